//! Pluggable retry backoff strategies (`spec.md` §4.9).

use std::time::Duration;

use rand::Rng;

/// Computes the delay before a given retry attempt. `attempt` is
/// 1-indexed: the delay before the *first* retry (i.e. after the
/// initial failure) is `delay_for(1)`.
pub trait Backoff: Send + Sync + 'static {
    fn delay_for(&self, attempt: u32) -> Duration;
}

/// `delay = base * multiplier^(attempt-1)`, optionally jittered by a
/// uniform `±jitter * delay`, capped at `max_delay`.
#[derive(Debug, Clone, Copy)]
pub struct Exponential {
    pub base: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub jitter: f64,
}

impl Exponential {
    pub fn new(base: Duration, multiplier: f64, max_delay: Duration) -> Self {
        Self {
            base,
            multiplier,
            max_delay,
            jitter: 0.0,
        }
    }

    #[must_use]
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        assert!((0.0..=1.0).contains(&jitter), "jitter must be in [0, 1]");
        self.jitter = jitter;
        self
    }
}

impl Backoff for Exponential {
    fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let raw = self.base.as_secs_f64() * self.multiplier.powi(exponent);
        let delay = Duration::from_secs_f64(raw.max(0.0)).min(self.max_delay);
        apply_jitter(delay, self.jitter)
    }
}

/// A constant delay between attempts.
#[derive(Debug, Clone, Copy)]
pub struct Fixed {
    pub delay: Duration,
}

impl Fixed {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Backoff for Fixed {
    fn delay_for(&self, _attempt: u32) -> Duration {
        self.delay
    }
}

/// `delay = base + increment * (attempt-1)`, capped at `max_delay`.
#[derive(Debug, Clone, Copy)]
pub struct Linear {
    pub base: Duration,
    pub increment: Duration,
    pub max_delay: Duration,
}

impl Linear {
    pub fn new(base: Duration, increment: Duration, max_delay: Duration) -> Self {
        Self {
            base,
            increment,
            max_delay,
        }
    }
}

impl Backoff for Linear {
    fn delay_for(&self, attempt: u32) -> Duration {
        let steps = attempt.saturating_sub(1);
        self.base
            .saturating_add(self.increment.saturating_mul(steps))
            .min(self.max_delay)
    }
}

/// Applies uniform jitter in `[delay*(1-jitter), delay*(1+jitter)]`.
fn apply_jitter(delay: Duration, jitter: f64) -> Duration {
    if jitter == 0.0 {
        return delay;
    }
    let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
    Duration::from_secs_f64((delay.as_secs_f64() * factor).max(0.0))
}
