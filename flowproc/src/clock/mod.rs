//! Time abstraction shared by every timing processor ([`crate::throttle`],
//! [`crate::debounce`], [`crate::batcher`], [`crate::windowing`],
//! [`crate::retry`]).
//!
//! Processors never call `tokio::time` directly; they hold an
//! `Arc<dyn Clock>` so tests can swap in [`FakeClock`] and drive timing
//! deterministically instead of racing real wall-clock sleeps.
//!
//! Grounded on the `Clock`/`ClockControl` split in
//! `oxidizer::time::Clock` (real vs. virtual time behind one trait) and
//! on `get-convex-convex-backend`'s `Runtime` timer-registration
//! pattern.

mod fake;
mod real;

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

pub use fake::FakeClock;
pub use real::RealClock;

/// A source of time. `now`/`after`/`timer`/`ticker`/`after_func` mirror
/// the real-clock primitives every processor needs; swapping the
/// implementation behind an `Arc<dyn Clock>` is the only thing that
/// distinguishes a production pipeline from a deterministic test.
#[async_trait]
pub trait Clock: Send + Sync + 'static {
    /// The clock's current instant. Monotonic: never goes backwards.
    fn now(&self) -> Instant;

    /// Resolves after `duration` has elapsed on this clock.
    async fn after(&self, duration: Duration);

    /// A resettable, stoppable one-shot timer, for debounce/retry-style
    /// processors that repeatedly push a deadline back.
    fn timer(&self, duration: Duration) -> Timer;

    /// A repeating ticker, for tumbling/sliding window boundaries.
    fn ticker(&self, period: Duration) -> Ticker;

    /// Schedules `callback` to run once, after `duration`, without
    /// requiring the caller to hold a channel open. Used where a
    /// processor wants a fire-and-forget deadline (batcher's max-latency
    /// flush) instead of a polled [`Timer`].
    fn after_func(&self, duration: Duration, callback: Box<dyn FnOnce() + Send + 'static>);
}

/// A resettable one-shot timer returned by [`Clock::timer`].
///
/// Not `Clone`: a timer has exactly one owner, matching the borrowed
/// `time::Sleep`/`time::Interval` idiom in `tokio::time`.
pub struct Timer {
    inner: TimerInner,
}

enum TimerInner {
    Real {
        fire_rx: mpsc::Receiver<()>,
        control: mpsc::UnboundedSender<real::TimerControl>,
    },
    Fake {
        clock: FakeClock,
        id: Arc<Mutex<u64>>,
        fire_rx: mpsc::Receiver<()>,
    },
}

impl Timer {
    /// Waits for this timer to fire. Returns `false` if the timer's
    /// driver has shut down (only possible on a dropped/cancelled real
    /// clock driver; never on `FakeClock`).
    pub async fn fired(&mut self) -> bool {
        match &mut self.inner {
            TimerInner::Real { fire_rx, .. } => fire_rx.recv().await.is_some(),
            TimerInner::Fake { fire_rx, .. } => fire_rx.recv().await.is_some(),
        }
    }

    /// Non-blocking check for a pending fire, for tests driving a
    /// [`FakeClock`] without wanting to await.
    pub fn try_fired(&mut self) -> bool {
        match &mut self.inner {
            TimerInner::Real { fire_rx, .. } => fire_rx.try_recv().is_ok(),
            TimerInner::Fake { fire_rx, .. } => fire_rx.try_recv().is_ok(),
        }
    }

    /// Cancels any pending fire and reschedules `duration` from now.
    pub fn reset(&mut self, duration: Duration) {
        match &mut self.inner {
            TimerInner::Real { control, .. } => {
                let _ = control.send(real::TimerControl::Reset(duration));
            }
            TimerInner::Fake { clock, id, fire_rx } => {
                *fire_rx = clock.reset_timer(id, duration);
            }
        }
    }

    /// Cancels any pending fire. The timer may be `reset` again
    /// afterwards.
    pub fn stop(&mut self) {
        match &mut self.inner {
            TimerInner::Real { control, .. } => {
                let _ = control.send(real::TimerControl::Stop);
            }
            TimerInner::Fake { clock, id, .. } => clock.stop_timer(*id.lock()),
        }
    }
}

impl Drop for Timer {
    /// No timer may outlive its processor (`spec.md` §3.3): dropping it
    /// is equivalent to `stop()`.
    fn drop(&mut self) {
        self.stop();
    }
}

/// A repeating ticker returned by [`Clock::ticker`].
pub struct Ticker {
    inner: TickerInner,
}

enum TickerInner {
    Real {
        rx: mpsc::UnboundedReceiver<()>,
        control: mpsc::UnboundedSender<real::TickerControl>,
    },
    Fake {
        clock: FakeClock,
        id: u64,
        rx: mpsc::UnboundedReceiver<()>,
    },
}

impl Ticker {
    /// Waits for the next tick. Returns `false` once the ticker has been
    /// stopped and drained.
    pub async fn tick(&mut self) -> bool {
        match &mut self.inner {
            TickerInner::Real { rx, .. } => rx.recv().await.is_some(),
            TickerInner::Fake { rx, .. } => rx.recv().await.is_some(),
        }
    }

    /// Non-blocking check for a pending tick.
    pub fn try_tick(&mut self) -> bool {
        match &mut self.inner {
            TickerInner::Real { rx, .. } => rx.try_recv().is_ok(),
            TickerInner::Fake { rx, .. } => rx.try_recv().is_ok(),
        }
    }

    pub fn stop(&mut self) {
        match &mut self.inner {
            TickerInner::Real { control, .. } => {
                let _ = control.send(real::TickerControl::Stop);
            }
            TickerInner::Fake { clock, id, .. } => clock.stop_ticker(*id),
        }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Convenience constructor matching the production default
/// (`Arc::new(RealClock::new())`), used wherever a processor builder
/// falls back to real time when the caller doesn't supply a clock.
pub fn real() -> Arc<dyn Clock> {
    Arc::new(RealClock::new())
}
