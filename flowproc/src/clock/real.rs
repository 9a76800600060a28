//! Wall-clock [`Clock`] backed by `tokio::time`.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{Clock, Ticker, TickerInner, Timer, TimerInner};

pub(super) enum TimerControl {
    Reset(Duration),
    Stop,
}

pub(super) enum TickerControl {
    Stop,
}

/// Production [`Clock`]: `now` is `Instant::now`, and timers/tickers are
/// driven by a background task per instance talking to `tokio::time`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealClock;

impl RealClock {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn after(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn timer(&self, duration: Duration) -> Timer {
        let (fire_tx, fire_rx) = mpsc::channel(1);
        let (control_tx, mut control_rx) = mpsc::unbounded_channel::<TimerControl>();
        tokio::spawn(async move {
            let mut sleep = Box::pin(tokio::time::sleep(duration));
            loop {
                tokio::select! {
                    () = &mut sleep => {
                        if fire_tx.send(()).await.is_err() {
                            return;
                        }
                        match control_rx.recv().await {
                            Some(TimerControl::Reset(d)) => sleep.as_mut().reset(tokio::time::Instant::now() + d),
                            Some(TimerControl::Stop) | None => return,
                        }
                    }
                    msg = control_rx.recv() => {
                        match msg {
                            Some(TimerControl::Reset(d)) => sleep.as_mut().reset(tokio::time::Instant::now() + d),
                            Some(TimerControl::Stop) | None => return,
                        }
                    }
                }
            }
        });
        Timer {
            inner: TimerInner::Real {
                fire_rx,
                control: control_tx,
            },
        }
    }

    fn ticker(&self, period: Duration) -> Ticker {
        let (tx, rx) = mpsc::unbounded_channel();
        let (control_tx, mut control_rx) = mpsc::unbounded_channel::<TickerControl>();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if tx.send(()).is_err() {
                            return;
                        }
                    }
                    msg = control_rx.recv() => {
                        match msg {
                            Some(TickerControl::Stop) | None => return,
                        }
                    }
                }
            }
        });
        Ticker {
            inner: TickerInner::Real { rx, control: control_tx },
        }
    }

    fn after_func(&self, duration: Duration, callback: Box<dyn FnOnce() + Send + 'static>) {
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            callback();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn after_resolves_once_duration_elapses() {
        let clock = RealClock::new();
        let started = tokio::time::Instant::now();
        clock.after(Duration::from_millis(50)).await;
        assert!(tokio::time::Instant::now() >= started + Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn timer_fires_then_can_be_reset() {
        let clock = RealClock::new();
        let mut timer = clock.timer(Duration::from_millis(20));
        assert!(timer.fired().await);
        timer.reset(Duration::from_millis(20));
        tokio::time::advance(Duration::from_millis(20)).await;
        assert!(timer.fired().await);
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_ticks_repeatedly() {
        let clock = RealClock::new();
        let mut ticker = clock.ticker(Duration::from_millis(10));
        assert!(ticker.tick().await);
        assert!(ticker.tick().await);
        ticker.stop();
    }
}
