//! Virtual-time clock for deterministic tests.
//!
//! Holds a single monotonically non-decreasing virtual [`Instant`].
//! Registered waits (`after`, `timer`, `ticker`, `after_func`) sit in a
//! priority queue keyed by firing instant; [`FakeClock::advance`] fires,
//! in time order, every wait whose deadline has been reached, with ties
//! broken by registration order (`spec.md` §4.1).
//!
//! Grounded on the priority-queue clock design in `oxidizer_time::Clock`/
//! `ClockControl` and on `get-convex-convex-backend`'s
//! `Runtime::register_timer`/`unregister_timer` waker-registration
//! pattern, adapted to the `after`/`timer`/`ticker`/`after_func` surface
//! `spec.md` §4.1 calls for.

use std::{
    collections::BTreeMap,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use async_trait::async_trait;

use super::{Clock, Ticker, TickerInner, Timer, TimerInner};

/// A single pending wait, keyed in [`Inner::waits`] by `(deadline, seq)`.
enum Wait {
    /// `after`/`timer`: fires once, then is forgotten.
    Once(mpsc::Sender<()>),
    /// `after_func`: runs a callback once, outside the state lock.
    AfterFunc(Box<dyn FnOnce() + Send>),
    /// `ticker`: fires repeatedly, re-registering itself `period` later
    /// each time it fires.
    Ticker {
        tx: mpsc::UnboundedSender<()>,
        period: Duration,
    },
}

/// A scheduled wait plus the registration id its owner (`Timer`/`Ticker`)
/// uses to `reset`/`stop` it.
struct Entry {
    id: u64,
    wait: Wait,
}

struct Inner {
    now: Instant,
    next_seq: u64,
    next_id: u64,
    waits: BTreeMap<(Instant, u64), Entry>,
    /// `id -> (deadline, seq)`, so `reset`/`stop` can find and remove a
    /// wait without the caller needing to remember its deadline.
    index: std::collections::HashMap<u64, (Instant, u64)>,
}

impl Inner {
    fn schedule(&mut self, deadline: Instant, wait: Wait) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        let id = self.next_id;
        self.next_id += 1;
        self.waits.insert((deadline, seq), Entry { id, wait });
        self.index.insert(id, (deadline, seq));
        id
    }

    /// Re-registers an already-allocated id (ticker re-arm) under a new
    /// key, keeping `index` pointed at the live entry.
    fn reschedule_existing(&mut self, id: u64, deadline: Instant, wait: Wait) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.waits.insert((deadline, seq), Entry { id, wait });
        self.index.insert(id, (deadline, seq));
    }

    fn cancel(&mut self, id: u64) {
        if let Some(key) = self.index.remove(&id) {
            self.waits.remove(&key);
        }
    }
}

/// Virtual-time [`Clock`] for tests. See the module docs for the firing
/// contract.
#[derive(Clone)]
pub struct FakeClock {
    inner: Arc<Mutex<Inner>>,
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeClock {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                now: Instant::now(),
                next_seq: 0,
                next_id: 0,
                waits: BTreeMap::new(),
                index: std::collections::HashMap::new(),
            })),
        }
    }

    /// Moves the virtual clock forward by `duration`, firing every wait
    /// whose deadline falls within `[now, now + duration]` in time order,
    /// ties broken by registration order. A ticker may fire more than
    /// once if more than one of its periods elapsed during the advance.
    pub fn advance(&self, duration: Duration) {
        let mut fired_callbacks: Vec<Box<dyn FnOnce() + Send>> = Vec::new();
        let target = {
            let mut inner = self.inner.lock();
            let target = inner.now + duration;
            loop {
                let Some((&key, _)) = inner.waits.iter().next() else {
                    break;
                };
                if key.0 > target {
                    break;
                }
                let Entry { id, wait } = inner.waits.remove(&key).expect("key just peeked");
                inner.index.remove(&id);
                inner.now = key.0;
                match wait {
                    Wait::Once(tx) => {
                        let _ = tx.try_send(());
                    }
                    Wait::AfterFunc(f) => fired_callbacks.push(f),
                    Wait::Ticker { tx, period } => {
                        let _ = tx.send(());
                        let next_deadline = key.0 + period;
                        inner.reschedule_existing(id, next_deadline, Wait::Ticker { tx, period });
                    }
                }
            }
            inner.now = target;
            target
        };
        let _ = target;

        // Callbacks run outside the state lock so they may themselves
        // touch the clock (e.g. schedule another `after_func`).
        for f in fired_callbacks {
            f();
        }
    }

    /// Yields to the runtime until tasks woken by the most recent
    /// `advance` have had a chance to observe their fire and react.
    ///
    /// Fires are delivered synchronously inside `advance` (a bounded
    /// `try_send`, or a direct callback invocation); this only covers the
    /// gap between "the fire was delivered to a channel" and "the task
    /// reading that channel was polled again by the executor". It does
    /// not wait for further downstream backpressure — ordinary channel
    /// capacity governs that, the same as with a real clock.
    pub async fn block_until_ready(&self) {
        for _ in 0..64 {
            tokio::task::yield_now().await;
        }
    }

    pub(super) fn now_inner(&self) -> Instant {
        self.inner.lock().now
    }

    pub(super) fn after_inner(&self, duration: Duration) -> mpsc::Receiver<()> {
        let (tx, rx) = mpsc::channel(1);
        let deadline = {
            let mut inner = self.inner.lock();
            inner.now + duration
        };
        self.inner.lock().schedule(deadline, Wait::Once(tx));
        rx
    }

    pub(super) fn timer_inner(&self, duration: Duration) -> Timer {
        let (fire_tx, fire_rx) = mpsc::channel(1);
        let deadline = self.now_inner() + duration;
        let id = self.inner.lock().schedule(deadline, Wait::Once(fire_tx));
        Timer {
            inner: TimerInner::Fake {
                clock: self.clone(),
                id: Arc::new(Mutex::new(id)),
                fire_rx,
            },
        }
    }

    pub(super) fn reset_timer(&self, id: &Mutex<u64>, duration: Duration) -> mpsc::Receiver<()> {
        let mut guard = id.lock();
        self.inner.lock().cancel(*guard);
        let (fire_tx, fire_rx) = mpsc::channel(1);
        let deadline = self.now_inner() + duration;
        *guard = self.inner.lock().schedule(deadline, Wait::Once(fire_tx));
        fire_rx
    }

    pub(super) fn stop_timer(&self, id: u64) {
        self.inner.lock().cancel(id);
    }

    pub(super) fn ticker_inner(&self, period: Duration) -> Ticker {
        let (tx, rx) = mpsc::unbounded_channel();
        let deadline = self.now_inner() + period;
        let id = self.inner.lock().schedule(deadline, Wait::Ticker { tx, period });
        Ticker {
            inner: TickerInner::Fake {
                clock: self.clone(),
                id,
                rx,
            },
        }
    }

    pub(super) fn stop_ticker(&self, id: u64) {
        self.inner.lock().cancel(id);
    }

    pub(super) fn after_func_inner(&self, duration: Duration, callback: Box<dyn FnOnce() + Send>) {
        let deadline = self.now_inner() + duration;
        self.inner.lock().schedule(deadline, Wait::AfterFunc(callback));
    }
}

#[async_trait]
impl Clock for FakeClock {
    fn now(&self) -> Instant {
        self.now_inner()
    }

    async fn after(&self, duration: Duration) {
        let mut rx = self.after_inner(duration);
        let _ = rx.recv().await;
    }

    fn timer(&self, duration: Duration) -> Timer {
        self.timer_inner(duration)
    }

    fn ticker(&self, period: Duration) -> Ticker {
        self.ticker_inner(period)
    }

    fn after_func(&self, duration: Duration, callback: Box<dyn FnOnce() + Send + 'static>) {
        self.after_func_inner(duration, callback)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn after_fires_only_once_advanced_past_deadline() {
        let clock = FakeClock::new();
        let mut rx = clock.after_inner(Duration::from_millis(100));
        clock.advance(Duration::from_millis(50));
        assert!(rx.try_recv().is_err());
        clock.advance(Duration::from_millis(50));
        clock.block_until_ready().await;
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn ticker_fires_once_per_period_crossed() {
        let clock = FakeClock::new();
        let mut ticker = clock.ticker_inner(Duration::from_millis(10));
        clock.advance(Duration::from_millis(35));
        clock.block_until_ready().await;
        let mut ticks = 0;
        while ticker.try_tick() {
            ticks += 1;
        }
        assert_eq!(3, ticks);
    }

    #[tokio::test]
    async fn equal_deadlines_fire_in_registration_order() {
        let clock = FakeClock::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            clock.after_func_inner(Duration::from_millis(10), Box::new(move || order.lock().push(i)));
        }
        clock.advance(Duration::from_millis(10));
        assert_eq!(vec![0, 1, 2], *order.lock());
    }

    #[tokio::test]
    async fn reset_reschedules_from_now() {
        let clock = FakeClock::new();
        let mut timer = clock.timer_inner(Duration::from_millis(10));
        clock.advance(Duration::from_millis(5));
        timer.reset(Duration::from_millis(10));
        clock.advance(Duration::from_millis(5));
        assert!(!timer.try_fired());
        clock.advance(Duration::from_millis(5));
        clock.block_until_ready().await;
        assert!(timer.try_fired());
    }

    #[test]
    fn stop_is_idempotent_and_dequeues() {
        let clock = FakeClock::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let counter2 = counter.clone();
        clock.after_func_inner(
            Duration::from_millis(10),
            Box::new(move || {
                counter2.fetch_add(1, Ordering::SeqCst);
            }),
        );
        // Cancel the only scheduled wait directly via its id (1, since
        // the constructor above allocated id 0 for that registration).
        clock.inner.lock().cancel(0);
        clock.inner.lock().cancel(0);
        clock.advance(Duration::from_millis(20));
        assert_eq!(0, counter.load(Ordering::SeqCst));
    }
}
