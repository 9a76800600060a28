//! Bounded LRU deduplication with an optional TTL (`spec.md` §4.7).

use std::{
    hash::Hash,
    num::NonZeroUsize,
    sync::Arc,
    time::Duration,
};

use lru::LruCache;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::Instrument;

use crate::{
    clock::{self, Clock},
    error::wall_now,
    processor::{catch_panic, default_name, processor_span, CancelToken, Inbox, Outbox, DEFAULT_CHANNEL_CAPACITY},
    result::Res,
};

/// Drops any success whose `key_fn(value)` has been seen within the
/// retention window; passes first occurrences through. Capacity is
/// bounded: at `max_size`, inserting evicts the least-recently-used key.
/// An optional TTL additionally expires an entry after `ttl` has elapsed
/// since its insertion, checked lazily on access and by a periodic
/// background sweep.
pub struct Dedupe<T, K> {
    name: String,
    max_size: NonZeroUsize,
    ttl: Option<Duration>,
    sweep_interval: Duration,
    key_fn: Arc<dyn Fn(&T) -> K + Send + Sync>,
    clock: Arc<dyn Clock>,
}

impl<T, K> Dedupe<T, K>
where
    T: Send + 'static,
    K: Hash + Eq + Clone + Send + Sync + 'static,
{
    pub fn new(max_size: usize, key_fn: impl Fn(&T) -> K + Send + Sync + 'static) -> Self {
        let max_size = NonZeroUsize::new(max_size).expect("max_size must be positive");
        Self {
            name: default_name("dedupe"),
            max_size,
            ttl: None,
            sweep_interval: Duration::from_secs(10),
            key_fn: Arc::new(key_fn),
            clock: clock::real(),
        }
    }

    /// Enables expiry: an entry is considered stale `ttl` after its
    /// insertion. Also picks the default sweep interval
    /// (`max(ttl/10, 10s)` clamped to `[10s, 5m]`) unless overridden by a
    /// later call to [`Self::with_sweep_interval`].
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self.sweep_interval = default_sweep_interval(ttl);
        self
    }

    #[must_use]
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn process(self, mut input: Inbox<T>, cancel: CancelToken) -> Inbox<T> {
        let (tx, rx): (Outbox<T>, Inbox<T>) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        let span = processor_span("dedupe", &self.name);
        tokio::spawn(
            async move {
            let cache: Mutex<LruCache<K, std::time::Instant>> = Mutex::new(LruCache::new(self.max_size));
            let mut sweeper = self.ttl.map(|_| self.clock.ticker(self.sweep_interval));
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return,
                    item = input.recv() => {
                        let Some(item) = item else { return };
                        if item.is_failure() {
                            let item = item.passed_through(self.name.clone());
                            if tx.send(item).await.is_err() {
                                return;
                            }
                            continue;
                        }
                        let key_result = catch_panic(&self.name, || (self.key_fn)(item.value().expect("checked success above")));
                        match key_result {
                            Ok(key) => {
                                let now = self.clock.now();
                                let is_duplicate = {
                                    let mut guard = cache.lock();
                                    match guard.get(&key) {
                                        Some(&inserted_at) => match self.ttl {
                                            Some(ttl) => now < inserted_at + ttl,
                                            None => true,
                                        },
                                        None => false,
                                    }
                                };
                                if is_duplicate {
                                    tracing::trace!("dropped duplicate");
                                    continue;
                                }
                                cache.lock().put(key, now);
                                if tx.send(item).await.is_err() {
                                    return;
                                }
                            }
                            Err(err) => {
                                let failure = Res::failure(
                                    item.into_value().expect("checked success above"),
                                    err,
                                    self.name.clone(),
                                    wall_now(),
                                );
                                if tx.send(failure).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                    _ = async {
                        match sweeper.as_mut() {
                            Some(t) => { t.tick().await; }
                            None => std::future::pending().await,
                        }
                    }, if sweeper.is_some() => {
                        if let Some(ttl) = self.ttl {
                            let now = self.clock.now();
                            let mut guard = cache.lock();
                            let expired: Vec<K> = guard
                                .iter()
                                .filter(|(_, &inserted_at)| now >= inserted_at + ttl)
                                .map(|(k, _)| k.clone())
                                .collect();
                            if !expired.is_empty() {
                                tracing::debug!(count = expired.len(), "ttl sweep evicted entries");
                            }
                            for key in expired {
                                guard.pop(&key);
                            }
                        }
                    }
                }
            }
            }
            .instrument(span),
        );
        rx
    }
}

fn default_sweep_interval(ttl: Duration) -> Duration {
    (ttl / 10).clamp(Duration::from_secs(10), Duration::from_secs(5 * 60))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::clock::FakeClock;

    proptest! {
        #[test]
        fn without_ttl_exactly_the_first_occurrence_of_each_key_survives(
            keys in prop::collection::vec(0i32..10, 0..200),
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            let survivors = runtime.block_on(async {
                let (tx, input) = mpsc::channel(keys.len().max(1));
                let mut output = Dedupe::new(keys.len().max(1), |n: &i32| *n).process(input, CancelToken::new());
                for k in &keys {
                    tx.send(Res::success(*k)).await.unwrap();
                }
                drop(tx);

                let mut survivors = Vec::new();
                while let Some(item) = output.recv().await {
                    survivors.push(*item.value().unwrap());
                }
                survivors
            });

            let mut expected = Vec::new();
            let mut seen = std::collections::HashSet::new();
            for k in &keys {
                if seen.insert(*k) {
                    expected.push(*k);
                }
            }
            prop_assert_eq!(survivors, expected);
        }
    }

    #[tokio::test]
    async fn max_size_2_evicts_lru_and_reemits_per_scenario_seven() {
        // A,B,C,B,A at max_size=2 (spec.md §8 scenario 7): A opens the
        // cache, B fills it to capacity {A, B}. C evicts the
        // least-recently-used entry (A), leaving {B, C}. The second B is
        // a duplicate and is dropped, but the lookup promotes B to
        // most-recently-used, leaving C as the next eviction candidate.
        // The second A is no longer cached — it was evicted when C
        // arrived — so it passes through as a fresh occurrence.
        let (tx, input) = mpsc::channel(16);
        let mut output = Dedupe::new(2, |s: &&'static str| *s).process(input, CancelToken::new());

        for key in ["a", "b", "c", "b", "a"] {
            tx.send(Res::success(key)).await.unwrap();
        }
        drop(tx);

        let mut survivors = Vec::new();
        while let Some(item) = output.recv().await {
            survivors.push(*item.value().unwrap());
        }
        assert_eq!(vec!["a", "b", "c", "a"], survivors);
    }

    #[tokio::test]
    async fn only_first_occurrence_of_a_key_passes_within_retention() {
        let (tx, input) = mpsc::channel(16);
        let mut output = Dedupe::new(16, |n: &i32| *n % 3).process(input, CancelToken::new());

        tx.send(Res::success(1)).await.unwrap(); // key 1
        tx.send(Res::success(4)).await.unwrap(); // key 1, duplicate
        tx.send(Res::success(2)).await.unwrap(); // key 2, distinct
        drop(tx);

        let first = output.recv().await.unwrap();
        assert_eq!(Some(&1), first.value());
        let second = output.recv().await.unwrap();
        assert_eq!(Some(&2), second.value());
        assert!(output.recv().await.is_none());
    }

    #[tokio::test]
    async fn entry_expires_after_ttl_and_is_allowed_through_again() {
        let clock = Arc::new(FakeClock::new());
        let (tx, input) = mpsc::channel(16);
        let mut output = Dedupe::new(16, |n: &i32| *n)
            .with_ttl(Duration::from_millis(50))
            .with_clock(clock.clone())
            .process(input, CancelToken::new());

        tx.send(Res::success(7)).await.unwrap();
        clock.block_until_ready().await;
        let first = output.recv().await.unwrap();
        assert_eq!(Some(&7), first.value());

        tx.send(Res::success(7)).await.unwrap();
        clock.block_until_ready().await;
        // Within the TTL window: dropped. We can't directly observe a
        // drop, so confirm the next distinct key still flows, meaning
        // the duplicate never reached the channel.
        tx.send(Res::success(9)).await.unwrap();
        clock.block_until_ready().await;
        let second = output.recv().await.unwrap();
        assert_eq!(Some(&9), second.value());

        clock.advance(Duration::from_millis(60));
        clock.block_until_ready().await;
        tx.send(Res::success(7)).await.unwrap();
        drop(tx);
        let third = output.recv().await.unwrap();
        assert_eq!(Some(&7), third.value());
    }

    #[tokio::test]
    async fn key_fn_panic_routes_item_to_a_failure_and_continues() {
        let (tx, input) = mpsc::channel(16);
        let mut output = Dedupe::new(16, |n: &i32| {
            if *n == 13 {
                panic!("unlucky key");
            }
            *n
        })
        .process(input, CancelToken::new());

        tx.send(Res::success(13)).await.unwrap();
        tx.send(Res::success(1)).await.unwrap();
        drop(tx);

        let first = output.recv().await.unwrap();
        assert!(first.is_failure());
        let second = output.recv().await.unwrap();
        assert_eq!(Some(&1), second.value());
    }
}
