//! Fan-out to exactly `N` partitions by hash or round-robin
//! (`spec.md` §4.10).

use std::{
    hash::{Hash, Hasher},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use fnv::FnvHasher;
use tokio::sync::mpsc;
use tracing::Instrument;

use crate::{
    processor::{catch_panic, default_name, processor_span, CancelToken, Inbox, Outbox, DEFAULT_CHANNEL_CAPACITY},
    result::keys,
};

/// Splits one input into exactly `N` outputs, created the moment
/// [`Self::process`] is invoked. Every `Failure` is routed to partition
/// 0 unconditionally — a centralized error lane — and a panicking
/// key-fn or hasher is recovered the same way. Every forwarded item
/// carries `partition_index`/`partition_total`/`partition_strategy`
/// metadata.
pub struct Partition<T> {
    name: String,
    n: usize,
    strategy_name: &'static str,
    route: Arc<dyn Fn(&T) -> usize + Send + Sync>,
}

impl<T> Partition<T>
where
    T: Clone + Send + 'static,
{
    /// `partition_idx = reduce(fnv1a(key_fn(value)), N)`, using Lemire's
    /// multiplicative mapping instead of a plain modulo to avoid bias.
    pub fn hash<K: Hash>(n: usize, key_fn: impl Fn(&T) -> K + Send + Sync + 'static) -> Self {
        assert!(n > 0, "n must be positive");
        let route = move |value: &T| {
            let key = key_fn(value);
            let mut hasher = FnvHasher::default();
            key.hash(&mut hasher);
            reduce(hasher.finish(), n)
        };
        Self {
            name: default_name("partition"),
            n,
            strategy_name: "hash",
            route: Arc::new(route),
        }
    }

    /// An atomic counter modulo `N`.
    pub fn round_robin(n: usize) -> Self {
        assert!(n > 0, "n must be positive");
        let counter = Arc::new(AtomicUsize::new(0));
        let route = move |_: &T| counter.fetch_add(1, Ordering::Relaxed) % n;
        Self {
            name: default_name("partition"),
            n,
            strategy_name: "round_robin",
            route: Arc::new(route),
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn process(self, mut input: Inbox<T>, cancel: CancelToken) -> Vec<Inbox<T>> {
        let mut senders = Vec::with_capacity(self.n);
        let mut receivers = Vec::with_capacity(self.n);
        for _ in 0..self.n {
            let (tx, rx): (Outbox<T>, Inbox<T>) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
            senders.push(tx);
            receivers.push(rx);
        }

        let name = self.name.clone();
        let n = self.n;
        let strategy_name = self.strategy_name;
        let route = self.route.clone();
        let span = processor_span("partition", &name);
        tokio::spawn(
            async move {
                loop {
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => return,
                        item = input.recv() => {
                            let Some(item) = item else { return };
                            let idx = if item.is_failure() {
                                0
                            } else {
                                match catch_panic(&name, || (route)(item.value().expect("checked success above"))) {
                                    Ok(idx) => idx.min(n - 1),
                                    Err(_) => {
                                        tracing::warn!("route panicked, routing to partition 0");
                                        0
                                    }
                                }
                            };
                            let item = item
                                .passed_through(name.clone())
                                .with_metadata(keys::PARTITION_INDEX, idx)
                                .with_metadata(keys::PARTITION_TOTAL, n)
                                .with_metadata(keys::PARTITION_STRATEGY, strategy_name);
                            let _ = senders[idx].send(item).await;
                        }
                    }
                }
            }
            .instrument(span),
        );
        receivers
    }
}

fn reduce(hash: u64, n: usize) -> usize {
    (((hash as u128) * (n as u128)) >> 64) as usize
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::result::Res;

    proptest! {
        #[test]
        fn reduce_never_returns_an_index_outside_the_partition_count(
            hash in any::<u64>(), n in 1usize..10_000,
        ) {
            prop_assert!(reduce(hash, n) < n);
        }

        #[test]
        fn same_key_always_lands_in_the_same_partition(
            key in any::<i32>(), n in 1usize..16,
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            let landed = runtime.block_on(async {
                let (tx, input) = mpsc::channel(4);
                let mut outputs = Partition::hash(n, |k: &i32| *k).process(input, CancelToken::new());
                tx.send(Res::success(key)).await.unwrap();
                tx.send(Res::success(key)).await.unwrap();
                drop(tx);

                let mut landed = None;
                for (idx, rx) in outputs.iter_mut().enumerate() {
                    let mut count = 0;
                    while rx.recv().await.is_some() {
                        count += 1;
                    }
                    if count > 0 {
                        landed = Some((idx, count));
                    }
                }
                landed
            });

            let (_, count) = landed.expect("the key must land somewhere");
            prop_assert_eq!(count, 2);
        }
    }

    #[tokio::test]
    async fn hash_partition_is_consistent_for_the_same_key() {
        let (tx, input) = mpsc::channel(16);
        let mut outputs = Partition::hash(4, |n: &i32| *n).process(input, CancelToken::new());

        tx.send(Res::success(42)).await.unwrap();
        tx.send(Res::success(42)).await.unwrap();
        drop(tx);

        let mut landed = None;
        for (idx, rx) in outputs.iter_mut().enumerate() {
            if let Ok(item) = rx.try_recv() {
                assert_eq!(Some(&42), item.value());
                landed = Some(idx);
            }
        }
        assert!(landed.is_some());

        let idx = landed.unwrap();
        let second = outputs[idx].try_recv().unwrap();
        assert_eq!(Some(&42), second.value());
    }

    #[tokio::test]
    async fn round_robin_cycles_through_every_partition() {
        let (tx, input) = mpsc::channel(16);
        let mut outputs = Partition::round_robin(3).process(input, CancelToken::new());

        for n in 0..6 {
            tx.send(Res::success(n)).await.unwrap();
        }
        drop(tx);
        tokio::task::yield_now().await;

        for rx in outputs.iter_mut() {
            let mut count = 0;
            while rx.try_recv().is_ok() {
                count += 1;
            }
            assert_eq!(2, count);
        }
    }

    #[tokio::test]
    async fn failures_always_land_on_partition_zero() {
        let (tx, input) = mpsc::channel(16);
        let mut outputs = Partition::round_robin(3).process(input, CancelToken::new());

        tx.send(Res::<i32>::failure(
            1,
            crate::error::FlowError::cancelled("test"),
            "test",
            crate::error::wall_now(),
        ))
        .await
        .unwrap();
        drop(tx);
        tokio::task::yield_now().await;

        assert!(outputs[0].try_recv().is_ok());
        assert!(outputs[1].try_recv().is_err());
        assert!(outputs[2].try_recv().is_err());
    }
}
