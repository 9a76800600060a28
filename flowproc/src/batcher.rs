//! Dual-trigger size/latency batching (`spec.md` §4.4).

use std::{sync::Arc, time::Duration};

use tokio::sync::mpsc;
use tracing::Instrument;

use crate::{
    clock::{self, Clock, Timer},
    processor::{processor_span, CancelToken, Inbox, Outbox, DEFAULT_CHANNEL_CAPACITY},
    result::{keys, Metadata, Res},
};

/// Accumulates successes into an ordered buffer, emitting it as a single
/// `Res<Vec<T>>` success when `max_size` is reached or `max_latency` has
/// elapsed since the first item of the current batch, whichever comes
/// first. A `max_latency` of zero disables the time trigger.
///
/// A failure on input is forwarded immediately, wrapped as a
/// single-element batch so it keeps `Res<Vec<T>>`'s shape; it never
/// counts toward size and never starts or resets the latency timer.
pub struct Batcher<T> {
    name: String,
    max_size: usize,
    max_latency: Duration,
    clock: Arc<dyn Clock>,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T> Batcher<T>
where
    T: Send + 'static,
{
    pub fn new(max_size: usize) -> Self {
        assert!(max_size > 0, "max_size must be at least 1");
        Self {
            name: "batcher".to_owned(),
            max_size,
            max_latency: Duration::ZERO,
            clock: clock::real(),
            _marker: std::marker::PhantomData,
        }
    }

    #[must_use]
    pub fn with_latency(mut self, max_latency: Duration) -> Self {
        self.max_latency = max_latency;
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

    pub fn process(self, mut input: Inbox<T>, cancel: CancelToken) -> Inbox<Vec<T>> {
        let (tx, rx): (Outbox<Vec<T>>, Inbox<Vec<T>>) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        let span = processor_span("batcher", &self.name);
        tokio::spawn(
            async move {
                let mut buffer: Vec<T> = Vec::new();
                let mut timer: Option<Timer> = None;
                loop {
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => return,
                        item = input.recv() => {
                            match item {
                                None => {
                                    if !buffer.is_empty() {
                                        let n = buffer.len();
                                        let batch = std::mem::take(&mut buffer);
                                        tracing::debug!(size = n, trigger = "close", "emitting batch");
                                        let _ = tx.send(batch_result(batch)).await;
                                    }
                                    return;
                                }
                                Some(item) => {
                                    if item.is_failure() {
                                        let wrapped = wrap_failure(item, &self.name);
                                        if tx.send(wrapped).await.is_err() {
                                            return;
                                        }
                                        continue;
                                    }
                                    if buffer.is_empty() && !self.max_latency.is_zero() {
                                        timer = Some(self.clock.timer(self.max_latency));
                                    }
                                    buffer.push(item.into_value().expect("checked success above"));
                                    if buffer.len() >= self.max_size {
                                        timer = None;
                                        let n = buffer.len();
                                        let batch = std::mem::take(&mut buffer);
                                        tracing::debug!(size = n, trigger = "max_size", "emitting batch");
                                        if tx.send(batch_result(batch)).await.is_err() {
                                            return;
                                        }
                                    }
                                }
                            }
                        }
                        fired = async {
                            match timer.as_mut() {
                                Some(t) => t.fired().await,
                                None => std::future::pending().await,
                            }
                        }, if timer.is_some() => {
                            timer = None;
                            if fired && !buffer.is_empty() {
                                let n = buffer.len();
                                let batch = std::mem::take(&mut buffer);
                                tracing::debug!(size = n, trigger = "max_latency", "emitting batch");
                                if tx.send(batch_result(batch)).await.is_err() {
                                    return;
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

fn batch_result<T>(batch: Vec<T>) -> Res<Vec<T>> {
    let metadata = Metadata::new().with(keys::BATCH_SIZE, batch.len() as i64);
    Res::Success { value: batch, metadata }
}

fn wrap_failure<T>(item: Res<T>, processor: &str) -> Res<Vec<T>> {
    match item {
        Res::Failure {
            input,
            error,
            timestamp,
            metadata,
            ..
        } => Res::Failure {
            input: vec![input],
            error,
            processor: processor.to_owned(),
            timestamp,
            metadata: metadata.with(keys::PROCESSOR, processor.to_owned()),
        },
        Res::Success { .. } => unreachable!("wrap_failure called on a success"),
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::clock::FakeClock;

    proptest! {
        #[test]
        fn concatenating_every_emitted_batch_reproduces_the_input_in_order(
            values in prop::collection::vec(any::<i32>(), 0..200),
            max_size in 1usize..16,
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            let (reassembled, every_batch_within_max_size) = runtime.block_on(async {
                let (tx, input) = mpsc::channel(values.len().max(1));
                let mut output = Batcher::new(max_size).process(input, CancelToken::new());
                for v in &values {
                    tx.send(Res::success(*v)).await.unwrap();
                }
                drop(tx);

                let mut reassembled = Vec::new();
                let mut every_batch_within_max_size = true;
                while let Some(batch) = output.recv().await {
                    let batch = batch.into_value().expect("no failures in this input");
                    every_batch_within_max_size &= batch.len() <= max_size;
                    reassembled.extend(batch);
                }
                (reassembled, every_batch_within_max_size)
            });

            prop_assert!(every_batch_within_max_size);
            prop_assert_eq!(reassembled, values);
        }
    }

    #[tokio::test]
    async fn max_size_3_max_latency_100ms_scenario_from_spec() {
        let clock = Arc::new(FakeClock::new());
        let (tx, input) = mpsc::channel(16);
        let mut output = Batcher::new(3)
            .with_latency(Duration::from_millis(100))
            .with_clock(clock.clone())
            .process(input, CancelToken::new());

        tx.send(Res::success(1)).await.unwrap();
        clock.block_until_ready().await;
        clock.advance(Duration::from_millis(10));
        tx.send(Res::success(2)).await.unwrap();
        clock.block_until_ready().await;
        clock.advance(Duration::from_millis(10));
        tx.send(Res::success(3)).await.unwrap();

        let first = output.recv().await.unwrap();
        assert_eq!(Some(&vec![1, 2, 3]), first.value());

        clock.advance(Duration::from_millis(10));
        tx.send(Res::success(4)).await.unwrap();
        clock.block_until_ready().await;
        clock.advance(Duration::from_millis(10));
        tx.send(Res::success(5)).await.unwrap();
        clock.block_until_ready().await;

        clock.advance(Duration::from_millis(100));
        clock.block_until_ready().await;
        let second = output.recv().await.unwrap();
        assert_eq!(Some(&vec![4, 5]), second.value());

        drop(tx);
        assert!(output.recv().await.is_none());
    }

    #[tokio::test]
    async fn max_size_one_degenerates_to_singleton_passthrough() {
        let clock = Arc::new(FakeClock::new());
        let (tx, input) = mpsc::channel(16);
        let mut output = Batcher::new(1).with_clock(clock.clone()).process(input, CancelToken::new());
        tx.send(Res::success(7)).await.unwrap();
        let first = output.recv().await.unwrap();
        assert_eq!(Some(&vec![7]), first.value());
    }

    #[tokio::test]
    async fn zero_latency_disables_time_trigger() {
        let clock = Arc::new(FakeClock::new());
        let (tx, input) = mpsc::channel(16);
        let mut output = Batcher::new(2).with_clock(clock.clone()).process(input, CancelToken::new());
        tx.send(Res::success(1)).await.unwrap();
        clock.block_until_ready().await;
        clock.advance(Duration::from_secs(3600));
        clock.block_until_ready().await;
        drop(tx);
        let flushed = output.recv().await.unwrap();
        assert_eq!(Some(&vec![1]), flushed.value());
    }
}
