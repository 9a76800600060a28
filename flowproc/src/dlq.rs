//! Dead-letter splitter: successes and failures down independent
//! outputs (`spec.md` §4.8).

use std::{
    sync::atomic::{AtomicU64, Ordering},
    sync::Arc,
    time::Duration,
};

use tokio::sync::mpsc;
use tracing::Instrument;

use crate::processor::{default_name, processor_span, CancelToken, Inbox, Outbox, DEFAULT_CHANNEL_CAPACITY};

/// How long a forward to a possibly-unread output may block before the
/// item is dropped rather than stalling the splitter.
const FORWARD_TIMEOUT: Duration = Duration::from_millis(10);

/// The two independent outputs produced by [`Dlq::process`].
pub struct DlqOutputs<T> {
    pub successes: Inbox<T>,
    pub failures: Inbox<T>,
}

/// Splits a single input into a `successes` and a `failures` output,
/// classifying by `Res` variant. Since either output may go unread, each
/// forward is bounded by a short timeout; if it doesn't complete in time
/// (and cancellation hasn't been signalled) the item is dropped and the
/// drop counter increments, rather than deadlocking the splitter.
pub struct Dlq {
    name: String,
    dropped: Arc<AtomicU64>,
}

impl Default for Dlq {
    fn default() -> Self {
        Self::new()
    }
}

impl Dlq {
    pub fn new() -> Self {
        Self {
            name: default_name("dlq"),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Number of items dropped so far because a consumer wasn't reading
    /// its output within [`FORWARD_TIMEOUT`].
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn process<T>(&self, mut input: Inbox<T>, cancel: CancelToken) -> DlqOutputs<T>
    where
        T: Send + 'static,
    {
        let (success_tx, success_rx): (Outbox<T>, Inbox<T>) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        let (failure_tx, failure_rx): (Outbox<T>, Inbox<T>) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        let dropped = self.dropped.clone();
        let span = processor_span("dlq", &self.name);

        tokio::spawn(
            async move {
                loop {
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => return,
                        item = input.recv() => {
                            let Some(item) = item else { return };
                            let is_success = item.is_success();
                            let target = if is_success { &success_tx } else { &failure_tx };
                            match tokio::time::timeout(FORWARD_TIMEOUT, target.send(item)).await {
                                Ok(Ok(())) => {}
                                Ok(Err(_)) => return, // consumer gone; the other output may still be live
                                Err(_) => {
                                    let total = dropped.fetch_add(1, Ordering::Relaxed) + 1;
                                    tracing::warn!(is_success, total_dropped = total, "dropped item past forward timeout");
                                }
                            }
                        }
                    }
                }
            }
            .instrument(span),
        );

        DlqOutputs {
            successes: success_rx,
            failures: failure_rx,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::FlowError, result::Res};

    #[tokio::test]
    async fn successes_and_failures_land_on_separate_outputs() {
        let (tx, input) = mpsc::channel(16);
        let dlq = Dlq::new();
        let outputs = dlq.process(input, CancelToken::new());
        let mut successes = outputs.successes;
        let mut failures = outputs.failures;

        tx.send(Res::success(1)).await.unwrap();
        tx.send(Res::<i32>::failure(2, FlowError::cancelled("test"), "test", crate::error::wall_now()))
            .await
            .unwrap();
        drop(tx);

        assert_eq!(Some(1), successes.recv().await.and_then(|r| r.into_value()));
        let failure = failures.recv().await.unwrap();
        assert!(failure.is_failure());
    }

    #[tokio::test]
    async fn unread_output_drops_items_past_the_timeout_without_stalling_the_other() {
        let (tx, input) = mpsc::channel(16);
        let dlq = Dlq::new();
        let outputs = dlq.process(input, CancelToken::new());
        let mut successes = outputs.successes;
        let _unread_failures = outputs.failures;

        for i in 0..4 {
            tx.send(Res::success(i)).await.unwrap();
        }
        drop(tx);

        let mut received = Vec::new();
        while let Some(item) = successes.recv().await {
            received.push(item.into_value().unwrap());
        }
        assert_eq!(vec![0, 1, 2, 3], received);
        assert_eq!(0, dlq.dropped_count());
    }

    #[tokio::test(start_paused = true)]
    async fn failures_channel_left_unread_past_capacity_drops_and_counts() {
        // One more than the splitter's failure output can buffer, so the
        // send for the last one genuinely blocks on a full channel instead
        // of completing immediately.
        let total = DEFAULT_CHANNEL_CAPACITY + 1;
        let (tx, input) = mpsc::channel(total);
        let dlq = Dlq::new();
        let outputs = dlq.process(input, CancelToken::new());
        let mut successes = outputs.successes;
        let _unread_failures = outputs.failures;

        for i in 0..total {
            tx.send(Res::<i32>::failure(
                i as i32,
                crate::error::FlowError::cancelled("test"),
                "test",
                crate::error::wall_now(),
            ))
            .await
            .unwrap();
        }
        drop(tx);

        // Let the splitter task fill the failures channel and block on the
        // one that doesn't fit, before the forward timeout has elapsed.
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        tokio::time::advance(Duration::from_millis(11)).await;

        // The splitter exits once it observes the timeout and then finds
        // the (already closed) input empty; waiting for the unrelated
        // successes output to close is a reliable way to synchronize on
        // that without reading the unread failures output ourselves.
        assert!(successes.recv().await.is_none());
        assert_eq!(1, dlq.dropped_count());
    }
}
