//! Retries failed items with a pluggable backoff (`spec.md` §4.9).
//!
//! Successes pass through untouched. A `Failure` is retried, re-running
//! `execute` against the original input, up to `max_attempts` times. The
//! final outcome — success or exhausted/non-retryable failure — is the
//! only thing this processor emits for that item; composing it with
//! [`crate::dlq::Dlq`] downstream gives the "forward to a DLQ splitter"
//! half of the contract.

use std::{
    future::Future,
    panic::AssertUnwindSafe,
    pin::Pin,
    sync::Arc,
};

use futures::FutureExt;
use tokio::sync::mpsc;
use tracing::Instrument;

use crate::{
    backoff::Backoff,
    clock::{self, Clock},
    error::{wall_now, BoxError, ErrorKind, FlowError},
    processor::{default_name, processor_span, CancelToken, Inbox, Outbox, DEFAULT_CHANNEL_CAPACITY},
    result::{keys, Res},
};

type ExecuteFuture<T> = Pin<Box<dyn Future<Output = Result<T, BoxError>> + Send>>;
type ExecuteFn<T> = Arc<dyn Fn(T) -> ExecuteFuture<T> + Send + Sync>;
type ShouldRetry = Arc<dyn Fn(&FlowError) -> bool + Send + Sync>;

pub struct Retry<T> {
    name: String,
    max_attempts: u32,
    backoff: Arc<dyn Backoff>,
    should_retry: ShouldRetry,
    execute: ExecuteFn<T>,
    clock: Arc<dyn Clock>,
}

impl<T> Retry<T>
where
    T: Clone + Send + 'static,
{
    pub fn new<F, Fut>(max_attempts: u32, backoff: impl Backoff, execute: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, BoxError>> + Send + 'static,
    {
        assert!(max_attempts > 0, "max_attempts must be positive");
        Self {
            name: default_name("retry"),
            max_attempts,
            backoff: Arc::new(backoff),
            should_retry: Arc::new(|err: &FlowError| err.kind().is_retryable_by_default()),
            execute: Arc::new(move |t| Box::pin(execute(t))),
            clock: clock::real(),
        }
    }

    #[must_use]
    pub fn with_should_retry(mut self, predicate: impl Fn(&FlowError) -> bool + Send + Sync + 'static) -> Self {
        self.should_retry = Arc::new(predicate);
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
        let span = processor_span("retry", &self.name);
        tokio::spawn(
            async move {
                loop {
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => return,
                        item = input.recv() => {
                            let Some(item) = item else { return };
                            match item {
                                Res::Success { .. } => {
                                    if tx.send(item).await.is_err() {
                                        return;
                                    }
                                }
                                Res::Failure { input, error, .. } => {
                                    let outcome = run_retries(
                                        &self.name,
                                        input,
                                        (*error).clone_for_retry(),
                                        self.max_attempts,
                                        self.backoff.as_ref(),
                                        self.should_retry.as_ref(),
                                        self.execute.as_ref(),
                                        self.clock.as_ref(),
                                        &cancel,
                                    )
                                    .await;
                                    if tx.send(outcome).await.is_err() {
                                        return;
                                    }
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

#[allow(clippy::too_many_arguments)]
async fn run_retries<T>(
    name: &str,
    original_input: T,
    mut error: FlowError,
    max_attempts: u32,
    backoff: &dyn Backoff,
    should_retry: &(dyn Fn(&FlowError) -> bool + Send + Sync),
    execute: &(dyn Fn(T) -> ExecuteFuture<T> + Send + Sync),
    clock: &dyn Clock,
    cancel: &CancelToken,
) -> Res<T>
where
    T: Clone + Send + 'static,
{
    let mut attempt = 0u32;
    loop {
        if attempt >= max_attempts || !should_retry(&error) {
            tracing::debug!(attempt, "retries exhausted or error not retryable, forwarding failure");
            return Res::failure(original_input, error, name, wall_now()).with_metadata(keys::RETRY_COUNT, attempt);
        }
        attempt += 1;
        let delay = backoff.delay_for(attempt);
        tracing::debug!(attempt, ?delay, "retrying after backoff");
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                return Res::failure(original_input, FlowError::cancelled(name), name, wall_now())
                    .with_metadata(keys::RETRY_COUNT, attempt);
            }
            () = clock.after(delay) => {}
        }

        let attempt_input = original_input.clone();
        let outcome = AssertUnwindSafe(execute(attempt_input)).catch_unwind().await;
        match outcome {
            Ok(Ok(value)) => {
                return Res::success(value).with_metadata(keys::RETRY_COUNT, attempt);
            }
            Ok(Err(source)) => {
                error = FlowError::user(name, source, error.kind());
            }
            Err(payload) => {
                error = FlowError::panicked(name, payload);
            }
        }
    }
}
