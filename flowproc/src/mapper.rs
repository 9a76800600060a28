//! Order-preserving and unordered concurrent mapping (`spec.md` §4.6).

use std::{collections::BTreeMap, future::Future, panic::AssertUnwindSafe, pin::Pin, sync::Arc};

use futures::FutureExt;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::Instrument;

use crate::{
    error::{wall_now, BoxError, ErrorKind, FlowError},
    processor::{processor_span, recast_failure, CancelToken, Inbox, Outbox, DEFAULT_CHANNEL_CAPACITY},
    result::Res,
};

type MapFuture<U> = Pin<Box<dyn Future<Output = Result<U, BoxError>> + Send>>;
type MapFn<T, U> = Arc<dyn Fn(T) -> MapFuture<U> + Send + Sync>;

/// Applies an async function to each success using up to `workers`
/// concurrent tasks. In ordered mode (the default) the output preserves
/// input order exactly; in unordered mode results are emitted as they
/// complete. Failures never reach a worker.
///
/// A `Res<U>::Failure` has no slot for a value of the input type `T`
/// once `T` and `U` differ, so a passed-through input failure or a
/// function error/panic populates `input` with `U::default()` — a
/// placeholder, not the original value. This is a deliberate departure
/// from preserving the literal input, which is only type-representable
/// when a transform's input and output types coincide.
pub struct AsyncMapper<T, U> {
    name: String,
    workers: usize,
    ordered: bool,
    func: MapFn<T, U>,
}

impl<T, U> AsyncMapper<T, U>
where
    T: Clone + Send + 'static,
    U: Default + Send + 'static,
{
    /// `workers` must be at least 1. Defaults to ordered mode; call
    /// [`Self::unordered`] to relax ordering for higher throughput.
    pub fn new<F, Fut>(workers: usize, func: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<U, BoxError>> + Send + 'static,
    {
        assert!(workers > 0, "workers must be at least 1");
        Self {
            name: "async_mapper".to_owned(),
            workers,
            ordered: true,
            func: Arc::new(move |t| Box::pin(func(t))),
        }
    }

    #[must_use]
    pub fn unordered(mut self) -> Self {
        self.ordered = false;
        self
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn process(self, mut input: Inbox<T>, cancel: CancelToken) -> Inbox<U> {
        let (tx, rx): (Outbox<U>, Inbox<U>) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        let (work_tx, work_rx) = mpsc::channel::<(u64, T)>(self.workers);
        let (completion_tx, completion_rx) = mpsc::channel::<(u64, Res<U>)>(DEFAULT_CHANNEL_CAPACITY);
        let work_rx = Arc::new(AsyncMutex::new(work_rx));

        let span = processor_span("async_mapper", &self.name);
        for _ in 0..self.workers {
            tokio::spawn(
                run_worker(
                    self.name.clone(),
                    self.func.clone(),
                    work_rx.clone(),
                    completion_tx.clone(),
                    cancel.clone(),
                )
                .instrument(span.clone()),
            );
        }

        if self.ordered {
            tokio::spawn(run_sequencer(completion_rx, tx));
        } else {
            tokio::spawn(run_forwarder(completion_rx, tx));
        }

        let name = self.name.clone();
        tokio::spawn(
            async move {
                let mut next_seq = 0u64;
                loop {
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => break,
                        item = input.recv() => {
                            let Some(item) = item else { break };
                            let seq = next_seq;
                            next_seq += 1;
                            if item.is_failure() {
                                let item: Res<U> = recast_failure(item, &name);
                                if completion_tx.send((seq, item)).await.is_err() {
                                    break;
                                }
                            } else {
                                let value = item.into_value().expect("checked success above");
                                if work_tx.send((seq, value)).await.is_err() {
                                    break;
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

async fn run_worker<T, U>(
    name: String,
    func: MapFn<T, U>,
    work_rx: Arc<AsyncMutex<mpsc::Receiver<(u64, T)>>>,
    completion_tx: mpsc::Sender<(u64, Res<U>)>,
    cancel: CancelToken,
) where
    T: Clone + Send + 'static,
    U: Default + Send + 'static,
{
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            next = async { work_rx.lock().await.recv().await } => {
                let Some((seq, value)) = next else { break };
                let outcome = AssertUnwindSafe((func)(value)).catch_unwind().await;
                let res = match outcome {
                    Ok(Ok(mapped)) => Res::success(mapped),
                    Ok(Err(source)) => {
                        tracing::debug!(seq, "mapper function returned an error");
                        Res::failure(
                            U::default(),
                            FlowError::user(name.clone(), source, ErrorKind::Validation),
                            name.clone(),
                            wall_now(),
                        )
                    }
                    Err(payload) => {
                        tracing::warn!(seq, "mapper function panicked");
                        Res::failure(U::default(), FlowError::panicked(name.clone(), payload), name.clone(), wall_now())
                    }
                };
                if completion_tx.send((seq, res)).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Buffers out-of-order completions until their predecessor has been
/// emitted. On cancellation/close with a gap, drains the contiguous
/// prefix it has and drops the rest (`spec.md` §4.6).
async fn run_sequencer<U>(mut completion_rx: mpsc::Receiver<(u64, Res<U>)>, tx: Outbox<U>) {
    let mut pending: BTreeMap<u64, Res<U>> = BTreeMap::new();
    let mut next = 0u64;
    while let Some((seq, res)) = completion_rx.recv().await {
        pending.insert(seq, res);
        while let Some(res) = pending.remove(&next) {
            if tx.send(res).await.is_err() {
                return;
            }
            next += 1;
        }
    }
}

async fn run_forwarder<U>(mut completion_rx: mpsc::Receiver<(u64, Res<U>)>, tx: Outbox<U>) {
    while let Some((_, res)) = completion_rx.recv().await {
        if tx.send(res).await.is_err() {
            return;
        }
    }
}
