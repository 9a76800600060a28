//! Merging (`FanIn`) and duplicating (`FanOut`) a stream
//! (`spec.md` §4.11).

use tokio::sync::mpsc;
use tracing::Instrument;

use crate::{
    processor::{processor_span, CancelToken, Inbox, Outbox, DEFAULT_CHANNEL_CAPACITY},
    result::Res,
};

/// Merges `M` inputs into one output. No ordering guarantee across
/// inputs; each input's own order is preserved. Closes the output once
/// every input has closed.
pub struct FanIn;

impl FanIn {
    pub fn process<T>(inputs: Vec<Inbox<T>>, cancel: CancelToken) -> Inbox<T>
    where
        T: Send + 'static,
    {
        let (tx, rx): (Outbox<T>, Inbox<T>) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        let span = processor_span("fan_in", "fan_in");
        for mut input in inputs {
            let tx = tx.clone();
            let cancel = cancel.clone();
            tokio::spawn(
                async move {
                    loop {
                        tokio::select! {
                            biased;
                            () = cancel.cancelled() => return,
                            item = input.recv() => {
                                let Some(item) = item else { return };
                                if tx.send(item).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                }
                .instrument(span.clone()),
            );
        }
        rx
    }
}

/// Duplicates one input into `n` outputs. Every output receives every
/// `Res` (cloned); sends to all outputs complete before the next input
/// item is read, so a slow consumer back-pressures the whole fan-out.
/// Built on an `async_broadcast` channel: each output is an adapter task
/// draining its own broadcast receiver into an `Inbox<T>`, keeping the
/// crate-wide `Inbox`/`Outbox` shape at the public boundary.
pub struct FanOut;

impl FanOut {
    pub fn process<T>(n: usize, mut input: Inbox<T>, cancel: CancelToken) -> Vec<Inbox<T>>
    where
        T: Clone + Send + 'static,
    {
        assert!(n > 0, "n must be positive");
        let (broadcast_tx, broadcast_rx) = async_broadcast::broadcast::<Res<T>>(DEFAULT_CHANNEL_CAPACITY);

        let mut receivers = Vec::with_capacity(n);
        for _ in 0..n {
            let mut upstream = broadcast_rx.clone();
            let (tx, rx): (Outbox<T>, Inbox<T>) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
            tokio::spawn(async move {
                while let Ok(item) = upstream.recv().await {
                    if tx.send(item).await.is_err() {
                        return;
                    }
                }
            });
            receivers.push(rx);
        }
        drop(broadcast_rx);

        let span = processor_span("fan_out", "fan_out");
        tokio::spawn(
            async move {
                loop {
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => return,
                        item = input.recv() => {
                            let Some(item) = item else { return };
                            if broadcast_tx.broadcast(item).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
            .instrument(span),
        );
        receivers
    }
}
