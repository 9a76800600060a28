//! Trailing-edge quiet-period debouncing (`spec.md` §4.3).

use std::{sync::Arc, time::Duration};

use tokio::sync::mpsc;
use tracing::Instrument;

use crate::{
    clock::{self, Clock, Timer},
    processor::{processor_span, CancelToken, Inbox, Outbox, DEFAULT_CHANNEL_CAPACITY},
    result::Res,
};

/// Holds the most recent success and emits it only once no further
/// success arrives for `quiet_period`. A new success replaces the held
/// item and restarts the wait. Failures pass straight through and never
/// touch the pending item.
pub struct Debounce<T> {
    name: String,
    quiet_period: Duration,
    clock: Arc<dyn Clock>,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T> Debounce<T>
where
    T: Send + 'static,
{
    pub fn new(quiet_period: Duration) -> Self {
        Self {
            name: "debounce".to_owned(),
            quiet_period,
            clock: clock::real(),
            _marker: std::marker::PhantomData,
        }
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
        let span = processor_span("debounce", &self.name);
        tokio::spawn(
            async move {
                let mut pending: Option<Res<T>> = None;
                let mut timer: Option<Timer> = None;
                loop {
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => return,
                        item = input.recv() => {
                            match item {
                                None => {
                                    if let Some(p) = pending.take() {
                                        let _ = tx.send(p).await;
                                    }
                                    return;
                                }
                                Some(item) => {
                                    if item.is_failure() {
                                        let item = item.passed_through(self.name.clone());
                                        if tx.send(item).await.is_err() {
                                            return;
                                        }
                                        continue;
                                    }
                                    if pending.is_some() {
                                        tracing::trace!("quiet period restarted by new arrival");
                                    }
                                    pending = Some(item);
                                    timer = Some(self.clock.timer(self.quiet_period));
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
                            if fired {
                                if let Some(p) = pending.take() {
                                    tracing::debug!("quiet period elapsed, emitting");
                                    if tx.send(p).await.is_err() {
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
