//! Fixed-size, non-overlapping windows (`spec.md` §4.5.1).

use std::{sync::Arc, time::Duration};

use tokio::sync::mpsc;
use tracing::Instrument;

use super::align;
use crate::{
    clock::{self, Clock, Timer},
    processor::{processor_span, CancelToken, Inbox, Outbox, DEFAULT_CHANNEL_CAPACITY},
    result::Res,
    window::Window,
};

/// Groups items into fixed, non-overlapping `size`-wide windows aligned
/// to the processor's start instant. An item at instant `t` belongs to
/// exactly the window `[floor(t/size)*size, that + size)`; each window
/// is emitted at its end instant, or on input close/cancellation if
/// non-empty.
pub struct TumblingWindow<T> {
    name: String,
    size: Duration,
    clock: Arc<dyn Clock>,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T> TumblingWindow<T>
where
    T: Send + 'static,
{
    pub fn new(size: Duration) -> Self {
        assert!(!size.is_zero(), "window size must be positive");
        Self {
            name: "tumbling_window".to_owned(),
            size,
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

    pub fn process(self, mut input: Inbox<T>, cancel: CancelToken) -> Inbox<Window<T>> {
        let (tx, rx): (Outbox<Window<T>>, Inbox<Window<T>>) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        let span = processor_span("tumbling_window", &self.name);
        tokio::spawn(
            async move {
                let origin = self.clock.now();
                let mut current: Option<Window<T>> = None;
                let mut timer: Option<Timer> = None;
                loop {
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => return,
                        item = input.recv() => {
                            match item {
                                None => {
                                    if let Some(w) = current.take() {
                                        if !w.is_empty() {
                                            tracing::debug!(count = w.count(), "emitting window on close");
                                            let _ = tx.send(w.into_result()).await;
                                        }
                                    }
                                    return;
                                }
                                Some(item) => {
                                    let now = self.clock.now();
                                    let start = align(origin, now, self.size);
                                    let end = start + self.size;
                                    let boundary_changed = match &current {
                                        Some(w) => w.start != start,
                                        None => true,
                                    };
                                    if boundary_changed {
                                        if let Some(w) = current.take() {
                                            if !w.is_empty() {
                                                tracing::debug!(count = w.count(), "emitting window");
                                                if tx.send(w.into_result()).await.is_err() {
                                                    return;
                                                }
                                            }
                                        }
                                        current = Some(Window::new(start, end));
                                        timer = Some(self.clock.timer(end.saturating_duration_since(now)));
                                    }
                                    current.as_mut().expect("just opened above").push(item);
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
                                if let Some(w) = current.take() {
                                    if !w.is_empty() {
                                        tracing::debug!(count = w.count(), "emitting window on timer");
                                        if tx.send(w.into_result()).await.is_err() {
                                            return;
                                        }
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
