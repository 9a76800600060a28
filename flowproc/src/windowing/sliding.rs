//! Overlapping fixed-size windows opened every `slide` (`spec.md`
//! §4.5.2).

use std::{
    collections::BTreeMap,
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::sync::mpsc;
use tracing::Instrument;

use super::align;
use crate::{
    clock::{self, Clock, Ticker},
    processor::{processor_span, CancelToken, Inbox, Outbox, DEFAULT_CHANNEL_CAPACITY},
    result::Res,
    window::Window,
};

/// An item at instant `t` joins every currently-open window that
/// contains it, and opens a new window at `floor(t/slide)*slide` if one
/// isn't already open there. Windows are emitted, in ascending `start`
/// order, at their `end` instant; a periodic check every `slide/4`
/// catches windows whose end has passed without a triggering item.
/// `slide == size` degenerates to tumbling-equivalent behavior.
pub struct SlidingWindow<T> {
    name: String,
    size: Duration,
    slide: Duration,
    clock: Arc<dyn Clock>,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T> SlidingWindow<T>
where
    T: Clone + Send + 'static,
{
    pub fn new(size: Duration, slide: Duration) -> Self {
        assert!(!size.is_zero(), "window size must be positive");
        assert!(!slide.is_zero(), "slide must be positive");
        assert!(slide <= size, "slide must not exceed size");
        Self {
            name: "sliding_window".to_owned(),
            size,
            slide,
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
        let span = processor_span("sliding_window", &self.name);
        tokio::spawn(
            async move {
            let origin = self.clock.now();
            // Open windows keyed by start instant, ascending. A BTreeMap
            // preserves close-order (spec: "ascending start").
            let mut open: BTreeMap<Instant, Window<T>> = BTreeMap::new();
            let check_every = Duration::from_nanos((self.slide.as_nanos() / 4).max(1) as u64);
            let mut ticker: Ticker = self.clock.ticker(check_every);
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return,
                    item = input.recv() => {
                        match item {
                            None => {
                                for (_, w) in open {
                                    if !w.is_empty() && tx.send(w.into_result()).await.is_err() {
                                        return;
                                    }
                                }
                                return;
                            }
                            Some(item) => {
                                let now = self.clock.now();
                                let newest_start = align(origin, now, self.slide);
                                open.entry(newest_start)
                                    .or_insert_with(|| Window::new(newest_start, newest_start + self.size));
                                for (&start, window) in open.iter_mut() {
                                    let end = start + self.size;
                                    if start <= now && now < end {
                                        window.push(item.clone());
                                    }
                                }
                                if !flush_expired(&mut open, now, &tx).await {
                                    return;
                                }
                            }
                        }
                    }
                    ticked = ticker.tick() => {
                        if !ticked {
                            continue;
                        }
                        let now = self.clock.now();
                        if !flush_expired(&mut open, now, &tx).await {
                            return;
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

/// Emits and removes every window whose `end` has passed, in ascending
/// `start` order (the map's natural iteration order). Returns `false` if
/// the output was dropped and the driver should stop.
async fn flush_expired<T>(open: &mut BTreeMap<Instant, Window<T>>, now: Instant, tx: &Outbox<Window<T>>) -> bool {
    let expired: Vec<Instant> = open
        .iter()
        .filter(|(&start, w)| start + duration_of(w) <= now)
        .map(|(&start, _)| start)
        .collect();
    for start in expired {
        if let Some(w) = open.remove(&start) {
            if !w.is_empty() {
                tracing::debug!(count = w.count(), "emitting window");
                if tx.send(w.into_result()).await.is_err() {
                    return false;
                }
            }
        }
    }
    true
}

fn duration_of<T>(w: &Window<T>) -> Duration {
    w.end.saturating_duration_since(w.start)
}
