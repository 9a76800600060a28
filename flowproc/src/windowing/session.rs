//! Per-key sessions bounded by an inactivity gap (`spec.md` §4.5.3).

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::sync::mpsc;
use tracing::Instrument;

use crate::{
    clock::{self, Clock},
    error::wall_now,
    processor::{catch_panic, processor_span, CancelToken, Inbox, Outbox, DEFAULT_CHANNEL_CAPACITY},
    result::Res,
    window::Window,
};

/// Partitions items by a key derived from each via `key_fn`. For each
/// key, a session spans `[first_item_time, last_item_time + gap)`; a new
/// item with the same key extends `end` to `now + gap`. A periodic check
/// (every `max(gap/4, 10ms)`) emits any session whose `end` has passed.
/// Sessions for different keys never merge.
///
/// A panic inside `key_fn` is captured: the offending item is emitted as
/// a `Failure` whose `input` is a single-element [`Window`] holding it,
/// so the item isn't silently lost; the session engine continues.
pub struct SessionWindow<T> {
    name: String,
    gap: Duration,
    key_fn: Arc<dyn Fn(&Res<T>) -> String + Send + Sync>,
    clock: Arc<dyn Clock>,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T> SessionWindow<T>
where
    T: Send + 'static,
{
    pub fn new(gap: Duration, key_fn: impl Fn(&Res<T>) -> String + Send + Sync + 'static) -> Self {
        assert!(!gap.is_zero(), "gap must be positive");
        Self {
            name: "session_window".to_owned(),
            gap,
            key_fn: Arc::new(key_fn),
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
        let span = processor_span("session_window", &self.name);
        tokio::spawn(async move {
            let mut sessions: HashMap<String, Window<T>> = HashMap::new();
            let quarter = Duration::from_nanos((self.gap.as_nanos() / 4).min(u64::MAX as u128) as u64);
            let check_every = quarter.max(Duration::from_millis(10));
            let mut ticker = self.clock.ticker(check_every);
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return,
                    item = input.recv() => {
                        match item {
                            None => {
                                for (_, w) in sessions {
                                    if !w.is_empty() && tx.send(w.into_result()).await.is_err() {
                                        return;
                                    }
                                }
                                return;
                            }
                            Some(item) => {
                                let now = self.clock.now();
                                match catch_panic(&self.name, || (self.key_fn)(&item)) {
                                    Ok(key) => {
                                        let session = sessions
                                            .entry(key)
                                            .or_insert_with(|| Window::new(now, now + self.gap));
                                        session.end = now + self.gap;
                                        session.push(item);
                                    }
                                    Err(err) => {
                                        let mut w = Window::new(now, now);
                                        w.push(item);
                                        let failure = Res::failure(w, err, self.name.clone(), wall_now());
                                        if tx.send(failure).await.is_err() {
                                            return;
                                        }
                                    }
                                }
                                if !flush_expired(&mut sessions, now, &tx).await {
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
                        if !flush_expired(&mut sessions, now, &tx).await {
                            return;
                        }
                    }
                }
            }
        }.instrument(span));
        rx
    }
}

async fn flush_expired<T>(sessions: &mut HashMap<String, Window<T>>, now: Instant, tx: &Outbox<Window<T>>) -> bool {
    let expired: Vec<String> = sessions.iter().filter(|(_, w)| now >= w.end).map(|(k, _)| k.clone()).collect();
    for key in expired {
        if let Some(w) = sessions.remove(&key) {
            if !w.is_empty() {
                tracing::debug!(count = w.count(), "emitting session on inactivity gap");
                if tx.send(w.into_result()).await.is_err() {
                    return false;
                }
            }
        }
    }
    true
}
