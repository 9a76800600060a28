//! [`Window<T>`] — the output type shared by all three windowing engines.

use std::time::Instant;

use crate::result::{keys, Metadata, Res};

/// A time-bounded group of `Res<T>` emitted atomically by a windowing
/// processor. `results` preserves arrival order within the window.
#[derive(Debug, Clone)]
pub struct Window<T> {
    pub start: Instant,
    pub end: Instant,
    pub results: Vec<Res<T>>,
}

impl<T> Window<T> {
    pub fn new(start: Instant, end: Instant) -> Self {
        Self {
            start,
            end,
            results: Vec::new(),
        }
    }

    pub fn push(&mut self, item: Res<T>) {
        self.results.push(item);
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn count(&self) -> usize {
        self.results.len()
    }

    /// Successes only, in arrival order.
    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.results.iter().filter_map(|r| r.value())
    }

    /// Failures only, in arrival order.
    pub fn errors(&self) -> impl Iterator<Item = &Res<T>> {
        self.results.iter().filter(|r| r.is_failure())
    }

    pub fn success_rate(&self) -> f64 {
        if self.results.is_empty() {
            return 0.0;
        }
        let successes = self.results.iter().filter(|r| r.is_success()).count();
        successes as f64 / self.results.len() as f64
    }

    /// Wraps `self` as the emitted `Res::Success`, stamping `window_start`/
    /// `window_end` metadata (`spec.md` §3.1). Built directly rather than
    /// via `Res::success` + `with_metadata` so windowing processors don't
    /// need a `T: Clone` bound just to tag the envelope.
    pub fn into_result(self) -> Res<Self> {
        let metadata = Metadata::new().with(keys::WINDOW_START, self.start).with(keys::WINDOW_END, self.end);
        Res::Success { value: self, metadata }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_rate_counts_failures_separately() {
        let now = Instant::now();
        let mut w: Window<i32> = Window::new(now, now);
        w.push(Res::success(1));
        w.push(Res::success(2));
        assert_eq!(1.0, w.success_rate());
        assert_eq!(2, w.values().count());
        assert_eq!(0, w.errors().count());
    }

    #[test]
    fn into_result_stamps_window_start_and_end() {
        let start = Instant::now();
        let end = start + std::time::Duration::from_millis(100);
        let mut w: Window<i32> = Window::new(start, end);
        w.push(Res::success(1));

        let res = w.into_result();
        let (got_start, found, _) = res.metadata().get_instant(crate::result::keys::WINDOW_START);
        assert!(found);
        assert_eq!(Some(start), got_start);
        let (got_end, found, _) = res.metadata().get_instant(crate::result::keys::WINDOW_END);
        assert!(found);
        assert_eq!(Some(end), got_end);
    }
}
