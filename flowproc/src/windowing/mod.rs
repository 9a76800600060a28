//! Time-windowing engines: tumbling, sliding, session (`spec.md` §4.5).
//!
//! All three share the output type `Res<Window<T>>` and the rule that
//! empty windows are never emitted; they differ only in boundary
//! policy.

mod session;
mod sliding;
mod tumbling;

pub use session::SessionWindow;
pub use sliding::SlidingWindow;
pub use tumbling::TumblingWindow;

use std::time::{Duration, Instant};

/// Aligns `now` down to the nearest multiple of `unit` measured from
/// `origin`: `origin + floor((now - origin) / unit) * unit`.
///
/// `Instant` has no absolute epoch to truncate against, so `origin` (the
/// processor's start instant) stands in for `spec.md` §4.5.1's
/// `start_time`.
pub(crate) fn align(origin: Instant, now: Instant, unit: Duration) -> Instant {
    let elapsed = now.saturating_duration_since(origin);
    let unit_nanos = unit.as_nanos().max(1);
    let aligned_nanos = (elapsed.as_nanos() / unit_nanos) * unit_nanos;
    origin + Duration::from_nanos(aligned_nanos.min(u64::MAX as u128) as u64)
}
