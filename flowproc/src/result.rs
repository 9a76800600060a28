//! The `Res<T>` envelope and its metadata discipline.
//!
//! Every element flowing through a pipeline is a [`Res<T>`]: either a
//! `Success` carrying a value and metadata, or a `Failure` preserving the
//! *original* input so that [`crate::dlq`] routing and [`crate::retry`]
//! can re-attempt it. A `Res` is immutable after construction —
//! [`Res::with_metadata`] always returns a new value.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Instant, SystemTime},
};

use snafu::Snafu;

use crate::error::FlowError;

/// Reserved metadata keys carrying framework semantics (`spec.md` §3.1).
pub mod keys {
    pub const PROCESSOR: &str = "processor";
    pub const TIMESTAMP: &str = "timestamp";
    pub const RETRY_COUNT: &str = "retry_count";
    pub const PARTITION_INDEX: &str = "partition_index";
    pub const PARTITION_TOTAL: &str = "partition_total";
    pub const PARTITION_STRATEGY: &str = "partition_strategy";
    pub const WINDOW_START: &str = "window_start";
    pub const WINDOW_END: &str = "window_end";
    pub const BATCH_SIZE: &str = "batch_size";
}

/// An opaque metadata value. Closed over the handful of types the
/// reserved keys in [`keys`] actually need, which keeps the
/// type-checked accessors (`get_int`, `get_string`, ...) honest without
/// resorting to `dyn Any` downcasting.
#[derive(Debug, Clone, PartialEq)]
pub enum MetaValue {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    Time(SystemTime),
    /// A monotonic instant, for `window_start`/`window_end` (`spec.md`
    /// §3.1) — `Instant` has no wall-clock meaning, so it can't reuse
    /// `Time`.
    Instant(Instant),
}

impl From<i64> for MetaValue {
    fn from(v: i64) -> Self {
        MetaValue::Int(v)
    }
}
impl From<usize> for MetaValue {
    fn from(v: usize) -> Self {
        MetaValue::Int(v as i64)
    }
}
impl From<f64> for MetaValue {
    fn from(v: f64) -> Self {
        MetaValue::Float(v)
    }
}
impl From<&str> for MetaValue {
    fn from(v: &str) -> Self {
        MetaValue::Str(v.to_owned())
    }
}
impl From<String> for MetaValue {
    fn from(v: String) -> Self {
        MetaValue::Str(v)
    }
}
impl From<bool> for MetaValue {
    fn from(v: bool) -> Self {
        MetaValue::Bool(v)
    }
}
impl From<SystemTime> for MetaValue {
    fn from(v: SystemTime) -> Self {
        MetaValue::Time(v)
    }
}
impl From<Instant> for MetaValue {
    fn from(v: Instant) -> Self {
        MetaValue::Instant(v)
    }
}

/// Returned by a type-checked accessor (`Metadata::get_int`, ...) when the
/// key is present but holds a different [`MetaValue`] variant.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(display("metadata key {key:?} is not the requested type"))]
pub struct MetaTypeMismatch {
    pub key: String,
}

/// Immutable, cheaply-cloned metadata map.
///
/// Copy-on-write via `Arc::make_mut`: cloning a `Metadata` is a refcount
/// bump, and `with` only deep-clones the backing map when it is actually
/// shared, per `spec.md` §9's "small-map optimization is a valid
/// implementation choice" latitude.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Metadata(Arc<HashMap<String, MetaValue>>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&MetaValue> {
        self.0.get(key)
    }

    /// Returns a new `Metadata` with `key` set to `value`, overriding any
    /// existing entry. Never mutates `self`.
    #[must_use]
    pub fn with(&self, key: impl Into<String>, value: impl Into<MetaValue>) -> Self {
        let mut clone = self.clone();
        Arc::make_mut(&mut clone.0).insert(key.into(), value.into());
        clone
    }

    pub fn get_int(&self, key: &str) -> (Option<i64>, bool, Option<MetaTypeMismatch>) {
        match self.0.get(key) {
            None => (None, false, None),
            Some(MetaValue::Int(v)) => (Some(*v), true, None),
            Some(_) => (
                None,
                true,
                Some(MetaTypeMismatch {
                    key: key.to_owned(),
                }),
            ),
        }
    }

    pub fn get_float(&self, key: &str) -> (Option<f64>, bool, Option<MetaTypeMismatch>) {
        match self.0.get(key) {
            None => (None, false, None),
            Some(MetaValue::Float(v)) => (Some(*v), true, None),
            Some(_) => (
                None,
                true,
                Some(MetaTypeMismatch {
                    key: key.to_owned(),
                }),
            ),
        }
    }

    pub fn get_string(&self, key: &str) -> (Option<&str>, bool, Option<MetaTypeMismatch>) {
        match self.0.get(key) {
            None => (None, false, None),
            Some(MetaValue::Str(v)) => (Some(v.as_str()), true, None),
            Some(_) => (
                None,
                true,
                Some(MetaTypeMismatch {
                    key: key.to_owned(),
                }),
            ),
        }
    }

    pub fn get_bool(&self, key: &str) -> (Option<bool>, bool, Option<MetaTypeMismatch>) {
        match self.0.get(key) {
            None => (None, false, None),
            Some(MetaValue::Bool(v)) => (Some(*v), true, None),
            Some(_) => (
                None,
                true,
                Some(MetaTypeMismatch {
                    key: key.to_owned(),
                }),
            ),
        }
    }

    pub fn get_time(&self, key: &str) -> (Option<SystemTime>, bool, Option<MetaTypeMismatch>) {
        match self.0.get(key) {
            None => (None, false, None),
            Some(MetaValue::Time(v)) => (Some(*v), true, None),
            Some(_) => (
                None,
                true,
                Some(MetaTypeMismatch {
                    key: key.to_owned(),
                }),
            ),
        }
    }

    pub fn get_instant(&self, key: &str) -> (Option<Instant>, bool, Option<MetaTypeMismatch>) {
        match self.0.get(key) {
            None => (None, false, None),
            Some(MetaValue::Instant(v)) => (Some(*v), true, None),
            Some(_) => (
                None,
                true,
                Some(MetaTypeMismatch {
                    key: key.to_owned(),
                }),
            ),
        }
    }
}

/// The universal stream element: either a successfully produced value, or
/// a failure that preserves the original input for DLQ/retry re-attempts.
#[derive(Debug, Clone)]
pub enum Res<T> {
    Success {
        value: T,
        metadata: Metadata,
    },
    Failure {
        /// The original value that failed to process.
        input: T,
        error: Arc<FlowError>,
        /// Name of the processor that produced this failure.
        processor: String,
        timestamp: SystemTime,
        metadata: Metadata,
    },
}

impl<T> Res<T> {
    pub fn success(value: T) -> Self {
        Res::Success {
            value,
            metadata: Metadata::new(),
        }
    }

    pub fn failure(
        input: T,
        error: FlowError,
        processor: impl Into<String>,
        timestamp: SystemTime,
    ) -> Self {
        Res::Failure {
            input,
            error: Arc::new(error),
            processor: processor.into(),
            timestamp,
            metadata: Metadata::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Res::Success { .. })
    }

    pub fn is_failure(&self) -> bool {
        !self.is_success()
    }

    pub fn metadata(&self) -> &Metadata {
        match self {
            Res::Success { metadata, .. } | Res::Failure { metadata, .. } => metadata,
        }
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Res::Success { value, .. } => Some(value),
            Res::Failure { .. } => None,
        }
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            Res::Success { value, .. } => Some(value),
            Res::Failure { .. } => None,
        }
    }

    /// The value a retry/DLQ attempt should be re-run against: the
    /// successful value, or the original failed input.
    pub fn input_or_value(&self) -> &T {
        match self {
            Res::Success { value, .. } => value,
            Res::Failure { input, .. } => input,
        }
    }

    /// Returns a new `Res` with `key` set to `value`. Per `spec.md` §3.1,
    /// this never mutates `self`.
    #[must_use]
    pub fn with_metadata(&self, key: impl Into<String>, value: impl Into<MetaValue>) -> Self
    where
        T: Clone,
    {
        match self {
            Res::Success { value: v, metadata } => Res::Success {
                value: v.clone(),
                metadata: metadata.with(key, value),
            },
            Res::Failure {
                input,
                error,
                processor,
                timestamp,
                metadata,
            } => Res::Failure {
                input: input.clone(),
                error: error.clone(),
                processor: processor.clone(),
                timestamp: *timestamp,
                metadata: metadata.with(key, value),
            },
        }
    }

    /// Forwards an input failure transparently, updating the `processor`
    /// field (and `processor` metadata key) to record the path it took
    /// (`spec.md` §7 rule 1). No-op on a `Success`.
    #[must_use]
    pub fn passed_through(self, processor: impl Into<String>) -> Self {
        match self {
            Res::Failure {
                input,
                error,
                timestamp,
                metadata,
                ..
            } => {
                let processor = processor.into();
                let metadata = metadata.with(keys::PROCESSOR, processor.clone());
                Res::Failure {
                    input,
                    error,
                    processor,
                    timestamp,
                    metadata,
                }
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_is_immutable_on_write() {
        let base = Metadata::new().with("a", 1i64);
        let extended = base.with("b", 2i64);

        assert_eq!((Some(1), true, None), base.get_int("a"));
        assert_eq!((None, false, None), base.get_int("b"));
        assert_eq!((Some(2), true, None), extended.get_int("b"));
    }

    #[test]
    fn type_mismatch_is_reported() {
        let meta = Metadata::new().with("a", "not an int");
        let (value, found, err) = meta.get_int("a");
        assert_eq!(None, value);
        assert!(found);
        assert!(err.is_some());
    }

    #[test]
    fn success_round_trips_value() {
        let r: Res<i32> = Res::success(7);
        assert!(r.is_success());
        assert_eq!(Some(&7), r.value());
    }

    #[test]
    fn instant_metadata_round_trips() {
        let now = std::time::Instant::now();
        let meta = Metadata::new().with("t", now);
        assert_eq!((Some(now), true, None), meta.get_instant("t"));
    }

    #[test]
    fn with_metadata_does_not_mutate_source() {
        let base: Res<i32> = Res::success(1);
        let tagged = base.with_metadata("k", 42i64);
        assert!(base.metadata().get("k").is_none());
        assert_eq!((Some(42), true, None), tagged.metadata().get_int("k"));
    }
}
