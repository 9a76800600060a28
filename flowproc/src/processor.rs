//! Shared plumbing every processor module builds on: channel type
//! aliases, the default channel capacity, cancellation, and the
//! panic-recovery helper required at every user-function boundary
//! (`spec.md` §9).

use std::panic::AssertUnwindSafe;

use tokio::sync::mpsc;

use crate::{
    error::FlowError,
    result::{keys, Res},
};

/// The receiving half of a processor's input: one `Res<T>` per element,
/// in arrival order.
pub type Inbox<T> = mpsc::Receiver<Res<T>>;

/// The sending half of a processor's output.
pub type Outbox<T> = mpsc::Sender<Res<T>>;

/// Cooperative cancellation, shared across a pipeline. Every driver task
/// observes this at its suspension points (`spec.md` §5).
pub type CancelToken = tokio_util::sync::CancellationToken;

/// Bounded channel capacity used by processor constructors that don't
/// expose their own `with_capacity`. Chosen to give a slow consumer a
/// few items of slack without masking true backpressure.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Runs a user-supplied closure, catching a panic and turning it into a
/// [`FlowError::Panicked`] instead of unwinding into the driver task.
///
/// Every key-fn, hasher, `Strategy::route`, mapper `fn`, and retry
/// `execute` boundary goes through this (`spec.md` §9).
pub(crate) fn catch_panic<F, R>(processor: &str, f: F) -> Result<R, FlowError>
where
    F: FnOnce() -> R,
{
    std::panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| FlowError::panicked(processor, payload))
}

/// A processor's human-readable identity, used as the `processor` field
/// on every `Failure` it produces and in its metadata writes
/// (`spec.md` §6). Each processor type picks its own default and
/// exposes `with_name` to override it.
pub(crate) fn default_name(kind: &str) -> String {
    kind.to_owned()
}

/// The span every processor's driver task runs inside, carrying its
/// name (`SPEC_FULL.md` §2). State-transition events (window emitted,
/// item dropped, retry attempted, dedupe eviction, ...) are logged
/// within it at `debug`/`trace` level; no subscriber is installed by
/// this crate, so logging is inert until the caller wires one up.
pub(crate) fn processor_span(kind: &'static str, name: &str) -> tracing::Span {
    tracing::info_span!("processor", kind, name = %name)
}

/// Rewraps a `Failure<T>` as a `Failure<U>` for processors whose output
/// type differs from its input type ([`crate::mapper::AsyncMapper`],
/// [`crate::trivial::Mapper`]). `Res<U>::Failure` has no slot for a
/// value of type `T`, so `input` becomes `U::default()` — a
/// placeholder, not the original value.
pub(crate) fn recast_failure<T, U: Default>(item: Res<T>, processor: &str) -> Res<U> {
    match item {
        Res::Failure {
            error,
            timestamp,
            metadata,
            ..
        } => Res::Failure {
            input: U::default(),
            error,
            processor: processor.to_owned(),
            timestamp,
            metadata: metadata.with(keys::PROCESSOR, processor.to_owned()),
        },
        Res::Success { .. } => unreachable!("recast_failure called on a Success"),
    }
}
