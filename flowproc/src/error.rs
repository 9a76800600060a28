//! Crate-wide error taxonomy.
//!
//! Every processor follows the same discipline: a `Res::Failure` arriving
//! on input is forwarded with its `processor` field updated to record the
//! path it took, while a processor-induced error (a user `fn`, a key-fn, a
//! hasher) is captured as a fresh `Res::Failure` carrying this error type.

use std::{fmt, time::SystemTime};

use snafu::Snafu;

/// Coarse classification of a [`FlowError`], consulted by [`crate::retry`]
/// to decide whether a failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The user function rejected the item; retrying would not help.
    Validation,
    /// A network/timeout/service-unavailable style error; worth retrying.
    Transient,
    /// Retries were exhausted, or the error was classified non-retryable
    /// up front.
    Permanent,
    /// Processing was interrupted by cancellation.
    Cancellation,
    /// A user-supplied function panicked; the processor recovered and
    /// continued.
    PanicRecovered,
}

impl ErrorKind {
    /// Default retryability for errors that arrive without a caller
    /// supplied classifier, per `spec.md` §4.9 ("sensible defaults for
    /// network/timeout/transient markers").
    pub fn is_retryable_by_default(self) -> bool {
        matches!(self, ErrorKind::Transient)
    }
}

/// A boxed, type-erased source error, since each processor is generic
/// over arbitrary user error types.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors attached to a `Res::Failure`.
#[derive(Debug, Snafu)]
pub enum FlowError {
    /// A user-supplied function (`Mapper::fn`, `Retry::execute`, ...)
    /// returned an error.
    #[snafu(display("{processor}: {source}"))]
    User {
        processor: String,
        source: BoxError,
        kind: ErrorKind,
    },

    /// A user-supplied key function, hasher, or `Strategy::route`
    /// panicked. The panic payload is captured as a string when possible,
    /// per `spec.md` §9's panic-recovery requirement.
    #[snafu(display("{processor}: panicked: {message}"))]
    Panicked { processor: String, message: String },

    /// Cancellation was signalled while an item was in flight.
    #[snafu(display("{processor}: cancelled"))]
    Cancelled { processor: String },
}

impl FlowError {
    /// Classifies this error for retry/DLQ routing purposes.
    pub fn kind(&self) -> ErrorKind {
        match self {
            FlowError::User { kind, .. } => *kind,
            FlowError::Panicked { .. } => ErrorKind::PanicRecovered,
            FlowError::Cancelled { .. } => ErrorKind::Cancellation,
        }
    }

    /// Name of the processor that produced this error.
    pub fn processor(&self) -> &str {
        match self {
            FlowError::User { processor, .. }
            | FlowError::Panicked { processor, .. }
            | FlowError::Cancelled { processor, .. } => processor,
        }
    }

    /// Unwraps `source` chains looking for a type the caller recognizes,
    /// matching `spec.md` §4.9's "wrapped-error recognition" requirement.
    pub fn downcast_source<E: std::error::Error + 'static>(&self) -> Option<&E> {
        match self {
            FlowError::User { source, .. } => {
                let mut cur: &(dyn std::error::Error + 'static) = source.as_ref();
                loop {
                    if let Some(e) = cur.downcast_ref::<E>() {
                        return Some(e);
                    }
                    cur = cur.source()?;
                }
            }
            _ => None,
        }
    }

    pub(crate) fn user(
        processor: impl Into<String>,
        source: BoxError,
        kind: ErrorKind,
    ) -> Self {
        FlowError::User {
            processor: processor.into(),
            source,
            kind,
        }
    }

    pub(crate) fn panicked(processor: impl Into<String>, payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = panic_message(&payload);
        FlowError::Panicked {
            processor: processor.into(),
            message,
        }
    }

    pub(crate) fn cancelled(processor: impl Into<String>) -> Self {
        FlowError::Cancelled {
            processor: processor.into(),
        }
    }

    /// An owned copy carrying the same display text, for callers (e.g.
    /// [`crate::retry`]) that need to hold an error across an `await`
    /// without cloning the non-`Clone` boxed source.
    pub(crate) fn clone_for_retry(&self) -> FlowError {
        match self {
            FlowError::User { processor, source, kind } => FlowError::User {
                processor: processor.clone(),
                source: Box::new(MessageError::new(source.to_string())),
                kind: *kind,
            },
            FlowError::Panicked { processor, message } => FlowError::Panicked {
                processor: processor.clone(),
                message: message.clone(),
            },
            FlowError::Cancelled { processor } => FlowError::Cancelled {
                processor: processor.clone(),
            },
        }
    }
}

/// Extracts a human-readable message from a caught panic payload.
fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

/// A trivial error carrying only a message, for user closures that want
/// to produce a `FlowError::User` without defining their own error type.
#[derive(Debug, Snafu)]
#[snafu(display("{message}"))]
pub struct MessageError {
    pub message: String,
}

impl MessageError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Stamp used for `Res::Failure::timestamp` wherever a processor has no
/// [`crate::clock::Clock`] handy (trivial processors have no timing
/// obligations per `spec.md` §4.12).
pub(crate) fn wall_now() -> SystemTime {
    SystemTime::now()
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
            ErrorKind::Cancellation => "cancellation",
            ErrorKind::PanicRecovered => "panic-recovered",
        };
        f.write_str(s)
    }
}
