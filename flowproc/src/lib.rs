//! Composable, asynchronous stream processors over a [`Res`] envelope.
//!
//! A pipeline is built by chaining processors: each consumes one
//! `tokio::sync::mpsc` receiver of `Res<T>` and produces one (or more, for
//! splitters and [`partition`]) receivers of `Res<U>`. There is no central
//! scheduler — every processor owns exactly one long-running driver task
//! (plus worker tasks, for [`mapper`]) that terminates when its input
//! closes or cancellation is signalled via a
//! [`tokio_util::sync::CancellationToken`].
//!
//! Start with [`result::Res`] for the envelope, [`clock::Clock`] for the
//! time abstraction every timing processor is built on, and
//! [`clock::FakeClock`] for writing deterministic tests.

pub mod backoff;
pub mod batcher;
pub mod clock;
pub mod debounce;
pub mod dedupe;
pub mod dlq;
pub mod error;
pub mod fan;
pub mod mapper;
pub mod partition;
pub mod processor;
pub mod result;
pub mod retry;
pub mod throttle;
pub mod trivial;
pub mod window;
pub mod windowing;

pub use error::{ErrorKind, FlowError};
pub use processor::{Inbox, Outbox};
pub use result::{MetaValue, Metadata, Res};
pub use window::Window;
