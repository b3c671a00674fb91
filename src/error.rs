//! Error types for the scheduler.
//!
//! The public API distinguishes two failure classes:
//!
//! - **Argument errors** are returned to the caller: an unrecognized
//!   priority tag, a worker index outside the configured range where no
//!   modulo wrap is defined, a handle that names no live task.
//! - **Invariant violations** indicate scheduler bugs (a satisfied steal
//!   request with no outstanding counter, a full channel that was sized to
//!   never fill). These are `debug_assert!`ed in debug builds and fatal in
//!   release; they never surface as `Err` values.
//!
//! A worker-loop verdict of "terminate" is a normal shutdown signal, not an
//! error, and is reported through return values.

use crate::types::{ThreadId, ThreadState};
use thiserror::Error;

/// Convenience alias for scheduler results.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by the scheduler's public API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// An operation received [`crate::types::ThreadPriority::Unknown`].
    #[error("{operation}: unknown thread priority value")]
    UnknownPriority {
        /// The operation that rejected the tag.
        operation: &'static str,
    },

    /// A worker index was out of range in a context without modulo wrap.
    #[error("worker index {worker} out of range (worker count {count})")]
    InvalidWorker {
        /// The offending index.
        worker: usize,
        /// The configured worker count.
        count: usize,
    },

    /// A state argument was invalid for the operation: creation accepts
    /// only pending or suspended, and state updates reject the query
    /// sentinel.
    #[error("invalid thread state {state:?} for this operation")]
    InvalidState {
        /// The rejected state.
        state: ThreadState,
    },

    /// A handle named no live task.
    #[error("unknown thread {0:?}")]
    UnknownThread(ThreadId),
}
