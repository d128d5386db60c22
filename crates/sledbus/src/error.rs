//! Error types for sledbus bus operations.
//!
//! ## Error Handling Strategy
//!
//! - **Caller bugs, fail loudly**: `Codec(InvalidName)`, `InvalidDelay`,
//!   `AlreadyRegistered`. Publishing surfaces these directly and writes
//!   nothing.
//! - **Retriable**: `Store`. The subscriber loop logs and retries these at
//!   the next receive interval; the publisher propagates them so the caller
//!   can retry the whole batch (a publish is a single atomic batch, so a
//!   failed one is never partially visible).
//! - **Corruption**: `Codec(MalformedKey | MalformedPayload)`. Logged by the
//!   subscriber, the offending item is skipped so it cannot block the head
//!   of the queue.
//! - **Shutdown**: `Closed` when a subscriber is closed or its context is
//!   cancelled mid-delivery.

use thiserror::Error;

/// Convenience type alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by registries, publishers, and subscribers.
#[derive(Debug, Error)]
pub enum Error {
    /// Name validation or key/payload codec failure from the core layer.
    #[error(transparent)]
    Codec(#[from] sledbus_core::Error),

    /// The `(topic, name)` pair is already registered.
    ///
    /// Only the in-memory registry raises this; the persistent registry
    /// silently returns the existing prefix instead.
    #[error("subscription '{name}' is already registered for topic '{topic}'")]
    AlreadyRegistered { topic: String, name: String },

    /// The reserved delay metadata entry did not parse as RFC-3339.
    #[error("invalid delay timestamp: {0}")]
    InvalidDelay(String),

    /// An underlying store operation failed.
    #[error("store error: {0}")]
    Store(#[from] sled::Error),

    /// The subscriber was closed while a delivery was in flight.
    #[error("subscriber was closed")]
    Closed,
}

impl From<sled::transaction::TransactionError<Error>> for Error {
    fn from(err: sled::transaction::TransactionError<Error>) -> Self {
        match err {
            sled::transaction::TransactionError::Abort(e) => e,
            sled::transaction::TransactionError::Storage(e) => Error::Store(e),
        }
    }
}
