//! Error types for the sledbus core building blocks.
//!
//! These errors cover the pure, store-independent layer: name validation,
//! message-key decoding, and record (de)serialization. The `sledbus` crate
//! wraps this enum into its own error type via `#[from]`.

use thiserror::Error;

/// Convenience type alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the core key and record codecs.
#[derive(Debug, Error)]
pub enum Error {
    /// A topic or subscription name failed validation.
    ///
    /// Raised for empty topics and for subscription prefixes whose logical
    /// part does not fit in the 1-byte length header (max 255 bytes).
    #[error("invalid name: {0}")]
    InvalidName(String),

    /// A message key was too short to carry the ordered suffix fields.
    #[error("malformed message key")]
    MalformedKey,

    /// A persisted record could not be decoded.
    #[error("malformed message payload: {0}")]
    MalformedPayload(String),
}
