//! Ordered Message-Key Codec
//!
//! Every persisted message lives under a key shaped as:
//!
//! ```text
//! ┌─────────────────────────┬────────────┬──────────┬───────────────┐
//! │ subscription prefix (P) │ due_at (8) │ seq (8)  │ tiebreak (16) │
//! └─────────────────────────┴────────────┴──────────┴───────────────┘
//! ```
//!
//! All suffix fields are big-endian, so byte-lexicographic order within a
//! prefix equals ascending `(due_at, seq, tiebreak)` order. That single
//! property drives the whole delivery path:
//!
//! - A prefix-bounded ascending scan yields messages in due order, and the
//!   subscriber can stop at the first not-yet-due key without inspecting
//!   anything else.
//! - `seq` is allocated monotonically per subscription, so keys minted in
//!   the same nanosecond still sort in publish order.
//! - `tiebreak` is 16 random bytes (a v4 UUID; uniqueness matters here, not
//!   unpredictability) so a visibility-timeout rewrite that lands on an
//!   occupied `(due_at, seq)` still produces a distinct key.
//!
//! The subscription prefix itself is `namespace ‖ [len:1] ‖ topic ‖ "_" ‖
//! name`, where `len` is the byte length of the logical `topic_name` part.
//! The logical part must fit the 1-byte header, which caps it at 255 bytes.
//!
//! Leasing a message rewrites only the `due_at` field (see
//! [`rewrite_due_at`]); `seq` and `tiebreak` travel with the message for its
//! whole lifetime.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Byte length of the ordered key suffix: due_at(8) + seq(8) + tiebreak(16).
pub const KEY_SUFFIX_LEN: usize = 32;

/// Minimum length of a well-formed message key: a 1-byte length header, at
/// least one logical prefix byte, and the 32-byte suffix.
pub const MIN_KEY_LEN: usize = 34;

/// Maximum byte length of the logical `topic_name` prefix part.
pub const MAX_LOGICAL_PREFIX_LEN: usize = 255;

/// Validate a topic name. Only emptiness is rejected at this layer.
pub fn validate_topic(topic: &str) -> Result<()> {
    if topic.is_empty() {
        return Err(Error::InvalidName("topic is an empty string".to_string()));
    }
    Ok(())
}

/// Encode the key prefix for a `(topic, name)` subscription.
///
/// The optional `namespace` isolates multiple buses sharing one store and is
/// prepended verbatim. The subscription name may be empty (a topic with a
/// single anonymous subscription).
///
/// # Errors
///
/// `InvalidName` when the topic is empty or the logical part exceeds
/// [`MAX_LOGICAL_PREFIX_LEN`] bytes.
pub fn encode_prefix(namespace: &str, topic: &str, name: &str) -> Result<Vec<u8>> {
    validate_topic(topic)?;

    let logical_len = topic.len() + 1 + name.len();
    if logical_len > MAX_LOGICAL_PREFIX_LEN {
        return Err(Error::InvalidName(format!(
            "subscription prefix is {logical_len} bytes, max {MAX_LOGICAL_PREFIX_LEN}"
        )));
    }

    let mut prefix = Vec::with_capacity(namespace.len() + 1 + logical_len);
    prefix.extend_from_slice(namespace.as_bytes());
    prefix.push(logical_len as u8);
    prefix.extend_from_slice(topic.as_bytes());
    prefix.push(b'_');
    prefix.extend_from_slice(name.as_bytes());
    Ok(prefix)
}

/// Encode a message key under `prefix`, due at `due_at_ns` (nanoseconds
/// since the Unix epoch) with per-subscription sequence number `seq`.
pub fn encode_message_key(prefix: &[u8], due_at_ns: u64, seq: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + KEY_SUFFIX_LEN);
    key.extend_from_slice(prefix);
    key.extend_from_slice(&due_at_ns.to_be_bytes());
    key.extend_from_slice(&seq.to_be_bytes());
    key.extend_from_slice(Uuid::new_v4().as_bytes());
    key
}

/// Decode the due time (nanoseconds since the Unix epoch) from a key.
///
/// # Errors
///
/// `MalformedKey` when the key is shorter than [`MIN_KEY_LEN`].
pub fn decode_due_at(key: &[u8]) -> Result<u64> {
    let start = suffix_start(key)?;
    Ok(read_u64(&key[start..start + 8]))
}

/// Decode the per-subscription sequence number from a key.
///
/// # Errors
///
/// `MalformedKey` when the key is shorter than [`MIN_KEY_LEN`].
pub fn decode_seq(key: &[u8]) -> Result<u64> {
    let start = suffix_start(key)?;
    Ok(read_u64(&key[start + 8..start + 16]))
}

/// Return a copy of `key` with the due time overwritten.
///
/// `seq` and `tiebreak` are left untouched: the changed due time alone makes
/// the rewritten key distinct from the original.
///
/// # Errors
///
/// `MalformedKey` when the key is shorter than [`MIN_KEY_LEN`].
pub fn rewrite_due_at(key: &[u8], new_due_at_ns: u64) -> Result<Vec<u8>> {
    let start = suffix_start(key)?;
    let mut rewritten = key.to_vec();
    rewritten[start..start + 8].copy_from_slice(&new_due_at_ns.to_be_bytes());
    Ok(rewritten)
}

/// Convert a UTC instant to nanoseconds since the Unix epoch, saturating at
/// the bounds of the representable range (roughly years 1677..=2262).
pub fn unix_nanos(at: DateTime<Utc>) -> u64 {
    at.timestamp_nanos_opt().unwrap_or(i64::MAX).max(0) as u64
}

fn suffix_start(key: &[u8]) -> Result<usize> {
    if key.len() < MIN_KEY_LEN {
        return Err(Error::MalformedKey);
    }
    Ok(key.len() - KEY_SUFFIX_LEN)
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    u64::from_be_bytes(buf)
}
