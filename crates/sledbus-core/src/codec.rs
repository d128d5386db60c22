//! Record Codec
//!
//! The value side of every persisted message is produced by a [`Codec`]: a
//! pure marshal/unmarshal pair over [`MessageRecord`]. The codec is
//! pluggable per publisher and subscriber; [`JsonCodec`] is the default and
//! what the rest of the workspace tests against.

use crate::error::{Error, Result};
use crate::record::MessageRecord;

/// Serializes message records to bytes and back.
///
/// Implementations must be pure: `unmarshal(marshal(r)) == r` for every
/// well-formed record, including records with empty metadata.
pub trait Codec: Send + Sync {
    /// Serialize a record for storage.
    fn marshal(&self, record: &MessageRecord) -> Result<Vec<u8>>;

    /// Deserialize a stored record.
    ///
    /// # Errors
    ///
    /// `MalformedPayload` when the input is not a valid encoding.
    fn unmarshal(&self, bytes: &[u8]) -> Result<MessageRecord>;
}

/// JSON implementation of [`Codec`], the default.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn marshal(&self, record: &MessageRecord) -> Result<Vec<u8>> {
        serde_json::to_vec(record).map_err(|e| Error::MalformedPayload(e.to_string()))
    }

    fn unmarshal(&self, bytes: &[u8]) -> Result<MessageRecord> {
        serde_json::from_slice(bytes).map_err(|e| Error::MalformedPayload(e.to_string()))
    }
}
