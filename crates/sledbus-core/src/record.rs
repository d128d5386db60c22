//! Message Types
//!
//! This module defines the two message representations used by the bus:
//!
//! - **`Message`**: what publishers hand in and consumers receive. A UUID,
//!   a string-to-string metadata map, and an opaque payload.
//! - **`MessageRecord`**: the persisted form of a message. Identical to
//!   `Message` plus the `created` timestamp stamped at publish time.
//!
//! ## Delayed delivery
//!
//! Delay is carried in-band as metadata rather than as a dedicated field so
//! that records stay compatible with the wider ecosystem convention: the
//! reserved key [`DELAYED_UNTIL_KEY`] holds an RFC-3339 UTC timestamp before
//! which the message must not be delivered. The [`Message::delayed_until`]
//! and [`Message::delayed_for`] builders write that key for you.
//!
//! ## Example
//! ```ignore
//! let msg = Message::new("order placed")
//!     .with_metadata("tenant", "acme")
//!     .delayed_for(Duration::from_secs(30));
//! publisher.publish("orders", &[msg])?;
//! ```

use std::collections::HashMap;

use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Reserved metadata key carrying an RFC-3339 UTC timestamp before which a
/// message must not be delivered.
///
/// The key name follows the upstream messaging-framework convention so that
/// messages produced by other tooling keep their delay semantics here.
pub const DELAYED_UNTIL_KEY: &str = "_watermill_delayed_until";

/// A single publishable/consumable message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Caller-visible message identifier.
    pub uuid: String,

    /// Free-form string metadata. The [`DELAYED_UNTIL_KEY`] entry is
    /// interpreted by the publisher; everything else passes through.
    pub metadata: HashMap<String, String>,

    /// Opaque payload bytes.
    pub payload: Bytes,
}

impl Message {
    /// Create a message with a fresh v4 UUID and empty metadata.
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            uuid: Uuid::new_v4().to_string(),
            metadata: HashMap::new(),
            payload: payload.into(),
        }
    }

    /// Replace the generated UUID with a caller-chosen one.
    pub fn with_uuid(mut self, uuid: impl Into<String>) -> Self {
        self.uuid = uuid.into();
        self
    }

    /// Add a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Hold the message back until the given instant.
    pub fn delayed_until(mut self, until: DateTime<Utc>) -> Self {
        self.metadata.insert(
            DELAYED_UNTIL_KEY.to_string(),
            until.to_rfc3339_opts(SecondsFormat::Nanos, true),
        );
        self
    }

    /// Hold the message back for the given duration from now.
    pub fn delayed_for(self, delay: std::time::Duration) -> Self {
        self.delayed_until(Utc::now() + delay)
    }
}

/// The persisted form of a [`Message`].
///
/// Every field is always serialized; in particular an empty metadata map is
/// written as `{}` so that it round-trips as an empty map rather than going
/// missing. Decoding tolerates absent fields for forward compatibility.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    #[serde(default)]
    pub uuid: String,

    #[serde(default)]
    pub metadata: HashMap<String, String>,

    #[serde(default)]
    pub payload: Bytes,

    /// Publish-time timestamp, stamped once per publish call.
    #[serde(default = "unix_epoch")]
    pub created: DateTime<Utc>,
}

fn unix_epoch() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

impl MessageRecord {
    /// Build the persisted form of `message`, stamped with `created`.
    pub fn new(message: &Message, created: DateTime<Utc>) -> Self {
        Self {
            uuid: message.uuid.clone(),
            metadata: message.metadata.clone(),
            payload: message.payload.clone(),
            created,
        }
    }

    /// Recover the user-facing message, dropping the `created` stamp.
    pub fn into_message(self) -> Message {
        Message {
            uuid: self.uuid,
            metadata: self.metadata,
            payload: self.payload,
        }
    }
}
