//! sledbus-core - message, key, and codec building blocks
//!
//! This crate holds the pure, store-independent layer of the sledbus
//! message bus: the [`Message`]/[`MessageRecord`] types, the ordered
//! message-key codec in [`keys`], and the pluggable value [`Codec`].
//! The `sledbus` crate builds the registries, publishers, and subscriber on
//! top of these.
//!
//! Nothing in here performs I/O, so everything is directly unit-testable.

pub mod codec;
pub mod error;
pub mod keys;
pub mod record;

pub use codec::{Codec, JsonCodec};
pub use error::{Error, Result};
pub use record::{Message, MessageRecord, DELAYED_UNTIL_KEY};
