//! Publisher API
//!
//! Publishing fans a message out to every subscription of its topic: one
//! record per `(message, subscription)` pair, each under its own ordered
//! key. The store deliberately holds `|subscriptions|` physical copies of
//! every payload, because each subscription has an independent consumption
//! cursor and visibility state; no delivery-tracking side table exists.
//!
//! All writes of a publish call commit atomically, so a failed publish is
//! never partially visible and the caller can simply retry the whole batch.
//!
//! ## Outbox pattern
//!
//! [`TxPublisher`] plans the same writes but inserts them into a
//! caller-supplied transaction, so messages commit atomically with other
//! application state:
//!
//! ```ignore
//! db.transaction(|tx| {
//!     tx.insert(b"order:42", order_bytes.clone())?;
//!     tx_publisher.publish(tx, "orders", &messages)?;
//!     Ok(())
//! })?;
//! ```
//!
//! ## Delayed delivery
//!
//! A message carrying the reserved [`DELAYED_UNTIL_KEY`] metadata entry is
//! written with its due time taken from that RFC-3339 timestamp instead of
//! `now`. An unparseable timestamp fails the whole publish with
//! `InvalidDelay` before anything is written; that is a caller bug and
//! fails loudly.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sled::transaction::{ConflictableTransactionError, ConflictableTransactionResult, TransactionalTree};
use tracing::debug;

use sledbus_core::{keys, Codec, JsonCodec, Message, MessageRecord, DELAYED_UNTIL_KEY};

use crate::error::{Error, Result};
use crate::registry::Registry;

/// Configuration shared by [`Publisher`] and [`TxPublisher`].
#[derive(Clone)]
pub struct PublisherConfig {
    /// Record marshaller; JSON by default.
    pub codec: Arc<dyn Codec>,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            codec: Arc::new(JsonCodec),
        }
    }
}

/// Publishes message batches in a self-contained atomic batch.
pub struct Publisher {
    db: sled::Db,
    registry: Arc<dyn Registry>,
    config: PublisherConfig,
}

impl Publisher {
    pub fn new(db: &sled::Db, registry: Arc<dyn Registry>, config: PublisherConfig) -> Self {
        Self {
            db: db.clone(),
            registry,
            config,
        }
    }

    /// Publish `messages` to every subscription of `topic`.
    ///
    /// Publishing zero messages is a no-op; publishing to a topic with no
    /// subscriptions silently drops the messages, as a pub/sub bus with no
    /// subscribers does.
    ///
    /// # Errors
    ///
    /// `InvalidName` for an empty topic, `InvalidDelay` for an unparseable
    /// delay marker, `Store` when the batch fails to commit. Nothing is
    /// written unless everything is.
    pub fn publish(&self, topic: &str, messages: &[Message]) -> Result<()> {
        let writes = plan_writes(self.registry.as_ref(), self.config.codec.as_ref(), topic, messages)?;
        if writes.is_empty() {
            return Ok(());
        }

        let count = writes.len();
        let mut batch = sled::Batch::default();
        for (key, value) in writes {
            batch.insert(key, value);
        }
        self.db.apply_batch(batch)?;

        debug!(topic, messages = messages.len(), records = count, "published batch");
        Ok(())
    }
}

/// Publishes message batches inside a caller-owned transaction.
pub struct TxPublisher {
    registry: Arc<dyn Registry>,
    config: PublisherConfig,
}

impl TxPublisher {
    pub fn new(registry: Arc<dyn Registry>, config: PublisherConfig) -> Self {
        Self { registry, config }
    }

    /// Plan and insert the records for `messages` into `tx`.
    ///
    /// Call this from inside a `Tree::transaction` closure on the same tree
    /// the bus runs over; the messages become visible if and only if the
    /// surrounding transaction commits. The error type threads through the
    /// closure, so `?` works directly.
    pub fn publish(
        &self,
        tx: &TransactionalTree,
        topic: &str,
        messages: &[Message],
    ) -> ConflictableTransactionResult<(), Error> {
        let writes = plan_writes(self.registry.as_ref(), self.config.codec.as_ref(), topic, messages)
            .map_err(ConflictableTransactionError::Abort)?;

        for (key, value) in writes {
            tx.insert(key, value)?;
        }
        Ok(())
    }
}

/// Resolve subscriptions, stamp `now`, and encode one `(key, value)` write
/// per `(message, subscription)` pair. Pure apart from sequence allocation;
/// an empty result means there is nothing to commit.
fn plan_writes(
    registry: &dyn Registry,
    codec: &dyn Codec,
    topic: &str,
    messages: &[Message],
) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    keys::validate_topic(topic)?;
    if messages.is_empty() {
        return Ok(Vec::new());
    }

    let subscriptions = registry.subscriptions(topic)?;
    if subscriptions.is_empty() {
        return Ok(Vec::new());
    }

    let now = Utc::now();
    let now_ns = keys::unix_nanos(now);

    let mut writes = Vec::with_capacity(messages.len() * subscriptions.len());
    for message in messages {
        let due_ns = due_at(message, now_ns)?;
        let value = codec.marshal(&MessageRecord::new(message, now))?;

        for subscription in &subscriptions {
            let seq = subscription.sequence().next()?;
            let key = keys::encode_message_key(subscription.prefix(), due_ns, seq);
            writes.push((key, value.clone()));
        }
    }
    Ok(writes)
}

fn due_at(message: &Message, now_ns: u64) -> Result<u64> {
    let Some(until) = message.metadata.get(DELAYED_UNTIL_KEY) else {
        return Ok(now_ns);
    };

    let parsed = DateTime::parse_from_rfc3339(until)
        .map_err(|e| Error::InvalidDelay(format!("{until:?}: {e}")))?;
    let due_ns = parsed
        .timestamp_nanos_opt()
        .filter(|ns| *ns >= 0)
        .ok_or_else(|| Error::InvalidDelay(format!("{until:?}: timestamp out of range")))?;
    Ok(due_ns as u64)
}
