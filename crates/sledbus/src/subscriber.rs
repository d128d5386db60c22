//! Subscriber API
//!
//! A [`Subscriber`] registers a `(topic, name)` subscription and runs one
//! long-lived worker task per subscription. The worker polls the store,
//! leases due messages, and hands them to the consumer over an in-process
//! channel; the consumer resolves each delivery with
//! [`ReceivedMessage::ack`] or [`ReceivedMessage::nack`].
//!
//! ## Message lifecycle
//!
//! ```text
//!  [pending] ──lease──▶ [leased] ──ack──▶ [done]
//!     ▲                    │
//!     │                 nack/timeout
//!     └────────────────────┘
//! ```
//!
//! A *pending* message is an on-disk key with `due_at <= now`. Leasing
//! rewrites the key with `due_at` pushed forward by the visibility timeout
//! and deletes the old key; *done* is key absence. There is no in-memory
//! table of in-flight messages: the leased state **is** the forward-written
//! key, so redelivery after an ack that never came falls out of the key
//! order by itself, with no background reaper.
//!
//! Leasing rewrites the key rather than marking in place because the scan
//! iterates in due order: moved keys leave the head of the scan, so the
//! next batch sees different items and an expired lease resurfaces exactly
//! when its new due time arrives.
//!
//! ## Failure policy
//!
//! Store errors are logged with `{topic, subscription}` context and retried
//! at the next receive interval; a transient store hiccup must not kill a
//! long-running subscriber. A record that fails to decode is logged and
//! skipped so it cannot block the messages behind it; its lease expires and
//! it resurfaces at the next visibility window.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use sled::transaction::ConflictableTransactionError;
use sled::IVec;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use sledbus_core::{keys, Codec, JsonCodec, Message};

use crate::error::{Error, Result};
use crate::registry::Registry;

/// Configuration for [`Subscriber`]. An empty value is valid.
#[derive(Clone)]
pub struct SubscriberConfig {
    /// Subscription name. May be empty for a topic's single anonymous
    /// subscription. Distinct names receive independent copies of every
    /// message; see the crate docs for what happens when two subscribers
    /// share a name.
    pub name: String,

    /// Record unmarshaller; JSON by default.
    pub codec: Arc<dyn Codec>,

    /// Idle poll period between store scans (default 1 s).
    pub receive_interval: Duration,

    /// Maximum messages leased per scan transaction (default 100).
    pub receive_batch_size: usize,

    /// How long a leased message stays hidden before it becomes eligible
    /// for redelivery (default 5 s).
    pub visibility_timeout: Duration,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            codec: Arc::new(JsonCodec),
            receive_interval: Duration::from_secs(1),
            receive_batch_size: 100,
            visibility_timeout: Duration::from_secs(5),
        }
    }
}

/// Consumes messages for one subscription name across topics.
pub struct Subscriber {
    db: sled::Db,
    registry: Arc<dyn Registry>,
    config: SubscriberConfig,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Subscriber {
    pub fn new(db: &sled::Db, registry: Arc<dyn Registry>, config: SubscriberConfig) -> Self {
        Self::with_shutdown(db, registry, config, CancellationToken::new())
    }

    pub(crate) fn with_shutdown(
        db: &sled::Db,
        registry: Arc<dyn Registry>,
        config: SubscriberConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            db: db.clone(),
            registry,
            config,
            shutdown,
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Register `(topic, config.name)` and start its worker task.
    ///
    /// The returned channel is the exclusive delivery stream for this
    /// subscription; it closes when `ctx` is cancelled or the subscriber is
    /// closed. Call once per topic per subscriber instance. Must be called
    /// from within a tokio runtime.
    pub fn subscribe(
        &self,
        ctx: CancellationToken,
        topic: &str,
    ) -> Result<mpsc::Receiver<ReceivedMessage>> {
        let subscription = self.registry.register(topic, &self.config.name)?;

        let (out, rx) = mpsc::channel(1);
        let worker = Worker {
            db: self.db.clone(),
            topic: topic.to_string(),
            name: self.config.name.clone(),
            prefix: subscription.prefix_bytes(),
            codec: self.config.codec.clone(),
            receive_interval: self.config.receive_interval,
            receive_batch_size: self.config.receive_batch_size.max(1),
            visibility_timeout: self.config.visibility_timeout,
            ctx,
            shutdown: self.shutdown.clone(),
            out,
        };

        let handle = tokio::spawn(worker.run());
        self.workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
        Ok(rx)
    }

    /// Stop all worker tasks and wait for them to exit.
    ///
    /// Deliveries awaiting an ack are abandoned; their leases expire and
    /// the messages are redelivered to the next subscriber.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(|e| e.into_inner()));
        for worker in workers {
            let _ = worker.await;
        }
    }
}

/// A message handed to the consumer, awaiting its ack/nack decision.
///
/// The first call to [`ack`](Self::ack) or [`nack`](Self::nack) wins and
/// returns `true`; later calls are no-ops returning `false`. Dropping the
/// message without deciding counts as abandonment: the lease expires and
/// the message is redelivered.
pub struct ReceivedMessage {
    message: Message,
    created: DateTime<Utc>,
    decision: Mutex<Option<oneshot::Sender<Outcome>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Acked,
    Nacked,
}

impl ReceivedMessage {
    fn new(message: Message, created: DateTime<Utc>) -> (Self, oneshot::Receiver<Outcome>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                message,
                created,
                decision: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    pub fn uuid(&self) -> &str {
        &self.message.uuid
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.message.metadata
    }

    pub fn payload(&self) -> &Bytes {
        &self.message.payload
    }

    /// When the message was originally published.
    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn into_message(self) -> Message {
        self.message
    }

    /// Finalise the message: its record is deleted and never redelivered.
    pub fn ack(&self) -> bool {
        self.resolve(Outcome::Acked)
    }

    /// Refuse the message: it is redelivered once its lease expires.
    pub fn nack(&self) -> bool {
        self.resolve(Outcome::Nacked)
    }

    fn resolve(&self, outcome: Outcome) -> bool {
        let sender = self
            .decision
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match sender {
            Some(tx) => tx.send(outcome).is_ok(),
            None => false,
        }
    }
}

struct RawMessage {
    key: Vec<u8>,
    value: IVec,
}

/// Long-lived task owning one subscription's poll loop.
struct Worker {
    db: sled::Db,
    topic: String,
    name: String,
    prefix: Bytes,
    codec: Arc<dyn Codec>,
    receive_interval: Duration,
    receive_batch_size: usize,
    visibility_timeout: Duration,
    ctx: CancellationToken,
    shutdown: CancellationToken,
    out: mpsc::Sender<ReceivedMessage>,
}

impl Worker {
    async fn run(self) {
        debug!(topic = %self.topic, subscription = %self.name, "subscription worker started");

        loop {
            match self.receive_batch().await {
                Ok(()) => {}
                Err(Error::Closed) => break,
                Err(e) => {
                    // transient store trouble: log, then retry next interval
                    warn!(
                        topic = %self.topic,
                        subscription = %self.name,
                        error = %e,
                        "failed to receive messages"
                    );
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.receive_interval) => {}
                _ = self.ctx.cancelled() => break,
                _ = self.shutdown.cancelled() => break,
            }
        }

        debug!(topic = %self.topic, subscription = %self.name, "subscription worker stopped");
    }

    async fn receive_batch(&self) -> Result<()> {
        let leased = self.lease_due_messages()?;
        if leased.is_empty() {
            return Ok(());
        }

        debug!(
            topic = %self.topic,
            subscription = %self.name,
            count = leased.len(),
            "leased messages"
        );

        for raw in leased {
            self.deliver(raw).await?;
        }
        Ok(())
    }

    /// Lease every due message under the prefix, up to the batch size.
    ///
    /// Candidates are collected from a plain prefix scan; the transaction
    /// then re-checks each key before rewriting it, so a key claimed by a
    /// competing same-name subscriber in the meantime simply drops out of
    /// this batch.
    fn lease_due_messages(&self) -> Result<Vec<RawMessage>> {
        let now_ns = keys::unix_nanos(Utc::now());
        let visibility_ns = self.visibility_timeout.as_nanos() as u64;

        let mut candidates: Vec<(IVec, IVec, u64)> = Vec::new();
        for item in self.db.scan_prefix(&self.prefix) {
            let (key, value) = item?;
            let due_ns = match keys::decode_due_at(&key) {
                Ok(due_ns) => due_ns,
                Err(e) => {
                    warn!(
                        topic = %self.topic,
                        subscription = %self.name,
                        error = %e,
                        "skipping malformed message key"
                    );
                    continue;
                }
            };

            // keys sort by due time: everything after this is in the future
            if due_ns > now_ns {
                break;
            }

            candidates.push((key, value, due_ns));
            if candidates.len() >= self.receive_batch_size {
                break;
            }
        }

        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let leased = self.db.transaction(|tx| {
            let mut leased = Vec::with_capacity(candidates.len());
            for (key, value, due_ns) in &candidates {
                if tx.get(key)?.is_none() {
                    continue;
                }

                let new_key = keys::rewrite_due_at(key, due_ns + visibility_ns)
                    .map_err(|e| ConflictableTransactionError::Abort(Error::from(e)))?;
                tx.insert(new_key.clone(), value.clone())?;
                tx.remove(key.clone())?;

                leased.push(RawMessage {
                    key: new_key,
                    value: value.clone(),
                });
            }
            Ok(leased)
        })?;

        Ok(leased)
    }

    /// Hand one leased message to the consumer and act on its decision.
    async fn deliver(&self, raw: RawMessage) -> Result<()> {
        let record = match self.codec.unmarshal(&raw.value) {
            Ok(record) => record,
            Err(e) => {
                warn!(
                    topic = %self.topic,
                    subscription = %self.name,
                    error = %e,
                    "dropping message with undecodable payload"
                );
                return Ok(());
            }
        };

        let created = record.created;
        let (message, decision) = ReceivedMessage::new(record.into_message(), created);

        tokio::select! {
            sent = self.out.send(message) => {
                if sent.is_err() {
                    // consumer dropped the channel
                    return Err(Error::Closed);
                }
            }
            _ = self.ctx.cancelled() => return Err(Error::Closed),
            _ = self.shutdown.cancelled() => return Err(Error::Closed),
        }

        tokio::select! {
            outcome = decision => match outcome {
                Ok(Outcome::Acked) => {
                    // finalise: the leased key is the only trace of the message
                    self.db.remove(&raw.key)?;
                }
                Ok(Outcome::Nacked) | Err(_) => {
                    // leave the lease to expire; the message resurfaces at
                    // due + visibility_timeout
                }
            },
            _ = self.ctx.cancelled() => return Err(Error::Closed),
            _ = self.shutdown.cancelled() => return Err(Error::Closed),
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn received(payload: &str) -> (ReceivedMessage, oneshot::Receiver<Outcome>) {
        ReceivedMessage::new(Message::new(payload.to_string()), Utc::now())
    }

    #[test]
    fn test_ack_resolves_once() {
        let (message, mut decision) = received("p");

        assert!(message.ack());
        assert!(!message.ack());
        assert!(!message.nack());
        assert_eq!(decision.try_recv().expect("decision"), Outcome::Acked);
    }

    #[test]
    fn test_nack_resolves_once() {
        let (message, mut decision) = received("p");

        assert!(message.nack());
        assert!(!message.ack());
        assert_eq!(decision.try_recv().expect("decision"), Outcome::Nacked);
    }

    #[test]
    fn test_drop_without_decision_closes_channel() {
        let (message, mut decision) = received("p");
        drop(message);
        assert!(decision.try_recv().is_err());
    }

    #[test]
    fn test_accessors_expose_message_fields() {
        let inner = Message::new("payload").with_metadata("k", "v");
        let created = Utc::now();
        let (message, _decision) = ReceivedMessage::new(inner.clone(), created);

        assert_eq!(message.uuid(), inner.uuid);
        assert_eq!(message.payload(), &inner.payload);
        assert_eq!(message.metadata()["k"], "v");
        assert_eq!(message.created(), created);
        assert_eq!(message.into_message(), inner);
    }
}
