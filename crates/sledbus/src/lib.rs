//! sledbus - a durable, embedded publish/subscribe message bus over sled
//!
//! Publishers and subscribers share one embedded [`sled`] store; there is
//! no broker process and no network hop. The bus provides:
//!
//! - **At-least-once delivery** with per-subscription fan-out: publishing
//!   writes one record per registered subscription, each with its own
//!   consumption cursor.
//! - **Delayed delivery** via a reserved metadata key
//!   ([`DELAYED_UNTIL_KEY`]) or the [`Message::delayed_for`] builder.
//! - **Visibility-timeout redelivery**: a delivered-but-unacked message
//!   resurfaces automatically, with no background reaper. The mechanism is
//!   the key encoding itself: message keys sort by due time, and leasing a
//!   message rewrites its key forward by the visibility timeout.
//!
//! ## Quick start
//!
//! ```ignore
//! use sledbus::{Bus, InMemoryRegistry, InMemoryRegistryConfig, Message,
//!               PublisherConfig, SubscriberConfig};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! let db = sled::open("./bus-data")?;
//! let registry = Arc::new(InMemoryRegistry::new(InMemoryRegistryConfig::default()));
//! let bus = Bus::new(db, registry);
//!
//! let subscriber = bus.subscriber(SubscriberConfig::default());
//! let mut messages = subscriber.subscribe(CancellationToken::new(), "orders")?;
//!
//! let publisher = bus.publisher(PublisherConfig::default());
//! publisher.publish("orders", &[Message::new("order placed")])?;
//!
//! let msg = messages.recv().await.expect("delivery");
//! msg.ack();
//! ```
//!
//! ## Registries
//!
//! Subscription identity lives in a [`Registry`]. [`InMemoryRegistry`]
//! keeps it per-process; [`PersistentRegistry`] stores it in sled so a
//! restarted process resumes its subscriptions and drains messages
//! published before the restart.
//!
//! ## Competing consumers
//!
//! Two subscribers sharing a subscription *name* share its key prefix and
//! compete for the same records: the lease transaction guarantees each
//! message lands in exactly one of their batches per visibility window, so
//! together they still honor at-least-once delivery. Distinct names never
//! contend. (With an in-memory registry the second same-name registration
//! on one registry instance fails with
//! [`Error::AlreadyRegistered`] instead.)
//!
//! ## What this bus does not do
//!
//! Cross-process coordination beyond the shared store, exactly-once
//! delivery, dead-letter queues, replay after ack, and TTL expiry of
//! undelivered messages are all out of scope.

pub mod bus;
pub mod error;
pub mod publisher;
pub mod registry;
pub mod subscriber;

pub use bus::Bus;
pub use error::{Error, Result};
pub use publisher::{Publisher, PublisherConfig, TxPublisher};
pub use registry::memory::{InMemoryRegistry, InMemoryRegistryConfig};
pub use registry::persistent::{PersistentRegistry, PersistentRegistryConfig};
pub use registry::{Registry, Sequence, Subscription};
pub use subscriber::{ReceivedMessage, Subscriber, SubscriberConfig};

pub use sledbus_core::{keys, Codec, JsonCodec, Message, MessageRecord, DELAYED_UNTIL_KEY};
