//! Subscription Registry
//!
//! The registry maps `(topic, name)` pairs to [`Subscription`] handles and
//! is the publisher's source of truth for fan-out: publishing to a topic
//! writes one record per registered subscription, so publish correctness
//! depends entirely on what the registry reports.
//!
//! Two implementations share the [`Registry`] trait:
//!
//! - [`memory::InMemoryRegistry`]: process-local maps, for buses whose
//!   subscription identity does not need to survive a restart.
//! - [`persistent::PersistentRegistry`]: prefix lists and sequence
//!   high-water marks stored in sled, so a restarted process resumes with
//!   the same subscriptions (and pending messages) it had before.
//!
//! The variants differ on duplicate registration: the in-memory registry
//! returns [`Error::AlreadyRegistered`](crate::Error::AlreadyRegistered),
//! the persistent registry idempotently returns the existing prefix.

pub mod memory;
pub mod persistent;

use std::sync::Arc;

use bytes::Bytes;

use crate::error::Result;

/// Monotonic sequence-number allocator for one subscription.
///
/// `next` never repeats a value for the lifetime of the allocator and is
/// safe to call from multiple threads; gaps are permitted. `release` frees
/// any store-side reservation and must be called on shutdown (the owning
/// registry's `close` does this).
pub trait Sequence: Send + Sync {
    fn next(&self) -> Result<u64>;

    fn release(&self) -> Result<()>;
}

/// A registered `(topic, name)` subscription: its unique key prefix and its
/// sequence allocator. Cloning is cheap and shares the allocator.
#[derive(Clone)]
pub struct Subscription {
    prefix: Bytes,
    sequence: Arc<dyn Sequence>,
}

impl Subscription {
    pub(crate) fn new(prefix: Vec<u8>, sequence: Arc<dyn Sequence>) -> Self {
        Self {
            prefix: Bytes::from(prefix),
            sequence,
        }
    }

    /// The key prefix every message for this subscription is written under.
    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }

    pub(crate) fn prefix_bytes(&self) -> Bytes {
        self.prefix.clone()
    }

    /// The subscription's sequence allocator.
    pub fn sequence(&self) -> &dyn Sequence {
        self.sequence.as_ref()
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

/// Maps topics to their subscriptions and allocates sequence numbers.
pub trait Registry: Send + Sync {
    /// Register `(topic, name)` and return its subscription handle.
    ///
    /// See the module docs for how the two implementations treat duplicate
    /// registrations.
    fn register(&self, topic: &str, name: &str) -> Result<Subscription>;

    /// Every subscription currently registered for `topic`, in registration
    /// order. An unknown topic yields an empty list; an empty topic is an
    /// `InvalidName` error.
    fn subscriptions(&self, topic: &str) -> Result<Vec<Subscription>>;

    /// Release all sequence allocators. Idempotent.
    fn close(&self) -> Result<()>;
}
