//! In-Memory Registry
//!
//! Process-local [`Registry`] backed by a `RwLock`-protected map. Reads
//! (the per-publish `subscriptions` lookup) take the shared lock; every
//! mutation takes the exclusive lock. Sequence numbers come from a plain
//! atomic counter per subscription, so nothing here touches the store.
//!
//! Subscription identity does not survive a restart. Messages published
//! before a crash are only recoverable if the restarted process registers
//! subscriptions producing identical prefixes; use the persistent registry
//! when that matters.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use sledbus_core::keys;

use crate::error::{Error, Result};
use crate::registry::{Registry, Sequence, Subscription};

/// Configuration for [`InMemoryRegistry`]. An empty value is valid.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRegistryConfig {
    /// Global byte prefix applied to every message key, isolating multiple
    /// buses sharing one store.
    pub namespace: String,
}

/// Process-local registry. Duplicate `(topic, name)` registrations fail
/// with [`Error::AlreadyRegistered`].
pub struct InMemoryRegistry {
    config: InMemoryRegistryConfig,
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    // topic -> name -> handle, plus per-topic registration order
    registered: HashMap<String, HashMap<String, Subscription>>,
    order: HashMap<String, Vec<Subscription>>,
}

impl InMemoryRegistry {
    pub fn new(config: InMemoryRegistryConfig) -> Self {
        Self {
            config,
            inner: RwLock::new(Inner::default()),
        }
    }
}

impl Registry for InMemoryRegistry {
    fn register(&self, topic: &str, name: &str) -> Result<Subscription> {
        let prefix = keys::encode_prefix(&self.config.namespace, topic, name)?;

        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if let Some(names) = inner.registered.get(topic) {
            if names.contains_key(name) {
                return Err(Error::AlreadyRegistered {
                    topic: topic.to_string(),
                    name: name.to_string(),
                });
            }
        }

        let subscription = Subscription::new(prefix, Arc::new(AtomicSequence::default()));
        inner
            .registered
            .entry(topic.to_string())
            .or_default()
            .insert(name.to_string(), subscription.clone());
        inner
            .order
            .entry(topic.to_string())
            .or_default()
            .push(subscription.clone());

        Ok(subscription)
    }

    fn subscriptions(&self, topic: &str) -> Result<Vec<Subscription>> {
        keys::validate_topic(topic)?;

        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        Ok(inner.order.get(topic).cloned().unwrap_or_default())
    }

    fn close(&self) -> Result<()> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let order = std::mem::take(&mut inner.order);
        inner.registered.clear();
        drop(inner);

        // every allocator gets a release attempt; the first failure is
        // reported after the loop rather than aborting it
        let mut first_err = None;
        for subscription in order.into_values().flatten() {
            if let Err(e) = subscription.sequence().release() {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

/// Atomic counter sequence; `release` is a no-op.
#[derive(Default)]
struct AtomicSequence {
    next: AtomicU64,
}

impl Sequence for AtomicSequence {
    fn next(&self) -> Result<u64> {
        Ok(self.next.fetch_add(1, Ordering::Relaxed))
    }

    fn release(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn new_registry() -> InMemoryRegistry {
        InMemoryRegistry::new(InMemoryRegistryConfig::default())
    }

    #[test]
    fn test_register_returns_encoded_prefix() {
        let registry = InMemoryRegistry::new(InMemoryRegistryConfig {
            namespace: "ns".to_string(),
        });
        let subscription = registry.register("top", "sub").expect("register");
        assert_eq!(
            subscription.prefix(),
            keys::encode_prefix("ns", "top", "sub").expect("encode")
        );
    }

    #[test]
    fn test_register_rejects_empty_topic() {
        let err = new_registry().register("", "sub").expect_err("must fail");
        assert!(matches!(err, Error::Codec(sledbus_core::Error::InvalidName(_))));
    }

    #[test]
    fn test_register_rejects_duplicate() {
        let registry = new_registry();
        registry.register("top", "sub").expect("first register");

        let err = registry.register("top", "sub").expect_err("must fail");
        assert!(matches!(err, Error::AlreadyRegistered { .. }));
    }

    #[test]
    fn test_register_permits_empty_name() {
        let registry = new_registry();
        registry.register("top", "").expect("register");

        // but only once
        let err = registry.register("top", "").expect_err("must fail");
        assert!(matches!(err, Error::AlreadyRegistered { .. }));
    }

    #[test]
    fn test_subscriptions_rejects_empty_topic() {
        let err = new_registry().subscriptions("").expect_err("must fail");
        assert!(matches!(err, Error::Codec(sledbus_core::Error::InvalidName(_))));
    }

    #[test]
    fn test_subscriptions_unknown_topic_is_empty() {
        let subscriptions = new_registry().subscriptions("top").expect("subscriptions");
        assert!(subscriptions.is_empty());
    }

    #[test]
    fn test_subscriptions_in_registration_order() {
        let registry = new_registry();
        let s1 = registry.register("top", "sub1").expect("register");
        let s2 = registry.register("top", "sub2").expect("register");

        let subscriptions = registry.subscriptions("top").expect("subscriptions");
        assert_eq!(subscriptions.len(), 2);
        assert_eq!(subscriptions[0].prefix(), s1.prefix());
        assert_eq!(subscriptions[1].prefix(), s2.prefix());
    }

    #[test]
    fn test_sequence_is_monotonic() {
        let registry = new_registry();
        let subscription = registry.register("top", "sub").expect("register");

        for expected in 0..100 {
            assert_eq!(subscription.sequence().next().expect("next"), expected);
        }
    }

    #[test]
    fn test_sequence_is_atomic_across_threads() {
        let registry = new_registry();
        let subscription = registry.register("top", "sub").expect("register");

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let subscription = subscription.clone();
                std::thread::spawn(move || {
                    (0..250)
                        .map(|_| subscription.sequence().next().expect("next"))
                        .collect::<Vec<u64>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for thread in threads {
            for value in thread.join().expect("join") {
                assert!(seen.insert(value), "sequence value {value} repeated");
            }
        }
        assert_eq!(seen.len(), 8 * 250);
    }

    #[test]
    fn test_close_clears_registrations() {
        let registry = new_registry();
        registry.register("top", "sub").expect("register");
        registry.close().expect("close");

        assert!(registry.subscriptions("top").expect("subscriptions").is_empty());
        // close is idempotent, and the name can be reused afterwards
        registry.close().expect("close again");
        registry.register("top", "sub").expect("re-register");
    }
}
