//! Bus Façade
//!
//! [`Bus`] ties a sled handle to a registry and hands out publishers and
//! subscribers wired to both. It is a convenience: every component can also
//! be constructed directly from a `sled::Db` and an `Arc<dyn Registry>`.
//!
//! ## Shutdown order
//!
//! The bus keeps a handle to every subscriber it creates. `close()` first
//! cancels the bus token and drains those subscribers (awaiting each
//! worker task), then closes the registry to release its sequence
//! allocators. The sled handle stays with the caller, who closes it by
//! dropping the last clone.

use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::publisher::{Publisher, PublisherConfig, TxPublisher};
use crate::registry::Registry;
use crate::subscriber::{Subscriber, SubscriberConfig};

/// Owns the store handle and registry; hands out publishers and subscribers.
pub struct Bus {
    db: sled::Db,
    registry: Arc<dyn Registry>,
    shutdown: CancellationToken,
    subscribers: Mutex<Vec<Arc<Subscriber>>>,
}

impl Bus {
    pub fn new(db: sled::Db, registry: Arc<dyn Registry>) -> Self {
        Self {
            db,
            registry,
            shutdown: CancellationToken::new(),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// A publisher committing its own atomic batches.
    pub fn publisher(&self, config: PublisherConfig) -> Publisher {
        Publisher::new(&self.db, self.registry.clone(), config)
    }

    /// A publisher for caller-owned transactions (outbox pattern).
    pub fn tx_publisher(&self, config: PublisherConfig) -> TxPublisher {
        TxPublisher::new(self.registry.clone(), config)
    }

    /// A subscriber that is drained when this bus closes.
    pub fn subscriber(&self, config: SubscriberConfig) -> Arc<Subscriber> {
        let subscriber = Arc::new(Subscriber::with_shutdown(
            &self.db,
            self.registry.clone(),
            config,
            self.shutdown.child_token(),
        ));
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(subscriber.clone());
        subscriber
    }

    /// The underlying store handle.
    pub fn db(&self) -> &sled::Db {
        &self.db
    }

    /// Drain every bus-created subscriber, then close the registry.
    ///
    /// Subscribers stop first so no worker is still leasing when the
    /// registry releases its sequence allocators.
    pub async fn close(&self) -> Result<()> {
        self.shutdown.cancel();

        let subscribers = std::mem::take(
            &mut *self.subscribers.lock().unwrap_or_else(|e| e.into_inner()),
        );
        for subscriber in subscribers {
            subscriber.close().await;
        }

        self.registry.close()
    }
}
