//! Persistent Registry
//!
//! Store-backed [`Registry`]: subscription identity survives restarts, so a
//! process that comes back up and re-registers the same `(topic, name)`
//! resumes the exact key prefix it had before and receives every message
//! still pending under it.
//!
//! ## Persisted layout
//!
//! Two well-known keys per topic, both in the default tree (the namespace
//! part is omitted when empty):
//!
//! - `"<ns>_<topic>_prefixes"`: the registered subscription prefixes,
//!   joined by a single space. This is why topic and subscription names
//!   must not contain spaces here: the delimiter is in-band.
//! - `"<ns>_<topic>_sequence"`: a big-endian u64 high-water mark backing
//!   the topic's sequence allocator.
//!
//! ## Sequence bandwidth
//!
//! [`StoreSequence`] leases `sequence_bandwidth` values per store write and
//! hands them out from an in-process counter, so a publish batch of
//! `messages x subscriptions` allocations costs at most
//! `ceil(n / bandwidth)` store round-trips. `release` returns the unused
//! tail of the current block with a CAS; if the CAS loses (another
//! allocator advanced the mark) the tail becomes a permitted gap.
//!
//! Unlike the in-memory variant, re-registering an existing `(topic, name)`
//! is not an error: the existing prefix is returned.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use sledbus_core::keys;

use crate::error::{Error, Result};
use crate::registry::{Registry, Sequence, Subscription};

/// Configuration for [`PersistentRegistry`]. An empty value is valid.
#[derive(Debug, Clone)]
pub struct PersistentRegistryConfig {
    /// Global byte prefix applied to every key, isolating multiple buses
    /// sharing one store.
    pub namespace: String,

    /// How many sequence values each store write reserves (default 100).
    pub sequence_bandwidth: u64,
}

impl Default for PersistentRegistryConfig {
    fn default() -> Self {
        Self {
            namespace: String::new(),
            sequence_bandwidth: 100,
        }
    }
}

/// Store-backed registry; see the module docs for the persisted layout.
pub struct PersistentRegistry {
    db: sled::Db,
    config: PersistentRegistryConfig,
    sequences: RwLock<HashMap<String, Arc<StoreSequence>>>,
}

impl PersistentRegistry {
    pub fn new(db: &sled::Db, config: PersistentRegistryConfig) -> Self {
        Self {
            db: db.clone(),
            config,
            sequences: RwLock::new(HashMap::new()),
        }
    }

    fn topic_sequence(&self, topic: &str) -> Arc<StoreSequence> {
        if let Some(sequence) = self
            .sequences
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(topic)
        {
            return sequence.clone();
        }

        let mut sequences = self.sequences.write().unwrap_or_else(|e| e.into_inner());
        sequences
            .entry(topic.to_string())
            .or_insert_with(|| {
                Arc::new(StoreSequence::new(
                    self.db.clone(),
                    registry_key(&self.config.namespace, topic, "sequence"),
                    self.config.sequence_bandwidth,
                ))
            })
            .clone()
    }

    fn read_prefixes(&self, topic: &str) -> Result<Vec<Vec<u8>>> {
        let key = registry_key(&self.config.namespace, topic, "prefixes");
        let Some(value) = self.db.get(key)? else {
            return Ok(Vec::new());
        };
        Ok(split_prefixes(&value))
    }
}

impl Registry for PersistentRegistry {
    fn register(&self, topic: &str, name: &str) -> Result<Subscription> {
        validate_components(&[&self.config.namespace, topic, name])?;
        let prefix = keys::encode_prefix(&self.config.namespace, topic, name)?;

        // idempotent append: re-running the closure on CAS contention is
        // safe because it is a pure function of the current list
        let key = registry_key(&self.config.namespace, topic, "prefixes");
        self.db.update_and_fetch(key, |current| {
            let mut prefixes: Vec<&[u8]> = current
                .map(|bytes| {
                    bytes
                        .split(|b| *b == b' ')
                        .filter(|p| !p.is_empty())
                        .collect()
                })
                .unwrap_or_default();
            if !prefixes.iter().any(|p| *p == prefix.as_slice()) {
                prefixes.push(&prefix);
            }
            Some(prefixes.join(&b' '))
        })?;

        Ok(Subscription::new(prefix, self.topic_sequence(topic)))
    }

    fn subscriptions(&self, topic: &str) -> Result<Vec<Subscription>> {
        keys::validate_topic(topic)?;

        // always read the persisted list: registrations made through other
        // handles or processes must be visible to this publish
        let prefixes = self.read_prefixes(topic)?;
        if prefixes.is_empty() {
            return Ok(Vec::new());
        }

        let sequence = self.topic_sequence(topic);
        Ok(prefixes
            .into_iter()
            .map(|prefix| Subscription::new(prefix, sequence.clone()))
            .collect())
    }

    fn close(&self) -> Result<()> {
        let sequences = std::mem::take(
            &mut *self.sequences.write().unwrap_or_else(|e| e.into_inner()),
        );

        // every allocator gets a release attempt; the first failure is
        // reported after the loop rather than aborting it
        let mut first_err = None;
        for sequence in sequences.into_values() {
            if let Err(e) = sequence.release() {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

fn registry_key(namespace: &str, topic: &str, kind: &str) -> Vec<u8> {
    if namespace.is_empty() {
        format!("{topic}_{kind}").into_bytes()
    } else {
        format!("{namespace}_{topic}_{kind}").into_bytes()
    }
}

fn split_prefixes(value: &[u8]) -> Vec<Vec<u8>> {
    value
        .split(|b| *b == b' ')
        .filter(|p| !p.is_empty())
        .map(<[u8]>::to_vec)
        .collect()
}

fn validate_components(components: &[&str]) -> Result<()> {
    for component in components {
        if component.contains(' ') {
            return Err(Error::Codec(sledbus_core::Error::InvalidName(format!(
                "{component:?} must not contain spaces"
            ))));
        }
    }
    Ok(())
}

/// Block-leasing sequence allocator over a single store key.
struct StoreSequence {
    db: sled::Db,
    key: Vec<u8>,
    bandwidth: u64,
    state: Mutex<BlockState>,
}

#[derive(Default)]
struct BlockState {
    /// Next value to hand out.
    next: u64,
    /// Exclusive upper bound of the leased block; `next == limit` means the
    /// block is exhausted.
    limit: u64,
}

impl StoreSequence {
    fn new(db: sled::Db, key: Vec<u8>, bandwidth: u64) -> Self {
        Self {
            db,
            key,
            bandwidth: bandwidth.max(1),
            state: Mutex::new(BlockState::default()),
        }
    }
}

impl Sequence for StoreSequence {
    fn next(&self) -> Result<u64> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        if state.next == state.limit {
            let bandwidth = self.bandwidth;
            let leased = self.db.update_and_fetch(&self.key, |current| {
                let mark = current.map(decode_mark).unwrap_or(0);
                Some(mark.saturating_add(bandwidth).to_be_bytes().to_vec())
            })?;

            let limit = leased.as_deref().map(decode_mark).unwrap_or(bandwidth);
            state.limit = limit;
            state.next = limit - bandwidth;
        }

        let value = state.next;
        state.next += 1;
        Ok(value)
    }

    fn release(&self) -> Result<()> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.next == state.limit {
            return Ok(());
        }

        // return the unused tail; a lost CAS means another allocator moved
        // the mark and the tail stays a gap
        let _ = self.db.compare_and_swap(
            &self.key,
            Some(state.limit.to_be_bytes().to_vec()),
            Some(state.next.to_be_bytes().to_vec()),
        )?;
        Ok(())
    }
}

fn decode_mark(bytes: &[u8]) -> u64 {
    if bytes.len() != 8 {
        return 0;
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    u64::from_be_bytes(buf)
}
