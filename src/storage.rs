//! Local key/value storage engine.
//!
//! Records are keyed by their 160-bit key hash and carry the metadata the
//! maintenance loop needs (timestamp, publisher, replica set). Capacity is a
//! fixed record count; each overflow evicts exactly one record, the one with
//! the smallest timestamp (ties broken by key order).
//!
//! The engine never talks to the network. Everything the orchestrator has to
//! act on is queued as a [`StorageEvent`] and collected with
//! [`StorageEngine::take_events`].

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::{debug, trace};

use crate::core::{normalize_key, now_millis, Key, NodeId};
use crate::error::DhtError;

/// Who published a record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Publisher {
    Node(NodeId),
    /// Received through a STORE from the network.
    Remote,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageRecord {
    pub key: Key,
    pub value: Vec<u8>,
    /// Insertion or refresh time in milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub publisher: Publisher,
    /// Nodes known to hold a copy.
    pub replicated_to: HashSet<NodeId>,
}

/// Options for [`StorageEngine::put`].
#[derive(Clone, Debug, Default)]
pub struct PutOptions {
    /// Defaults to the local node.
    pub publisher: Option<Publisher>,
    pub replicated_to: HashSet<NodeId>,
    /// Set by the republish path; suppresses [`StorageEvent::Stored`].
    pub republish: bool,
    /// Defaults to now.
    pub timestamp: Option<u64>,
}

/// Notifications produced by the storage engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StorageEvent {
    Stored { key: Key, publisher: Publisher },
    /// A local lookup missed; the orchestrator may go to the network.
    Requested { key: Key },
    Evicted { key: Key },
    /// Push to closest nodes missing from the replica set.
    Replicate(StorageRecord),
    /// Re-announce to all closest nodes.
    Republish(StorageRecord),
}

#[derive(Debug)]
pub struct StorageEngine {
    local_id: NodeId,
    max_store_size: usize,
    records: HashMap<Key, StorageRecord>,
    events: VecDeque<StorageEvent>,
}

impl StorageEngine {
    pub fn new(local_id: NodeId, max_store_size: usize) -> Self {
        Self {
            local_id,
            max_store_size,
            records: HashMap::new(),
            events: VecDeque::new(),
        }
    }

    /// Store `value` under the normalised form of `key`, returning the key hash.
    pub fn put(&mut self, key: &str, value: Vec<u8>, options: PutOptions) -> Result<Key, DhtError> {
        let key = normalize_key(key)?;
        Ok(self.put_hashed(key, value, options))
    }

    /// [`put`](Self::put) for a key that is already hashed.
    pub fn put_hashed(&mut self, key: Key, value: Vec<u8>, options: PutOptions) -> Key {
        let publisher = options
            .publisher
            .unwrap_or(Publisher::Node(self.local_id));
        let record = StorageRecord {
            key,
            value,
            timestamp: options.timestamp.unwrap_or_else(now_millis),
            publisher,
            replicated_to: options.replicated_to,
        };
        self.upsert(record);
        if !options.republish {
            self.events.push_back(StorageEvent::Stored { key, publisher });
        }
        key
    }

    /// Look up a value by application key.
    ///
    /// On a miss a [`StorageEvent::Requested`] is queued; this call itself never
    /// waits on the network.
    pub fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>, DhtError> {
        let key = normalize_key(key)?;
        Ok(self.get_hashed(&key))
    }

    pub fn get_hashed(&mut self, key: &Key) -> Option<Vec<u8>> {
        match self.records.get(key) {
            Some(record) => Some(record.value.clone()),
            None => {
                self.events.push_back(StorageEvent::Requested { key: *key });
                None
            }
        }
    }

    /// Side-effect free lookup used to answer FIND_VALUE requests.
    pub fn peek(&self, key: &Key) -> Option<&StorageRecord> {
        self.records.get(key)
    }

    /// Unconditional upsert for records arriving through STORE.
    pub fn store_remote_value(&mut self, record: StorageRecord) {
        let key = record.key;
        let publisher = record.publisher;
        self.upsert(record);
        self.events.push_back(StorageEvent::Stored { key, publisher });
    }

    /// Add `nodes` to the replica set of `key`.
    pub fn mark_replicated(&mut self, key: &Key, nodes: impl IntoIterator<Item = NodeId>) {
        if let Some(record) = self.records.get_mut(key) {
            record.replicated_to.extend(nodes);
        }
    }

    /// Queue one [`StorageEvent::Replicate`] per stored record.
    pub fn emit_replicate(&mut self) -> usize {
        let records = self.sorted_records();
        let count = records.len();
        self.events
            .extend(records.into_iter().map(StorageEvent::Replicate));
        count
    }

    /// Queue one [`StorageEvent::Republish`] per stored record.
    pub fn emit_republish(&mut self) -> usize {
        let records = self.sorted_records();
        let count = records.len();
        self.events
            .extend(records.into_iter().map(StorageEvent::Republish));
        count
    }

    /// Drain queued events in emission order.
    pub fn take_events(&mut self) -> Vec<StorageEvent> {
        self.events.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.records.contains_key(key)
    }

    fn sorted_records(&self) -> Vec<StorageRecord> {
        let mut records: Vec<StorageRecord> = self.records.values().cloned().collect();
        records.sort_by_key(|r| r.key);
        records
    }

    fn upsert(&mut self, record: StorageRecord) {
        if !self.records.contains_key(&record.key) && self.records.len() >= self.max_store_size {
            self.evict_oldest();
        }
        trace!(key = %record.key, bytes = record.value.len(), "storing record");
        self.records.insert(record.key, record);
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .records
            .values()
            .min_by_key(|r| (r.timestamp, r.key))
            .map(|r| r.key);
        if let Some(key) = oldest {
            self.records.remove(&key);
            debug!(key = %key, "evicted oldest record at capacity");
            self.events.push_back(StorageEvent::Evicted { key });
        }
    }
}
