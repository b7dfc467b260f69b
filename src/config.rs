//! Node configuration.
//!
//! Defaults follow the usual Kademlia parameters (`k = 20`, `α = 3`, 160
//! buckets). Durations are stored in milliseconds so the struct round-trips
//! through a plain JSON file.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::time::Duration;

use crate::core::ID_BITS;
use crate::error::DhtError;

// ============================================================================
// Configuration Constants
// ============================================================================

/// Default bucket size and lookup result width.
pub const DEFAULT_K: usize = 20;

/// Default parallelism for concurrent lookups.
pub const DEFAULT_ALPHA: usize = 3;

/// One bucket per bit of the identifier space.
pub const DEFAULT_BUCKET_COUNT: usize = ID_BITS;

/// Maximum number of records held by the storage engine.
pub const DEFAULT_MAX_STORE_SIZE: usize = 1000;

/// Peer ceiling enforced by the peer manager.
pub const DEFAULT_MAX_PEERS: usize = 50;

/// Relay successes before a peer counts as DHT-capable.
pub const DEFAULT_DHT_CAPABILITY_THRESHOLD: u32 = 2;

/// DHT-capable peers required before the node reports readiness.
pub const DEFAULT_DHT_READY_MIN_PEERS: usize = 2;

const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_LOOKUP_TIMEOUT_MS: u64 = 30_000;

/// Consecutive unanswered PINGs before a stale bucket entry is replaced.
const DEFAULT_PING_ATTEMPTS: u32 = 2;

const DEFAULT_MIN_STORE_ACKS: usize = 1;

/// Replication pushes records to closest nodes missing from the replica set (1 hour).
const DEFAULT_REPLICATE_INTERVAL_MS: u64 = 60 * 60 * 1000;

/// Republication re-announces every record network-wide (24 hours).
const DEFAULT_REPUBLISH_INTERVAL_MS: u64 = 24 * 60 * 60 * 1000;

const DEFAULT_SIGNAL_MAX_HOPS: u8 = 8;

/// Tunables for a [`DhtNode`](crate::node::DhtNode).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DhtConfig {
    /// Bucket capacity and number of closest nodes returned by lookups.
    pub k: usize,
    /// Outstanding queries per lookup round.
    pub alpha: usize,
    /// Upper bound on leaf buckets; the deepest split is `bucket_count - 1`.
    pub bucket_count: usize,
    pub max_store_size: usize,
    pub max_peers: usize,
    pub dht_capability_threshold: u32,
    pub dht_ready_min_peers: usize,
    pub request_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub lookup_timeout_ms: u64,
    pub ping_attempts: u32,
    /// Acknowledged STOREs needed for `put` to report success.
    pub min_store_acks: usize,
    pub replicate_interval_ms: u64,
    pub republish_interval_ms: u64,
    /// Cache values found through FIND_VALUE on the querying node.
    pub cache_found_values: bool,
    pub signal_max_hops: u8,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            k: DEFAULT_K,
            alpha: DEFAULT_ALPHA,
            bucket_count: DEFAULT_BUCKET_COUNT,
            max_store_size: DEFAULT_MAX_STORE_SIZE,
            max_peers: DEFAULT_MAX_PEERS,
            dht_capability_threshold: DEFAULT_DHT_CAPABILITY_THRESHOLD,
            dht_ready_min_peers: DEFAULT_DHT_READY_MIN_PEERS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            lookup_timeout_ms: DEFAULT_LOOKUP_TIMEOUT_MS,
            ping_attempts: DEFAULT_PING_ATTEMPTS,
            min_store_acks: DEFAULT_MIN_STORE_ACKS,
            replicate_interval_ms: DEFAULT_REPLICATE_INTERVAL_MS,
            republish_interval_ms: DEFAULT_REPUBLISH_INTERVAL_MS,
            cache_found_values: true,
            signal_max_hops: DEFAULT_SIGNAL_MAX_HOPS,
        }
    }
}

impl DhtConfig {
    /// Load a JSON config file; missing fields fall back to defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: DhtConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), DhtError> {
        let invalid = |msg: &str| Err(DhtError::InvalidConfig(msg.to_string()));
        if self.k == 0 {
            return invalid("k must be positive");
        }
        if self.alpha == 0 {
            return invalid("alpha must be positive");
        }
        if self.bucket_count == 0 || self.bucket_count > ID_BITS {
            return invalid("bucket_count must be within 1..=160");
        }
        if self.max_store_size == 0 {
            return invalid("max_store_size must be positive");
        }
        if self.max_peers == 0 {
            return invalid("max_peers must be positive");
        }
        if self.ping_attempts == 0 {
            return invalid("ping_attempts must be positive");
        }
        if self.min_store_acks == 0 {
            return invalid("min_store_acks must be positive");
        }
        if self.request_timeout_ms == 0 || self.lookup_timeout_ms == 0 {
            return invalid("timeouts must be positive");
        }
        if self.replicate_interval_ms == 0 || self.republish_interval_ms == 0 {
            return invalid("maintenance intervals must be positive");
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.lookup_timeout_ms)
    }

    pub fn replicate_interval(&self) -> Duration {
        Duration::from_millis(self.replicate_interval_ms)
    }

    pub fn republish_interval(&self) -> Duration {
        Duration::from_millis(self.republish_interval_ms)
    }
}
