//! Identity, hashing and the XOR distance metric.
//!
//! This module contains the leaf building blocks every other component uses:
//!
//! - **Identity & Hashing**: [`NodeId`], [`Key`], [`derive_node_id`], [`normalize_key`]
//! - **Distance Metrics**: [`xor_distance`], [`distance_cmp`], [`common_prefix_len`]
//! - **Peers**: [`Contact`], the descriptor handed to the transport to reach a node
//!
//! All functions here are pure and total. Identifiers are fixed-width 160-bit
//! unsigned bit vectors, so XOR can never overflow and comparisons are plain
//! big-endian byte comparisons.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha1::{Digest, Sha1};

use crate::error::DhtError;

// ============================================================================
// Identifiers
// ============================================================================

/// Width of an identifier in bytes.
pub const ID_LEN: usize = 20;

/// Width of an identifier in bits.
pub const ID_BITS: usize = ID_LEN * 8;

/// A 160-bit identifier for DHT nodes.
///
/// Canonically rendered as a 40-character lowercase hex string, which is also
/// its wire representation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct NodeId([u8; ID_LEN]);

/// A 160-bit key for stored values. Keys live in the same space as node ids
/// so that values are placed on the nodes closest to them.
pub type Key = NodeId;

impl NodeId {
    /// The all-zero identifier.
    pub const ZERO: NodeId = NodeId([0u8; ID_LEN]);

    pub const fn from_bytes(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    /// Draw a uniformly random identifier.
    pub fn random() -> Self {
        let mut bytes = [0u8; ID_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Parse a 40-character hex string.
    pub fn from_hex(s: &str) -> Result<Self, DhtError> {
        let raw = hex::decode(s).map_err(|err| DhtError::InvalidNodeId(format!("{s}: {err}")))?;
        let bytes: [u8; ID_LEN] = raw
            .try_into()
            .map_err(|_| DhtError::InvalidNodeId(format!("{s}: expected {ID_LEN} bytes")))?;
        Ok(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// XOR distance from `self` to `other`.
    pub fn distance(&self, other: &NodeId) -> Distance {
        xor_distance(self, other)
    }

    /// Value of the bit at `index`, counting from the most significant bit.
    pub fn bit(&self, index: usize) -> bool {
        self.0[index / 8] & (0x80 >> (index % 8)) != 0
    }

    /// Copy of `self` with the bit at `index` forced to `value`.
    pub fn with_bit(mut self, index: usize, value: bool) -> Self {
        let mask = 0x80 >> (index % 8);
        if value {
            self.0[index / 8] |= mask;
        } else {
            self.0[index / 8] &= !mask;
        }
        self
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.to_hex())
    }
}

impl FromStr for NodeId {
    type Err = DhtError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        NodeId::from_hex(&s).map_err(de::Error::custom)
    }
}

// ============================================================================
// Hashing Functions
// ============================================================================

/// Compute a 20-byte SHA-1 digest of the input data.
fn sha1_digest(data: &[u8]) -> [u8; ID_LEN] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    let digest = hasher.finalize();

    let mut out = [0u8; ID_LEN];
    out.copy_from_slice(&digest);
    out
}

/// Derive a stable [`NodeId`] by hashing arbitrary input with SHA-1.
///
/// ```
/// use webdht::derive_node_id;
///
/// let id = derive_node_id(b"abc");
/// assert_eq!(id.to_hex(), "a9993e364706816aba3e25717850c26c9cd0d89d");
/// ```
pub fn derive_node_id(data: &[u8]) -> NodeId {
    NodeId(sha1_digest(data))
}

/// Hash raw content into the key space.
pub fn hash_content(data: &[u8]) -> Key {
    NodeId(sha1_digest(data))
}

/// True when `key` is already a 40-character hex hash.
fn is_hash_shaped(key: &str) -> bool {
    key.len() == ID_LEN * 2 && key.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Normalise an application key into the 160-bit key space.
///
/// Keys that are already hash-shaped (40 hex characters) are taken verbatim;
/// anything else is hashed with SHA-1. The empty string is a caller error.
///
/// ```
/// use webdht::{hash_content, normalize_key};
///
/// let hashed = normalize_key("test-key").unwrap();
/// assert_eq!(hashed, hash_content(b"test-key"));
/// assert_eq!(normalize_key(&hashed.to_hex()).unwrap(), hashed);
/// ```
pub fn normalize_key(key: &str) -> Result<Key, DhtError> {
    if key.is_empty() {
        return Err(DhtError::InvalidKey("key must not be empty".into()));
    }
    if is_hash_shaped(key) {
        return NodeId::from_hex(key);
    }
    Ok(hash_content(key.as_bytes()))
}

// ============================================================================
// Distance Metrics
// ============================================================================

/// XOR distance between two identifiers, ordered as a big-endian unsigned integer.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Distance([u8; ID_LEN]);

impl Distance {
    pub const ZERO: Distance = Distance([0u8; ID_LEN]);
    pub const MAX: Distance = Distance([0xff; ID_LEN]);

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    /// Number of leading zero bits, in `0..=ID_BITS`.
    pub fn leading_zeros(&self) -> usize {
        for (byte_idx, byte) in self.0.iter().enumerate() {
            if *byte != 0 {
                return byte_idx * 8 + byte.leading_zeros() as usize;
            }
        }
        ID_BITS
    }
}

impl fmt::Debug for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Distance({})", hex::encode(self.0))
    }
}

/// Compute the XOR distance between two node IDs.
///
/// # Properties
/// - `xor_distance(a, a) == Distance::ZERO`
/// - `xor_distance(a, b) == xor_distance(b, a)`
pub fn xor_distance(a: &NodeId, b: &NodeId) -> Distance {
    let mut out = [0u8; ID_LEN];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = a.0[i] ^ b.0[i];
    }
    Distance(out)
}

/// Compare two XOR distances as fixed-width big-endian unsigned integers.
pub fn distance_cmp(a: &Distance, b: &Distance) -> Ordering {
    a.cmp(b)
}

/// Count the leading bits `a` and `b` have in common, in `0..=160`.
pub fn common_prefix_len(a: &NodeId, b: &NodeId) -> usize {
    xor_distance(a, b).leading_zeros()
}

// ============================================================================
// Contacts
// ============================================================================

/// Another DHT node: its identifier plus the transport address used to reach it.
///
/// The address is opaque to the DHT; only the [`Transport`](crate::transport::Transport)
/// interprets it.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Contact {
    pub id: NodeId,
    pub addr: String,
}

impl Contact {
    pub fn new(id: NodeId, addr: impl Into<String>) -> Self {
        Self {
            id,
            addr: addr.into(),
        }
    }
}

impl fmt::Display for Contact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.addr)
    }
}

/// Parses the `<hex-id>@<addr>` form printed by [`Contact`]'s `Display`.
impl FromStr for Contact {
    type Err = DhtError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (id, addr) = s
            .split_once('@')
            .ok_or_else(|| DhtError::InvalidNodeId(format!("{s}: expected <id>@<addr>")))?;
        Ok(Contact::new(NodeId::from_hex(id)?, addr))
    }
}

/// Milliseconds since the Unix epoch; the timestamp unit used on the wire and in storage.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
