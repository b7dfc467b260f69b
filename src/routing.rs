//! Kademlia routing table built from splittable k-buckets.
//!
//! Buckets live in an arena (`Vec<KBucket>`) and refer to their children by
//! index, so a split is two pushes plus an index update. The root bucket
//! covers the whole identifier space at depth 0. Only a bucket whose prefix
//! range contains the local id may split, which keeps the tree a single spine
//! with one leaf per shared-prefix length, i.e. at most `bucket_count` leaves.
//!
//! When a non-splittable bucket is full the table hands back a
//! [`PendingEviction`]; the caller pings the least-recently-seen entry (see
//! [`probe_stale_entry`]) and reports the outcome through
//! [`RoutingTable::apply_probe_result`].

use std::collections::HashSet;

use tokio::sync::Mutex;
use tokio::time::{self, Duration, Instant};
use tracing::{debug, trace};

use crate::core::{common_prefix_len, xor_distance, Contact, NodeId, ID_BITS};
use crate::rpc::DhtNetwork;

/// A contact held by a bucket together with liveness bookkeeping.
#[derive(Clone, Debug)]
pub struct PeerRecord {
    pub contact: Contact,
    pub last_seen: Instant,
}

impl PeerRecord {
    fn new(contact: Contact) -> Self {
        Self {
            contact,
            last_seen: Instant::now(),
        }
    }
}

/// Outcome of attempting to add or refresh a contact in a single bucket.
#[derive(Debug)]
enum BucketTouchOutcome {
    Inserted,
    Refreshed,
    /// Bucket is full; carries the least-recently-seen contact.
    Full { oldest: Contact },
}

/// A routing node holding up to `k` peers that share `depth` prefix bits.
///
/// Split buckets keep no nodes of their own and delegate to `children`
/// (`[bit = 0, bit = 1]` at position `depth`).
#[derive(Clone, Debug)]
pub struct KBucket {
    prefix: NodeId,
    depth: usize,
    /// Least-recently-seen first, most-recently-seen last.
    nodes: Vec<PeerRecord>,
    children: Option<[usize; 2]>,
}

impl KBucket {
    fn root() -> Self {
        Self {
            prefix: NodeId::ZERO,
            depth: 0,
            nodes: Vec::new(),
            children: None,
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn is_split(&self) -> bool {
        self.children.is_some()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[PeerRecord] {
        &self.nodes
    }

    /// Whether `id` falls inside this bucket's prefix range.
    pub fn covers(&self, id: &NodeId) -> bool {
        common_prefix_len(&self.prefix, id) >= self.depth
    }

    /// - If the contact exists, moves it to the end (most recently seen)
    /// - If the bucket has space, appends the contact
    /// - If the bucket is full, returns the oldest contact
    fn touch(&mut self, contact: &Contact, k: usize) -> BucketTouchOutcome {
        if self.refresh(&contact.id) {
            return BucketTouchOutcome::Refreshed;
        }
        if self.nodes.len() < k {
            self.nodes.push(PeerRecord::new(contact.clone()));
            return BucketTouchOutcome::Inserted;
        }
        match self.nodes.first() {
            Some(oldest) => BucketTouchOutcome::Full {
                oldest: oldest.contact.clone(),
            },
            // k == 0 is rejected by config validation; treat it as "no room".
            None => BucketTouchOutcome::Full {
                oldest: contact.clone(),
            },
        }
    }

    fn refresh(&mut self, id: &NodeId) -> bool {
        if let Some(pos) = self.nodes.iter().position(|r| &r.contact.id == id) {
            let mut existing = self.nodes.remove(pos);
            existing.last_seen = Instant::now();
            self.nodes.push(existing);
            true
        } else {
            false
        }
    }

    fn remove(&mut self, id: &NodeId) -> bool {
        if let Some(pos) = self.nodes.iter().position(|r| &r.contact.id == id) {
            self.nodes.remove(pos);
            true
        } else {
            false
        }
    }

    /// Partition this bucket's nodes by the bit after the prefix.
    /// Relative recency order is preserved in both halves.
    fn split(&mut self) -> (KBucket, KBucket) {
        let depth = self.depth;
        let mut left = KBucket {
            prefix: self.prefix.with_bit(depth, false),
            depth: depth + 1,
            nodes: Vec::new(),
            children: None,
        };
        let mut right = KBucket {
            prefix: self.prefix.with_bit(depth, true),
            depth: depth + 1,
            nodes: Vec::new(),
            children: None,
        };
        for record in self.nodes.drain(..) {
            if record.contact.id.bit(depth) {
                right.nodes.push(record);
            } else {
                left.nodes.push(record);
            }
        }
        (left, right)
    }
}

/// Outcome of [`RoutingTable::add_node`].
#[derive(Debug)]
pub enum InsertOutcome {
    Inserted,
    Refreshed,
    /// The local id is never stored.
    Rejected,
    /// The bucket is full and not splittable; the oldest entry must be probed.
    Full(PendingEviction),
    /// The bucket is full and its oldest entry is already being probed.
    Dropped,
}

/// Bucket update parked while the least-recently-seen entry is pinged.
#[derive(Clone, Debug)]
pub struct PendingEviction {
    pub oldest: Contact,
    pub candidate: Contact,
}

/// Kademlia routing table over 160-bit ids.
#[derive(Debug)]
pub struct RoutingTable {
    self_id: NodeId,
    k: usize,
    /// Deepest depth a bucket may be split to.
    max_depth: usize,
    /// Bucket arena; index 0 is the root.
    buckets: Vec<KBucket>,
    /// Oldest entries currently under a liveness probe.
    probing: HashSet<NodeId>,
}

impl RoutingTable {
    /// Create a routing table with the full 160 buckets.
    pub fn new(self_id: NodeId, k: usize) -> Self {
        Self::with_bucket_count(self_id, k, ID_BITS)
    }

    /// Create a routing table that never grows past `bucket_count` leaf buckets.
    pub fn with_bucket_count(self_id: NodeId, k: usize, bucket_count: usize) -> Self {
        Self {
            self_id,
            k,
            max_depth: bucket_count.clamp(1, ID_BITS) - 1,
            buckets: vec![KBucket::root()],
            probing: HashSet::new(),
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.self_id
    }

    pub fn k(&self) -> usize {
        self.k
    }

    /// Arena index of the leaf bucket responsible for `id`.
    fn leaf_for(&self, id: &NodeId) -> usize {
        let mut idx = 0;
        while let Some(children) = self.buckets[idx].children {
            let depth = self.buckets[idx].depth;
            idx = children[usize::from(id.bit(depth))];
        }
        idx
    }

    fn splittable(&self, idx: usize) -> bool {
        let bucket = &self.buckets[idx];
        bucket.covers(&self.self_id) && bucket.depth < self.max_depth
    }

    fn split(&mut self, idx: usize) {
        let (left, right) = self.buckets[idx].split();
        let left_idx = self.buckets.len();
        self.buckets.push(left);
        self.buckets.push(right);
        self.buckets[idx].children = Some([left_idx, left_idx + 1]);
        trace!(depth = self.buckets[idx].depth, "split routing bucket");
    }

    /// Add or refresh a contact.
    ///
    /// Splits the responsible bucket as long as it is full and covers the
    /// local id; otherwise reports a [`PendingEviction`] for the caller to probe.
    pub fn add_node(&mut self, contact: Contact) -> InsertOutcome {
        if contact.id == self.self_id {
            return InsertOutcome::Rejected;
        }
        loop {
            let idx = self.leaf_for(&contact.id);
            match self.buckets[idx].touch(&contact, self.k) {
                BucketTouchOutcome::Inserted => return InsertOutcome::Inserted,
                BucketTouchOutcome::Refreshed => return InsertOutcome::Refreshed,
                BucketTouchOutcome::Full { oldest } => {
                    if self.splittable(idx) {
                        self.split(idx);
                        continue;
                    }
                    if !self.probing.insert(oldest.id) {
                        return InsertOutcome::Dropped;
                    }
                    return InsertOutcome::Full(PendingEviction {
                        oldest,
                        candidate: contact,
                    });
                }
            }
        }
    }

    /// Remove a contact. Idempotent.
    pub fn remove_node(&mut self, id: &NodeId) -> bool {
        let idx = self.leaf_for(id);
        self.buckets[idx].remove(id)
    }

    pub fn has_node(&self, id: &NodeId) -> bool {
        self.get_node(id).is_some()
    }

    pub fn get_node(&self, id: &NodeId) -> Option<&PeerRecord> {
        let idx = self.leaf_for(id);
        self.buckets[idx].nodes.iter().find(|r| &r.contact.id == id)
    }

    /// Find the `count` closest contacts to `target` across all buckets.
    pub fn closest(&self, target: &NodeId, count: usize) -> Vec<Contact> {
        let mut all = Vec::new();
        self.collect(0, &mut all);
        all.sort_by_key(|c| xor_distance(&c.id, target));
        all.truncate(count);
        all
    }

    fn collect(&self, bucket: usize, out: &mut Vec<Contact>) {
        let node = &self.buckets[bucket];
        match node.children {
            Some([left, right]) => {
                self.collect(left, out);
                self.collect(right, out);
            }
            None => out.extend(node.nodes.iter().map(|r| r.contact.clone())),
        }
    }

    /// Total number of contacts.
    pub fn len(&self) -> usize {
        self.leaves().map(KBucket::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of leaf buckets currently in use.
    pub fn bucket_count(&self) -> usize {
        self.leaves().count()
    }

    /// Leaf buckets, in arena order.
    pub fn leaves(&self) -> impl Iterator<Item = &KBucket> {
        self.buckets.iter().filter(|b| !b.is_split())
    }

    /// Apply the result of pinging the oldest contact in a full bucket.
    ///
    /// If the oldest contact answered it is refreshed and the candidate is
    /// dropped. Otherwise the oldest is evicted and the candidate admitted.
    pub fn apply_probe_result(&mut self, pending: PendingEviction, oldest_alive: bool) {
        self.probing.remove(&pending.oldest.id);
        let idx = self.leaf_for(&pending.candidate.id);
        let k = self.k;
        let bucket = &mut self.buckets[idx];
        if oldest_alive {
            bucket.refresh(&pending.oldest.id);
            return;
        }

        bucket.remove(&pending.oldest.id);
        if bucket.nodes.iter().any(|r| r.contact.id == pending.candidate.id) {
            return;
        }
        if bucket.nodes.len() < k {
            bucket.nodes.push(PeerRecord::new(pending.candidate));
        }
    }
}

/// Ping the stale entry of a full bucket and settle the parked update.
///
/// The entry is kept if any of `attempts` consecutive pings is answered within
/// `timeout`. Returns whether the stale entry survived.
pub async fn probe_stale_entry<N>(
    routing: &Mutex<RoutingTable>,
    network: &N,
    pending: PendingEviction,
    attempts: u32,
    timeout: Duration,
) -> bool
where
    N: DhtNetwork + ?Sized,
{
    let mut alive = false;
    for attempt in 1..=attempts {
        match time::timeout(timeout, network.ping(&pending.oldest)).await {
            Ok(Ok(())) => {
                alive = true;
                break;
            }
            Ok(Err(err)) => debug!(
                peer = %pending.oldest.id,
                attempt,
                "ping failed: {err:?}"
            ),
            Err(_) => debug!(peer = %pending.oldest.id, attempt, "ping timed out"),
        }
    }
    if !alive {
        debug!(
            evicted = %pending.oldest.id,
            admitted = %pending.candidate.id,
            "replacing unresponsive bucket entry"
        );
    }
    routing.lock().await.apply_probe_result(pending, alive);
    alive
}
