//! Live connection bookkeeping and DHT relay capability tracking.
//!
//! The peer manager enforces the connection ceiling: when full, the connected
//! peer farthest from the local id is swapped for a strictly closer newcomer,
//! unless it has proven able to relay DHT traffic. Relay successes promote a
//! peer to "DHT-capable"; once enough distinct capable peers are connected the
//! node is DHT-ready. Readiness changes are edge-triggered events.

use std::collections::{HashMap, HashSet, VecDeque};

use tokio::time::Instant;
use tracing::{debug, info};

use crate::core::{xor_distance, Contact, NodeId};

/// Relay history for one connected peer.
#[derive(Clone, Debug)]
pub struct DhtCapabilityInfo {
    pub peer_id: NodeId,
    pub success_count: u32,
    pub last_success: Instant,
    pub relayed_targets: HashSet<NodeId>,
}

/// Outcome of [`PeerManager::register_peer`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    /// Admitted after disconnecting a farther, non-capable peer.
    Replaced { evicted: NodeId },
    Rejected(RejectReason),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejectReason {
    SelfId,
    Duplicate,
    AtCapacity,
}

/// Bookkeeping changes for the protocol layer to re-emit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerEvent {
    Connected(Contact),
    Disconnected(NodeId),
    DhtReady,
    DhtUnready,
}

#[derive(Debug)]
pub struct PeerManager {
    local_id: NodeId,
    max_peers: usize,
    capability_threshold: u32,
    ready_min_peers: usize,
    peers: HashMap<NodeId, Contact>,
    capabilities: HashMap<NodeId, DhtCapabilityInfo>,
    dht_ready: bool,
    events: VecDeque<PeerEvent>,
}

impl PeerManager {
    pub fn new(
        local_id: NodeId,
        max_peers: usize,
        capability_threshold: u32,
        ready_min_peers: usize,
    ) -> Self {
        Self {
            local_id,
            max_peers,
            capability_threshold,
            ready_min_peers,
            peers: HashMap::new(),
            capabilities: HashMap::new(),
            dht_ready: false,
            events: VecDeque::new(),
        }
    }

    /// Admit a newly connected peer, making room at the ceiling if possible.
    pub fn register_peer(&mut self, contact: Contact) -> Admission {
        if contact.id == self.local_id {
            return Admission::Rejected(RejectReason::SelfId);
        }
        if self.peers.contains_key(&contact.id) {
            return Admission::Rejected(RejectReason::Duplicate);
        }

        let mut admission = Admission::Admitted;
        if self.peers.len() >= self.max_peers {
            match self.make_room_for_peer(&contact.id) {
                Some(evicted) => {
                    self.remove_peer(&evicted);
                    admission = Admission::Replaced { evicted };
                }
                None => return Admission::Rejected(RejectReason::AtCapacity),
            }
        }

        debug!(peer = %contact.id, "peer registered");
        self.peers.insert(contact.id, contact.clone());
        self.events.push_back(PeerEvent::Connected(contact));
        admission
    }

    /// Pick the farthest connected peer if it may be replaced by `candidate`.
    fn make_room_for_peer(&self, candidate: &NodeId) -> Option<NodeId> {
        let farthest = self
            .peers
            .keys()
            .max_by_key(|id| xor_distance(id, &self.local_id))
            .copied()?;
        if self.is_dht_capable(&farthest) {
            return None;
        }
        let candidate_distance = xor_distance(candidate, &self.local_id);
        if candidate_distance < xor_distance(&farthest, &self.local_id) {
            Some(farthest)
        } else {
            None
        }
    }

    /// Forget a peer and its relay history. Idempotent.
    pub fn remove_peer(&mut self, id: &NodeId) -> bool {
        let removed = self.peers.remove(id).is_some();
        self.capabilities.remove(id);
        if removed {
            debug!(peer = %id, "peer removed");
            self.events.push_back(PeerEvent::Disconnected(*id));
            self.recompute_readiness();
        }
        removed
    }

    /// Record that `peer_id` successfully relayed signaling traffic for `target`.
    ///
    /// Returns true when this success made the peer DHT-capable.
    pub fn record_dht_signal_success(&mut self, peer_id: &NodeId, target: &NodeId) -> bool {
        if !self.peers.contains_key(peer_id) {
            return false;
        }
        let was_capable = self.is_dht_capable(peer_id);
        let info = self
            .capabilities
            .entry(*peer_id)
            .or_insert_with(|| DhtCapabilityInfo {
                peer_id: *peer_id,
                success_count: 0,
                last_success: Instant::now(),
                relayed_targets: HashSet::new(),
            });
        info.success_count = info.success_count.saturating_add(1);
        info.last_success = Instant::now();
        info.relayed_targets.insert(*target);

        let now_capable = self.is_dht_capable(peer_id);
        if now_capable && !was_capable {
            debug!(peer = %peer_id, "peer is now DHT-capable");
        }
        self.recompute_readiness();
        now_capable && !was_capable
    }

    fn recompute_readiness(&mut self) {
        let ready = self.dht_capable_count() >= self.ready_min_peers;
        if ready == self.dht_ready {
            return;
        }
        self.dht_ready = ready;
        if ready {
            info!("DHT ready");
            self.events.push_back(PeerEvent::DhtReady);
        } else {
            info!("DHT no longer ready");
            self.events.push_back(PeerEvent::DhtUnready);
        }
    }

    /// Connected peers that relayed to `target` before, best first.
    pub fn get_dht_routes(&self, target: &NodeId, max_routes: usize) -> Vec<NodeId> {
        let mut routes: Vec<&DhtCapabilityInfo> = self
            .capabilities
            .values()
            .filter(|info| info.relayed_targets.contains(target))
            .filter(|info| self.peers.contains_key(&info.peer_id))
            .collect();
        routes.sort_by(|a, b| {
            b.success_count
                .cmp(&a.success_count)
                .then_with(|| a.peer_id.cmp(&b.peer_id))
        });
        routes
            .into_iter()
            .take(max_routes)
            .map(|info| info.peer_id)
            .collect()
    }

    /// Connected peers ordered by XOR distance to `target`.
    pub fn closest_connected(&self, target: &NodeId, count: usize) -> Vec<Contact> {
        let mut contacts = self.connected_contacts();
        contacts.sort_by_key(|c| xor_distance(&c.id, target));
        contacts.truncate(count);
        contacts
    }

    pub fn is_dht_capable(&self, id: &NodeId) -> bool {
        self.capabilities
            .get(id)
            .map(|info| info.success_count >= self.capability_threshold)
            .unwrap_or(false)
    }

    pub fn dht_capable_count(&self) -> usize {
        self.capabilities
            .keys()
            .filter(|id| self.peers.contains_key(*id) && self.is_dht_capable(id))
            .count()
    }

    pub fn is_dht_ready(&self) -> bool {
        self.dht_ready
    }

    pub fn capability(&self, id: &NodeId) -> Option<&DhtCapabilityInfo> {
        self.capabilities.get(id)
    }

    pub fn is_connected(&self, id: &NodeId) -> bool {
        self.peers.contains_key(id)
    }

    pub fn contact(&self, id: &NodeId) -> Option<&Contact> {
        self.peers.get(id)
    }

    pub fn connected_ids(&self) -> Vec<NodeId> {
        self.peers.keys().copied().collect()
    }

    pub fn connected_contacts(&self) -> Vec<Contact> {
        self.peers.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn take_events(&mut self) -> Vec<PeerEvent> {
        self.events.drain(..).collect()
    }
}
