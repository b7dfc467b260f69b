//! The DHT node: routing, storage, peers and lookups wired together.
//!
//! [`DhtNode`] is transport-agnostic. It owns one [`RoutingTable`], one
//! [`StorageEngine`] and one [`PeerManager`], each behind its own lock, plus
//! the [`RpcLayer`] that talks to the [`Transport`]. After
//! [`start`](DhtNode::start) a single event loop consumes transport and
//! protocol events; public operations (`put`, `get`, `find_node`, ...) run on
//! the caller's task and only suspend on their own network requests.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::config::DhtConfig;
use crate::core::{normalize_key, now_millis, xor_distance, Contact, Key, NodeId};
use crate::error::DhtError;
use crate::lookup::{ContactObserver, Lookup, LookupKind, LookupOutcome, LookupParams};
use crate::peers::PeerManager;
use crate::routing::{probe_stale_entry, InsertOutcome, PendingEviction, RoutingTable};
use crate::rpc::{ProtocolEvent, RpcLayer};
use crate::storage::{Publisher, PutOptions, StorageEngine, StorageEvent, StorageRecord};
use crate::transport::{Transport, TransportEvents};

const NODE_EVENT_CAPACITY: usize = 256;

/// Relay routes tried before falling back to the closest connected peer.
const MAX_SIGNAL_ROUTES: usize = 3;

/// Application-facing notifications.
#[derive(Clone, Debug, PartialEq)]
pub enum NodeEvent {
    /// The event loop is running.
    Ready(NodeId),
    PeerConnected(NodeId),
    PeerDisconnected(NodeId),
    /// A SIGNAL addressed to this node. `via` is the last relay, or `from`
    /// itself for a direct delivery.
    Signal {
        from: NodeId,
        via: NodeId,
        data: serde_json::Value,
    },
    DhtReady,
    DhtUnready,
    ValueStored {
        key: Key,
    },
}

// ─────────────────────────────────────────────────────────────────────────────
// Telemetry and Diagnostics
// ─────────────────────────────────────────────────────────────────────────────

/// Snapshot of current DHT node state for telemetry and debugging.
#[derive(Clone, Debug, Default, Serialize)]
pub struct TelemetrySnapshot {
    /// Contacts across all routing buckets.
    pub routing_contacts: usize,
    /// Leaf buckets in use.
    pub buckets: usize,
    /// Number of key-value pairs in local storage.
    pub stored_keys: usize,
    pub connected_peers: usize,
    pub dht_capable_peers: usize,
    pub dht_ready: bool,
    /// Requests waiting for a response.
    pub pending_requests: usize,
}

// ─────────────────────────────────────────────────────────────────────────────
// DHT Node
// ─────────────────────────────────────────────────────────────────────────────

type Inbound = (TransportEvents, mpsc::UnboundedReceiver<ProtocolEvent>);

#[derive(Clone, Copy, Debug)]
enum Maintenance {
    Replicate,
    Republish,
}

/// A Kademlia node over some [`Transport`].
///
/// # Key Methods
///
/// * [`connect`](Self::connect) / [`bootstrap`](Self::bootstrap) - Join the network
/// * [`put`](Self::put) / [`get`](Self::get) - Store and retrieve values
/// * [`find_node`](Self::find_node) - Iterative lookup for the closest nodes
/// * [`send_signal`](Self::send_signal) - Relay opaque signaling data to a peer
/// * [`replicate`](Self::replicate) / [`republish`](Self::republish) - Maintenance passes
///
/// The node is meant to live in an [`Arc`] shared with its background tasks.
pub struct DhtNode<T: Transport> {
    /// This node's unique identifier.
    pub id: NodeId,
    /// Contact info for this node (ID + transport address).
    pub self_contact: Contact,
    config: DhtConfig,
    routing: Arc<Mutex<RoutingTable>>,
    storage: Arc<Mutex<StorageEngine>>,
    peers: Arc<Mutex<PeerManager>>,
    rpc: Arc<RpcLayer<T>>,
    events: broadcast::Sender<NodeEvent>,
    /// Taken by `start`.
    inbound: Mutex<Option<Inbound>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Transport> DhtNode<T> {
    /// Build a node. `transport_events` must be the receiver paired with
    /// `transport`.
    pub fn new(
        self_contact: Contact,
        transport: Arc<T>,
        transport_events: TransportEvents,
        config: DhtConfig,
    ) -> Result<Self, DhtError> {
        config.validate()?;
        let id = self_contact.id;
        let peers = Arc::new(Mutex::new(PeerManager::new(
            id,
            config.max_peers,
            config.dht_capability_threshold,
            config.dht_ready_min_peers,
        )));
        let (rpc, protocol_events) =
            RpcLayer::new(self_contact.clone(), transport, peers.clone(), &config);
        let (events, _) = broadcast::channel(NODE_EVENT_CAPACITY);
        Ok(Self {
            id,
            self_contact,
            routing: Arc::new(Mutex::new(RoutingTable::with_bucket_count(
                id,
                config.k,
                config.bucket_count,
            ))),
            storage: Arc::new(Mutex::new(StorageEngine::new(id, config.max_store_size))),
            peers,
            rpc: Arc::new(rpc),
            events,
            inbound: Mutex::new(Some((transport_events, protocol_events))),
            tasks: Mutex::new(Vec::new()),
            config,
        })
    }

    pub fn contact(&self) -> Contact {
        self.self_contact.clone()
    }

    pub fn config(&self) -> &DhtConfig {
        &self.config
    }

    pub fn routing(&self) -> &Arc<Mutex<RoutingTable>> {
        &self.routing
    }

    pub fn storage(&self) -> &Arc<Mutex<StorageEngine>> {
        &self.storage
    }

    pub fn peers(&self) -> &Arc<Mutex<PeerManager>> {
        &self.peers
    }

    pub fn rpc(&self) -> &Arc<RpcLayer<T>> {
        &self.rpc
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: NodeEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Spawn the event loop and the maintenance timers, then emit
    /// [`NodeEvent::Ready`].
    pub async fn start(self: &Arc<Self>) -> Result<(), DhtError> {
        let (mut transport_events, mut protocol_events) = self
            .inbound
            .lock()
            .await
            .take()
            .ok_or(DhtError::AlreadyStarted)?;

        let node = Arc::clone(self);
        let driver = tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(event) = transport_events.recv() => {
                        node.rpc.handle_transport_event(event).await;
                    }
                    Some(event) = protocol_events.recv() => {
                        node.handle_protocol_event(event).await;
                    }
                    else => break,
                }
            }
            debug!(node = %node.id, "event loop stopped");
        });

        let replicate = self.spawn_maintenance(Maintenance::Replicate);
        let republish = self.spawn_maintenance(Maintenance::Republish);

        self.tasks
            .lock()
            .await
            .extend([driver, replicate, republish]);
        info!(node = %self.id, addr = %self.self_contact.addr, "DHT node started");
        self.emit(NodeEvent::Ready(self.id));
        Ok(())
    }

    fn spawn_maintenance(self: &Arc<Self>, pass: Maintenance) -> JoinHandle<()> {
        let node = Arc::clone(self);
        let period = match pass {
            Maintenance::Replicate => self.config.replicate_interval(),
            Maintenance::Republish => self.config.republish_interval(),
        };
        tokio::spawn(async move {
            let mut ticker = time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match pass {
                    Maintenance::Replicate => node.replicate().await,
                    Maintenance::Republish => node.republish().await,
                };
            }
        })
    }

    /// Stop the background tasks. Connections are left to the transport.
    pub async fn shutdown(&self) {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
    }

    // ========================================================================
    // Inbound events
    // ========================================================================

    async fn handle_protocol_event(&self, event: ProtocolEvent) {
        match event {
            ProtocolEvent::PeerConnected(contact) => {
                let id = contact.id;
                self.observe_contact(contact).await;
                self.emit(NodeEvent::PeerConnected(id));
            }
            ProtocolEvent::PeerDisconnected(id) => {
                self.routing.lock().await.remove_node(&id);
                self.emit(NodeEvent::PeerDisconnected(id));
            }
            ProtocolEvent::DhtReady => self.emit(NodeEvent::DhtReady),
            ProtocolEvent::DhtUnready => self.emit(NodeEvent::DhtUnready),
            ProtocolEvent::Seen(contact) => self.observe_contact(contact).await,
            ProtocolEvent::FindNode {
                from,
                request_id,
                target,
            } => {
                let nodes = self.handle_find_node_request(&from, target).await;
                self.rpc.reply_find_node(&from.id, request_id, nodes).await;
            }
            ProtocolEvent::FindValue {
                from,
                request_id,
                key,
            } => {
                let (value, nodes) = self.handle_find_value_request(&from, key).await;
                self.rpc
                    .reply_find_value(&from.id, request_id, value, nodes)
                    .await;
            }
            ProtocolEvent::Store {
                from,
                request_id,
                key,
                value,
                timestamp,
            } => {
                self.handle_store_request(&from, key, value, timestamp).await;
                self.rpc.ack_store(&from.id, request_id).await;
            }
            ProtocolEvent::Signal {
                from,
                origin,
                target,
                hops,
                data,
            } => self.handle_signal(from, origin, target, hops, data).await,
        }
    }

    /// Closest known contacts for a FIND_NODE request.
    pub async fn handle_find_node_request(&self, from: &Contact, target: NodeId) -> Vec<Contact> {
        trace!(peer = %from.id, node_target = %target, "FIND_NODE");
        self.routing.lock().await.closest(&target, self.config.k)
    }

    /// The stored value if present, otherwise the closest known contacts.
    pub async fn handle_find_value_request(
        &self,
        from: &Contact,
        key: Key,
    ) -> (Option<Vec<u8>>, Vec<Contact>) {
        trace!(peer = %from.id, key = %key, "FIND_VALUE");
        let value = self
            .storage
            .lock()
            .await
            .peek(&key)
            .map(|record| record.value.clone());
        if value.is_some() {
            return (value, Vec::new());
        }
        let closer = self.routing.lock().await.closest(&key, self.config.k);
        (None, closer)
    }

    /// Accept a STORE from the network. The sender is recorded as a replica.
    pub async fn handle_store_request(
        &self,
        from: &Contact,
        key: Key,
        value: Vec<u8>,
        timestamp: u64,
    ) {
        debug!(peer = %from.id, key = %key, bytes = value.len(), "STORE");
        let events = {
            let mut storage = self.storage.lock().await;
            storage.store_remote_value(StorageRecord {
                key,
                value,
                timestamp,
                publisher: Publisher::Remote,
                replicated_to: HashSet::from([from.id]),
            });
            storage.take_events()
        };
        self.publish_storage_events(events);
    }

    async fn handle_signal(
        &self,
        from: Contact,
        origin: NodeId,
        target: NodeId,
        hops: u8,
        data: serde_json::Value,
    ) {
        if target == self.id {
            if from.id != origin {
                // `from` just proved it can carry traffic between us and `origin`.
                self.rpc.record_relay_success(&from.id, &origin).await;
            }
            self.emit(NodeEvent::Signal {
                from: origin,
                via: from.id,
                data,
            });
            return;
        }
        if !self
            .route_signal(origin, target, hops, data, Some(from.id))
            .await
        {
            debug!(origin = %origin, signal_target = %target, hops, "dropping undeliverable signal");
        }
    }

    /// Translate storage notifications into node events.
    fn publish_storage_events(&self, events: Vec<StorageEvent>) {
        for event in events {
            match event {
                StorageEvent::Stored { key, .. } => self.emit(NodeEvent::ValueStored { key }),
                StorageEvent::Requested { key } => trace!(key = %key, "local miss"),
                StorageEvent::Evicted { key } => debug!(key = %key, "record evicted"),
                StorageEvent::Replicate(record) | StorageEvent::Republish(record) => {
                    trace!(key = %record.key, "maintenance event outside a maintenance pass")
                }
            }
        }
    }

    // ========================================================================
    // Routing table upkeep
    // ========================================================================

    /// Observe a contact and update the routing table.
    ///
    /// If the bucket for this contact is full, spawns a background task to ping
    /// the oldest contact and decide whether to evict it.
    pub async fn observe_contact(&self, contact: Contact) {
        if contact.id == self.id {
            return;
        }
        let outcome = self.routing.lock().await.add_node(contact);
        if let InsertOutcome::Full(pending) = outcome {
            self.spawn_bucket_refresh(pending);
        }
    }

    /// Spawn a background task to ping the oldest contact in a full bucket.
    fn spawn_bucket_refresh(&self, pending: PendingEviction) {
        let routing = self.routing.clone();
        let rpc = self.rpc.clone();
        let attempts = self.config.ping_attempts;
        let timeout = self.config.request_timeout();
        tokio::spawn(async move {
            probe_stale_entry(&routing, rpc.as_ref(), pending, attempts, timeout).await;
        });
    }

    // ========================================================================
    // Public operations
    // ========================================================================

    /// Connect to `peer`. Returns whether a connection is now established;
    /// connecting to ourselves is a caller error.
    pub async fn connect(&self, peer: &Contact) -> Result<bool, DhtError> {
        self.connect_with_signal(peer, None).await
    }

    /// [`connect`](Self::connect), handing initial signaling data to the transport.
    pub async fn connect_with_signal(
        &self,
        peer: &Contact,
        signal: Option<serde_json::Value>,
    ) -> Result<bool, DhtError> {
        if peer.id == self.id {
            return Err(DhtError::SelfConnect);
        }
        match self.rpc.connect(peer, signal).await {
            Ok(()) => {
                self.observe_contact(peer.clone()).await;
                Ok(true)
            }
            Err(err) => {
                warn!(peer = %peer, "connect failed: {err}");
                Ok(false)
            }
        }
    }

    /// Close the connection to `peer`; it also leaves the routing table.
    pub async fn disconnect(&self, peer: &NodeId) {
        self.rpc.disconnect(peer).await;
    }

    /// Connect to `seeds` and look up our own id to populate the routing table.
    /// Returns how many seeds were reached.
    pub async fn bootstrap(&self, seeds: &[Contact]) -> usize {
        let mut reached = 0;
        for seed in seeds.iter().filter(|s| s.id != self.id) {
            if matches!(self.connect(seed).await, Ok(true)) {
                reached += 1;
            }
        }
        if reached > 0 {
            let found = self.find_node(self.id).await;
            info!(node = %self.id, seeds = reached, discovered = found.len(), "bootstrap complete");
        } else if !seeds.is_empty() {
            warn!(node = %self.id, "bootstrap reached no seed");
        }
        reached
    }

    /// Run an iterative lookup seeded from the routing table.
    pub async fn lookup(&self, target: NodeId, kind: LookupKind) -> LookupOutcome {
        let seeds = self.routing.lock().await.closest(&target, self.config.k);
        Lookup::new(
            self.id,
            target,
            kind,
            seeds,
            LookupParams::from_config(&self.config),
        )
        .run(self.rpc.as_ref(), self)
        .await
    }

    /// The `k` closest live contacts to `target` known to the network.
    pub async fn find_node(&self, target: NodeId) -> Vec<Contact> {
        self.lookup(target, LookupKind::FindNode)
            .await
            .into_contacts()
    }

    /// Store `value` locally and on the closest nodes for `key`.
    ///
    /// Succeeds once at least `min_store_acks` remote nodes acknowledged the
    /// STORE. Network trouble yields `Ok(false)`; only an invalid key is an error.
    pub async fn put(&self, key: &str, value: Vec<u8>) -> Result<bool, DhtError> {
        let timestamp = now_millis();
        let (key_hash, events) = {
            let mut storage = self.storage.lock().await;
            let options = PutOptions {
                timestamp: Some(timestamp),
                ..PutOptions::default()
            };
            let key_hash = storage.put(key, value.clone(), options)?;
            (key_hash, storage.take_events())
        };
        self.publish_storage_events(events);

        let acks = self.publish(key_hash, value, timestamp).await;
        let stored = acks >= self.config.min_store_acks;
        debug!(key = %key_hash, acks, stored, "put finished");
        Ok(stored)
    }

    /// Look `key` up locally, then on the network.
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, DhtError> {
        let key_hash = normalize_key(key)?;
        let (local, events) = {
            let mut storage = self.storage.lock().await;
            (storage.get_hashed(&key_hash), storage.take_events())
        };
        self.publish_storage_events(events);
        if local.is_some() {
            return Ok(local);
        }

        match self.lookup(key_hash, LookupKind::FindValue).await {
            LookupOutcome::Value { value, from, .. } => {
                debug!(key = %key_hash, holder = %from.id, "value found on the network");
                if self.config.cache_found_values {
                    let events = {
                        let mut storage = self.storage.lock().await;
                        storage.put_hashed(
                            key_hash,
                            value.clone(),
                            PutOptions {
                                publisher: Some(Publisher::Remote),
                                replicated_to: HashSet::from([from.id]),
                                ..PutOptions::default()
                            },
                        );
                        storage.take_events()
                    };
                    self.publish_storage_events(events);
                }
                Ok(Some(value))
            }
            outcome => {
                debug!(key = %key_hash, state = ?outcome.state(), "value not found");
                Ok(None)
            }
        }
    }

    /// Send opaque signaling data to `target`, directly when connected and
    /// through DHT peers otherwise. Returns whether the first hop accepted it.
    pub async fn send_signal(&self, target: NodeId, data: serde_json::Value) -> bool {
        if target == self.id {
            return false;
        }
        self.route_signal(self.id, target, self.config.signal_max_hops, data, None)
            .await
    }

    async fn route_signal(
        &self,
        origin: NodeId,
        target: NodeId,
        hops: u8,
        data: serde_json::Value,
        came_from: Option<NodeId>,
    ) -> bool {
        let (direct, routes, closest) = {
            let peers = self.peers.lock().await;
            (
                peers.is_connected(&target),
                peers.get_dht_routes(&target, MAX_SIGNAL_ROUTES),
                peers.closest_connected(&target, self.config.k),
            )
        };
        if direct {
            return self
                .rpc
                .send_signal(&target, origin, target, hops, data)
                .await;
        }
        let Some(remaining) = hops.checked_sub(1) else {
            return false;
        };

        let usable = |id: &NodeId| Some(*id) != came_from && *id != origin;
        for via in routes.into_iter().filter(|id| usable(id)) {
            if self
                .rpc
                .send_signal(&via, origin, target, remaining, data.clone())
                .await
            {
                trace!(via = %via, signal_target = %target, "signal sent over known route");
                return true;
            }
        }

        // Relays only move the signal strictly closer; the origin may use any peer.
        let own_distance = xor_distance(&self.id, &target);
        for peer in closest.into_iter().filter(|c| usable(&c.id)) {
            if origin != self.id && xor_distance(&peer.id, &target) >= own_distance {
                break;
            }
            if self
                .rpc
                .send_signal(&peer.id, origin, target, remaining, data.clone())
                .await
            {
                trace!(via = %peer.id, signal_target = %target, "signal sent towards closest peer");
                return true;
            }
        }
        false
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Push every record to closest nodes missing from its replica set.
    /// Returns the number of new replicas acknowledged.
    pub async fn replicate(&self) -> usize {
        let events = {
            let mut storage = self.storage.lock().await;
            storage.emit_replicate();
            storage.take_events()
        };
        let mut acked = 0;
        for event in events {
            match event {
                StorageEvent::Replicate(record) => acked += self.replicate_record(record).await,
                other => self.publish_storage_events(vec![other]),
            }
        }
        debug!(node = %self.id, acked, "replication pass finished");
        acked
    }

    async fn replicate_record(&self, record: StorageRecord) -> usize {
        let missing: Vec<Contact> = self
            .lookup(record.key, LookupKind::FindNode)
            .await
            .into_contacts()
            .into_iter()
            .filter(|c| c.id != self.id && !record.replicated_to.contains(&c.id))
            .collect();
        if missing.is_empty() {
            return 0;
        }
        self.store_to(&missing, record.key, &record.value, record.timestamp)
            .await
    }

    /// Re-announce every locally published record with a fresh timestamp.
    /// Returns the number of acknowledged STOREs.
    pub async fn republish(&self) -> usize {
        let events = {
            let mut storage = self.storage.lock().await;
            storage.emit_republish();
            storage.take_events()
        };
        let mut acked = 0;
        for event in events {
            match event {
                StorageEvent::Republish(record) => acked += self.republish_record(record).await,
                other => self.publish_storage_events(vec![other]),
            }
        }
        debug!(node = %self.id, acked, "republish pass finished");
        acked
    }

    async fn republish_record(&self, record: StorageRecord) -> usize {
        if record.publisher != Publisher::Node(self.id) {
            trace!(key = %record.key, "skipping republish of remote record");
            return 0;
        }
        let timestamp = now_millis();
        let events = {
            let mut storage = self.storage.lock().await;
            storage.put_hashed(
                record.key,
                record.value.clone(),
                PutOptions {
                    publisher: Some(record.publisher),
                    replicated_to: record.replicated_to,
                    republish: true,
                    timestamp: Some(timestamp),
                },
            );
            storage.take_events()
        };
        self.publish_storage_events(events);
        self.publish(record.key, record.value, timestamp).await
    }

    /// Look up the closest nodes for `key` and STORE to all of them.
    async fn publish(&self, key: Key, value: Vec<u8>, timestamp: u64) -> usize {
        let targets: Vec<Contact> = self
            .lookup(key, LookupKind::FindNode)
            .await
            .into_contacts()
            .into_iter()
            .filter(|c| c.id != self.id)
            .take(self.config.k)
            .collect();
        if targets.is_empty() {
            debug!(key = %key, "no remote nodes to store on");
            return 0;
        }
        self.store_to(&targets, key, &value, timestamp).await
    }

    /// Fan STORE out to `targets`, recording acknowledged replicas.
    async fn store_to(&self, targets: &[Contact], key: Key, value: &[u8], timestamp: u64) -> usize {
        let results = join_all(
            targets
                .iter()
                .map(|contact| self.rpc.store_record(contact, key, value.to_vec(), timestamp)),
        )
        .await;

        let acked: Vec<NodeId> = targets
            .iter()
            .zip(results)
            .filter_map(|(contact, result)| match result {
                Ok(()) => Some(contact.id),
                Err(err) => {
                    debug!(peer = %contact.id, key = %key, "STORE failed: {err}");
                    None
                }
            })
            .collect();
        self.storage
            .lock()
            .await
            .mark_replicated(&key, acked.iter().copied());
        acked.len()
    }

    /// Get a snapshot of current node state for telemetry.
    pub async fn telemetry_snapshot(&self) -> TelemetrySnapshot {
        let (routing_contacts, buckets) = {
            let routing = self.routing.lock().await;
            (routing.len(), routing.bucket_count())
        };
        let stored_keys = self.storage.lock().await.len();
        let (connected_peers, dht_capable_peers, dht_ready) = {
            let peers = self.peers.lock().await;
            (peers.len(), peers.dht_capable_count(), peers.is_dht_ready())
        };
        TelemetrySnapshot {
            routing_contacts,
            buckets,
            stored_keys,
            connected_peers,
            dht_capable_peers,
            dht_ready,
            pending_requests: self.rpc.pending_requests().await,
        }
    }
}

#[async_trait::async_trait]
impl<T: Transport> ContactObserver for DhtNode<T> {
    async fn observe_contact(&self, contact: Contact) {
        DhtNode::observe_contact(self, contact).await;
    }
}
