//! Request/response plumbing on top of a [`Transport`].
//!
//! [`RpcLayer`] owns the peer-facing side of a node: it admits connections
//! through the [`PeerManager`], answers PING directly, correlates responses
//! with outstanding requests by `requestId`, and re-emits everything else as a
//! typed [`ProtocolEvent`] for the node to act on.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as SyncMutex, MutexGuard, PoisonError};

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::{self, Duration};
use tracing::{debug, info, trace, warn};

use crate::config::DhtConfig;
use crate::core::{now_millis, Contact, Key, NodeId};
use crate::peers::{Admission, PeerEvent, PeerManager, RejectReason};
use crate::protocol::{Message, MessageKind};
use crate::transport::{Transport, TransportEvent};

/// Network abstraction for DHT RPC operations.
///
/// The lookup engine and the bucket probe only need these four calls, which
/// keeps them independent of connection handling and lets tests substitute an
/// in-memory implementation.
#[async_trait]
pub trait DhtNetwork: Send + Sync + 'static {
    /// Send a FIND_NODE RPC to find contacts near a target ID.
    async fn find_node(&self, to: &Contact, target: NodeId) -> Result<Vec<Contact>>;

    /// Send a FIND_VALUE RPC to retrieve a value or get closer contacts.
    ///
    /// Returns (value, closer_nodes) where value is Some if the key was found.
    async fn find_value(&self, to: &Contact, key: Key) -> Result<(Option<Vec<u8>>, Vec<Contact>)>;

    /// Send a STORE RPC and wait for the acknowledgement.
    async fn store(&self, to: &Contact, key: Key, value: Vec<u8>) -> Result<()>;

    /// Ping a contact to check if it's still responsive.
    ///
    /// Used for the "ping-before-evict" rule: when a bucket is full, the oldest
    /// contact is pinged before deciding whether to keep it.
    async fn ping(&self, to: &Contact) -> Result<()>;
}

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("connection rejected: {0:?}")]
    Rejected(RejectReason),

    #[error("connect failed: {0}")]
    ConnectFailed(String),

    #[error("failed to send {0}")]
    SendFailed(MessageKind),

    #[error("request timed out")]
    Timeout,

    #[error("peer disconnected before responding")]
    Cancelled,

    #[error("unexpected response {0}")]
    UnexpectedResponse(MessageKind),
}

/// Domain events re-emitted from inbound traffic and peer bookkeeping.
#[derive(Clone, Debug)]
pub enum ProtocolEvent {
    PeerConnected(Contact),
    PeerDisconnected(NodeId),
    DhtReady,
    DhtUnready,
    /// Any well-formed message; the sender is alive and reachable.
    Seen(Contact),
    FindNode {
        from: Contact,
        request_id: u64,
        target: NodeId,
    },
    FindValue {
        from: Contact,
        request_id: u64,
        key: Key,
    },
    Store {
        from: Contact,
        request_id: u64,
        key: Key,
        value: Vec<u8>,
        timestamp: u64,
    },
    Signal {
        from: Contact,
        origin: NodeId,
        target: NodeId,
        hops: u8,
        data: serde_json::Value,
    },
}

impl From<PeerEvent> for ProtocolEvent {
    fn from(event: PeerEvent) -> Self {
        match event {
            PeerEvent::Connected(contact) => ProtocolEvent::PeerConnected(contact),
            PeerEvent::Disconnected(id) => ProtocolEvent::PeerDisconnected(id),
            PeerEvent::DhtReady => ProtocolEvent::DhtReady,
            PeerEvent::DhtUnready => ProtocolEvent::DhtUnready,
        }
    }
}

struct PendingRequest {
    peer: NodeId,
    reply: oneshot::Sender<Message>,
}

type PendingMap = SyncMutex<HashMap<u64, PendingRequest>>;

fn lock_pending(pending: &PendingMap) -> MutexGuard<'_, HashMap<u64, PendingRequest>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes a request's waiter once the request future completes or is dropped
/// by an outer timeout.
struct PendingSlot<'a> {
    pending: &'a PendingMap,
    request_id: u64,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        lock_pending(self.pending).remove(&self.request_id);
    }
}

pub struct RpcLayer<T: Transport> {
    local: Contact,
    transport: Arc<T>,
    peers: Arc<Mutex<PeerManager>>,
    pending: PendingMap,
    next_request_id: AtomicU64,
    request_timeout: Duration,
    connect_timeout: Duration,
    events: mpsc::UnboundedSender<ProtocolEvent>,
}

impl<T: Transport> RpcLayer<T> {
    pub fn new(
        local: Contact,
        transport: Arc<T>,
        peers: Arc<Mutex<PeerManager>>,
        config: &DhtConfig,
    ) -> (Self, mpsc::UnboundedReceiver<ProtocolEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let layer = Self {
            local,
            transport,
            peers,
            pending: SyncMutex::new(HashMap::new()),
            next_request_id: AtomicU64::new(1),
            request_timeout: config.request_timeout(),
            connect_timeout: config.connect_timeout(),
            events,
        };
        (layer, rx)
    }

    pub fn local(&self) -> &Contact {
        &self.local
    }

    pub fn peers(&self) -> &Arc<Mutex<PeerManager>> {
        &self.peers
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub async fn pending_requests(&self) -> usize {
        lock_pending(&self.pending).len()
    }

    fn emit(&self, event: ProtocolEvent) {
        // The receiver only goes away when the node shuts down.
        let _ = self.events.send(event);
    }

    fn forward_peer_events(&self, events: Vec<PeerEvent>) {
        for event in events {
            self.emit(event.into());
        }
    }

    // ========================================================================
    // Connections
    // ========================================================================

    /// Connect to `peer` unless a connection already exists.
    ///
    /// `signal` is handed to the transport in both cases so relayed setup data
    /// reaches an existing connection too.
    pub async fn connect(
        &self,
        peer: &Contact,
        signal: Option<serde_json::Value>,
    ) -> Result<(), RpcError> {
        if peer.id == self.local.id {
            return Err(RpcError::Rejected(RejectReason::SelfId));
        }
        let connected = self.peers.lock().await.is_connected(&peer.id);
        if connected && signal.is_none() {
            return Ok(());
        }

        match time::timeout(self.connect_timeout, self.transport.connect(peer, signal)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(RpcError::ConnectFailed(err.to_string())),
            Err(_) => return Err(RpcError::Timeout),
        }
        if connected {
            return Ok(());
        }

        match self.on_connected(peer.clone()).await {
            Admission::Admitted
            | Admission::Replaced { .. }
            | Admission::Rejected(RejectReason::Duplicate) => Ok(()),
            Admission::Rejected(reason) => Err(RpcError::Rejected(reason)),
        }
    }

    /// Register a freshly established connection with the peer manager.
    ///
    /// Admitted peers are pinged straight away so their PONG populates the
    /// routing table on both sides. Duplicate notifications are no-ops.
    pub async fn on_connected(&self, contact: Contact) -> Admission {
        let (admission, events) = {
            let mut peers = self.peers.lock().await;
            let admission = peers.register_peer(contact.clone());
            (admission, peers.take_events())
        };

        if admission == Admission::Rejected(RejectReason::Duplicate) {
            return admission;
        }
        match &admission {
            Admission::Admitted | Admission::Rejected(RejectReason::Duplicate) => {}
            Admission::Replaced { evicted } => {
                info!(evicted = %evicted, admitted = %contact.id, "peer ceiling reached, replacing farthest peer");
                self.transport.disconnect(evicted).await;
                self.fail_pending_for(evicted).await;
            }
            Admission::Rejected(reason) => {
                debug!(peer = %contact.id, ?reason, "rejecting connection");
                self.transport.disconnect(&contact.id).await;
            }
        }
        self.forward_peer_events(events);

        if matches!(admission, Admission::Admitted | Admission::Replaced { .. }) {
            let ping = Message::Ping {
                sender: self.local.clone(),
                request_id: self.next_id(),
                timestamp: now_millis(),
            };
            self.send_message(&contact.id, &ping).await;
        }
        admission
    }

    /// Close the connection to `peer` and forget it.
    pub async fn disconnect(&self, peer: &NodeId) {
        self.transport.disconnect(peer).await;
        self.peer_closed(peer).await;
    }

    async fn peer_closed(&self, peer: &NodeId) {
        let events = {
            let mut peers = self.peers.lock().await;
            peers.remove_peer(peer);
            peers.take_events()
        };
        self.fail_pending_for(peer).await;
        self.forward_peer_events(events);
    }

    /// Drop every waiter on `peer`; their requests resolve as cancelled.
    async fn fail_pending_for(&self, peer: &NodeId) {
        let dropped = {
            let mut pending = lock_pending(&self.pending);
            let before = pending.len();
            pending.retain(|_, req| req.peer != *peer);
            before - pending.len()
        };
        if dropped > 0 {
            debug!(peer = %peer, dropped, "cancelled in-flight requests");
        }
    }

    /// Record a successful relay through `peer` and publish readiness changes.
    pub async fn record_relay_success(&self, peer: &NodeId, target: &NodeId) -> bool {
        let (promoted, events) = {
            let mut peers = self.peers.lock().await;
            let promoted = peers.record_dht_signal_success(peer, target);
            (promoted, peers.take_events())
        };
        self.forward_peer_events(events);
        promoted
    }

    // ========================================================================
    // Outbound
    // ========================================================================

    fn next_id(&self) -> u64 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Best-effort send to a connected peer. Returns whether the transport
    /// accepted the frame; never queues.
    pub async fn send_message(&self, target: &NodeId, message: &Message) -> bool {
        if !self.peers.lock().await.is_connected(target) {
            trace!(peer = %target, kind = %message.kind(), "not connected, dropping message");
            return false;
        }
        let frame = match message.encode() {
            Ok(frame) => frame,
            Err(err) => {
                warn!(kind = %message.kind(), "failed to encode message: {err}");
                return false;
            }
        };
        match self.transport.send(target, frame).await {
            Ok(()) => true,
            Err(err) => {
                debug!(peer = %target, kind = %message.kind(), "send failed: {err:?}");
                false
            }
        }
    }

    /// Send `message` to every connected peer accepted by `filter`.
    pub async fn broadcast<F>(&self, message: &Message, filter: F) -> usize
    where
        F: Fn(&Contact) -> bool,
    {
        let targets: Vec<Contact> = self
            .peers
            .lock()
            .await
            .connected_contacts()
            .into_iter()
            .filter(|c| filter(c))
            .collect();
        let mut delivered = 0;
        for target in targets {
            if self.send_message(&target.id, message).await {
                delivered += 1;
            }
        }
        delivered
    }

    /// Send a request built around a fresh request id and wait for its response.
    async fn request<F>(&self, peer: &Contact, build: F) -> Result<Message, RpcError>
    where
        F: FnOnce(u64) -> Message,
    {
        self.connect(peer, None).await?;

        let request_id = self.next_id();
        let message = build(request_id);
        let kind = message.kind();
        let (tx, rx) = oneshot::channel();
        lock_pending(&self.pending).insert(
            request_id,
            PendingRequest {
                peer: peer.id,
                reply: tx,
            },
        );
        let _slot = PendingSlot {
            pending: &self.pending,
            request_id,
        };

        if !self.send_message(&peer.id, &message).await {
            return Err(RpcError::SendFailed(kind));
        }

        match time::timeout(self.request_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(RpcError::Cancelled),
            Err(_) => {
                trace!(peer = %peer.id, request_id, %kind, "request timed out");
                Err(RpcError::Timeout)
            }
        }
    }

    /// Send STORE carrying an explicit record timestamp.
    pub async fn store_record(
        &self,
        to: &Contact,
        key: Key,
        value: Vec<u8>,
        timestamp: u64,
    ) -> Result<(), RpcError> {
        let sender = self.local.clone();
        let reply = self
            .request(to, |request_id| Message::Store {
                sender,
                request_id,
                key,
                value,
                timestamp,
            })
            .await?;
        match reply {
            Message::Pong { .. } => Ok(()),
            other => Err(RpcError::UnexpectedResponse(other.kind())),
        }
    }

    pub async fn reply_find_node(&self, to: &NodeId, request_id: u64, nodes: Vec<Contact>) -> bool {
        let reply = Message::FindNodeResponse {
            sender: self.local.clone(),
            request_id,
            nodes,
        };
        self.send_message(to, &reply).await
    }

    pub async fn reply_find_value(
        &self,
        to: &NodeId,
        request_id: u64,
        value: Option<Vec<u8>>,
        nodes: Vec<Contact>,
    ) -> bool {
        let reply = Message::FindValueResponse {
            sender: self.local.clone(),
            request_id,
            value,
            nodes,
        };
        self.send_message(to, &reply).await
    }

    /// Acknowledge a STORE with a PONG echoing its request id.
    pub async fn ack_store(&self, to: &NodeId, request_id: u64) -> bool {
        let ack = Message::Pong {
            sender: self.local.clone(),
            request_id,
            timestamp: now_millis(),
        };
        self.send_message(to, &ack).await
    }

    pub async fn send_signal(
        &self,
        via: &NodeId,
        origin: NodeId,
        target: NodeId,
        hops: u8,
        data: serde_json::Value,
    ) -> bool {
        let message = Message::Signal {
            sender: self.local.clone(),
            origin,
            target,
            hops,
            signal: data,
        };
        self.send_message(via, &message).await
    }

    // ========================================================================
    // Inbound
    // ========================================================================

    pub async fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Connected(contact) => {
                self.on_connected(contact).await;
            }
            TransportEvent::Data { from, frame } => self.handle_frame(&from, &frame).await,
            TransportEvent::Closed(peer) => self.peer_closed(&peer).await,
            TransportEvent::Error { peer, error } => {
                warn!(peer = %peer, "transport error: {error}");
            }
        }
    }

    /// Parse and dispatch one inbound frame. Bad frames are logged and dropped;
    /// the connection stays open.
    pub async fn handle_frame(&self, from: &NodeId, frame: &[u8]) {
        let message = match Message::decode(frame) {
            Ok(message) => message,
            Err(err) => {
                warn!(peer = %from, "dropping inbound message: {err}");
                return;
            }
        };
        if message.sender().id != *from {
            warn!(
                peer = %from,
                claimed = %message.sender().id,
                kind = %message.kind(),
                "dropping message with mismatched sender"
            );
            return;
        }
        trace!(peer = %from, kind = %message.kind(), "inbound message");
        self.emit(ProtocolEvent::Seen(message.sender().clone()));

        match message {
            Message::Ping {
                sender, request_id, ..
            } => {
                let pong = Message::Pong {
                    sender: self.local.clone(),
                    request_id,
                    timestamp: now_millis(),
                };
                self.send_message(&sender.id, &pong).await;
            }
            Message::Pong { .. }
            | Message::FindNodeResponse { .. }
            | Message::FindValueResponse { .. } => self.resolve(from, message).await,
            Message::FindNode {
                sender,
                request_id,
                target,
            } => self.emit(ProtocolEvent::FindNode {
                from: sender,
                request_id,
                target,
            }),
            Message::FindValue {
                sender,
                request_id,
                key,
            } => self.emit(ProtocolEvent::FindValue {
                from: sender,
                request_id,
                key,
            }),
            Message::Store {
                sender,
                request_id,
                key,
                value,
                timestamp,
            } => self.emit(ProtocolEvent::Store {
                from: sender,
                request_id,
                key,
                value,
                timestamp,
            }),
            Message::Signal {
                sender,
                origin,
                target,
                hops,
                signal,
            } => self.emit(ProtocolEvent::Signal {
                from: sender,
                origin,
                target,
                hops,
                data: signal,
            }),
        }
    }

    async fn resolve(&self, from: &NodeId, message: Message) {
        let Some(request_id) = message.request_id() else {
            return;
        };
        let waiter = {
            let mut pending = lock_pending(&self.pending);
            match pending.get(&request_id) {
                Some(req) if req.peer == *from => pending.remove(&request_id),
                Some(_) => {
                    warn!(peer = %from, request_id, "response from unexpected peer");
                    None
                }
                None => None,
            }
        };
        match waiter {
            Some(req) => {
                let _ = req.reply.send(message);
            }
            None => trace!(peer = %from, request_id, "no waiter for response"),
        }
    }
}

#[async_trait]
impl<T: Transport> DhtNetwork for RpcLayer<T> {
    async fn find_node(&self, to: &Contact, target: NodeId) -> Result<Vec<Contact>> {
        let sender = self.local.clone();
        let reply = self
            .request(to, |request_id| Message::FindNode {
                sender,
                request_id,
                target,
            })
            .await?;
        match reply {
            Message::FindNodeResponse { nodes, .. } => Ok(nodes),
            other => Err(RpcError::UnexpectedResponse(other.kind()).into()),
        }
    }

    async fn find_value(&self, to: &Contact, key: Key) -> Result<(Option<Vec<u8>>, Vec<Contact>)> {
        let sender = self.local.clone();
        let reply = self
            .request(to, |request_id| Message::FindValue {
                sender,
                request_id,
                key,
            })
            .await?;
        match reply {
            Message::FindValueResponse { value, nodes, .. } => Ok((value, nodes)),
            other => Err(RpcError::UnexpectedResponse(other.kind()).into()),
        }
    }

    async fn store(&self, to: &Contact, key: Key, value: Vec<u8>) -> Result<()> {
        self.store_record(to, key, value, now_millis()).await?;
        Ok(())
    }

    async fn ping(&self, to: &Contact) -> Result<()> {
        let sender = self.local.clone();
        let reply = self
            .request(to, |request_id| Message::Ping {
                sender,
                request_id,
                timestamp: now_millis(),
            })
            .await?;
        match reply {
            Message::Pong { .. } => Ok(()),
            other => Err(RpcError::UnexpectedResponse(other.kind()).into()),
        }
    }
}
