#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration, Instant};

use webdht::transport::{event_channel, TransportEventSender};
use webdht::{
    Contact, DhtConfig, DhtNode, Message, MessageKind, NodeId, Transport, TransportEvent,
    TransportEvents,
};

/// Switchboard connecting [`MemoryTransport`]s inside one process.
#[derive(Default)]
pub struct MemoryHub {
    endpoints: Mutex<HashMap<NodeId, (Contact, TransportEventSender)>>,
    links: Mutex<HashSet<(NodeId, NodeId)>>,
}

fn link(a: NodeId, b: NodeId) -> (NodeId, NodeId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

impl MemoryHub {
    async fn register(&self, contact: Contact, events: TransportEventSender) {
        let mut endpoints = self.endpoints.lock().await;
        endpoints.insert(contact.id, (contact, events));
    }

    async fn endpoint(&self, id: &NodeId) -> Option<(Contact, TransportEventSender)> {
        let endpoints = self.endpoints.lock().await;
        endpoints.get(id).cloned()
    }

    pub async fn is_linked(&self, a: NodeId, b: NodeId) -> bool {
        let links = self.links.lock().await;
        links.contains(&link(a, b))
    }

    /// Deliver a raw frame to `to` as if `from` had sent it.
    pub async fn inject(&self, from: NodeId, to: NodeId, frame: Vec<u8>) -> bool {
        match self.endpoint(&to).await {
            Some((_, events)) => events.send(TransportEvent::Data { from, frame }).is_ok(),
            None => false,
        }
    }
}

/// In-memory [`Transport`] with failure injection and a log of sent messages.
pub struct MemoryTransport {
    hub: Arc<MemoryHub>,
    local: Contact,
    /// Peers that refuse connections and frames.
    failures: Mutex<HashSet<NodeId>>,
    /// Peers whose frames are accepted but never delivered.
    silenced: Mutex<HashSet<NodeId>>,
    /// Added before every outbound connection attempt.
    connect_delay: Mutex<Duration>,
    sent: Mutex<Vec<(NodeId, MessageKind)>>,
}

impl MemoryTransport {
    pub async fn new(hub: Arc<MemoryHub>, local: Contact) -> (Arc<Self>, TransportEvents) {
        let (events, rx) = event_channel();
        hub.register(local.clone(), events).await;
        let transport = Arc::new(Self {
            hub,
            local,
            failures: Mutex::new(HashSet::new()),
            silenced: Mutex::new(HashSet::new()),
            connect_delay: Mutex::new(Duration::ZERO),
            sent: Mutex::new(Vec::new()),
        });
        (transport, rx)
    }

    pub async fn set_failure(&self, node: NodeId, fail: bool) {
        let mut failures = self.failures.lock().await;
        if fail {
            failures.insert(node);
        } else {
            failures.remove(&node);
        }
    }

    pub async fn set_silenced(&self, node: NodeId, silenced: bool) {
        let mut set = self.silenced.lock().await;
        if silenced {
            set.insert(node);
        } else {
            set.remove(&node);
        }
    }

    pub async fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock().await = delay;
    }

    pub async fn sent(&self) -> Vec<(NodeId, MessageKind)> {
        let sent = self.sent.lock().await;
        sent.clone()
    }

    pub async fn sent_count(&self, kind: MessageKind) -> usize {
        let sent = self.sent.lock().await;
        sent.iter().filter(|(_, k)| *k == kind).count()
    }

    pub async fn clear_sent(&self) {
        self.sent.lock().await.clear();
    }

    async fn should_fail(&self, node: &NodeId) -> bool {
        let failures = self.failures.lock().await;
        failures.contains(node)
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, peer: &Contact, _signal: Option<serde_json::Value>) -> Result<()> {
        let delay = *self.connect_delay.lock().await;
        if !delay.is_zero() {
            sleep(delay).await;
        }
        if self.should_fail(&peer.id).await {
            return Err(anyhow!("injected connection failure"));
        }
        let (remote, remote_events) = self
            .hub
            .endpoint(&peer.id)
            .await
            .ok_or_else(|| anyhow!("peer {} not reachable", peer.id))?;
        let (_, local_events) = self
            .hub
            .endpoint(&self.local.id)
            .await
            .ok_or_else(|| anyhow!("local endpoint missing"))?;

        let fresh = self
            .hub
            .links
            .lock()
            .await
            .insert(link(self.local.id, peer.id));
        if fresh {
            let _ = local_events.send(TransportEvent::Connected(remote));
            let _ = remote_events.send(TransportEvent::Connected(self.local.clone()));
        }
        Ok(())
    }

    async fn send(&self, peer: &NodeId, frame: Vec<u8>) -> Result<()> {
        if self.should_fail(peer).await {
            return Err(anyhow!("injected network failure"));
        }
        if !self.hub.is_linked(self.local.id, *peer).await {
            return Err(anyhow!("no connection to {peer}"));
        }
        if let Ok(message) = Message::decode(&frame) {
            self.sent.lock().await.push((*peer, message.kind()));
        }
        if self.silenced.lock().await.contains(peer) {
            return Ok(());
        }
        let (_, events) = self
            .hub
            .endpoint(peer)
            .await
            .ok_or_else(|| anyhow!("peer {peer} went away"))?;
        events
            .send(TransportEvent::Data {
                from: self.local.id,
                frame,
            })
            .map_err(|_| anyhow!("peer {peer} stopped"))
    }

    async fn disconnect(&self, peer: &NodeId) {
        let removed = self
            .hub
            .links
            .lock()
            .await
            .remove(&link(self.local.id, *peer));
        if !removed {
            return;
        }
        if let Some((_, events)) = self.hub.endpoint(&self.local.id).await {
            let _ = events.send(TransportEvent::Closed(*peer));
        }
        if let Some((_, events)) = self.hub.endpoint(peer).await {
            let _ = events.send(TransportEvent::Closed(self.local.id));
        }
    }
}

pub struct TestNode {
    pub node: Arc<DhtNode<MemoryTransport>>,
    pub transport: Arc<MemoryTransport>,
}

impl TestNode {
    /// Build and start a node on `hub`.
    pub async fn new(hub: Arc<MemoryHub>, index: u32, config: DhtConfig) -> Self {
        Self::with_contact(hub, make_contact(index), config).await
    }

    pub async fn with_contact(hub: Arc<MemoryHub>, contact: Contact, config: DhtConfig) -> Self {
        let (transport, events) = MemoryTransport::new(hub, contact.clone()).await;
        let node = Arc::new(
            DhtNode::new(contact, transport.clone(), events, config).expect("valid config"),
        );
        node.start().await.expect("node starts");
        Self { node, transport }
    }

    pub fn contact(&self) -> Contact {
        self.node.contact()
    }

    pub fn id(&self) -> NodeId {
        self.node.id
    }

    pub async fn knows(&self, other: &TestNode) -> bool {
        self.node.routing().lock().await.has_node(&other.id())
    }

    pub async fn holds(&self, key: &str) -> bool {
        let key = webdht::normalize_key(key).expect("valid key");
        self.node.storage().lock().await.contains(&key)
    }
}

/// Short timeouts so failure paths finish quickly.
pub fn test_config(k: usize, alpha: usize) -> DhtConfig {
    DhtConfig {
        k,
        alpha,
        request_timeout_ms: 300,
        connect_timeout_ms: 300,
        lookup_timeout_ms: 3_000,
        ..DhtConfig::default()
    }
}

pub fn make_node_id(index: u32) -> NodeId {
    let mut id = [0u8; 20];
    id[..4].copy_from_slice(&index.to_be_bytes());
    NodeId::from_bytes(id)
}

pub fn make_contact(index: u32) -> Contact {
    Contact::new(make_node_id(index), format!("node-{index}"))
}

/// Poll `check` until it holds or two seconds pass.
pub async fn wait_until<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        if check().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(5)).await;
    }
}

/// Connect `a` to `b` and wait until both routing tables hold the other.
pub async fn link_nodes(a: &TestNode, b: &TestNode) {
    assert!(a.node.connect(&b.contact()).await.expect("connect"));
    assert!(
        wait_until(|| async move { a.knows(b).await && b.knows(a).await }).await,
        "nodes never learned each other"
    );
}
