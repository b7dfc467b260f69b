//! TCP implementation of [`Transport`].
//!
//! Every connection starts with a hello exchange: both sides send their
//! [`Contact`] as the first frame, so each end learns the other's id and
//! listen address. After that, each frame carries one protocol message.
//! Outbound connections verify that the remote id matches the dialed contact.
//!
//! Each connection runs a reader task that forwards frames as
//! [`TransportEvent::Data`] and a writer task fed by an unbounded channel, so
//! [`Transport::send`] never waits on the socket.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};
use tracing::{debug, trace};

use crate::core::{Contact, NodeId};
use crate::framing::{read_frame, write_frame};
use crate::transport::{event_channel, Transport, TransportEvent, TransportEventSender, TransportEvents};

/// Time allowed for the hello exchange.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

struct Connection {
    generation: u64,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    reader: JoinHandle<()>,
}

type ConnectionMap = Arc<Mutex<HashMap<NodeId, Connection>>>;

/// Exchange hello frames and return the remote contact.
pub(crate) async fn handshake(stream: &mut TcpStream, local: &Contact) -> Result<Contact> {
    let hello = serde_json::to_vec(local)?;
    let exchange = async {
        write_frame(stream, &hello).await?;
        let frame = read_frame(stream)
            .await?
            .ok_or_else(|| anyhow!("connection closed during handshake"))?;
        let remote: Contact = serde_json::from_slice(&frame)?;
        Ok::<_, anyhow::Error>(remote)
    };
    let remote = time::timeout(HANDSHAKE_TIMEOUT, exchange)
        .await
        .map_err(|_| anyhow!("handshake timed out"))??;
    if remote.id == local.id {
        bail!("refusing connection to ourselves");
    }
    Ok(remote)
}

pub struct TcpTransport {
    local: Contact,
    events: TransportEventSender,
    connections: ConnectionMap,
    generation: AtomicU64,
}

impl TcpTransport {
    /// Create a transport advertising `local`. The returned receiver must be
    /// handed to the node that owns this transport.
    pub fn new(local: Contact) -> (Arc<Self>, TransportEvents) {
        let (events, rx) = event_channel();
        let transport = Arc::new(Self {
            local,
            events,
            connections: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
        });
        (transport, rx)
    }

    pub fn local(&self) -> &Contact {
        &self.local
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.lock().await.len()
    }

    /// Take ownership of a handshaken stream and announce the connection.
    pub(crate) async fn attach(&self, remote: Contact, stream: TcpStream) {
        let peer = remote.id;
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let (mut read_half, mut write_half) = stream.into_split();
        let (outbound, mut queue) = mpsc::unbounded_channel::<Vec<u8>>();

        tokio::spawn(async move {
            while let Some(frame) = queue.recv().await {
                if let Err(err) = write_frame(&mut write_half, &frame).await {
                    debug!(peer = %peer, "write failed: {err:?}");
                    break;
                }
            }
        });

        let events = self.events.clone();
        let connections = self.connections.clone();
        let reader = tokio::spawn(async move {
            loop {
                match read_frame(&mut read_half).await {
                    Ok(Some(frame)) => {
                        trace!(peer = %peer, bytes = frame.len(), "frame received");
                        let _ = events.send(TransportEvent::Data { from: peer, frame });
                    }
                    Ok(None) => break,
                    Err(err) => {
                        let _ = events.send(TransportEvent::Error {
                            peer,
                            error: err.to_string(),
                        });
                        break;
                    }
                }
            }
            let mut connections = connections.lock().await;
            if connections.get(&peer).map(|c| c.generation) == Some(generation) {
                connections.remove(&peer);
                drop(connections);
                debug!(peer = %peer, "connection closed");
                let _ = events.send(TransportEvent::Closed(peer));
            }
        });

        let previous = self.connections.lock().await.insert(
            peer,
            Connection {
                generation,
                outbound,
                reader,
            },
        );
        if let Some(previous) = previous {
            debug!(peer = %peer, "replacing existing connection");
            previous.reader.abort();
        }
        let _ = self.events.send(TransportEvent::Connected(remote));
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, peer: &Contact, _signal: Option<serde_json::Value>) -> Result<()> {
        if self.connections.lock().await.contains_key(&peer.id) {
            return Ok(());
        }
        let mut stream = time::timeout(HANDSHAKE_TIMEOUT, TcpStream::connect(&peer.addr))
            .await
            .map_err(|_| anyhow!("connect to {} timed out", peer.addr))??;
        stream.set_nodelay(true)?;
        let remote = handshake(&mut stream, &self.local).await?;
        if remote.id != peer.id {
            bail!("{} answered as {}, expected {}", peer.addr, remote.id, peer.id);
        }
        // The dialed address is the one known to work.
        self.attach(Contact::new(remote.id, peer.addr.clone()), stream)
            .await;
        Ok(())
    }

    async fn send(&self, peer: &NodeId, frame: Vec<u8>) -> Result<()> {
        let connections = self.connections.lock().await;
        let connection = connections
            .get(peer)
            .ok_or_else(|| anyhow!("no connection to {peer}"))?;
        connection
            .outbound
            .send(frame)
            .map_err(|_| anyhow!("connection to {peer} is closing"))
    }

    async fn disconnect(&self, peer: &NodeId) {
        let removed = self.connections.lock().await.remove(peer);
        if let Some(connection) = removed {
            connection.reader.abort();
            debug!(peer = %peer, "disconnected");
            let _ = self.events.send(TransportEvent::Closed(*peer));
        }
    }
}
