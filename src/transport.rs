//! Boundary with the connection-level transport.
//!
//! A [`Transport`] physically connects two peers and moves opaque frames
//! between them. Everything it observes is reported through a
//! [`TransportEvent`] channel handed out when the transport is built; the
//! protocol layer consumes that channel and never polls the transport itself.

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::core::{Contact, NodeId};

/// Connection lifecycle and inbound data reported by a transport.
#[derive(Clone, Debug)]
pub enum TransportEvent {
    /// A connection to `Contact` is established and can carry frames.
    Connected(Contact),
    /// One complete frame arrived from `from`.
    Data { from: NodeId, frame: Vec<u8> },
    Closed(NodeId),
    /// A per-connection error that did not (yet) close the connection.
    Error { peer: NodeId, error: String },
}

pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;
pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;

/// Creates a transport event channel.
pub fn event_channel() -> (TransportEventSender, TransportEvents) {
    mpsc::unbounded_channel()
}

/// Connection-oriented frame transport.
///
/// Implementations must emit [`TransportEvent::Connected`] once a connection
/// opened by [`connect`](Transport::connect) or accepted from a remote peer is
/// usable, and [`TransportEvent::Closed`] exactly once when it goes away.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a connection to `peer`.
    ///
    /// `signal` carries out-of-band connection setup data relayed through the
    /// DHT; transports that do not need it may ignore it.
    async fn connect(&self, peer: &Contact, signal: Option<serde_json::Value>) -> Result<()>;

    /// Hand one serialized frame to the connection for `peer`.
    async fn send(&self, peer: &NodeId, frame: Vec<u8>) -> Result<()>;

    /// Close the connection to `peer` if one exists.
    async fn disconnect(&self, peer: &NodeId);
}
