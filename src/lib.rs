//! # webdht
//!
//! A Kademlia distributed hash table engine. Nodes are identified by 160-bit
//! SHA-1 ids, route by XOR distance through a splitting k-bucket table, and
//! store values on the `k` nodes closest to each key. The peer transport is a
//! pluggable collaborator: anything that can open a connection to a named
//! peer and move opaque frames can carry the DHT.
//!
//! The crate is split into a handful of modules that can be reused
//! independently:
//!
//! - [`core`]: identifiers, hashing, the XOR metric and [`Contact`].
//! - [`routing`]: the k-bucket [`RoutingTable`] with ping-before-evict.
//! - [`storage`]: the capacity-bounded [`StorageEngine`].
//! - [`peers`]: connection ceiling and DHT relay capability tracking.
//! - [`protocol`]: the JSON wire messages exchanged between peers.
//! - [`rpc`]: request correlation and inbound dispatch over a [`Transport`].
//! - [`lookup`]: the iterative FIND_NODE / FIND_VALUE search.
//! - [`node`]: [`DhtNode`], which ties everything together.
//! - [`net`], [`framing`], [`server`]: a TCP transport with length-prefixed
//!   frames, used by the `webdht` binary.
//!
//! ## Getting started
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use anyhow::Result;
//! use tokio::net::TcpListener;
//! use webdht::{derive_node_id, Contact, DhtConfig, DhtNode, TcpTransport};
//!
//! # async fn launch(seed: Contact) -> Result<()> {
//! let listener = TcpListener::bind("127.0.0.1:4000").await?;
//! let contact = Contact::new(derive_node_id(b"node-a"), "127.0.0.1:4000");
//! let (transport, events) = TcpTransport::new(contact.clone());
//! tokio::spawn(webdht::server::serve(listener, transport.clone()));
//!
//! let node = Arc::new(DhtNode::new(contact, transport, events, DhtConfig::default())?);
//! node.start().await?;
//! node.bootstrap(&[seed]).await;
//! node.put("greeting", b"hello".to_vec()).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod framing;
pub mod lookup;
pub mod net;
pub mod node;
pub mod peers;
pub mod protocol;
pub mod routing;
pub mod rpc;
pub mod server;
pub mod storage;
pub mod transport;

pub use crate::config::DhtConfig;
pub use crate::core::{
    common_prefix_len, derive_node_id, distance_cmp, hash_content, normalize_key, xor_distance,
    Contact, Distance, Key, NodeId,
};
pub use crate::error::DhtError;
pub use crate::lookup::{ContactObserver, Lookup, LookupKind, LookupOutcome, LookupParams, LookupState};
pub use crate::net::TcpTransport;
pub use crate::node::{DhtNode, NodeEvent, TelemetrySnapshot};
pub use crate::peers::{Admission, PeerManager, RejectReason};
pub use crate::protocol::{Message, MessageKind, ProtocolError};
pub use crate::routing::{probe_stale_entry, InsertOutcome, PendingEviction, RoutingTable};
pub use crate::rpc::{DhtNetwork, ProtocolEvent, RpcError, RpcLayer};
pub use crate::storage::{PutOptions, StorageEngine, StorageEvent, StorageRecord};
pub use crate::transport::{Transport, TransportEvent, TransportEvents};
