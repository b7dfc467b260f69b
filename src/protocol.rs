//! DHT wire message definitions.
//!
//! Every message is a JSON object tagged by `type`. Request/response kinds
//! carry a `requestId` that the response echoes. All messages carry the
//! sender's [`Contact`] so receivers can populate their routing tables from
//! ordinary traffic.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{Contact, Key, NodeId};

/// The fixed, case-sensitive set of message kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Ping,
    Pong,
    FindNode,
    FindNodeResponse,
    FindValue,
    FindValueResponse,
    Store,
    Signal,
}

impl MessageKind {
    pub const ALL: [MessageKind; 8] = [
        MessageKind::Ping,
        MessageKind::Pong,
        MessageKind::FindNode,
        MessageKind::FindNodeResponse,
        MessageKind::FindValue,
        MessageKind::FindValueResponse,
        MessageKind::Store,
        MessageKind::Signal,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Ping => "PING",
            MessageKind::Pong => "PONG",
            MessageKind::FindNode => "FIND_NODE",
            MessageKind::FindNodeResponse => "FIND_NODE_RESPONSE",
            MessageKind::FindValue => "FIND_VALUE",
            MessageKind::FindValueResponse => "FIND_VALUE_RESPONSE",
            MessageKind::Store => "STORE",
            MessageKind::Signal => "SIGNAL",
        }
    }

    pub fn parse(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == tag)
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A DHT protocol message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum Message {
    Ping {
        sender: Contact,
        request_id: u64,
        timestamp: u64,
    },
    /// Answers a PING, and acknowledges a STORE with the STORE's request id.
    Pong {
        sender: Contact,
        request_id: u64,
        timestamp: u64,
    },
    FindNode {
        sender: Contact,
        request_id: u64,
        target: NodeId,
    },
    FindNodeResponse {
        sender: Contact,
        request_id: u64,
        nodes: Vec<Contact>,
    },
    FindValue {
        sender: Contact,
        request_id: u64,
        key: Key,
    },
    /// Carries the value if the responder holds it, closer nodes otherwise.
    FindValueResponse {
        sender: Contact,
        request_id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<Vec<u8>>,
        #[serde(default)]
        nodes: Vec<Contact>,
    },
    Store {
        sender: Contact,
        request_id: u64,
        key: Key,
        value: Vec<u8>,
        timestamp: u64,
    },
    /// Opaque signaling payload relayed towards `target` on behalf of `origin`.
    Signal {
        sender: Contact,
        origin: NodeId,
        target: NodeId,
        hops: u8,
        signal: serde_json::Value,
    },
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("message has no type tag")]
    MissingType,

    #[error("unknown message type {0:?}")]
    UnknownType(String),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Ping { .. } => MessageKind::Ping,
            Message::Pong { .. } => MessageKind::Pong,
            Message::FindNode { .. } => MessageKind::FindNode,
            Message::FindNodeResponse { .. } => MessageKind::FindNodeResponse,
            Message::FindValue { .. } => MessageKind::FindValue,
            Message::FindValueResponse { .. } => MessageKind::FindValueResponse,
            Message::Store { .. } => MessageKind::Store,
            Message::Signal { .. } => MessageKind::Signal,
        }
    }

    pub fn sender(&self) -> &Contact {
        match self {
            Message::Ping { sender, .. }
            | Message::Pong { sender, .. }
            | Message::FindNode { sender, .. }
            | Message::FindNodeResponse { sender, .. }
            | Message::FindValue { sender, .. }
            | Message::FindValueResponse { sender, .. }
            | Message::Store { sender, .. }
            | Message::Signal { sender, .. } => sender,
        }
    }

    pub fn request_id(&self) -> Option<u64> {
        match self {
            Message::Ping { request_id, .. }
            | Message::Pong { request_id, .. }
            | Message::FindNode { request_id, .. }
            | Message::FindNodeResponse { request_id, .. }
            | Message::FindValue { request_id, .. }
            | Message::FindValueResponse { request_id, .. }
            | Message::Store { request_id, .. } => Some(*request_id),
            Message::Signal { .. } => None,
        }
    }

    /// Whether this message completes an outstanding request.
    pub fn is_response(&self) -> bool {
        matches!(
            self,
            Message::Pong { .. }
                | Message::FindNodeResponse { .. }
                | Message::FindValueResponse { .. }
        )
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse a frame, distinguishing unknown kinds from malformed payloads.
    pub fn decode(bytes: &[u8]) -> Result<Message, ProtocolError> {
        let raw: serde_json::Value = serde_json::from_slice(bytes)?;
        let tag = raw
            .get("type")
            .and_then(serde_json::Value::as_str)
            .ok_or(ProtocolError::MissingType)?;
        if MessageKind::parse(tag).is_none() {
            return Err(ProtocolError::UnknownType(tag.to_string()));
        }
        Ok(serde_json::from_value(raw)?)
    }
}
