//! Caller-facing error type.
//!
//! Network behaviour (timeouts, silent peers, missing values) is never an
//! error at this boundary; it surfaces as `false`, `None` or an empty list.
//! `DhtError` is reserved for contract violations by the caller.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DhtError {
    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("invalid node id: {0}")]
    InvalidNodeId(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("a node cannot connect to itself")]
    SelfConnect,

    #[error("node has already been started")]
    AlreadyStarted,
}
