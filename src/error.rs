//! Error types for the Canopy coordination store.
//!
//! All fallible operations return [`Result`], built on the unified
//! [`CanopyError`] type. Errors fall into a few categories:
//!
//! - **Consensus**: leadership and replication errors. `NotLeader` and
//!   `Retry` are the two outcomes a client is expected to recover from by
//!   redirecting or retrying.
//! - **Configuration**: invalid settings or a rejected membership change.
//! - **Storage**: durable log and snapshot store failures.
//! - **Network/serialization**: transport-level failures at the adapter.
//!
//! State-machine outcomes (lookup errors, type errors, condition mismatches)
//! are not errors: they are statuses carried in tree responses, see
//! [`crate::tree::Status`].

use std::io;
use thiserror::Error;

use crate::types::NodeId;

/// Main error type for Canopy operations.
#[derive(Error, Debug)]
pub enum CanopyError {
    // Consensus errors
    #[error("not the leader, leader is: {leader:?}")]
    NotLeader { leader: Option<NodeId> },

    #[error("leadership changed before the operation committed, retry")]
    Retry,

    #[error("raft log error: {0}")]
    RaftLog(String),

    #[error("node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("a configuration change is already in flight")]
    ConfigChangeInProgress,

    // Protocol errors
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    // Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    // Storage errors
    #[error("storage error: {0}")]
    Storage(String),

    #[error("rocksdb error: {0}")]
    RocksDb(String),

    // Network errors
    #[error("network error: {0}")]
    Network(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    // Serialization errors
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    // External errors
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CanopyError {
    /// Check if the error is one a client should recover from by retrying
    /// (possibly against a different node).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CanopyError::NotLeader { .. }
                | CanopyError::Retry
                | CanopyError::ConfigChangeInProgress
                | CanopyError::Timeout(_)
                | CanopyError::Network(_)
        )
    }

    /// Best-effort leader hint, if this error carries one.
    pub fn leader_hint(&self) -> Option<NodeId> {
        match self {
            CanopyError::NotLeader { leader } => *leader,
            _ => None,
        }
    }
}

impl From<rocksdb::Error> for CanopyError {
    fn from(e: rocksdb::Error) -> Self {
        CanopyError::RocksDb(e.to_string())
    }
}

impl From<bincode::Error> for CanopyError {
    fn from(e: bincode::Error) -> Self {
        CanopyError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for CanopyError {
    fn from(e: serde_json::Error) -> Self {
        CanopyError::Serialization(e.to_string())
    }
}

/// Result type alias for Canopy operations.
pub type Result<T> = std::result::Result<T, CanopyError>;
