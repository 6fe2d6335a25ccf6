//! Raft consensus engine with weighted voting.
//!
//! The engine replicates opaque command payloads through a durable log and
//! applies them, in log order, to a pluggable [`StateMachine`]. Quorums are
//! weighted: each server carries a voting weight, a set of servers is a
//! quorum when its summed weight strictly exceeds half the total, and a
//! weight of zero makes a server a learner that replicates but never votes.
//! Weights change at runtime through `Configuration` log entries, one change
//! in flight at a time.
//!
//! # Structure
//!
//! - [`node`]: the [`RaftNode`] event loop, driven by a command channel
//! - [`state`]: role transitions and volatile/persistent bookkeeping
//! - [`log`]: the in-memory log suffix
//! - [`storage`]: RocksDB-backed durability for term, vote, log, snapshot
//! - [`rpc`]: RPC message types and the [`RaftRpc`] transport trait

pub mod log;
pub mod node;
pub mod rpc;
pub mod state;
pub mod storage;

pub use log::{EntryKind, LogEntry, RaftLog};
pub use node::{ConsensusConfig, RaftCommand, RaftHandle, RaftNode};
pub use rpc::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    RaftRpc, RequestVoteRequest, RequestVoteResponse, RequestWeightRequest, RequestWeightResponse,
};
pub use state::{LeaderState, NodeState, PersistentState, RaftState, VolatileState};
pub use storage::{RaftStorage, SnapshotMeta};

use crate::error::Result;

/// The replicated state machine the engine drives.
///
/// `apply` must be deterministic: given the same sequence of committed
/// payloads, every replica must produce the same state and the same outputs.
/// The engine guarantees each committed entry is applied exactly once, in
/// log order.
pub trait StateMachine: Send + 'static {
    /// The result of applying one command, returned to the proposer.
    type Output: Send + 'static;

    /// Apply one committed command payload.
    fn apply(&mut self, data: &[u8]) -> Self::Output;

    /// Serialize the complete state for snapshotting.
    fn snapshot(&self) -> Result<Vec<u8>>;

    /// Replace the complete state from a snapshot.
    fn restore(&mut self, data: &[u8]) -> Result<()>;
}
