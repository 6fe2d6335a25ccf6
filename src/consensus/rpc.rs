//! Raft RPC message definitions.
//!
//! These are the already-parsed request/response structs the service adapter
//! hands to the consensus engine; the wire encoding lives at the adapter.

use super::LogEntry;
use crate::types::{LogIndex, Membership, NodeId, Term, Weight};
use serde::{Deserialize, Serialize};

/// RequestVote RPC arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    /// Candidate's term.
    pub term: Term,
    /// Candidate requesting the vote.
    pub candidate_id: NodeId,
    /// Index of the candidate's last log entry.
    pub last_log_index: LogIndex,
    /// Term of the candidate's last log entry.
    pub last_log_term: Term,
}

/// RequestVote RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    /// Current term, for the candidate to update itself.
    pub term: Term,
    /// True if the candidate received this server's vote.
    pub vote_granted: bool,
}

/// AppendEntries RPC arguments. Also the heartbeat (empty `entries`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    /// Leader's term.
    pub term: Term,
    /// Leader's id, so followers can hint redirected clients.
    pub leader_id: NodeId,
    /// Index of the log entry immediately preceding the new ones.
    pub prev_log_index: LogIndex,
    /// Term of the entry at `prev_log_index`.
    pub prev_log_term: Term,
    /// Entries to store (empty for heartbeat).
    pub entries: Vec<LogEntry>,
    /// Leader's commit index.
    pub leader_commit: LogIndex,
}

/// AppendEntries RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// Current term, for the leader to update itself.
    pub term: Term,
    /// True if the follower held an entry matching prev_log_index/term and
    /// durably appended the new entries.
    pub success: bool,
    /// Last index replicated on the follower (valid when `success`).
    pub match_index: LogIndex,
    /// On failure, where the leader should retry from (fast backoff).
    pub conflict_index: Option<LogIndex>,
    /// Term of the conflicting entry, if the follower had one.
    pub conflict_term: Option<Term>,
}

/// InstallSnapshot RPC arguments, streamed in chunks. The follower applies
/// the snapshot atomically only once the final chunk (`done`) arrives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    /// Leader's term.
    pub term: Term,
    /// Leader's id.
    pub leader_id: NodeId,
    /// The snapshot replaces all entries up through this index.
    pub last_included_index: LogIndex,
    /// Term of the entry at `last_included_index`.
    pub last_included_term: Term,
    /// The committed voting configuration as of the snapshot.
    pub membership: Membership,
    /// Byte offset of this chunk within the snapshot.
    pub offset: u64,
    /// Raw snapshot bytes for this chunk.
    pub data: Vec<u8>,
    /// True if this is the last chunk.
    pub done: bool,
}

/// InstallSnapshot RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    /// Current term, for the leader to update itself.
    pub term: Term,
    /// Byte offset of the next expected chunk.
    pub next_offset: u64,
    /// Whether the snapshot was fully received and installed.
    pub done: bool,
}

/// RequestWeight RPC arguments: reassign a server's voting weight. Handled
/// by the leader as a configuration mutation replicated through the log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestWeightRequest {
    /// Server whose weight changes.
    pub target_id: NodeId,
    /// New voting weight; 0 demotes the server to a learner.
    pub weight: Weight,
}

/// RequestWeight RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestWeightResponse {
    /// Current term.
    pub term: Term,
    /// True once the change committed.
    pub success: bool,
    /// Best-effort leader hint when `success` is false.
    pub leader_hint: Option<NodeId>,
}

/// Trait for the Raft RPC transport. The engine fans out to peers through
/// this; implementations live at the service adapter (and in tests).
#[async_trait::async_trait]
pub trait RaftRpc: Send + Sync {
    /// Send RequestVote to a peer.
    async fn request_vote(
        &self,
        target: NodeId,
        request: RequestVoteRequest,
    ) -> crate::Result<RequestVoteResponse>;

    /// Send AppendEntries to a peer.
    async fn append_entries(
        &self,
        target: NodeId,
        request: AppendEntriesRequest,
    ) -> crate::Result<AppendEntriesResponse>;

    /// Send InstallSnapshot to a peer.
    async fn install_snapshot(
        &self,
        target: NodeId,
        request: InstallSnapshotRequest,
    ) -> crate::Result<InstallSnapshotResponse>;
}
