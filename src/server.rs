//! Service adapter: turns already-parsed request structs into engine and
//! tree calls, and back into response structs.
//!
//! Client-facing requests come in two families: read-write (replicated
//! through the log) and read-only (served from the local tree after a
//! linearizable read barrier). Consensus errors are folded into the tree's
//! status space so clients see one vocabulary: `NOT_LEADER` carries a leader
//! hint, `RETRY` means leadership moved mid-flight.
//!
//! The HTTP plumbing (axum router, reqwest peer client) lives here too; the
//! consensus and tree cores never depend on it.

use crate::config::CanopyConfig;
use crate::consensus::{
    AppendEntriesRequest, AppendEntriesResponse, ConsensusConfig, InstallSnapshotRequest,
    InstallSnapshotResponse, RaftCommand, RaftHandle, RaftNode, RaftRpc, RaftStorage,
    RequestVoteRequest, RequestVoteResponse, RequestWeightRequest, RequestWeightResponse,
};
use crate::error::{CanopyError, Result};
use crate::tree::{
    CommandOutcome, Condition, ReadOnlyOp, ReadOnlyResult, Status, TreeCommand, TreeStateMachine,
    WriteOp,
};
use crate::types::{Membership, NodeId};
use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::info;

/// Connect timeout for peer RPCs.
const RPC_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Request timeout for peer RPCs.
const RPC_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// A read-write request: an optional condition plus exactly one operation.
/// `op` is optional at the wire so an empty request is a clean
/// `INVALID_REQUEST` instead of a parse failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadWriteTreeRequest {
    #[serde(default)]
    pub condition: Option<Condition>,
    #[serde(default)]
    pub op: Option<WriteOp>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadWriteTreeResponse {
    pub status: Status,
    pub error: Option<String>,
    pub leader_hint: Option<NodeId>,
}

/// A read-only request: optional condition plus exactly one read operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadOnlyTreeRequest {
    #[serde(default)]
    pub condition: Option<Condition>,
    #[serde(default)]
    pub op: Option<ReadOnlyOp>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadOnlyTreeResponse {
    pub status: Status,
    pub error: Option<String>,
    pub leader_hint: Option<NodeId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contents: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<String>>,
}

impl ReadOnlyTreeResponse {
    fn failed(status: Status, error: Option<String>, leader_hint: Option<NodeId>) -> Self {
        Self {
            status,
            error,
            leader_hint,
            contents: None,
            children: None,
        }
    }
}

/// The coordination service for one node.
pub struct CoordinationServer {
    node_id: NodeId,
    raft: RaftHandle<CommandOutcome>,
    state_machine: Arc<RwLock<TreeStateMachine>>,
}

impl CoordinationServer {
    pub fn new(
        node_id: NodeId,
        raft: RaftHandle<CommandOutcome>,
        state_machine: Arc<RwLock<TreeStateMachine>>,
    ) -> Self {
        Self {
            node_id,
            raft,
            state_machine,
        }
    }

    /// Replicate a tree mutation and wait for its applied outcome.
    pub async fn handle_read_write(&self, request: ReadWriteTreeRequest) -> ReadWriteTreeResponse {
        let op = match request.op {
            Some(op) => op,
            None => {
                return ReadWriteTreeResponse {
                    status: Status::InvalidRequest,
                    error: Some("request contains no operation".to_string()),
                    leader_hint: None,
                }
            }
        };

        let command = TreeCommand {
            condition: request.condition,
            op,
        };
        let data = match bincode::serialize(&command) {
            Ok(d) => d,
            Err(e) => {
                return ReadWriteTreeResponse {
                    status: Status::InvalidRequest,
                    error: Some(e.to_string()),
                    leader_hint: None,
                }
            }
        };

        match self.raft.propose(data).await {
            Ok(outcome) => ReadWriteTreeResponse {
                status: outcome.status,
                error: outcome.error,
                leader_hint: None,
            },
            Err(e) => {
                let (status, error, leader_hint) = map_consensus_error(e);
                ReadWriteTreeResponse {
                    status,
                    error,
                    leader_hint,
                }
            }
        }
    }

    /// Serve a read after a linearizable barrier: every write committed
    /// before this request arrived is visible.
    pub async fn handle_read_only(&self, request: ReadOnlyTreeRequest) -> ReadOnlyTreeResponse {
        let op = match request.op {
            Some(op) => op,
            None => {
                return ReadOnlyTreeResponse::failed(
                    Status::InvalidRequest,
                    Some("request contains no operation".to_string()),
                    None,
                )
            }
        };

        if let Err(e) = self.raft.read_barrier().await {
            let (status, error, leader_hint) = map_consensus_error(e);
            return ReadOnlyTreeResponse::failed(status, error, leader_hint);
        }

        let result = self
            .state_machine
            .read()
            .read_only(request.condition.as_ref(), &op);

        match result {
            Ok(ReadOnlyResult::Contents(contents)) => ReadOnlyTreeResponse {
                status: Status::Ok,
                error: None,
                leader_hint: None,
                contents: Some(contents),
                children: None,
            },
            Ok(ReadOnlyResult::Children(children)) => ReadOnlyTreeResponse {
                status: Status::Ok,
                error: None,
                leader_hint: None,
                contents: None,
                children: Some(children),
            },
            Err(e) => ReadOnlyTreeResponse::failed(e.status, Some(e.message), None),
        }
    }

    /// Reassign a server's voting weight.
    pub async fn handle_request_weight(
        &self,
        request: RequestWeightRequest,
    ) -> RequestWeightResponse {
        match self.raft.set_weight(request.target_id, request.weight).await {
            Ok(term) => RequestWeightResponse {
                term,
                success: true,
                leader_hint: Some(self.node_id),
            },
            Err(e) => RequestWeightResponse {
                term: 0,
                success: false,
                leader_hint: e.leader_hint(),
            },
        }
    }

    pub async fn is_leader(&self) -> bool {
        self.raft.is_leader().await.unwrap_or(false)
    }

    pub async fn leader(&self) -> Option<NodeId> {
        self.raft.leader().await.ok().flatten()
    }
}

fn map_consensus_error(e: CanopyError) -> (Status, Option<String>, Option<NodeId>) {
    match e {
        CanopyError::NotLeader { leader } => (
            Status::NotLeader,
            Some("this node is not the leader".to_string()),
            leader,
        ),
        CanopyError::InvalidRequest(msg) => (Status::InvalidRequest, Some(msg), None),
        other => (Status::Retry, Some(other.to_string()), None),
    }
}

/// HTTP transport for peer RPCs.
pub struct NetworkRpc {
    peers: HashMap<NodeId, String>,
    client: reqwest::Client,
}

impl NetworkRpc {
    pub fn new(peers: HashMap<NodeId, String>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(RPC_CONNECT_TIMEOUT)
            .timeout(RPC_REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self { peers, client }
    }

    fn peer_url(&self, target: NodeId, endpoint: &str) -> Option<String> {
        self.peers
            .get(&target)
            .map(|addr| format!("http://{}/{}", addr, endpoint))
    }

    async fn post_json<Req: Serialize, Resp: for<'de> Deserialize<'de>>(
        &self,
        target: NodeId,
        endpoint: &str,
        request: &Req,
    ) -> Result<Resp> {
        let url = self
            .peer_url(target, endpoint)
            .ok_or(CanopyError::NodeNotFound(target))?;

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| CanopyError::Network(e.to_string()))?;

        response
            .json()
            .await
            .map_err(|e| CanopyError::Deserialization(e.to_string()))
    }
}

#[async_trait::async_trait]
impl RaftRpc for NetworkRpc {
    async fn request_vote(
        &self,
        target: NodeId,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        self.post_json(target, "raft/request_vote", &request).await
    }

    async fn append_entries(
        &self,
        target: NodeId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        self.post_json(target, "raft/append_entries", &request)
            .await
    }

    async fn install_snapshot(
        &self,
        target: NodeId,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        self.post_json(target, "raft/install_snapshot", &request)
            .await
    }
}

/// Shared state for axum handlers.
#[derive(Clone)]
struct ServerState {
    server: Arc<CoordinationServer>,
    raft: RaftHandle<CommandOutcome>,
}

/// Construct and run one node: storage, tree, consensus engine, HTTP
/// adapter. Blocks until the listener stops.
pub async fn run_server(config: CanopyConfig) -> Result<()> {
    let node_id = config.node.id;
    info!(node_id, name = %config.node.name, "Starting coordination server");

    let peers: HashMap<NodeId, String> = config
        .cluster
        .servers
        .iter()
        .filter(|s| s.id != node_id)
        .map(|s| (s.id, s.address.clone()))
        .collect();

    let initial_membership =
        Membership::new(config.cluster.servers.iter().map(|s| (s.id, s.weight)));

    let consensus_config = ConsensusConfig {
        node_id,
        initial_membership,
        election_timeout_min: config.cluster.election_timeout_min,
        election_timeout_max: config.cluster.election_timeout_max,
        heartbeat_interval: config.cluster.heartbeat_interval,
        vote_rpc_timeout: config.cluster.vote_rpc_timeout,
        append_rpc_timeout: config.cluster.append_rpc_timeout,
        max_entries_per_append: config.cluster.max_entries_per_append,
        snapshot_threshold: config.cluster.snapshot_threshold,
        snapshot_chunk_size: config.cluster.snapshot_chunk_size,
    };

    let storage = Arc::new(RaftStorage::open(config.storage.data_dir.join("raft"))?);
    // One tree instance, shared between the engine (applies) and the
    // adapter (reads).
    let state_machine = Arc::new(RwLock::new(TreeStateMachine::new()));
    let rpc = Arc::new(NetworkRpc::new(peers));

    let (raft_node, command_rx) = RaftNode::new(
        consensus_config,
        storage,
        Arc::clone(&state_machine),
        rpc,
    )?;
    let raft = raft_node.handle();

    let server = Arc::new(CoordinationServer::new(
        node_id,
        raft.clone(),
        Arc::clone(&state_machine),
    ));

    let raft_task = tokio::spawn(async move {
        raft_node.run(command_rx).await;
    });

    let server_state = ServerState {
        server,
        raft: raft.clone(),
    };

    let app = Router::new()
        .route("/raft/request_vote", post(handle_request_vote))
        .route("/raft/append_entries", post(handle_append_entries))
        .route("/raft/install_snapshot", post(handle_install_snapshot))
        .route("/raft/request_weight", post(handle_request_weight))
        .route("/tree/read_write", post(handle_tree_read_write))
        .route("/tree/read_only", post(handle_tree_read_only))
        .route("/health", get(health_check))
        .with_state(server_state);

    let listener = TcpListener::bind(config.cluster.bind_addr).await?;
    info!(addr = %config.cluster.bind_addr, "Coordination server listening");

    axum::serve(listener, app)
        .await
        .map_err(|e| CanopyError::Network(e.to_string()))?;

    let _ = raft.shutdown().await;
    raft_task.abort();
    Ok(())
}

async fn health_check() -> &'static str {
    "OK"
}

async fn handle_request_vote(
    State(state): State<ServerState>,
    Json(request): Json<RequestVoteRequest>,
) -> Json<RequestVoteResponse> {
    let (tx, rx) = oneshot::channel();
    let fallback = RequestVoteResponse {
        term: 0,
        vote_granted: false,
    };

    if state
        .raft
        .sender()
        .send(RaftCommand::RequestVote {
            request,
            response: tx,
        })
        .await
        .is_err()
    {
        return Json(fallback);
    }

    Json(rx.await.unwrap_or(fallback))
}

async fn handle_append_entries(
    State(state): State<ServerState>,
    Json(request): Json<AppendEntriesRequest>,
) -> Json<AppendEntriesResponse> {
    let (tx, rx) = oneshot::channel();
    let fallback = AppendEntriesResponse {
        term: 0,
        success: false,
        match_index: 0,
        conflict_index: None,
        conflict_term: None,
    };

    if state
        .raft
        .sender()
        .send(RaftCommand::AppendEntries {
            request,
            response: tx,
        })
        .await
        .is_err()
    {
        return Json(fallback.clone());
    }

    Json(rx.await.unwrap_or(fallback))
}

async fn handle_install_snapshot(
    State(state): State<ServerState>,
    Json(request): Json<InstallSnapshotRequest>,
) -> Json<InstallSnapshotResponse> {
    let (tx, rx) = oneshot::channel();
    let fallback = InstallSnapshotResponse {
        term: 0,
        next_offset: 0,
        done: false,
    };

    if state
        .raft
        .sender()
        .send(RaftCommand::InstallSnapshot {
            request,
            response: tx,
        })
        .await
        .is_err()
    {
        return Json(fallback);
    }

    Json(rx.await.unwrap_or(fallback))
}

async fn handle_request_weight(
    State(state): State<ServerState>,
    Json(request): Json<RequestWeightRequest>,
) -> Json<RequestWeightResponse> {
    Json(state.server.handle_request_weight(request).await)
}

async fn handle_tree_read_write(
    State(state): State<ServerState>,
    Json(request): Json<ReadWriteTreeRequest>,
) -> Json<ReadWriteTreeResponse> {
    Json(state.server.handle_read_write(request).await)
}

async fn handle_tree_read_only(
    State(state): State<ServerState>,
    Json(request): Json<ReadOnlyTreeRequest>,
) -> Json<ReadOnlyTreeResponse> {
    Json(state.server.handle_read_only(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consensus_errors_map_to_statuses() {
        let (status, _, hint) = map_consensus_error(CanopyError::NotLeader { leader: Some(3) });
        assert_eq!(status, Status::NotLeader);
        assert_eq!(hint, Some(3));

        let (status, _, _) = map_consensus_error(CanopyError::Retry);
        assert_eq!(status, Status::Retry);

        let (status, _, _) = map_consensus_error(CanopyError::InvalidRequest("bad".into()));
        assert_eq!(status, Status::InvalidRequest);
    }

    #[test]
    fn read_write_request_without_op_parses() {
        let request: ReadWriteTreeRequest = serde_json::from_str("{}").unwrap();
        assert!(request.op.is_none());
        assert!(request.condition.is_none());
    }
}
