//! Tree and service adapter integration tests.
//!
//! Drives a single-node cluster through the [`CoordinationServer`] request
//! structs, exercising the full propose/apply path: path rules, conditional
//! writes, removal semantics, error status mapping, weight changes, and
//! recovery across a restart.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tempfile::TempDir;

use canopy::consensus::{
    AppendEntriesRequest, AppendEntriesResponse, ConsensusConfig, InstallSnapshotRequest,
    InstallSnapshotResponse, RaftHandle, RaftNode, RaftRpc, RaftStorage, RequestVoteRequest,
    RequestVoteResponse, RequestWeightRequest,
};
use canopy::error::{CanopyError, Result};
use canopy::server::{CoordinationServer, ReadOnlyTreeRequest, ReadWriteTreeRequest};
use canopy::tree::{
    CommandOutcome, Condition, ReadOnlyOp, Status, TreeCommand, TreeStateMachine, WriteOp,
};
use canopy::types::{Membership, NodeId};

// =============================================================================
// Single-node harness
// =============================================================================

/// A single-voter cluster never sends peer RPCs.
struct NoPeersRpc;

#[async_trait::async_trait]
impl RaftRpc for NoPeersRpc {
    async fn request_vote(
        &self,
        target: NodeId,
        _request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        Err(CanopyError::NodeNotFound(target))
    }

    async fn append_entries(
        &self,
        target: NodeId,
        _request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        Err(CanopyError::NodeNotFound(target))
    }

    async fn install_snapshot(
        &self,
        target: NodeId,
        _request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        Err(CanopyError::NodeNotFound(target))
    }
}

struct SingleNode {
    server: CoordinationServer,
    handle: RaftHandle<CommandOutcome>,
    task: tokio::task::JoinHandle<()>,
}

impl SingleNode {
    async fn spawn(data_dir: &Path) -> Self {
        let config = ConsensusConfig {
            node_id: 1,
            initial_membership: Membership::new([(1, 1)]),
            ..Default::default()
        };
        let storage = Arc::new(RaftStorage::open(data_dir).unwrap());
        let sm = Arc::new(RwLock::new(TreeStateMachine::new()));

        let (node, rx) =
            RaftNode::new(config, storage, Arc::clone(&sm), Arc::new(NoPeersRpc)).unwrap();
        let handle = node.handle();
        let task = tokio::spawn(async move {
            node.run(rx).await;
        });

        for _ in 0..100 {
            if let Ok(true) = handle.is_leader().await {
                return Self {
                    server: CoordinationServer::new(1, handle.clone(), sm),
                    handle,
                    task,
                };
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("single node never became leader");
    }

    /// Stop the engine and wait for it to release storage.
    async fn stop(self) {
        self.handle.shutdown().await.unwrap();
        self.task.await.unwrap();
    }
}

fn write_req(path: &str, contents: &[u8]) -> ReadWriteTreeRequest {
    ReadWriteTreeRequest {
        condition: None,
        op: Some(WriteOp::Write {
            path: path.to_string(),
            contents: contents.to_vec(),
        }),
    }
}

fn mkdir_req(path: &str) -> ReadWriteTreeRequest {
    ReadWriteTreeRequest {
        condition: None,
        op: Some(WriteOp::MakeDirectory {
            path: path.to_string(),
        }),
    }
}

fn read_req(path: &str) -> ReadOnlyTreeRequest {
    ReadOnlyTreeRequest {
        condition: None,
        op: Some(ReadOnlyOp::Read {
            path: path.to_string(),
        }),
    }
}

fn list_req(path: &str) -> ReadOnlyTreeRequest {
    ReadOnlyTreeRequest {
        condition: None,
        op: Some(ReadOnlyOp::ListDirectory {
            path: path.to_string(),
        }),
    }
}

// =============================================================================
// Basic namespace operations through the adapter
// =============================================================================

#[tokio::test]
async fn write_then_read_round_trips() {
    let dir = TempDir::new().unwrap();
    let node = SingleNode::spawn(dir.path()).await;

    let resp = node.server.handle_read_write(mkdir_req("/app")).await;
    assert_eq!(resp.status, Status::Ok);

    let resp = node
        .server
        .handle_read_write(write_req("/app/config", b"port=8080"))
        .await;
    assert_eq!(resp.status, Status::Ok);

    let resp = node.server.handle_read_only(read_req("/app/config")).await;
    assert_eq!(resp.status, Status::Ok);
    assert_eq!(resp.contents.as_deref(), Some(b"port=8080".as_slice()));

    node.stop().await;
}

#[tokio::test]
async fn directories_are_not_created_implicitly() {
    let dir = TempDir::new().unwrap();
    let node = SingleNode::spawn(dir.path()).await;

    // Writing under a missing directory fails without creating anything.
    let resp = node
        .server
        .handle_read_write(write_req("/missing/file", b"x"))
        .await;
    assert_eq!(resp.status, Status::LookupError);

    let resp = node
        .server
        .handle_read_write(mkdir_req("/missing/nested"))
        .await;
    assert_eq!(resp.status, Status::LookupError);

    let resp = node.server.handle_read_only(list_req("/")).await;
    assert_eq!(resp.status, Status::Ok);
    assert!(resp.children.unwrap().is_empty());

    node.stop().await;
}

#[tokio::test]
async fn listing_marks_directories_with_a_slash() {
    let dir = TempDir::new().unwrap();
    let node = SingleNode::spawn(dir.path()).await;

    node.server.handle_read_write(mkdir_req("/sub")).await;
    node.server
        .handle_read_write(write_req("/file", b"data"))
        .await;

    let resp = node.server.handle_read_only(list_req("/")).await;
    assert_eq!(resp.status, Status::Ok);
    let children = resp.children.unwrap();
    assert!(children.contains(&"file".to_string()));
    assert!(children.contains(&"sub/".to_string()));

    node.stop().await;
}

#[tokio::test]
async fn removal_is_idempotent_but_type_checked() {
    let dir = TempDir::new().unwrap();
    let node = SingleNode::spawn(dir.path()).await;

    node.server.handle_read_write(mkdir_req("/d")).await;
    node.server
        .handle_read_write(write_req("/d/f", b"1"))
        .await;

    // Non-empty directory refuses removal.
    let resp = node
        .server
        .handle_read_write(ReadWriteTreeRequest {
            condition: None,
            op: Some(WriteOp::RemoveDirectory {
                path: "/d".to_string(),
            }),
        })
        .await;
    assert_eq!(resp.status, Status::ObjectNotEmpty);

    // Removing a directory as a file is a type error.
    let resp = node
        .server
        .handle_read_write(ReadWriteTreeRequest {
            condition: None,
            op: Some(WriteOp::RemoveFile {
                path: "/d".to_string(),
            }),
        })
        .await;
    assert_eq!(resp.status, Status::TypeError);

    // Removing something that does not exist succeeds.
    let resp = node
        .server
        .handle_read_write(ReadWriteTreeRequest {
            condition: None,
            op: Some(WriteOp::RemoveFile {
                path: "/d/absent".to_string(),
            }),
        })
        .await;
    assert_eq!(resp.status, Status::Ok);

    node.stop().await;
}

#[tokio::test]
async fn relative_paths_are_rejected() {
    let dir = TempDir::new().unwrap();
    let node = SingleNode::spawn(dir.path()).await;

    let resp = node
        .server
        .handle_read_write(write_req("relative/path", b"x"))
        .await;
    assert_eq!(resp.status, Status::InvalidRequest);

    let resp = node.server.handle_read_only(read_req("no-slash")).await;
    assert_eq!(resp.status, Status::InvalidRequest);

    node.stop().await;
}

#[tokio::test]
async fn requests_without_an_operation_are_invalid() {
    let dir = TempDir::new().unwrap();
    let node = SingleNode::spawn(dir.path()).await;

    let resp = node
        .server
        .handle_read_write(ReadWriteTreeRequest {
            condition: None,
            op: None,
        })
        .await;
    assert_eq!(resp.status, Status::InvalidRequest);

    let resp = node
        .server
        .handle_read_only(ReadOnlyTreeRequest {
            condition: None,
            op: None,
        })
        .await;
    assert_eq!(resp.status, Status::InvalidRequest);

    node.stop().await;
}

// =============================================================================
// Conditional writes
// =============================================================================

#[tokio::test]
async fn stale_condition_leaves_contents_untouched() {
    let dir = TempDir::new().unwrap();
    let node = SingleNode::spawn(dir.path()).await;

    node.server.handle_read_write(mkdir_req("/cfg")).await;
    node.server
        .handle_read_write(write_req("/cfg/app", b"v1"))
        .await;

    // A condition against stale contents fails and mutates nothing.
    let resp = node
        .server
        .handle_read_write(ReadWriteTreeRequest {
            condition: Some(Condition {
                path: "/cfg/app".to_string(),
                contents: b"v0".to_vec(),
            }),
            op: Some(WriteOp::Write {
                path: "/cfg/app".to_string(),
                contents: b"v2".to_vec(),
            }),
        })
        .await;
    assert_eq!(resp.status, Status::ConditionNotMet);

    let resp = node.server.handle_read_only(read_req("/cfg/app")).await;
    assert_eq!(resp.contents.as_deref(), Some(b"v1".as_slice()));

    // The matching condition succeeds.
    let resp = node
        .server
        .handle_read_write(ReadWriteTreeRequest {
            condition: Some(Condition {
                path: "/cfg/app".to_string(),
                contents: b"v1".to_vec(),
            }),
            op: Some(WriteOp::Write {
                path: "/cfg/app".to_string(),
                contents: b"v2".to_vec(),
            }),
        })
        .await;
    assert_eq!(resp.status, Status::Ok);

    let resp = node.server.handle_read_only(read_req("/cfg/app")).await;
    assert_eq!(resp.contents.as_deref(), Some(b"v2".as_slice()));

    node.stop().await;
}

#[tokio::test]
async fn conditions_gate_reads_too() {
    let dir = TempDir::new().unwrap();
    let node = SingleNode::spawn(dir.path()).await;

    node.server
        .handle_read_write(write_req("/guard", b"open"))
        .await;
    node.server
        .handle_read_write(write_req("/value", b"42"))
        .await;

    let resp = node
        .server
        .handle_read_only(ReadOnlyTreeRequest {
            condition: Some(Condition {
                path: "/guard".to_string(),
                contents: b"open".to_vec(),
            }),
            op: Some(ReadOnlyOp::Read {
                path: "/value".to_string(),
            }),
        })
        .await;
    assert_eq!(resp.status, Status::Ok);
    assert_eq!(resp.contents.as_deref(), Some(b"42".as_slice()));

    let resp = node
        .server
        .handle_read_only(ReadOnlyTreeRequest {
            condition: Some(Condition {
                path: "/guard".to_string(),
                contents: b"closed".to_vec(),
            }),
            op: Some(ReadOnlyOp::Read {
                path: "/value".to_string(),
            }),
        })
        .await;
    assert_eq!(resp.status, Status::ConditionNotMet);
    assert!(resp.contents.is_none());

    node.stop().await;
}

// =============================================================================
// Weight reassignment through the adapter
// =============================================================================

#[tokio::test]
async fn request_weight_commits_and_reports_the_term() {
    let dir = TempDir::new().unwrap();
    let node = SingleNode::spawn(dir.path()).await;

    let resp = node
        .server
        .handle_request_weight(RequestWeightRequest {
            target_id: 1,
            weight: 3,
        })
        .await;
    assert!(resp.success);
    assert!(resp.term > 0);
    assert_eq!(resp.leader_hint, Some(1));

    // Demoting the only voter would brick the cluster.
    let resp = node
        .server
        .handle_request_weight(RequestWeightRequest {
            target_id: 1,
            weight: 0,
        })
        .await;
    assert!(!resp.success);

    node.stop().await;
}

// =============================================================================
// Recovery
// =============================================================================

#[tokio::test]
async fn namespace_survives_a_restart() {
    let dir = TempDir::new().unwrap();

    let node = SingleNode::spawn(dir.path()).await;
    node.server.handle_read_write(mkdir_req("/persisted")).await;
    let resp = node
        .server
        .handle_read_write(write_req("/persisted/key", b"value"))
        .await;
    assert_eq!(resp.status, Status::Ok);
    node.stop().await;

    // A fresh engine over the same storage replays the log into an empty
    // tree and serves the same contents.
    let node = SingleNode::spawn(dir.path()).await;
    let resp = node
        .server
        .handle_read_only(read_req("/persisted/key"))
        .await;
    assert_eq!(resp.status, Status::Ok);
    assert_eq!(resp.contents.as_deref(), Some(b"value".as_slice()));
    node.stop().await;
}

// =============================================================================
// Replica determinism
// =============================================================================

#[test]
fn replicas_applying_the_same_log_converge() {
    use canopy::consensus::StateMachine;

    let commands: Vec<TreeCommand> = vec![
        TreeCommand {
            condition: None,
            op: WriteOp::MakeDirectory {
                path: "/a".to_string(),
            },
        },
        TreeCommand {
            condition: None,
            op: WriteOp::Write {
                path: "/a/x".to_string(),
                contents: b"1".to_vec(),
            },
        },
        // Fails on both replicas, identically.
        TreeCommand {
            condition: Some(Condition {
                path: "/a/x".to_string(),
                contents: b"stale".to_vec(),
            }),
            op: WriteOp::Write {
                path: "/a/x".to_string(),
                contents: b"2".to_vec(),
            },
        },
        TreeCommand {
            condition: None,
            op: WriteOp::Write {
                path: "/a/x".to_string(),
                contents: b"3".to_vec(),
            },
        },
        TreeCommand {
            condition: None,
            op: WriteOp::RemoveFile {
                path: "/a/x".to_string(),
            },
        },
        TreeCommand {
            condition: None,
            op: WriteOp::Write {
                path: "/a/y".to_string(),
                contents: b"final".to_vec(),
            },
        },
    ];

    let mut first = TreeStateMachine::new();
    let mut second = TreeStateMachine::new();

    for command in &commands {
        let data = bincode::serialize(command).unwrap();
        let a = first.apply(&data);
        let b = second.apply(&data);
        assert_eq!(a, b);
    }

    // Garbage payloads produce the same deterministic failure everywhere.
    let a = first.apply(b"not a command");
    let b = second.apply(b"not a command");
    assert_eq!(a.status, Status::InvalidRequest);
    assert_eq!(a, b);

    assert_eq!(first.snapshot().unwrap(), second.snapshot().unwrap());
}
