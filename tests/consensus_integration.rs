//! Consensus integration tests.
//!
//! Runs real RaftNode event loops in-process, routing peer RPCs over the
//! nodes' command channels instead of HTTP, and checks leader election,
//! replication, commit survival across leader loss, and weight changes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tempfile::TempDir;
use tokio::sync::{mpsc, oneshot};

use canopy::consensus::{
    AppendEntriesRequest, AppendEntriesResponse, ConsensusConfig, InstallSnapshotRequest,
    InstallSnapshotResponse, RaftCommand, RaftHandle, RaftNode, RaftRpc, RaftStorage,
    RequestVoteRequest, RequestVoteResponse,
};
use canopy::error::{CanopyError, Result};
use canopy::tree::{CommandOutcome, Condition, Status, TreeCommand, TreeStateMachine, WriteOp};
use canopy::types::{Membership, NodeId};

// =============================================================================
// Channel-routed RPC and cluster harness
// =============================================================================

type CommandSender = mpsc::Sender<RaftCommand<CommandOutcome>>;

/// Routes peer RPCs to in-process nodes over their command channels.
#[derive(Clone, Default)]
struct Router {
    nodes: Arc<RwLock<HashMap<NodeId, CommandSender>>>,
}

impl Router {
    fn register(&self, id: NodeId, tx: CommandSender) {
        self.nodes.write().insert(id, tx);
    }

    fn sender_for(&self, id: NodeId) -> Result<CommandSender> {
        self.nodes
            .read()
            .get(&id)
            .cloned()
            .ok_or(CanopyError::NodeNotFound(id))
    }
}

struct ChannelRpc {
    router: Router,
}

#[async_trait::async_trait]
impl RaftRpc for ChannelRpc {
    async fn request_vote(
        &self,
        target: NodeId,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        let tx = self.router.sender_for(target)?;
        let (otx, orx) = oneshot::channel();
        tx.send(RaftCommand::RequestVote {
            request,
            response: otx,
        })
        .await
        .map_err(|_| CanopyError::Network("peer unreachable".into()))?;
        orx.await
            .map_err(|_| CanopyError::Network("peer dropped request".into()))
    }

    async fn append_entries(
        &self,
        target: NodeId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let tx = self.router.sender_for(target)?;
        let (otx, orx) = oneshot::channel();
        tx.send(RaftCommand::AppendEntries {
            request,
            response: otx,
        })
        .await
        .map_err(|_| CanopyError::Network("peer unreachable".into()))?;
        orx.await
            .map_err(|_| CanopyError::Network("peer dropped request".into()))
    }

    async fn install_snapshot(
        &self,
        target: NodeId,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        let tx = self.router.sender_for(target)?;
        let (otx, orx) = oneshot::channel();
        tx.send(RaftCommand::InstallSnapshot {
            request,
            response: otx,
        })
        .await
        .map_err(|_| CanopyError::Network("peer unreachable".into()))?;
        orx.await
            .map_err(|_| CanopyError::Network("peer dropped request".into()))
    }
}

struct TestCluster {
    handles: HashMap<NodeId, RaftHandle<CommandOutcome>>,
    state_machines: HashMap<NodeId, Arc<RwLock<TreeStateMachine>>>,
    _dirs: Vec<TempDir>,
}

impl TestCluster {
    /// Spawn `n` nodes, all with voting weight 1.
    fn spawn(n: u64) -> Self {
        let membership = Membership::new((1..=n).map(|id| (id, 1)));
        let router = Router::default();

        let mut handles = HashMap::new();
        let mut state_machines = HashMap::new();
        let mut dirs = Vec::new();

        for id in 1..=n {
            let dir = TempDir::new().unwrap();
            let config = ConsensusConfig {
                node_id: id,
                initial_membership: membership.clone(),
                ..Default::default()
            };
            let storage = Arc::new(RaftStorage::open(dir.path()).unwrap());
            let sm = Arc::new(RwLock::new(TreeStateMachine::new()));
            let rpc = Arc::new(ChannelRpc {
                router: router.clone(),
            });

            let (node, rx) = RaftNode::new(config, storage, Arc::clone(&sm), rpc).unwrap();
            let handle = node.handle();
            router.register(id, handle.sender());

            tokio::spawn(async move {
                node.run(rx).await;
            });

            handles.insert(id, handle);
            state_machines.insert(id, sm);
            dirs.push(dir);
        }

        Self {
            handles,
            state_machines,
            _dirs: dirs,
        }
    }

    async fn wait_for_leader(&self) -> NodeId {
        self.wait_for_leader_among(self.handles.keys().copied().collect())
            .await
    }

    async fn wait_for_leader_among(&self, candidates: Vec<NodeId>) -> NodeId {
        for _ in 0..100 {
            for &id in &candidates {
                if let Ok(true) = self.handles[&id].is_leader().await {
                    return id;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("no leader elected within timeout");
    }

    async fn write(&self, node: NodeId, path: &str, contents: &[u8]) -> Result<CommandOutcome> {
        let command = TreeCommand {
            condition: None,
            op: WriteOp::Write {
                path: path.to_string(),
                contents: contents.to_vec(),
            },
        };
        let data = bincode::serialize(&command).unwrap();
        self.handles[&node].propose(data).await
    }

    /// Poll until `path` reads as `expected` on the given node's replica.
    async fn wait_for_replication(&self, node: NodeId, path: &str, expected: &[u8]) {
        for _ in 0..100 {
            if let Ok(contents) = self.state_machines[&node].read().read(path) {
                if contents == expected {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("node {} never applied {}", node, path);
    }
}

// =============================================================================
// Cluster tests
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_node_cluster_elects_exactly_one_leader() {
    let cluster = TestCluster::spawn(3);
    let leader = cluster.wait_for_leader().await;

    // Settle, then count leaders.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let mut leaders = Vec::new();
    for (&id, handle) in &cluster.handles {
        if handle.is_leader().await.unwrap() {
            leaders.push(id);
        }
    }
    assert_eq!(leaders, vec![leader]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn writes_replicate_to_every_node() {
    let cluster = TestCluster::spawn(3);
    let leader = cluster.wait_for_leader().await;

    let outcome = cluster.write(leader, "/greeting", b"hello").await.unwrap();
    assert_eq!(outcome.status, Status::Ok);

    for id in 1..=3 {
        cluster.wait_for_replication(id, "/greeting", b"hello").await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn followers_redirect_to_the_leader() {
    let cluster = TestCluster::spawn(3);
    let leader = cluster.wait_for_leader().await;

    // Give heartbeats a moment to propagate the leader id.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let follower = (1..=3).find(|&id| id != leader).unwrap();
    match cluster.write(follower, "/x", b"1").await {
        Err(CanopyError::NotLeader { leader: hint }) => {
            assert_eq!(hint, Some(leader));
        }
        other => panic!("expected NotLeader, got {:?}", other.map(|o| o.status)),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn committed_write_survives_leader_loss() {
    let cluster = TestCluster::spawn(3);
    let leader = cluster.wait_for_leader().await;

    let outcome = cluster.write(leader, "/durable", b"v1").await.unwrap();
    assert_eq!(outcome.status, Status::Ok);

    // Make sure the entry is applied everywhere before killing the leader.
    for id in 1..=3 {
        cluster.wait_for_replication(id, "/durable", b"v1").await;
    }

    cluster.handles[&leader].shutdown().await.unwrap();

    let survivors: Vec<NodeId> = (1..=3).filter(|&id| id != leader).collect();
    let new_leader = cluster.wait_for_leader_among(survivors).await;
    assert_ne!(new_leader, leader);

    // The committed write is still there, and the cluster still makes
    // progress with two of three nodes.
    cluster
        .handles[&new_leader]
        .read_barrier()
        .await
        .unwrap();
    let contents = cluster.state_machines[&new_leader]
        .read()
        .read("/durable")
        .unwrap();
    assert_eq!(contents, b"v1");

    let outcome = cluster.write(new_leader, "/durable", b"v2").await.unwrap();
    assert_eq!(outcome.status, Status::Ok);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn read_barrier_sees_all_committed_writes() {
    let cluster = TestCluster::spawn(3);
    let leader = cluster.wait_for_leader().await;

    for i in 0..5u8 {
        let outcome = cluster
            .write(leader, &format!("/k{}", i), &[i])
            .await
            .unwrap();
        assert_eq!(outcome.status, Status::Ok);
    }

    cluster.handles[&leader].read_barrier().await.unwrap();
    let sm = cluster.state_machines[&leader].read();
    for i in 0..5u8 {
        assert_eq!(sm.read(&format!("/k{}", i)).unwrap(), vec![i]);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn weight_changes_commit_and_apply_on_every_node() {
    let cluster = TestCluster::spawn(3);
    let leader = cluster.wait_for_leader().await;

    // Demote node 3 to a learner.
    let term = cluster.handles[&leader].set_weight(3, 0).await.unwrap();
    assert!(term > 0);

    // The cluster keeps committing under the new two-voter configuration,
    // and the learner still receives entries.
    let outcome = cluster.write(leader, "/after", b"change").await.unwrap();
    assert_eq!(outcome.status, Status::Ok);
    cluster.wait_for_replication(3, "/after", b"change").await;

    // A second change goes through once the first has committed.
    let term = cluster.handles[&leader].set_weight(3, 2).await.unwrap();
    assert!(term > 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn conditional_writes_serialize_through_the_log() {
    let cluster = TestCluster::spawn(3);
    let leader = cluster.wait_for_leader().await;

    let outcome = cluster.write(leader, "/lock", b"owner-a").await.unwrap();
    assert_eq!(outcome.status, Status::Ok);

    // Two compare-and-swap attempts against the same expected value: the
    // log orders them, so exactly one wins.
    let cas = |owner: &'static [u8]| TreeCommand {
        condition: Some(Condition {
            path: "/lock".to_string(),
            contents: b"owner-a".to_vec(),
        }),
        op: WriteOp::Write {
            path: "/lock".to_string(),
            contents: owner.to_vec(),
        },
    };

    let h = cluster.handles[&leader].clone();
    let first = h.propose(bincode::serialize(&cas(b"owner-b")).unwrap());
    let h = cluster.handles[&leader].clone();
    let second = h.propose(bincode::serialize(&cas(b"owner-c")).unwrap());

    let (first, second) = tokio::join!(first, second);
    let statuses = [first.unwrap().status, second.unwrap().status];
    assert!(statuses.contains(&Status::Ok));
    assert!(statuses.contains(&Status::ConditionNotMet));

    cluster.handles[&leader].read_barrier().await.unwrap();
    let contents = cluster.state_machines[&leader]
        .read()
        .read("/lock")
        .unwrap();
    assert!(contents == b"owner-b" || contents == b"owner-c");
}

// =============================================================================
// RPC message round trips
// =============================================================================

#[test]
fn install_snapshot_request_carries_membership() {
    let request = InstallSnapshotRequest {
        term: 3,
        leader_id: 1,
        last_included_index: 42,
        last_included_term: 2,
        membership: Membership::new([(1, 2), (2, 1), (3, 0)]),
        offset: 1024,
        data: vec![1, 2, 3],
        done: false,
    };

    let bytes = bincode::serialize(&request).unwrap();
    let back: InstallSnapshotRequest = bincode::deserialize(&bytes).unwrap();
    assert_eq!(back.membership.weight_of(1), 2);
    assert_eq!(back.membership.weight_of(3), 0);
    assert_eq!(back.offset, 1024);
    assert!(!back.done);
}

#[test]
fn append_entries_response_round_trips_conflict_hints() {
    let response = AppendEntriesResponse {
        term: 5,
        success: false,
        match_index: 0,
        conflict_index: Some(50),
        conflict_term: Some(3),
    };

    let json = serde_json::to_string(&response).unwrap();
    let back: AppendEntriesResponse = serde_json::from_str(&json).unwrap();
    assert_eq!(back.conflict_index, Some(50));
    assert_eq!(back.conflict_term, Some(3));
}
