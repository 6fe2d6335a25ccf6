//! The consensus engine event loop.
//!
//! A [`RaftNode`] owns the log, the durable store, and a shared state
//! machine, and is driven entirely through a command channel: the service
//! adapter sends [`RaftCommand`]s and awaits oneshot responses. Proposals
//! resolve when the entry is applied, so the proposer gets the state
//! machine's output for its own command, not just a log index.

use super::rpc::*;
use super::state::*;
use super::{EntryKind, LogEntry, RaftLog, RaftStorage, SnapshotMeta, StateMachine};
use crate::error::{CanopyError, Result};
use crate::types::{ConfigChange, LogIndex, Membership, NodeId, Term, Weight};
use parking_lot::RwLock;
use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, timeout, Instant};
use tracing::{debug, error, info, warn};

/// Consensus engine settings for one node.
#[derive(Debug, Clone)]
pub struct ConsensusConfig {
    /// This node's id.
    pub node_id: NodeId,
    /// Initial voting configuration, used only until a snapshot or committed
    /// Configuration entry supersedes it.
    pub initial_membership: Membership,
    /// Minimum election timeout.
    pub election_timeout_min: Duration,
    /// Maximum election timeout.
    pub election_timeout_max: Duration,
    /// Heartbeat interval.
    pub heartbeat_interval: Duration,
    /// How long to wait for one RequestVote response.
    pub vote_rpc_timeout: Duration,
    /// How long to wait for one AppendEntries response.
    pub append_rpc_timeout: Duration,
    /// Maximum entries per AppendEntries RPC.
    pub max_entries_per_append: usize,
    /// Applied entries since the last compaction before a snapshot is taken.
    pub snapshot_threshold: usize,
    /// Chunk size for InstallSnapshot streaming.
    pub snapshot_chunk_size: usize,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            initial_membership: Membership::new([(1, 1)]),
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(50),
            vote_rpc_timeout: Duration::from_millis(100),
            append_rpc_timeout: Duration::from_millis(50),
            max_entries_per_append: 100,
            snapshot_threshold: 10000,
            snapshot_chunk_size: 1024 * 1024,
        }
    }
}

/// Commands accepted by the engine. `O` is the state machine's output type.
pub enum RaftCommand<O> {
    /// Replicate a command payload; resolves with the state machine's output
    /// once the entry commits and is applied.
    Propose {
        data: Vec<u8>,
        response: oneshot::Sender<Result<O>>,
    },
    /// Change a server's voting weight. Resolves with the term at which the
    /// change committed.
    SetWeight {
        target_id: NodeId,
        weight: Weight,
        response: oneshot::Sender<Result<Term>>,
    },
    /// Incoming RequestVote RPC.
    RequestVote {
        request: RequestVoteRequest,
        response: oneshot::Sender<RequestVoteResponse>,
    },
    /// Incoming AppendEntries RPC.
    AppendEntries {
        request: AppendEntriesRequest,
        response: oneshot::Sender<AppendEntriesResponse>,
    },
    /// Incoming InstallSnapshot RPC.
    InstallSnapshot {
        request: InstallSnapshotRequest,
        response: oneshot::Sender<InstallSnapshotResponse>,
    },
    /// Linearizable read fence: resolves once every entry committed before
    /// the fence was issued has been applied on this node.
    ReadBarrier {
        response: oneshot::Sender<Result<()>>,
    },
    /// Whether this node currently believes it is the leader.
    IsLeader { response: oneshot::Sender<bool> },
    /// Last known leader id.
    GetLeader {
        response: oneshot::Sender<Option<NodeId>>,
    },
    /// Stop the event loop.
    Shutdown,
}

/// Cloneable client handle over the command channel.
pub struct RaftHandle<O> {
    tx: mpsc::Sender<RaftCommand<O>>,
}

impl<O> Clone for RaftHandle<O> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<O> RaftHandle<O> {
    pub fn new(tx: mpsc::Sender<RaftCommand<O>>) -> Self {
        Self { tx }
    }

    pub fn sender(&self) -> mpsc::Sender<RaftCommand<O>> {
        self.tx.clone()
    }

    /// Replicate a command and wait for its applied output.
    pub async fn propose(&self, data: Vec<u8>) -> Result<O> {
        let (response, rx) = oneshot::channel();
        self.send(RaftCommand::Propose { data, response }).await?;
        rx.await.map_err(|_| engine_stopped())?
    }

    /// Change a server's voting weight.
    pub async fn set_weight(&self, target_id: NodeId, weight: Weight) -> Result<Term> {
        let (response, rx) = oneshot::channel();
        self.send(RaftCommand::SetWeight {
            target_id,
            weight,
            response,
        })
        .await?;
        rx.await.map_err(|_| engine_stopped())?
    }

    /// Wait until this node has applied everything committed so far.
    pub async fn read_barrier(&self) -> Result<()> {
        let (response, rx) = oneshot::channel();
        self.send(RaftCommand::ReadBarrier { response }).await?;
        rx.await.map_err(|_| engine_stopped())?
    }

    pub async fn is_leader(&self) -> Result<bool> {
        let (response, rx) = oneshot::channel();
        self.send(RaftCommand::IsLeader { response }).await?;
        rx.await.map_err(|_| engine_stopped())
    }

    pub async fn leader(&self) -> Result<Option<NodeId>> {
        let (response, rx) = oneshot::channel();
        self.send(RaftCommand::GetLeader { response }).await?;
        rx.await.map_err(|_| engine_stopped())
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.send(RaftCommand::Shutdown).await
    }

    async fn send(&self, cmd: RaftCommand<O>) -> Result<()> {
        self.tx.send(cmd).await.map_err(|_| engine_stopped())
    }
}

fn engine_stopped() -> CanopyError {
    CanopyError::Internal("consensus engine stopped".to_string())
}

/// A proposal waiting for its entry to be applied. If another leader's entry
/// lands at the same index the term will not match and the proposal fails
/// with Retry.
struct PendingProposal<O> {
    index: LogIndex,
    term: Term,
    response: oneshot::Sender<Result<O>>,
}

/// A weight change waiting for its Configuration entry to commit. Like
/// proposals, matched by index and term: a different leader's entry landing
/// at the same index must not be mistaken for ours.
struct PendingConfigChange {
    index: LogIndex,
    term: Term,
    response: oneshot::Sender<Result<Term>>,
}

/// A read fence waiting for `last_applied` to catch up.
struct PendingBarrier {
    wait_index: LogIndex,
    response: oneshot::Sender<Result<()>>,
}

/// Snapshot chunks accumulated from the leader, applied atomically on the
/// final chunk.
#[derive(Debug)]
struct PendingSnapshot {
    data: Vec<u8>,
    last_included_index: LogIndex,
    last_included_term: Term,
    membership: Membership,
    next_offset: u64,
}

/// The consensus engine for one server.
pub struct RaftNode<S: StateMachine> {
    config: ConsensusConfig,
    state: Arc<RwLock<RaftState>>,
    log: Arc<RwLock<RaftLog>>,
    storage: Arc<RaftStorage>,
    /// Shared with the service adapter, which reads it directly for
    /// read-only operations after a barrier.
    state_machine: Arc<RwLock<S>>,
    rpc: Arc<dyn RaftRpc>,
    command_tx: mpsc::Sender<RaftCommand<S::Output>>,
    pending_snapshot: Arc<RwLock<Option<PendingSnapshot>>>,
    pending_proposals: Arc<RwLock<Vec<PendingProposal<S::Output>>>>,
    pending_config_changes: Arc<RwLock<Vec<PendingConfigChange>>>,
    pending_barriers: Arc<RwLock<Vec<PendingBarrier>>>,
    /// Followers with a snapshot stream currently in flight.
    snapshot_streams: Arc<RwLock<HashSet<NodeId>>>,
}

impl<S: StateMachine> RaftNode<S> {
    /// Create a node, recovering term, vote, log, and snapshot from storage.
    ///
    /// The state machine is shared: the caller keeps its own handle for
    /// serving reads, and the engine applies committed entries to the same
    /// instance.
    pub fn new(
        config: ConsensusConfig,
        storage: Arc<RaftStorage>,
        state_machine: Arc<RwLock<S>>,
        rpc: Arc<dyn RaftRpc>,
    ) -> Result<(Self, mpsc::Receiver<RaftCommand<S::Output>>)> {
        let mut raft_state = RaftState::new(config.node_id, config.initial_membership.clone());

        if let Some(persistent) = storage.load_persistent_state()? {
            raft_state.persistent = persistent;
        }

        let mut log = RaftLog::new();
        if let Some((snapshot_data, meta)) = storage.load_snapshot()? {
            state_machine.write().restore(&snapshot_data)?;
            log.compact(meta.last_index, meta.last_term);
            raft_state.volatile.commit_index = meta.last_index;
            raft_state.volatile.last_applied = meta.last_index;
            // The snapshot's configuration supersedes the static one.
            // Configuration entries after the snapshot re-apply as the
            // commit index re-advances.
            raft_state.membership = meta.membership;
        }

        let first_index = log.first_index();
        for entry in storage.entries_from(first_index)? {
            log.append(entry)?;
        }

        info!(
            node_id = config.node_id,
            term = raft_state.current_term(),
            last_log_index = log.last_index(),
            "Recovered consensus state"
        );

        let (command_tx, command_rx) = mpsc::channel(1000);

        let node = Self {
            config,
            state: Arc::new(RwLock::new(raft_state)),
            log: Arc::new(RwLock::new(log)),
            storage,
            state_machine,
            rpc,
            command_tx,
            pending_snapshot: Arc::new(RwLock::new(None)),
            pending_proposals: Arc::new(RwLock::new(Vec::new())),
            pending_config_changes: Arc::new(RwLock::new(Vec::new())),
            pending_barriers: Arc::new(RwLock::new(Vec::new())),
            snapshot_streams: Arc::new(RwLock::new(HashSet::new())),
        };

        Ok((node, command_rx))
    }

    /// A handle for sending commands to this node.
    pub fn handle(&self) -> RaftHandle<S::Output> {
        RaftHandle::new(self.command_tx.clone())
    }

    /// Run the event loop until shutdown.
    pub async fn run(self, mut command_rx: mpsc::Receiver<RaftCommand<S::Output>>) {
        let mut election_deadline = self.reset_election_deadline();
        let mut heartbeat_interval = interval(self.config.heartbeat_interval);

        loop {
            let is_leader = self.state.read().is_leader();

            tokio::select! {
                Some(cmd) = command_rx.recv() => {
                    match cmd {
                        RaftCommand::Shutdown => {
                            info!(node_id = self.config.node_id, "Consensus engine shutting down");
                            self.fail_all_pending(engine_stopped);
                            break;
                        }
                        RaftCommand::Propose { data, response } => {
                            self.handle_propose(data, response).await;
                        }
                        RaftCommand::SetWeight { target_id, weight, response } => {
                            self.handle_set_weight(target_id, weight, response).await;
                        }
                        RaftCommand::RequestVote { request, response } => {
                            let result = self.handle_request_vote(request);
                            if result.vote_granted {
                                election_deadline = self.reset_election_deadline();
                            }
                            let _ = response.send(result);
                        }
                        RaftCommand::AppendEntries { request, response } => {
                            let result = self.handle_append_entries(request);
                            if result.success {
                                election_deadline = self.reset_election_deadline();
                            }
                            let _ = response.send(result);
                        }
                        RaftCommand::InstallSnapshot { request, response } => {
                            let result = self.handle_install_snapshot(request);
                            election_deadline = self.reset_election_deadline();
                            let _ = response.send(result);
                        }
                        RaftCommand::ReadBarrier { response } => {
                            self.handle_read_barrier(response).await;
                        }
                        RaftCommand::IsLeader { response } => {
                            let _ = response.send(is_leader);
                        }
                        RaftCommand::GetLeader { response } => {
                            let leader = self.state.read().leader_id;
                            let _ = response.send(leader);
                        }
                    }
                }

                _ = heartbeat_interval.tick(), if is_leader => {
                    self.replicate_to_all().await;
                }

                _ = tokio::time::sleep_until(election_deadline), if !is_leader => {
                    self.start_election().await;
                    election_deadline = self.reset_election_deadline();
                }
            }

            self.apply_committed_entries();
            self.fail_pending_if_not_leader();
            self.maybe_snapshot();
        }
    }

    /// Append a command entry locally and register the proposal. The caller's
    /// oneshot resolves when the entry is applied (or fails earlier).
    async fn handle_propose(&self, data: Vec<u8>, response: oneshot::Sender<Result<S::Output>>) {
        let (term, is_leader, leader_id) = {
            let state = self.state.read();
            (state.current_term(), state.is_leader(), state.leader_id)
        };

        if !is_leader {
            let _ = response.send(Err(CanopyError::NotLeader { leader: leader_id }));
            return;
        }

        let index = {
            let mut log = self.log.write();
            let index = log.last_index() + 1;
            let entry = LogEntry::command(term, index, data);

            if let Err(e) = self.storage.append_entries(&[entry.clone()]) {
                error!(error = %e, index, "Failed to persist proposed entry");
                let _ = response.send(Err(e));
                return;
            }
            if let Err(e) = log.append(entry) {
                let _ = response.send(Err(e));
                return;
            }
            index
        };

        self.pending_proposals.write().push(PendingProposal {
            index,
            term,
            response,
        });

        self.replicate_to_all().await;
    }

    /// Handle a weight-change request. One Configuration entry may be in
    /// flight at a time; the change affects quorums only once committed.
    async fn handle_set_weight(
        &self,
        target_id: NodeId,
        weight: Weight,
        response: oneshot::Sender<Result<Term>>,
    ) {
        let (term, index) = {
            let mut state = self.state.write();

            if !state.is_leader() {
                let _ = response.send(Err(CanopyError::NotLeader {
                    leader: state.leader_id,
                }));
                return;
            }
            if state.pending_config.is_some() {
                let _ = response.send(Err(CanopyError::ConfigChangeInProgress));
                return;
            }

            // Refuse a change that would leave the cluster with no voters.
            let mut next = state.membership.clone();
            next.set_weight(target_id, weight);
            if next.total_weight() == 0 {
                let _ = response.send(Err(CanopyError::InvalidRequest(
                    "weight change would leave no voting members".to_string(),
                )));
                return;
            }

            let change = ConfigChange::SetWeight {
                server_id: target_id,
                weight,
            };
            let data = match bincode::serialize(&change) {
                Ok(d) => d,
                Err(e) => {
                    let _ = response.send(Err(e.into()));
                    return;
                }
            };

            let term = state.current_term();
            let mut log = self.log.write();
            let index = log.last_index() + 1;
            let entry = LogEntry::configuration(term, index, data);

            if let Err(e) = self.storage.append_entries(&[entry.clone()]) {
                error!(error = %e, index, "Failed to persist configuration entry");
                let _ = response.send(Err(e));
                return;
            }
            if let Err(e) = log.append(entry) {
                let _ = response.send(Err(e));
                return;
            }

            state.pending_config = Some(index);
            (term, index)
        };

        info!(
            node_id = self.config.node_id,
            target = target_id,
            weight,
            index,
            term,
            "Proposed weight change"
        );

        self.pending_config_changes
            .write()
            .push(PendingConfigChange {
                index,
                term,
                response,
            });

        self.replicate_to_all().await;
    }

    /// Handle RequestVote. Votes are granted per the usual term, single-vote,
    /// and log-up-to-date rules; the weighted arithmetic happens on the
    /// candidate's side when it tallies.
    fn handle_request_vote(&self, request: RequestVoteRequest) -> RequestVoteResponse {
        let mut state = self.state.write();
        let log = self.log.read();

        if request.term > state.current_term() {
            state.become_follower(request.term, None);
            self.persist_state(&state);
        }

        let vote_granted = if request.term < state.current_term() {
            false
        } else if state.persistent.voted_for.is_some()
            && state.persistent.voted_for != Some(request.candidate_id)
        {
            false
        } else if !log.is_up_to_date(request.last_log_index, request.last_log_term) {
            false
        } else {
            state.persistent.voted_for = Some(request.candidate_id);
            self.persist_state(&state);
            true
        };

        debug!(
            node_id = state.node_id,
            candidate = request.candidate_id,
            term = request.term,
            vote_granted,
            "Handled RequestVote"
        );

        RequestVoteResponse {
            term: state.current_term(),
            vote_granted,
        }
    }

    /// Handle AppendEntries: consistency check, conflict truncation, durable
    /// append, commit advancement.
    fn handle_append_entries(&self, request: AppendEntriesRequest) -> AppendEntriesResponse {
        let mut state = self.state.write();
        let mut log = self.log.write();

        if request.term > state.current_term() {
            state.become_follower(request.term, Some(request.leader_id));
            self.persist_state(&state);
        }

        if request.term < state.current_term() {
            return AppendEntriesResponse {
                term: state.current_term(),
                success: false,
                match_index: 0,
                conflict_index: None,
                conflict_term: None,
            };
        }

        // An equal-term AppendEntries means this term already has a leader.
        if !state.state.is_follower() {
            state.become_follower(request.term, Some(request.leader_id));
            self.persist_state(&state);
        }
        state.leader_id = Some(request.leader_id);

        if !log.matches(request.prev_log_index, request.prev_log_term) {
            let conflict_term = log.term_at(request.prev_log_index);
            let conflict_index = if conflict_term.is_some() {
                // First index of the conflicting term, so the leader can
                // skip the whole run.
                let mut idx = request.prev_log_index;
                while idx > log.first_index() && log.term_at(idx - 1) == conflict_term {
                    idx -= 1;
                }
                Some(idx)
            } else {
                Some(log.last_index() + 1)
            };

            return AppendEntriesResponse {
                term: state.current_term(),
                success: false,
                match_index: 0,
                conflict_index,
                conflict_term,
            };
        }

        // The last index this request vouches for. Neither the commit index
        // nor the acknowledged match may pass it: entries above could be a
        // stale local suffix the leader has not examined.
        let last_new_index = request.prev_log_index + request.entries.len() as u64;

        let mut new_entries = Vec::new();
        for entry in request.entries {
            if entry.index <= log.last_index() {
                match log.get(entry.index) {
                    Some(existing) if existing.term == entry.term => {
                        // Already have it.
                    }
                    _ => {
                        // Conflict: drop our suffix, the leader's log wins.
                        log.truncate_suffix(entry.index);
                        if let Err(e) = self.storage.truncate_suffix(entry.index) {
                            error!(error = %e, index = entry.index,
                                "Failed to truncate conflicting log suffix");
                            return AppendEntriesResponse {
                                term: state.current_term(),
                                success: false,
                                match_index: 0,
                                conflict_index: None,
                                conflict_term: None,
                            };
                        }
                        new_entries.push(entry);
                    }
                }
            } else {
                new_entries.push(entry);
            }
        }

        if !new_entries.is_empty() {
            // Durability before acknowledgment: the leader counts this
            // response toward the quorum.
            if let Err(e) = self.storage.append_entries(&new_entries) {
                error!(error = %e, count = new_entries.len(),
                    "Failed to persist appended entries");
                return AppendEntriesResponse {
                    term: state.current_term(),
                    success: false,
                    match_index: log.last_index(),
                    conflict_index: None,
                    conflict_term: None,
                };
            }
            for entry in new_entries {
                if let Err(e) = log.append(entry) {
                    error!(error = %e, "Gap while appending replicated entries");
                    panic!("log append out of order after consistency check");
                }
            }
        }

        let new_commit = request.leader_commit.min(last_new_index);
        if new_commit > state.volatile.commit_index {
            state.volatile.commit_index = new_commit;
        }

        AppendEntriesResponse {
            term: state.current_term(),
            success: true,
            match_index: last_new_index,
            conflict_index: None,
            conflict_term: None,
        }
    }

    /// Campaign for leadership. Learners never campaign; their weight is
    /// zero so they could not win, and a vote for them would be wasted.
    async fn start_election(&self) {
        {
            let state = self.state.read();
            if !state.membership.is_voter(self.config.node_id) {
                debug!(
                    node_id = self.config.node_id,
                    "Election timeout ignored: this node is a learner"
                );
                return;
            }
        }

        let (term, last_log_index, last_log_term, peers) = {
            let mut state = self.state.write();
            let log = self.log.read();

            state.become_candidate();
            self.persist_state(&state);

            let peers: Vec<NodeId> = state
                .membership
                .server_ids()
                .filter(|&id| id != self.config.node_id)
                .collect();

            (state.current_term(), log.last_index(), log.last_term(), peers)
        };

        info!(node_id = self.config.node_id, term, "Starting election");

        let request = RequestVoteRequest {
            term,
            candidate_id: self.config.node_id,
            last_log_index,
            last_log_term,
        };

        let mut vote_futures = Vec::new();
        for peer_id in peers {
            let rpc = Arc::clone(&self.rpc);
            let req = request.clone();
            let rpc_timeout = self.config.vote_rpc_timeout;
            vote_futures.push(async move {
                match timeout(rpc_timeout, rpc.request_vote(peer_id, req)).await {
                    Ok(Ok(response)) => Some((peer_id, response)),
                    _ => None,
                }
            });
        }

        let results = futures::future::join_all(vote_futures).await;

        let mut granted = vec![self.config.node_id];

        // A cluster where our own weight is already a quorum (single voter)
        // has no responses to wait for.
        let won_alone = {
            let mut state = self.state.write();
            if state.state.is_candidate()
                && state.current_term() == term
                && state.votes_are_quorum(&granted)
            {
                let last_index = self.log.read().last_index();
                state.become_leader(last_index);
                true
            } else {
                false
            }
        };
        if won_alone {
            self.on_election_won(term).await;
            return;
        }

        for result in results.into_iter().flatten() {
            let (peer_id, response) = result;
            let won = {
                let mut state = self.state.write();
                if !state.state.is_candidate() || state.current_term() != term {
                    return;
                }

                if response.term > state.current_term() {
                    state.become_follower(response.term, None);
                    self.persist_state(&state);
                    return;
                }

                if !response.vote_granted {
                    false
                } else {
                    granted.push(peer_id);
                    debug!(
                        node_id = self.config.node_id,
                        voter = peer_id,
                        "Received vote"
                    );

                    if state.votes_are_quorum(&granted) {
                        let last_index = self.log.read().last_index();
                        state.become_leader(last_index);
                        true
                    } else {
                        false
                    }
                }
            };

            if won {
                self.on_election_won(term).await;
                return;
            }
        }
    }

    /// Post-election work: append a noop at the new term so the current-term
    /// commit rule can advance, and pick up any uncommitted Configuration
    /// entry left behind by a previous leader.
    async fn on_election_won(&self, term: Term) {
        let noop_index = {
            let mut state = self.state.write();
            let mut log = self.log.write();

            let index = log.last_index() + 1;
            let entry = LogEntry::noop(term, index);
            if let Err(e) = self.storage.append_entries(&[entry.clone()]) {
                error!(error = %e, "Failed to persist leader noop entry");
            }
            if let Err(e) = log.append(entry) {
                error!(error = %e, "Failed to append leader noop entry");
            }

            // Resume single-change discipline across leadership changes.
            state.pending_config = None;
            let mut idx = log.last_index();
            while idx > state.volatile.commit_index {
                if let Some(e) = log.get(idx) {
                    if e.kind == EntryKind::Configuration {
                        state.pending_config = Some(idx);
                        break;
                    }
                }
                idx -= 1;
            }

            index
        };

        info!(
            node_id = self.config.node_id,
            term, noop_index, "Won election, became leader"
        );

        self.replicate_to_all().await;
    }

    /// One replication round: AppendEntries to every peer in parallel, then
    /// fold the responses into match/next indexes and advance the commit
    /// index under the weighted quorum rule. Peers whose next entry has been
    /// compacted away get the snapshot instead.
    ///
    /// Returns the peers that acknowledged this round at the current term,
    /// which is the leadership evidence the read barrier needs.
    async fn replicate_to_all(&self) -> Vec<NodeId> {
        let (term, commit_index, leader_state) = {
            let state = self.state.read();
            if !state.is_leader() {
                return Vec::new();
            }
            (
                state.current_term(),
                state.volatile.commit_index,
                state.leader.clone(),
            )
        };

        let leader_state = match leader_state {
            Some(l) => l,
            None => return Vec::new(),
        };

        let first_index = self.log.read().first_index();
        let mut snapshot_peers = Vec::new();
        let mut replication_futures = Vec::new();

        for (&peer_id, &next_index) in &leader_state.next_index {
            if next_index < first_index {
                snapshot_peers.push(peer_id);
                continue;
            }

            let rpc = Arc::clone(&self.rpc);
            let node_id = self.config.node_id;

            let (prev_log_index, prev_log_term, entries) = {
                let log = self.log.read();
                let prev_log_index = next_index.saturating_sub(1);
                let prev_log_term = log.term_at(prev_log_index).unwrap_or(0);
                let entries = log.entries_from_limit(next_index, self.config.max_entries_per_append);
                (prev_log_index, prev_log_term, entries)
            };

            let request = AppendEntriesRequest {
                term,
                leader_id: node_id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit: commit_index,
            };

            let rpc_timeout = self.config.append_rpc_timeout;
            replication_futures.push(async move {
                match timeout(rpc_timeout, rpc.append_entries(peer_id, request)).await {
                    Ok(Ok(response)) => Some((peer_id, response)),
                    _ => None,
                }
            });
        }

        let results = futures::future::join_all(replication_futures).await;

        let mut acked = Vec::new();
        {
            let mut state = self.state.write();
            if !state.is_leader() || state.current_term() != term {
                return Vec::new();
            }

            for result in results.into_iter().flatten() {
                let (peer_id, response) = result;
                if response.term > state.current_term() {
                    state.become_follower(response.term, None);
                    self.persist_state(&state);
                    return Vec::new();
                }

                if let Some(leader) = state.leader.as_mut() {
                    if response.success {
                        leader.update_match(peer_id, response.match_index);
                        acked.push(peer_id);
                    } else if let Some(conflict_index) = response.conflict_index {
                        leader.next_index.insert(peer_id, conflict_index.max(1));
                    } else {
                        leader.decrement_next(peer_id);
                    }
                }
            }

            let last_log_index = self.log.read().last_index();
            let log = Arc::clone(&self.log);
            let new_commit =
                state.calculate_commit_index(last_log_index, |i| log.read().term_at(i));
            if new_commit > state.volatile.commit_index {
                state.volatile.commit_index = new_commit;
                debug!(
                    node_id = state.node_id,
                    commit_index = new_commit,
                    "Advanced commit index"
                );
            }
        }

        for peer_id in snapshot_peers {
            self.spawn_snapshot_stream(peer_id);
        }

        acked
    }

    /// Apply every committed-but-unapplied entry, in log order, resolving
    /// proposals, weight changes, and read fences along the way.
    fn apply_committed_entries(&self) {
        let (commit_index, last_applied) = {
            let state = self.state.read();
            (state.volatile.commit_index, state.volatile.last_applied)
        };

        if commit_index <= last_applied {
            self.resolve_barriers(last_applied);
            return;
        }

        for index in (last_applied + 1)..=commit_index {
            let entry = match self.log.read().get(index).cloned() {
                Some(e) => e,
                None => {
                    // A hole in the committed region means the log and the
                    // applied state can no longer agree. Continuing would
                    // silently diverge from the rest of the cluster.
                    error!(
                        node_id = self.config.node_id,
                        index, commit_index, "Committed entry missing from log"
                    );
                    panic!("committed log entry {} missing", index);
                }
            };

            match entry.kind {
                EntryKind::Command => {
                    let output = self.state_machine.write().apply(entry.data_bytes());
                    self.resolve_proposal(index, entry.term, output);
                }
                EntryKind::Configuration => {
                    self.apply_configuration(&entry);
                }
                EntryKind::Noop => {}
            }

            // Proposals and weight changes displaced by another leader's
            // entry at this index.
            self.fail_displaced_proposals(index, entry.term);
            self.fail_displaced_config_changes(index, entry.term);

            self.state.write().volatile.last_applied = index;
        }

        self.resolve_barriers(commit_index);
    }

    /// A committed Configuration entry takes effect on every replica.
    fn apply_configuration(&self, entry: &LogEntry) {
        let change: ConfigChange = match bincode::deserialize(entry.data_bytes()) {
            Ok(c) => c,
            Err(e) => {
                error!(error = %e, index = entry.index,
                    "Undecodable configuration entry");
                return;
            }
        };

        let ConfigChange::SetWeight { server_id, weight } = change;
        let term = {
            let mut state = self.state.write();
            state.membership.set_weight(server_id, weight);
            if state.pending_config == Some(entry.index) {
                state.pending_config = None;
            }
            // A new voter needs replication tracking; a leader that already
            // tracked it keeps its progress.
            let local_id = state.node_id;
            if let Some(leader) = state.leader.as_mut() {
                if server_id != local_id && !leader.next_index.contains_key(&server_id) {
                    let last = self.log.read().last_index();
                    leader.next_index.insert(server_id, last + 1);
                    leader.match_index.insert(server_id, 0);
                }
            }
            state.current_term()
        };

        info!(
            node_id = self.config.node_id,
            server = server_id,
            weight,
            index = entry.index,
            "Applied weight change"
        );

        let mut waiters = self.pending_config_changes.write();
        let mut i = 0;
        while i < waiters.len() {
            if waiters[i].index == entry.index && waiters[i].term == entry.term {
                let waiter = waiters.swap_remove(i);
                let _ = waiter.response.send(Ok(term));
            } else {
                i += 1;
            }
        }
    }

    fn resolve_proposal(&self, index: LogIndex, term: Term, output: S::Output) {
        let mut proposals = self.pending_proposals.write();
        if let Some(pos) = proposals
            .iter()
            .position(|p| p.index == index && p.term == term)
        {
            let proposal = proposals.swap_remove(pos);
            let _ = proposal.response.send(Ok(output));
        }
    }

    /// Proposals registered at `index` under a different term were
    /// overwritten by another leader; the command may or may not have
    /// committed elsewhere, so the only honest answer is Retry.
    fn fail_displaced_proposals(&self, index: LogIndex, applied_term: Term) {
        let mut proposals = self.pending_proposals.write();
        let mut i = 0;
        while i < proposals.len() {
            if proposals[i].index == index && proposals[i].term != applied_term {
                let proposal = proposals.swap_remove(i);
                let _ = proposal.response.send(Err(CanopyError::Retry));
            } else {
                i += 1;
            }
        }
    }

    /// Weight changes registered at `index` under a different term were
    /// overwritten by another leader; same rule as displaced proposals.
    fn fail_displaced_config_changes(&self, index: LogIndex, applied_term: Term) {
        let mut waiters = self.pending_config_changes.write();
        let mut i = 0;
        while i < waiters.len() {
            if waiters[i].index == index && waiters[i].term != applied_term {
                let waiter = waiters.swap_remove(i);
                let _ = waiter.response.send(Err(CanopyError::Retry));
            } else {
                i += 1;
            }
        }
    }

    fn resolve_barriers(&self, last_applied: LogIndex) {
        let mut barriers = self.pending_barriers.write();
        let mut i = 0;
        while i < barriers.len() {
            if barriers[i].wait_index <= last_applied {
                let barrier = barriers.swap_remove(i);
                let _ = barrier.response.send(Ok(()));
            } else {
                i += 1;
            }
        }
    }

    /// When leadership is lost, everything waiting on this node's log can no
    /// longer be resolved here.
    fn fail_pending_if_not_leader(&self) {
        let (is_leader, leader_id) = {
            let state = self.state.read();
            (state.is_leader(), state.leader_id)
        };
        if is_leader {
            return;
        }

        let any_pending = !self.pending_proposals.read().is_empty()
            || !self.pending_config_changes.read().is_empty()
            || !self.pending_barriers.read().is_empty();
        if !any_pending {
            return;
        }

        self.fail_all_pending(|| CanopyError::NotLeader { leader: leader_id });
    }

    fn fail_all_pending<F: Fn() -> CanopyError>(&self, err: F) {
        for p in self.pending_proposals.write().drain(..) {
            let _ = p.response.send(Err(err()));
        }
        for c in self.pending_config_changes.write().drain(..) {
            let _ = c.response.send(Err(err()));
        }
        for b in self.pending_barriers.write().drain(..) {
            let _ = b.response.send(Err(err()));
        }
    }

    /// Linearizable read fence: capture the commit index, confirm leadership
    /// with a heartbeat round a weighted quorum acknowledged at the current
    /// term, then resolve once the captured index has been applied locally.
    async fn handle_read_barrier(&self, response: oneshot::Sender<Result<()>>) {
        let (is_leader, leader_id, commit_index, term) = {
            let state = self.state.read();
            (
                state.is_leader(),
                state.leader_id,
                state.volatile.commit_index,
                state.current_term(),
            )
        };

        if !is_leader {
            let _ = response.send(Err(CanopyError::NotLeader { leader: leader_id }));
            return;
        }

        let mut acked = self.replicate_to_all().await;
        acked.push(self.config.node_id);

        let confirmed = {
            let state = self.state.read();
            if !state.is_leader() || state.current_term() != term {
                let _ = response.send(Err(CanopyError::NotLeader {
                    leader: state.leader_id,
                }));
                return;
            }
            state.votes_are_quorum(&acked)
        };

        if !confirmed {
            // Still nominally leader, but a quorum did not answer this
            // round; a newer leader may exist on the other side of a
            // partition, so this node's state cannot back a linearizable
            // read.
            let _ = response.send(Err(CanopyError::Retry));
            return;
        }

        self.pending_barriers.write().push(PendingBarrier {
            wait_index: commit_index,
            response,
        });
    }

    /// Take a snapshot once enough entries have been applied since the last
    /// compaction.
    fn maybe_snapshot(&self) {
        let (last_applied, covered) = {
            let state = self.state.read();
            let log = self.log.read();
            (
                state.volatile.last_applied,
                log.first_index().saturating_sub(1),
            )
        };

        if last_applied.saturating_sub(covered) < self.config.snapshot_threshold as u64 {
            return;
        }

        let snapshot_data = match self.state_machine.read().snapshot() {
            Ok(d) => d,
            Err(e) => {
                error!(error = %e, "Failed to serialize state machine snapshot");
                return;
            }
        };
        let snapshot_term = match self.log.read().term_at(last_applied) {
            Some(t) => t,
            None => return,
        };
        let meta = SnapshotMeta {
            last_index: last_applied,
            last_term: snapshot_term,
            membership: self.state.read().membership.clone(),
        };

        if let Err(e) = self.storage.save_snapshot(&snapshot_data, &meta) {
            error!(error = %e, "Failed to save snapshot");
            return;
        }

        self.log.write().compact(last_applied, snapshot_term);
        if let Err(e) = self.storage.compact_prefix(last_applied) {
            error!(error = %e, "Failed to compact log prefix");
        }

        info!(
            node_id = self.config.node_id,
            last_applied,
            size = snapshot_data.len(),
            "Created snapshot"
        );
    }

    /// Handle InstallSnapshot chunks from the leader.
    fn handle_install_snapshot(&self, request: InstallSnapshotRequest) -> InstallSnapshotResponse {
        let mut state = self.state.write();

        if request.term > state.current_term() {
            state.become_follower(request.term, Some(request.leader_id));
            self.persist_state(&state);
        }

        if request.term < state.current_term() {
            return InstallSnapshotResponse {
                term: state.current_term(),
                next_offset: 0,
                done: false,
            };
        }

        state.leader_id = Some(request.leader_id);

        let mut pending = self.pending_snapshot.write();

        if request.offset == 0 {
            *pending = Some(PendingSnapshot {
                data: Vec::new(),
                last_included_index: request.last_included_index,
                last_included_term: request.last_included_term,
                membership: request.membership.clone(),
                next_offset: 0,
            });
        }

        let snapshot = match pending.as_mut() {
            Some(s) => s,
            None => {
                warn!("Snapshot chunk arrived without an initial chunk");
                return InstallSnapshotResponse {
                    term: state.current_term(),
                    next_offset: 0,
                    done: false,
                };
            }
        };

        if request.offset != snapshot.next_offset {
            warn!(
                expected = snapshot.next_offset,
                received = request.offset,
                "Snapshot chunk offset mismatch"
            );
            return InstallSnapshotResponse {
                term: state.current_term(),
                next_offset: snapshot.next_offset,
                done: false,
            };
        }

        snapshot.data.extend_from_slice(&request.data);
        snapshot.next_offset += request.data.len() as u64;

        let final_next_offset = snapshot.next_offset;
        if !request.done {
            return InstallSnapshotResponse {
                term: state.current_term(),
                next_offset: final_next_offset,
                done: false,
            };
        }

        // Final chunk: persist, restore, compact, adopt the snapshot's
        // configuration. Nothing is touched until the whole image is here.
        let snapshot_data = snapshot.data.clone();
        let meta = SnapshotMeta {
            last_index: snapshot.last_included_index,
            last_term: snapshot.last_included_term,
            membership: snapshot.membership.clone(),
        };
        *pending = None;
        drop(pending);

        info!(
            node_id = self.config.node_id,
            index = meta.last_index,
            term = meta.last_term,
            size = snapshot_data.len(),
            "Received complete snapshot"
        );

        if let Err(e) = self.storage.save_snapshot(&snapshot_data, &meta) {
            error!(error = %e, "Failed to persist received snapshot");
            return InstallSnapshotResponse {
                term: state.current_term(),
                next_offset: 0,
                done: false,
            };
        }

        if let Err(e) = self.state_machine.write().restore(&snapshot_data) {
            error!(error = %e, "Failed to restore state machine from snapshot");
            return InstallSnapshotResponse {
                term: state.current_term(),
                next_offset: 0,
                done: false,
            };
        }

        self.log.write().compact(meta.last_index, meta.last_term);
        if let Err(e) = self.storage.compact_prefix(meta.last_index) {
            error!(error = %e, "Failed to compact log prefix after snapshot");
        }

        state.volatile.commit_index = state.volatile.commit_index.max(meta.last_index);
        state.volatile.last_applied = meta.last_index;
        state.membership = meta.membership;
        state.pending_config = None;

        InstallSnapshotResponse {
            term: state.current_term(),
            next_offset: final_next_offset,
            done: true,
        }
    }

    /// Stream the current snapshot to a follower whose next entry was
    /// compacted away. Runs on its own task so a slow follower cannot stall
    /// heartbeats, elections, or RPC handling; at most one stream per
    /// follower is in flight.
    fn spawn_snapshot_stream(&self, follower_id: NodeId) {
        if !self.snapshot_streams.write().insert(follower_id) {
            return;
        }

        let rpc = Arc::clone(&self.rpc);
        let storage = Arc::clone(&self.storage);
        let state = Arc::clone(&self.state);
        let streams = Arc::clone(&self.snapshot_streams);
        let node_id = self.config.node_id;
        let chunk_size = self.config.snapshot_chunk_size;

        tokio::spawn(async move {
            if let Err(e) =
                stream_snapshot(rpc, storage, state, node_id, chunk_size, follower_id).await
            {
                warn!(error = %e, follower = follower_id, "Snapshot streaming failed");
            }
            streams.write().remove(&follower_id);
        });
    }

    fn persist_state(&self, state: &RaftState) {
        if let Err(e) = self.storage.save_persistent_state(&state.persistent) {
            error!(error = %e, "Failed to persist term and vote");
        }
    }

    fn reset_election_deadline(&self) -> Instant {
        let mut rng = rand::thread_rng();
        let timeout =
            rng.gen_range(self.config.election_timeout_min..=self.config.election_timeout_max);
        Instant::now() + timeout
    }
}

/// The chunk loop behind [`RaftNode::spawn_snapshot_stream`]. On completion
/// the follower's match index jumps to the snapshot boundary, provided this
/// node still leads at the term the stream started under.
async fn stream_snapshot(
    rpc: Arc<dyn RaftRpc>,
    storage: Arc<RaftStorage>,
    state: Arc<RwLock<RaftState>>,
    node_id: NodeId,
    chunk_size: usize,
    follower_id: NodeId,
) -> Result<()> {
    let (data, meta) = match storage.load_snapshot()? {
        Some(s) => s,
        None => {
            return Err(CanopyError::Internal(
                "no snapshot available for lagging follower".to_string(),
            ))
        }
    };

    let term = state.read().current_term();
    let mut offset = 0u64;

    info!(
        node_id,
        follower = follower_id,
        size = data.len(),
        "Streaming snapshot to follower"
    );

    loop {
        let end = ((offset as usize) + chunk_size).min(data.len());
        let chunk = data[offset as usize..end].to_vec();
        let done = end >= data.len();

        let request = InstallSnapshotRequest {
            term,
            leader_id: node_id,
            last_included_index: meta.last_index,
            last_included_term: meta.last_term,
            membership: meta.membership.clone(),
            offset,
            data: chunk,
            done,
        };

        match timeout(
            Duration::from_secs(10),
            rpc.install_snapshot(follower_id, request),
        )
        .await
        {
            Ok(Ok(response)) => {
                if response.term > term {
                    let mut state = state.write();
                    state.become_follower(response.term, None);
                    if let Err(e) = storage.save_persistent_state(&state.persistent) {
                        error!(error = %e, "Failed to persist term and vote");
                    }
                    return Err(CanopyError::NotLeader { leader: None });
                }

                if response.done {
                    let mut state = state.write();
                    if state.is_leader() && state.current_term() == term {
                        if let Some(leader) = state.leader.as_mut() {
                            leader.update_match(follower_id, meta.last_index);
                        }
                    }
                    return Ok(());
                }

                offset = response.next_offset;
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(CanopyError::Timeout(
                    "snapshot chunk delivery timed out".to_string(),
                ))
            }
        }
    }
}
