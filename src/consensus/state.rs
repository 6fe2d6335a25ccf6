//! Raft node state management.

use crate::types::{LogIndex, Membership, NodeId, Term};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The role of a Raft node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    /// Passive, responds to RPCs.
    Follower,
    /// Actively seeking election.
    Candidate,
    /// Handles client requests and drives replication.
    Leader,
}

impl NodeState {
    pub fn is_leader(&self) -> bool {
        matches!(self, NodeState::Leader)
    }

    pub fn is_follower(&self) -> bool {
        matches!(self, NodeState::Follower)
    }

    pub fn is_candidate(&self) -> bool {
        matches!(self, NodeState::Candidate)
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Follower => write!(f, "Follower"),
            NodeState::Candidate => write!(f, "Candidate"),
            NodeState::Leader => write!(f, "Leader"),
        }
    }
}

/// State that must survive restarts. `current_term` is monotonic for the
/// life of the server; `voted_for` prevents double-voting within a term.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistentState {
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
}

/// Volatile state on all servers.
#[derive(Debug, Clone, Default)]
pub struct VolatileState {
    /// Highest log index known to be committed.
    pub commit_index: LogIndex,
    /// Highest log index applied to the state machine.
    /// Invariant: `last_applied <= commit_index`.
    pub last_applied: LogIndex,
}

/// Volatile state tracked by leaders for each peer.
#[derive(Debug, Clone)]
pub struct LeaderState {
    /// Next log index to send to each peer. Per-peer streams are strictly
    /// ordered; this only moves after an acknowledged response.
    pub next_index: HashMap<NodeId, LogIndex>,
    /// Highest log index known replicated on each peer.
    pub match_index: HashMap<NodeId, LogIndex>,
}

impl LeaderState {
    pub fn new(peers: &[NodeId], last_log_index: LogIndex) -> Self {
        let mut next_index = HashMap::new();
        let mut match_index = HashMap::new();

        for &peer in peers {
            next_index.insert(peer, last_log_index + 1);
            match_index.insert(peer, 0);
        }

        Self {
            next_index,
            match_index,
        }
    }

    /// Record a successful replication up to `match_index`.
    pub fn update_match(&mut self, peer: NodeId, match_index: LogIndex) {
        self.match_index.insert(peer, match_index);
        self.next_index.insert(peer, match_index + 1);
    }

    /// Back off after a consistency-check failure.
    pub fn decrement_next(&mut self, peer: NodeId) {
        if let Some(next) = self.next_index.get_mut(&peer) {
            *next = next.saturating_sub(1).max(1);
        }
    }
}

/// Complete Raft state for one node.
#[derive(Debug)]
pub struct RaftState {
    pub node_id: NodeId,
    pub state: NodeState,
    /// Last known leader, used as the hint in NotLeader responses.
    pub leader_id: Option<NodeId>,
    pub persistent: PersistentState,
    pub volatile: VolatileState,
    /// Leader-only bookkeeping, present iff `state == Leader`.
    pub leader: Option<LeaderState>,
    /// The committed voting configuration. Configuration entries update this
    /// only once they commit.
    pub membership: Membership,
    /// Index of an appended-but-uncommitted Configuration entry, if any.
    /// Enforces single-change-at-a-time discipline.
    pub pending_config: Option<LogIndex>,
}

impl RaftState {
    pub fn new(node_id: NodeId, membership: Membership) -> Self {
        Self {
            node_id,
            state: NodeState::Follower,
            leader_id: None,
            persistent: PersistentState::default(),
            volatile: VolatileState::default(),
            leader: None,
            membership,
            pending_config: None,
        }
    }

    /// Transition to follower at `term`. Resets `voted_for` only when the
    /// term actually advances.
    pub fn become_follower(&mut self, term: Term, leader_id: Option<NodeId>) {
        if term > self.persistent.current_term {
            self.persistent.voted_for = None;
        }
        self.state = NodeState::Follower;
        self.persistent.current_term = term;
        self.leader_id = leader_id;
        self.leader = None;

        tracing::info!(
            node_id = self.node_id,
            term = term,
            leader = ?leader_id,
            "Became follower"
        );
    }

    /// Transition to candidate: bump the term and vote for ourselves.
    pub fn become_candidate(&mut self) {
        self.state = NodeState::Candidate;
        self.persistent.current_term += 1;
        self.persistent.voted_for = Some(self.node_id);
        self.leader_id = None;
        self.leader = None;

        tracing::info!(
            node_id = self.node_id,
            term = self.persistent.current_term,
            "Became candidate"
        );
    }

    /// Transition to leader after winning an election.
    pub fn become_leader(&mut self, last_log_index: LogIndex) {
        let peers: Vec<NodeId> = self
            .membership
            .server_ids()
            .filter(|&id| id != self.node_id)
            .collect();
        self.state = NodeState::Leader;
        self.leader_id = Some(self.node_id);
        self.leader = Some(LeaderState::new(&peers, last_log_index));

        tracing::info!(
            node_id = self.node_id,
            term = self.persistent.current_term,
            "Became leader"
        );
    }

    pub fn is_leader(&self) -> bool {
        self.state.is_leader()
    }

    pub fn current_term(&self) -> Term {
        self.persistent.current_term
    }

    /// Whether the granted votes form a weighted quorum of the committed
    /// configuration.
    pub fn votes_are_quorum(&self, granted: &[NodeId]) -> bool {
        let weight: u64 = granted
            .iter()
            .map(|&id| self.membership.weight_of(id))
            .sum();
        self.membership.is_quorum(weight)
    }

    /// Compute the highest index a weighted quorum has replicated, subject
    /// to the current-term rule: an index only commits if the entry there
    /// carries the leader's current term. `term_at` answers the term of a
    /// retained index.
    pub fn calculate_commit_index<F>(&self, last_log_index: LogIndex, term_at: F) -> LogIndex
    where
        F: Fn(LogIndex) -> Option<Term>,
    {
        let leader_state = match (&self.leader, self.is_leader()) {
            (Some(l), true) => l,
            _ => return self.volatile.commit_index,
        };

        let mut candidate = last_log_index;
        while candidate > self.volatile.commit_index {
            // The leader's own log always holds everything through
            // last_log_index.
            let mut weight = self.membership.weight_of(self.node_id);
            for (&peer, &matched) in &leader_state.match_index {
                if matched >= candidate {
                    weight += self.membership.weight_of(peer);
                }
            }

            if self.membership.is_quorum(weight) {
                // Never commit an earlier-term entry by counting replicas
                // alone; it must be covered by a current-term entry.
                if term_at(candidate) == Some(self.persistent.current_term) {
                    return candidate;
                }
            }
            candidate -= 1;
        }

        self.volatile.commit_index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Membership;

    fn three_node_state() -> RaftState {
        RaftState::new(1, Membership::new([(1, 1), (2, 1), (3, 1)]))
    }

    #[test]
    fn test_initial_state() {
        let state = three_node_state();
        assert!(state.state.is_follower());
        assert_eq!(state.current_term(), 0);
        assert!(state.leader_id.is_none());
        assert!(state.pending_config.is_none());
    }

    #[test]
    fn test_become_candidate() {
        let mut state = three_node_state();
        state.become_candidate();

        assert!(state.state.is_candidate());
        assert_eq!(state.current_term(), 1);
        assert_eq!(state.persistent.voted_for, Some(1));
    }

    #[test]
    fn test_become_leader_initializes_peer_tracking() {
        let mut state = three_node_state();
        state.become_candidate();
        state.become_leader(5);

        assert!(state.state.is_leader());
        assert_eq!(state.leader_id, Some(1));

        let leader = state.leader.as_ref().unwrap();
        assert_eq!(leader.next_index.get(&2), Some(&6));
        assert_eq!(leader.match_index.get(&2), Some(&0));
        assert!(!leader.next_index.contains_key(&1));
    }

    #[test]
    fn test_follower_keeps_vote_within_same_term() {
        let mut state = three_node_state();
        state.persistent.current_term = 3;
        state.persistent.voted_for = Some(2);

        // Same term: vote must be remembered.
        state.become_follower(3, Some(2));
        assert_eq!(state.persistent.voted_for, Some(2));

        // Higher term: vote resets.
        state.become_follower(4, None);
        assert_eq!(state.persistent.voted_for, None);
    }

    #[test]
    fn test_weighted_vote_quorum() {
        let mut state = RaftState::new(1, Membership::new([(1, 1), (2, 1), (3, 1), (4, 0)]));
        state.become_candidate();

        // Self plus the learner is not a quorum.
        assert!(!state.votes_are_quorum(&[1, 4]));
        // Self plus one voter is.
        assert!(state.votes_are_quorum(&[1, 2]));
    }

    #[test]
    fn test_commit_index_weighted_majority() {
        let mut state = RaftState::new(1, Membership::new([(1, 1), (2, 1), (3, 1), (4, 1), (5, 1)]));
        state.become_candidate();
        state.become_leader(10);

        let leader = state.leader.as_mut().unwrap();
        leader.match_index.insert(2, 8);
        leader.match_index.insert(3, 7);
        leader.match_index.insert(4, 9);
        leader.match_index.insert(5, 6);

        // Replicated indexes are [10(self), 9, 8, 7, 6]; weight 3 of 5 is
        // first reached at index 8.
        let term = state.current_term();
        let commit = state.calculate_commit_index(10, |_| Some(term));
        assert_eq!(commit, 8);
    }

    #[test]
    fn test_commit_index_ignores_learners() {
        let mut state = RaftState::new(1, Membership::new([(1, 1), (2, 1), (3, 1), (4, 0)]));
        state.become_candidate();
        state.become_leader(5);

        let leader = state.leader.as_mut().unwrap();
        // Only the learner has caught up; voters have not.
        leader.match_index.insert(2, 0);
        leader.match_index.insert(3, 0);
        leader.match_index.insert(4, 5);

        let term = state.current_term();
        assert_eq!(state.calculate_commit_index(5, |_| Some(term)), 0);

        // Once one voter catches up, self + voter = 2 of 3 voting weight.
        state.leader.as_mut().unwrap().match_index.insert(2, 5);
        let term = state.current_term();
        assert_eq!(state.calculate_commit_index(5, |_| Some(term)), 5);
    }

    #[test]
    fn test_commit_index_requires_current_term_entry() {
        let mut state = three_node_state();
        state.persistent.current_term = 4;
        state.become_candidate(); // term 5
        state.become_leader(3);

        let leader = state.leader.as_mut().unwrap();
        leader.match_index.insert(2, 3);
        leader.match_index.insert(3, 3);

        // Entries 1..=3 are all from term 2: replicas alone never commit them.
        assert_eq!(state.calculate_commit_index(3, |_| Some(2)), 0);

        // A current-term entry at index 4 commits, covering the prefix.
        let leader = state.leader.as_mut().unwrap();
        leader.match_index.insert(2, 4);
        leader.match_index.insert(3, 4);
        let commit =
            state.calculate_commit_index(4, |i| if i == 4 { Some(5) } else { Some(2) });
        assert_eq!(commit, 4);
    }
}
