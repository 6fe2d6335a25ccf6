//! Core type definitions for the Canopy coordination store.
//!
//! # Key types
//!
//! - [`Membership`]: the cluster's voting configuration, mapping server ids
//!   to voting weights, with the weighted-quorum arithmetic used by both
//!   elections and commit advancement.
//! - [`ConfigChange`]: the payload of a `Configuration` log entry.
//!
//! # Type aliases
//!
//! - [`NodeId`] = `u64`: cluster server identifier
//! - [`Term`] = `u64`: Raft election epoch
//! - [`LogIndex`] = `u64`: Raft log position

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Unique identifier for a server in the cluster.
pub type NodeId = u64;

/// Raft term number.
pub type Term = u64;

/// Raft log index.
pub type LogIndex = u64;

/// Voting weight of a server. Zero means the server replicates the log but
/// never counts toward a quorum (a learner).
pub type Weight = u64;

/// The cluster's voting configuration.
///
/// Quorums are weighted: a set of servers forms a quorum when their summed
/// weight strictly exceeds half the total voting weight. With all weights at
/// one this degenerates to the usual majority rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    /// Voting weight per server, including this node. BTreeMap keeps the
    /// serialized form deterministic across replicas.
    weights: BTreeMap<NodeId, Weight>,
}

impl Membership {
    /// Build a membership from (server id, weight) pairs.
    pub fn new(servers: impl IntoIterator<Item = (NodeId, Weight)>) -> Self {
        Self {
            weights: servers.into_iter().collect(),
        }
    }

    /// Total voting weight across all servers.
    pub fn total_weight(&self) -> u64 {
        self.weights.values().sum()
    }

    /// Voting weight of one server (0 when unknown).
    pub fn weight_of(&self, id: NodeId) -> Weight {
        self.weights.get(&id).copied().unwrap_or(0)
    }

    /// Whether the server is a known member (voter or learner).
    pub fn contains(&self, id: NodeId) -> bool {
        self.weights.contains_key(&id)
    }

    /// Whether the server participates in quorum counting.
    pub fn is_voter(&self, id: NodeId) -> bool {
        self.weight_of(id) > 0
    }

    /// Whether `weight_sum` exceeds half the total voting weight.
    pub fn is_quorum(&self, weight_sum: u64) -> bool {
        weight_sum * 2 > self.total_weight()
    }

    /// Set a server's voting weight. Inserts the server if unknown.
    pub fn set_weight(&mut self, id: NodeId, weight: Weight) {
        self.weights.insert(id, weight);
    }

    /// All member server ids.
    pub fn server_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.weights.keys().copied()
    }
}

/// A configuration mutation replicated as a `Configuration` log entry.
///
/// Subject to single-change-at-a-time discipline: a leader refuses a new
/// change while a previous one is still uncommitted, and the change only
/// takes effect for quorum purposes once it is committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigChange {
    /// Change a server's voting weight (weight 0 demotes it to a learner).
    SetWeight { server_id: NodeId, weight: Weight },
}
