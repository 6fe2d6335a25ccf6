//! Configuration for a Canopy node.

use crate::error::{CanopyError, Result};
use crate::types::{NodeId, Weight};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration for a Canopy node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanopyConfig {
    /// Node identity.
    pub node: NodeConfig,
    /// Cluster membership and consensus timing.
    pub cluster: ClusterConfig,
    /// Durable storage configuration.
    pub storage: StorageConfig,
    /// Logging configuration.
    pub observability: ObservabilityConfig,
}

/// Identity of this node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// This node's id. Must be non-zero and appear in `cluster.servers`.
    pub id: NodeId,
    /// Human-readable node name for logs.
    pub name: String,
}

/// One server in the cluster configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEntry {
    pub id: NodeId,
    /// host:port the server's RPC adapter listens on.
    pub address: String,
    /// Voting weight; 0 makes the server a non-voting learner.
    #[serde(default = "default_weight")]
    pub weight: Weight,
}

fn default_weight() -> Weight {
    1
}

fn default_vote_rpc_timeout() -> Duration {
    Duration::from_millis(100)
}

fn default_append_rpc_timeout() -> Duration {
    Duration::from_millis(50)
}

/// Cluster membership and consensus timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Address this node binds its RPC adapter to.
    pub bind_addr: SocketAddr,
    /// All servers in the cluster, including this one.
    pub servers: Vec<ServerEntry>,
    /// Minimum election timeout.
    #[serde(with = "duration_millis")]
    pub election_timeout_min: Duration,
    /// Maximum election timeout.
    #[serde(with = "duration_millis")]
    pub election_timeout_max: Duration,
    /// Heartbeat interval; must be smaller than the minimum election timeout.
    #[serde(with = "duration_millis")]
    pub heartbeat_interval: Duration,
    /// How long to wait for one RequestVote response.
    #[serde(with = "duration_millis", default = "default_vote_rpc_timeout")]
    pub vote_rpc_timeout: Duration,
    /// How long to wait for one AppendEntries response.
    #[serde(with = "duration_millis", default = "default_append_rpc_timeout")]
    pub append_rpc_timeout: Duration,
    /// Maximum entries per AppendEntries RPC.
    pub max_entries_per_append: usize,
    /// Applied entries since the last compaction before a snapshot is taken.
    pub snapshot_threshold: usize,
    /// Chunk size for InstallSnapshot streaming.
    pub snapshot_chunk_size: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 7201)),
            servers: Vec::new(),
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(50),
            vote_rpc_timeout: default_vote_rpc_timeout(),
            append_rpc_timeout: default_append_rpc_timeout(),
            max_entries_per_append: 100,
            snapshot_threshold: 10000,
            snapshot_chunk_size: 1024 * 1024,
        }
    }
}

/// Durable storage configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the durable log, snapshots, and persisted state.
    pub data_dir: PathBuf,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level filter (trace, debug, info, warn, error).
    pub log_level: String,
    /// Emit JSON-formatted logs.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

impl CanopyConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CanopyError::Config(format!("failed to read config file: {}", e)))?;

        let config: Self = serde_json::from_str(&content)
            .map_err(|e| CanopyError::Config(format!("failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.node.id == 0 {
            return Err(CanopyError::InvalidConfig {
                field: "node.id".to_string(),
                reason: "node id must be non-zero".to_string(),
            });
        }

        if !self.cluster.servers.iter().any(|s| s.id == self.node.id) {
            return Err(CanopyError::InvalidConfig {
                field: "cluster.servers".to_string(),
                reason: format!("this node ({}) is not listed", self.node.id),
            });
        }

        if self.cluster.servers.iter().all(|s| s.weight == 0) {
            return Err(CanopyError::InvalidConfig {
                field: "cluster.servers".to_string(),
                reason: "at least one server must have a non-zero weight".to_string(),
            });
        }

        if self.cluster.heartbeat_interval >= self.cluster.election_timeout_min {
            return Err(CanopyError::InvalidConfig {
                field: "cluster.heartbeat_interval".to_string(),
                reason: "heartbeat interval must be below the minimum election timeout"
                    .to_string(),
            });
        }

        if self.cluster.election_timeout_min > self.cluster.election_timeout_max {
            return Err(CanopyError::InvalidConfig {
                field: "cluster.election_timeout_min".to_string(),
                reason: "minimum election timeout exceeds the maximum".to_string(),
            });
        }

        Ok(())
    }

    /// Create a minimal single-node development configuration.
    pub fn development() -> Self {
        Self {
            node: NodeConfig {
                id: 1,
                name: "dev-node".to_string(),
            },
            cluster: ClusterConfig {
                servers: vec![ServerEntry {
                    id: 1,
                    address: "127.0.0.1:7201".to_string(),
                    weight: 1,
                }],
                ..ClusterConfig::default()
            },
            storage: StorageConfig {
                data_dir: PathBuf::from("/tmp/canopy-dev"),
            },
            observability: ObservabilityConfig::default(),
        }
    }
}

/// Serde helper for durations stored as integer milliseconds.
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
