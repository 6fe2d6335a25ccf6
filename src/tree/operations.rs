//! Tree operation and outcome types.
//!
//! A read-write request is `{optional condition, exactly one WriteOp}` and is
//! serialized whole into the log, so the condition is evaluated against the
//! tree as it stands when the entry is applied. Read-only operations never
//! enter the log.

use serde::{Deserialize, Serialize};

/// Outcome status of a tree operation.
///
/// `NotLeader` and `Retry` are never produced by the tree itself; the service
/// adapter maps consensus errors onto them so clients see one status space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Ok,
    ConditionNotMet,
    LookupError,
    TypeError,
    ObjectNotEmpty,
    InvalidRequest,
    NotLeader,
    Retry,
}

/// A compare precondition: the node at `path` must be a file whose contents
/// equal `contents` exactly. Anything else (missing node, directory,
/// different contents) fails the whole request with `ConditionNotMet`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    pub path: String,
    #[serde(with = "serde_bytes")]
    pub contents: Vec<u8>,
}

/// Mutating tree operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteOp {
    MakeDirectory {
        path: String,
    },
    RemoveDirectory {
        path: String,
    },
    Write {
        path: String,
        #[serde(with = "serde_bytes")]
        contents: Vec<u8>,
    },
    RemoveFile {
        path: String,
    },
}

impl WriteOp {
    /// The target path, for logging.
    pub fn path(&self) -> &str {
        match self {
            WriteOp::MakeDirectory { path }
            | WriteOp::RemoveDirectory { path }
            | WriteOp::Write { path, .. }
            | WriteOp::RemoveFile { path } => path,
        }
    }
}

/// Non-mutating tree operations, served after a read barrier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadOnlyOp {
    Read { path: String },
    ListDirectory { path: String },
}

/// One replicated tree mutation: the log payload for a `Command` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeCommand {
    pub condition: Option<Condition>,
    pub op: WriteOp,
}

/// The applied result of a [`TreeCommand`], delivered back to the proposer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub status: Status,
    /// Human-readable detail when `status != Ok`.
    pub error: Option<String>,
}

impl CommandOutcome {
    pub fn ok() -> Self {
        Self {
            status: Status::Ok,
            error: None,
        }
    }

    pub fn failed(status: Status, message: impl Into<String>) -> Self {
        Self {
            status,
            error: Some(message.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }
}

impl From<TreeError> for CommandOutcome {
    fn from(e: TreeError) -> Self {
        Self {
            status: e.status,
            error: Some(e.message),
        }
    }
}

/// A failed tree operation: a status plus detail. These are outcomes, not
/// engine errors; they replicate and apply like any success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeError {
    pub status: Status,
    pub message: String,
}

impl TreeError {
    pub fn new(status: Status, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for TreeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.status, self.message)
    }
}

pub type TreeResult<T> = std::result::Result<T, TreeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_screaming_snake() {
        let json = serde_json::to_string(&Status::ConditionNotMet).unwrap();
        assert_eq!(json, "\"CONDITION_NOT_MET\"");
        let back: Status = serde_json::from_str("\"OBJECT_NOT_EMPTY\"").unwrap();
        assert_eq!(back, Status::ObjectNotEmpty);
    }

    #[test]
    fn command_round_trips_through_bincode() {
        let cmd = TreeCommand {
            condition: Some(Condition {
                path: "/locks/a".to_string(),
                contents: b"owner-1".to_vec(),
            }),
            op: WriteOp::Write {
                path: "/locks/a".to_string(),
                contents: b"owner-2".to_vec(),
            },
        };
        let bytes = bincode::serialize(&cmd).unwrap();
        let back: TreeCommand = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, cmd);
    }

    #[test]
    fn outcome_from_tree_error() {
        let outcome: CommandOutcome =
            TreeError::new(Status::LookupError, "no such path").into();
        assert_eq!(outcome.status, Status::LookupError);
        assert!(!outcome.is_ok());
    }
}
