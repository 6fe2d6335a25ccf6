//! The replicated tree: a hierarchical namespace of directories and files.
//!
//! Every replica applies the same committed commands in the same order, so
//! `apply` must be deterministic down to the serialized bytes. Children live
//! in BTreeMaps and snapshots are bincode-encoded, which makes two replicas
//! that applied the same prefix byte-identical.
//!
//! Uses snapshot caching: the serialized snapshot is cached and invalidated
//! on mutation, so repeated snapshot() calls between writes are free.

use super::operations::{
    CommandOutcome, Condition, ReadOnlyOp, Status, TreeCommand, TreeResult, WriteOp,
};
use crate::consensus::StateMachine;
use crate::error::Result;
use crate::tree::operations::TreeError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

/// One node in the tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TreeNode {
    Directory(BTreeMap<String, TreeNode>),
    File(#[serde(with = "serde_bytes")] Vec<u8>),
}

impl TreeNode {
    fn is_directory(&self) -> bool {
        matches!(self, TreeNode::Directory(_))
    }
}

/// The tree state machine. The root is always a directory and cannot be
/// replaced by a file.
pub struct TreeStateMachine {
    root: BTreeMap<String, TreeNode>,
    /// Cached serialized snapshot, invalidated on mutation.
    snapshot_cache: Mutex<Option<Vec<u8>>>,
    snapshot_valid: AtomicBool,
}

impl TreeStateMachine {
    pub fn new() -> Self {
        Self {
            root: BTreeMap::new(),
            snapshot_cache: Mutex::new(None),
            snapshot_valid: AtomicBool::new(false),
        }
    }

    #[inline]
    fn invalidate_snapshot_cache(&self) {
        self.snapshot_valid.store(false, Ordering::Release);
    }

    /// Split a path into components. Paths must begin with '/'; empty
    /// components ("//", trailing '/') are ignored. The root is the empty
    /// component list.
    pub fn parse_path(path: &str) -> TreeResult<Vec<&str>> {
        if !path.starts_with('/') {
            return Err(TreeError::new(
                Status::InvalidRequest,
                format!("path must begin with '/': {:?}", path),
            ));
        }
        Ok(path.split('/').filter(|c| !c.is_empty()).collect())
    }

    /// Walk to the directory containing the last component. Missing
    /// intermediate nodes are a lookup error; a file in the middle of the
    /// path is a type error. Never called with an empty component list.
    fn resolve_parent<'a>(
        root: &'a BTreeMap<String, TreeNode>,
        components: &[&str],
    ) -> TreeResult<&'a BTreeMap<String, TreeNode>> {
        let mut current = root;
        for component in &components[..components.len() - 1] {
            match current.get(*component) {
                Some(TreeNode::Directory(children)) => current = children,
                Some(TreeNode::File(_)) => {
                    return Err(TreeError::new(
                        Status::TypeError,
                        format!("{} is a file, not a directory", component),
                    ))
                }
                None => {
                    return Err(TreeError::new(
                        Status::LookupError,
                        format!("parent directory {} does not exist", component),
                    ))
                }
            }
        }
        Ok(current)
    }

    fn resolve_parent_mut<'a>(
        root: &'a mut BTreeMap<String, TreeNode>,
        components: &[&str],
    ) -> TreeResult<&'a mut BTreeMap<String, TreeNode>> {
        let mut current = root;
        for component in &components[..components.len() - 1] {
            match current.get_mut(*component) {
                Some(TreeNode::Directory(children)) => current = children,
                Some(TreeNode::File(_)) => {
                    return Err(TreeError::new(
                        Status::TypeError,
                        format!("{} is a file, not a directory", component),
                    ))
                }
                None => {
                    return Err(TreeError::new(
                        Status::LookupError,
                        format!("parent directory {} does not exist", component),
                    ))
                }
            }
        }
        Ok(current)
    }

    /// Read a file's contents.
    pub fn read(&self, path: &str) -> TreeResult<Vec<u8>> {
        let components = Self::parse_path(path)?;
        if components.is_empty() {
            return Err(TreeError::new(
                Status::TypeError,
                "the root is a directory",
            ));
        }
        let parent = Self::resolve_parent(&self.root, &components)?;
        match parent.get(components[components.len() - 1]) {
            Some(TreeNode::File(contents)) => Ok(contents.clone()),
            Some(TreeNode::Directory(_)) => Err(TreeError::new(
                Status::TypeError,
                format!("{} is a directory", path),
            )),
            None => Err(TreeError::new(
                Status::LookupError,
                format!("{} does not exist", path),
            )),
        }
    }

    /// List a directory's children in sorted order. Directories are listed
    /// with a trailing '/'.
    pub fn list_directory(&self, path: &str) -> TreeResult<Vec<String>> {
        let components = Self::parse_path(path)?;
        let children = if components.is_empty() {
            &self.root
        } else {
            let parent = Self::resolve_parent(&self.root, &components)?;
            match parent.get(components[components.len() - 1]) {
                Some(TreeNode::Directory(children)) => children,
                Some(TreeNode::File(_)) => {
                    return Err(TreeError::new(
                        Status::TypeError,
                        format!("{} is a file", path),
                    ))
                }
                None => {
                    return Err(TreeError::new(
                        Status::LookupError,
                        format!("{} does not exist", path),
                    ))
                }
            }
        };

        Ok(children
            .iter()
            .map(|(name, node)| {
                if node.is_directory() {
                    format!("{}/", name)
                } else {
                    name.clone()
                }
            })
            .collect())
    }

    /// Create a directory. The parent must already exist; creating an
    /// existing directory is a no-op.
    pub fn make_directory(&mut self, path: &str) -> TreeResult<()> {
        let components = Self::parse_path(path)?;
        if components.is_empty() {
            // The root always exists.
            return Ok(());
        }
        let parent = Self::resolve_parent_mut(&mut self.root, &components)?;
        let name = components[components.len() - 1];
        match parent.get(name) {
            Some(TreeNode::Directory(_)) => Ok(()),
            Some(TreeNode::File(_)) => Err(TreeError::new(
                Status::TypeError,
                format!("{} exists and is a file", path),
            )),
            None => {
                parent.insert(name.to_string(), TreeNode::Directory(BTreeMap::new()));
                self.invalidate_snapshot_cache();
                Ok(())
            }
        }
    }

    /// Create or overwrite a file.
    pub fn write(&mut self, path: &str, contents: Vec<u8>) -> TreeResult<()> {
        let components = Self::parse_path(path)?;
        if components.is_empty() {
            return Err(TreeError::new(
                Status::TypeError,
                "the root cannot be written as a file",
            ));
        }
        let parent = Self::resolve_parent_mut(&mut self.root, &components)?;
        let name = components[components.len() - 1];
        match parent.get(name) {
            Some(TreeNode::Directory(_)) => Err(TreeError::new(
                Status::TypeError,
                format!("{} is a directory", path),
            )),
            _ => {
                parent.insert(name.to_string(), TreeNode::File(contents));
                self.invalidate_snapshot_cache();
                Ok(())
            }
        }
    }

    /// Remove a file. Idempotent: a missing target is OK.
    pub fn remove_file(&mut self, path: &str) -> TreeResult<()> {
        let components = Self::parse_path(path)?;
        if components.is_empty() {
            return Err(TreeError::new(
                Status::TypeError,
                "the root is a directory",
            ));
        }
        let parent = Self::resolve_parent_mut(&mut self.root, &components)?;
        let name = components[components.len() - 1];
        match parent.get(name) {
            Some(TreeNode::File(_)) => {
                parent.remove(name);
                self.invalidate_snapshot_cache();
                Ok(())
            }
            Some(TreeNode::Directory(_)) => Err(TreeError::new(
                Status::TypeError,
                format!("{} is a directory", path),
            )),
            None => Ok(()),
        }
    }

    /// Remove an empty directory. Idempotent: a missing target is OK.
    /// Removing the root succeeds only when it is empty, and leaves it in
    /// place.
    pub fn remove_directory(&mut self, path: &str) -> TreeResult<()> {
        let components = Self::parse_path(path)?;
        if components.is_empty() {
            return if self.root.is_empty() {
                Ok(())
            } else {
                Err(TreeError::new(
                    Status::ObjectNotEmpty,
                    "the root directory is not empty",
                ))
            };
        }
        let parent = Self::resolve_parent_mut(&mut self.root, &components)?;
        let name = components[components.len() - 1];
        match parent.get(name) {
            Some(TreeNode::Directory(children)) => {
                if !children.is_empty() {
                    return Err(TreeError::new(
                        Status::ObjectNotEmpty,
                        format!("{} is not empty", path),
                    ));
                }
                parent.remove(name);
                self.invalidate_snapshot_cache();
                Ok(())
            }
            Some(TreeNode::File(_)) => Err(TreeError::new(
                Status::TypeError,
                format!("{} is a file", path),
            )),
            None => Ok(()),
        }
    }

    /// Evaluate a condition. Any failure to match, including a missing node
    /// or a directory at the path, is `ConditionNotMet`.
    pub fn check_condition(&self, condition: &Condition) -> TreeResult<()> {
        match self.read(&condition.path) {
            Ok(contents) if contents == condition.contents => Ok(()),
            Ok(_) => Err(TreeError::new(
                Status::ConditionNotMet,
                format!("contents of {} differ", condition.path),
            )),
            Err(e) if e.status == Status::InvalidRequest => Err(e),
            Err(_) => Err(TreeError::new(
                Status::ConditionNotMet,
                format!("{} is not a matching file", condition.path),
            )),
        }
    }

    /// Apply one replicated command: condition first, then the single
    /// operation. A failed condition leaves the tree untouched.
    pub fn apply_command(&mut self, command: &TreeCommand) -> CommandOutcome {
        if let Some(condition) = &command.condition {
            if let Err(e) = self.check_condition(condition) {
                return e.into();
            }
        }

        let result = match &command.op {
            WriteOp::MakeDirectory { path } => self.make_directory(path),
            WriteOp::RemoveDirectory { path } => self.remove_directory(path),
            WriteOp::Write { path, contents } => self.write(path, contents.clone()),
            WriteOp::RemoveFile { path } => self.remove_file(path),
        };

        match result {
            Ok(()) => CommandOutcome::ok(),
            Err(e) => e.into(),
        }
    }

    /// Evaluate a read-only operation, optionally guarded by a condition.
    pub fn read_only(
        &self,
        condition: Option<&Condition>,
        op: &ReadOnlyOp,
    ) -> TreeResult<ReadOnlyResult> {
        if let Some(condition) = condition {
            self.check_condition(condition)?;
        }
        match op {
            ReadOnlyOp::Read { path } => Ok(ReadOnlyResult::Contents(self.read(path)?)),
            ReadOnlyOp::ListDirectory { path } => {
                Ok(ReadOnlyResult::Children(self.list_directory(path)?))
            }
        }
    }
}

/// The successful result of a [`ReadOnlyOp`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOnlyResult {
    Contents(Vec<u8>),
    Children(Vec<String>),
}

impl Default for TreeStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine for TreeStateMachine {
    type Output = CommandOutcome;

    /// Deserialization failures are deterministic: every replica sees the
    /// same bytes and produces the same InvalidRequest outcome, so the
    /// replicas stay identical.
    fn apply(&mut self, data: &[u8]) -> CommandOutcome {
        let command: TreeCommand = match bincode::deserialize(data) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "Undecodable tree command in log");
                return CommandOutcome::failed(
                    Status::InvalidRequest,
                    "undecodable command payload",
                );
            }
        };

        let outcome = self.apply_command(&command);
        debug!(
            op = ?command.op.path(),
            status = ?outcome.status,
            "Applied tree command"
        );
        outcome
    }

    fn snapshot(&self) -> Result<Vec<u8>> {
        if self.snapshot_valid.load(Ordering::Acquire) {
            if let Some(cached) = self.snapshot_cache.lock().as_ref() {
                return Ok(cached.clone());
            }
        }

        let data = bincode::serialize(&self.root)?;
        *self.snapshot_cache.lock() = Some(data.clone());
        self.snapshot_valid.store(true, Ordering::Release);
        Ok(data)
    }

    fn restore(&mut self, data: &[u8]) -> Result<()> {
        self.root = bincode::deserialize(data)?;
        self.invalidate_snapshot_cache();
        Ok(())
    }
}
