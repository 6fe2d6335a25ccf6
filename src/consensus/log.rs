//! Raft log implementation.

use crate::error::{CanopyError, Result};
use crate::types::{LogIndex, Term};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;

/// What a log entry carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    /// A state machine command (a serialized tree mutation).
    Command,
    /// A cluster configuration change, effective once committed.
    Configuration,
    /// An empty entry a new leader appends at its own term so the
    /// current-term commit rule can make progress.
    Noop,
}

/// A single entry in the Raft log.
///
/// The payload is Arc-wrapped so cloning during replication fan-out is O(1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// The term when the entry was created by a leader.
    pub term: Term,
    /// The position of this entry in the log.
    pub index: LogIndex,
    /// What the payload means.
    pub kind: EntryKind,
    /// The payload bytes (empty for noop entries).
    #[serde(with = "arc_bytes")]
    pub data: Arc<Vec<u8>>,
}

impl LogEntry {
    /// Create a command entry.
    pub fn command(term: Term, index: LogIndex, data: Vec<u8>) -> Self {
        Self {
            term,
            index,
            kind: EntryKind::Command,
            data: Arc::new(data),
        }
    }

    /// Create a configuration-change entry.
    pub fn configuration(term: Term, index: LogIndex, data: Vec<u8>) -> Self {
        Self {
            term,
            index,
            kind: EntryKind::Configuration,
            data: Arc::new(data),
        }
    }

    /// Create an empty noop entry.
    pub fn noop(term: Term, index: LogIndex) -> Self {
        Self {
            term,
            index,
            kind: EntryKind::Noop,
            data: Arc::new(Vec::new()),
        }
    }

    /// Get a reference to the payload bytes.
    #[inline]
    pub fn data_bytes(&self) -> &[u8] {
        &self.data
    }
}

/// Serde helper for Arc<Vec<u8>>: serializes as raw bytes, deserializes into
/// an Arc-wrapped Vec.
mod arc_bytes {
    use serde::{Deserializer, Serializer};
    use std::sync::Arc;

    pub fn serialize<S>(data: &Arc<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serde_bytes::serialize(data.as_slice(), serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Arc<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes: Vec<u8> = serde_bytes::deserialize(deserializer)?;
        Ok(Arc::new(bytes))
    }
}

/// The in-memory Raft log. Durability is provided by
/// [`crate::consensus::RaftStorage`]; this structure holds the live suffix
/// starting at `first_index` (everything earlier is covered by a snapshot).
#[derive(Debug)]
pub struct RaftLog {
    entries: VecDeque<LogEntry>,
    /// Index of the first retained entry (after compaction).
    first_index: LogIndex,
    /// Term of the entry at `first_index - 1`, needed for the AppendEntries
    /// consistency check at the compaction boundary.
    snapshot_term: Term,
}

impl RaftLog {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            first_index: 1,
            snapshot_term: 0,
        }
    }

    /// Index of the last log entry (0 when nothing has ever been appended).
    pub fn last_index(&self) -> LogIndex {
        if self.entries.is_empty() {
            self.first_index.saturating_sub(1)
        } else {
            self.first_index + self.entries.len() as u64 - 1
        }
    }

    /// Term of the last log entry.
    pub fn last_term(&self) -> Term {
        self.entries
            .back()
            .map(|e| e.term)
            .unwrap_or(self.snapshot_term)
    }

    /// Index of the first retained entry.
    pub fn first_index(&self) -> LogIndex {
        self.first_index
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append an entry. The index must be exactly `last_index() + 1`; a gap
    /// would break the log-matching property.
    pub fn append(&mut self, entry: LogEntry) -> Result<()> {
        let expected_index = self.last_index() + 1;
        if entry.index != expected_index {
            return Err(CanopyError::RaftLog(format!(
                "expected index {}, got {}",
                expected_index, entry.index
            )));
        }
        self.entries.push_back(entry);
        Ok(())
    }

    /// Get an entry by index, if retained.
    pub fn get(&self, index: LogIndex) -> Option<&LogEntry> {
        if index < self.first_index || index > self.last_index() {
            return None;
        }
        let offset = (index - self.first_index) as usize;
        self.entries.get(offset)
    }

    /// Term at an index. Index 0 and the compaction boundary have known
    /// terms even though they hold no entry.
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        if index == self.first_index - 1 {
            return Some(self.snapshot_term);
        }
        self.get(index).map(|e| e.term)
    }

    /// Entries starting at `start_index`, clamped to what is retained.
    pub fn entries_from(&self, start_index: LogIndex) -> Vec<LogEntry> {
        if start_index > self.last_index() {
            return Vec::new();
        }
        let start = start_index.max(self.first_index);
        let offset = (start - self.first_index) as usize;
        self.entries.iter().skip(offset).cloned().collect()
    }

    /// Up to `limit` entries starting at `start_index`.
    pub fn entries_from_limit(&self, start_index: LogIndex, limit: usize) -> Vec<LogEntry> {
        let mut entries = self.entries_from(start_index);
        entries.truncate(limit);
        entries
    }

    /// Entries in the inclusive range [start, end].
    pub fn entries_range(&self, start: LogIndex, end: LogIndex) -> Vec<LogEntry> {
        self.entries_from(start)
            .into_iter()
            .take_while(|e| e.index <= end)
            .collect()
    }

    /// Remove all entries at or above `index`. Only used on followers when
    /// the leader's log conflicts with ours; a leader never truncates.
    pub fn truncate_suffix(&mut self, index: LogIndex) {
        if index < self.first_index {
            self.entries.clear();
            return;
        }
        let keep = (index - self.first_index) as usize;
        self.entries.truncate(keep);
    }

    /// AppendEntries consistency check: does our log contain an entry with
    /// this term at this index?
    pub fn matches(&self, prev_log_index: LogIndex, prev_log_term: Term) -> bool {
        if prev_log_index == 0 {
            return true;
        }
        match self.term_at(prev_log_index) {
            Some(term) => term == prev_log_term,
            None => false,
        }
    }

    /// Drop entries up to and including `up_to_index`; the snapshot at that
    /// position becomes the authoritative source for the discarded prefix.
    pub fn compact(&mut self, up_to_index: LogIndex, snapshot_term: Term) {
        if up_to_index < self.first_index {
            return;
        }

        let entries_to_remove = (up_to_index - self.first_index + 1) as usize;
        for _ in 0..entries_to_remove.min(self.entries.len()) {
            self.entries.pop_front();
        }

        self.first_index = up_to_index + 1;
        self.snapshot_term = snapshot_term;
    }

    /// Election rule: is a candidate's log at least as up-to-date as ours?
    /// Compared by (last term, last index), higher term wins.
    pub fn is_up_to_date(&self, last_log_index: LogIndex, last_log_term: Term) -> bool {
        let our_last_term = self.last_term();
        let our_last_index = self.last_index();

        if last_log_term != our_last_term {
            last_log_term > our_last_term
        } else {
            last_log_index >= our_last_index
        }
    }
}

impl Default for RaftLog {
    fn default() -> Self {
        Self::new()
    }
}
