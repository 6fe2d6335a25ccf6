//! Durable log and snapshot store, backed by RocksDB.
//!
//! Entries are keyed by a fixed prefix plus a big-endian index so a forward
//! iterator yields them in log order. Appends are flushed before returning:
//! an entry must be durable before it is acknowledged to the leader, or a
//! crash could un-replicate something a quorum already counted.

use super::{LogEntry, PersistentState};
use crate::error::{CanopyError, Result};
use crate::types::{LogIndex, Membership, Term};
use rocksdb::{Options, DB};
use serde::{Deserialize, Serialize};
use std::path::Path;

const PERSISTENT_STATE_KEY: &[u8] = b"raft_persistent_state";
const LOG_PREFIX: &[u8] = b"raft_log_";
const SNAPSHOT_KEY: &[u8] = b"raft_snapshot";
const SNAPSHOT_META_KEY: &[u8] = b"raft_snapshot_meta";

/// Snapshot metadata persisted alongside the snapshot bytes. Carries the
/// voting configuration as of the snapshot so a restoring server does not
/// need any log entry to know who votes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub last_index: LogIndex,
    pub last_term: Term,
    pub membership: Membership,
}

/// Durable Raft state: term/vote, the log suffix, and the latest snapshot.
pub struct RaftStorage {
    db: DB,
}

impl RaftStorage {
    /// Open or create the store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let db = DB::open(&opts, path)?;
        Ok(Self { db })
    }

    /// Load the persisted term and vote, if the server has run before.
    pub fn load_persistent_state(&self) -> Result<Option<PersistentState>> {
        match self.db.get(PERSISTENT_STATE_KEY)? {
            Some(data) => {
                let state: PersistentState = bincode::deserialize(&data)?;
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    /// Persist the term and vote. Must complete before responding to any
    /// RPC that changed them.
    pub fn save_persistent_state(&self, state: &PersistentState) -> Result<()> {
        let data = bincode::serialize(state)?;
        self.db.put(PERSISTENT_STATE_KEY, data)?;
        self.db.flush()?;
        Ok(())
    }

    /// Durably append log entries. Overwrites any stale entries at the same
    /// indexes, which is how follower-side conflict truncation lands on disk.
    pub fn append_entries(&self, entries: &[LogEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut batch = rocksdb::WriteBatch::default();

        for entry in entries {
            let key = log_key(entry.index);
            let value = bincode::serialize(entry)?;
            batch.put(&key, value);
        }

        self.db.write(batch)?;
        self.db.flush()?;
        Ok(())
    }

    /// Load a single entry by index.
    pub fn entry(&self, index: LogIndex) -> Result<Option<LogEntry>> {
        let key = log_key(index);
        match self.db.get(&key)? {
            Some(data) => {
                let entry: LogEntry = bincode::deserialize(&data)?;
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    /// Load all retained entries starting at `start_index`, in log order.
    pub fn entries_from(&self, start_index: LogIndex) -> Result<Vec<LogEntry>> {
        let mut entries = Vec::new();
        let start_key = log_key(start_index);

        let iter = self.db.iterator(rocksdb::IteratorMode::From(
            &start_key,
            rocksdb::Direction::Forward,
        ));

        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(LOG_PREFIX) {
                break;
            }
            let entry: LogEntry = bincode::deserialize(&value)?;
            entries.push(entry);
        }

        Ok(entries)
    }

    /// Delete entries at and above `from_index` (conflict truncation).
    pub fn truncate_suffix(&self, from_index: LogIndex) -> Result<()> {
        let mut batch = rocksdb::WriteBatch::default();
        let start_key = log_key(from_index);

        let iter = self.db.iterator(rocksdb::IteratorMode::From(
            &start_key,
            rocksdb::Direction::Forward,
        ));

        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(LOG_PREFIX) {
                break;
            }
            batch.delete(&key);
        }

        self.db.write(batch)?;
        self.db.flush()?;
        Ok(())
    }

    /// Delete entries up to and including `up_to_index`; the snapshot at
    /// that position covers the discarded prefix.
    pub fn compact_prefix(&self, up_to_index: LogIndex) -> Result<()> {
        let mut batch = rocksdb::WriteBatch::default();
        let start_key = log_key(1);
        let end_key = log_key(up_to_index + 1);

        let iter = self.db.iterator(rocksdb::IteratorMode::From(
            &start_key,
            rocksdb::Direction::Forward,
        ));

        for item in iter {
            let (key, _) = item?;
            if key.as_ref() >= end_key.as_slice() || !key.starts_with(LOG_PREFIX) {
                break;
            }
            batch.delete(&key);
        }

        self.db.write(batch)?;
        Ok(())
    }

    /// Atomically persist a snapshot and its metadata. The snapshot and the
    /// log compaction that follows are separate steps on purpose: a crash in
    /// between leaves both the snapshot and the uncompacted prefix valid.
    pub fn save_snapshot(&self, data: &[u8], meta: &SnapshotMeta) -> Result<()> {
        let meta_data = bincode::serialize(meta)?;

        let mut batch = rocksdb::WriteBatch::default();
        batch.put(SNAPSHOT_KEY, data);
        batch.put(SNAPSHOT_META_KEY, meta_data);
        self.db.write(batch)?;
        self.db.flush()?;

        Ok(())
    }

    /// Load the latest snapshot and its metadata.
    pub fn load_snapshot(&self) -> Result<Option<(Vec<u8>, SnapshotMeta)>> {
        let meta_data = match self.db.get(SNAPSHOT_META_KEY)? {
            Some(d) => d,
            None => return Ok(None),
        };

        let snapshot_data = match self.db.get(SNAPSHOT_KEY)? {
            Some(d) => d,
            None => return Ok(None),
        };

        let meta: SnapshotMeta = bincode::deserialize(&meta_data)?;
        Ok(Some((snapshot_data.to_vec(), meta)))
    }

    /// First and last retained log indexes, if any entries are stored.
    pub fn log_bounds(&self) -> Result<Option<(LogIndex, LogIndex)>> {
        let mut first: Option<LogIndex> = None;
        let mut last: Option<LogIndex> = None;

        let iter = self.db.iterator(rocksdb::IteratorMode::From(
            LOG_PREFIX,
            rocksdb::Direction::Forward,
        ));

        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(LOG_PREFIX) {
                break;
            }
            let index = parse_log_key(&key)?;
            if first.is_none() {
                first = Some(index);
            }
            last = Some(index);
        }

        match (first, last) {
            (Some(f), Some(l)) => Ok(Some((f, l))),
            _ => Ok(None),
        }
    }
}

fn log_key(index: LogIndex) -> Vec<u8> {
    let mut key = LOG_PREFIX.to_vec();
    key.extend_from_slice(&index.to_be_bytes());
    key
}

fn parse_log_key(key: &[u8]) -> Result<LogIndex> {
    if key.len() < LOG_PREFIX.len() + 8 {
        return Err(CanopyError::Storage("invalid log key".into()));
    }
    let index_bytes: [u8; 8] = key[LOG_PREFIX.len()..]
        .try_into()
        .map_err(|_| CanopyError::Storage("invalid log key".into()))?;
    Ok(LogIndex::from_be_bytes(index_bytes))
}
