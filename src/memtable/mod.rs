//! # Vectorized MemTable
//!
//! The in-memory write buffer of the tree, specialized by primary-key
//! type and laid out for cache-friendly sorting:
//!
//! - **Key/value separation** — values (full row bytes) live in a byte
//!   arena; sorting only touches the fixed-size entry array.
//! - **Integer-key specialization** — `Int` primary keys are stored
//!   inline in the entry (12 bytes + seq), so sorting performs zero
//!   extra memory accesses. `String` and `Double` keys go through a key
//!   arena and a byte-entry layout.
//! - **Lazy sorting** — `put` is an O(1) append; the entry array is
//!   sorted on the first read or serialization after a write, under the
//!   table's internal lock.
//!
//! ## Design Invariants
//!
//! - Every accepted `put` has its WAL record flushed **before** the
//!   in-memory append; a WAL failure leaves the memtable untouched.
//! - Entries sort by `(key ascending, seq ascending)`; among equal keys
//!   the largest `seq` wins and earlier versions are shadowed.
//! - A zero-length value is a tombstone.
//! - Immutable memtables are sorted exactly once and never mutated, so
//!   readers can share them freely.

#[cfg(test)]
mod tests;

pub mod arena;

use std::{
    path::{Path, PathBuf},
    sync::{
        RwLock, RwLockReadGuard,
        atomic::{AtomicU32, AtomicUsize, Ordering},
    },
};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::types::{ValueType, compare_keys, decode_int_key};
use crate::wal::{Wal, WalError};
use arena::Arena;

/// Errors returned by memtable operations.
#[derive(Debug, Error)]
pub enum MemtableError {
    /// Underlying WAL I/O failure; the memtable was not modified.
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    /// Key width does not match the declared primary-key type.
    #[error("invalid key width {got} for primary-key type (expected {expected})")]
    InvalidKeyWidth {
        /// Actual key length in bytes.
        got: usize,
        /// Required length for the declared type.
        expected: usize,
    },

    /// Internal invariant violation or poisoned lock.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result of a memtable point lookup.
#[derive(Debug, PartialEq)]
pub enum MemTableGetResult {
    /// The latest version of the key, with its row bytes.
    Value(Vec<u8>),

    /// The latest version of the key is a deletion.
    Tombstone,

    /// The memtable holds no version of the key.
    NotFound,
}

/// Entry layout for `Int` primary keys — the key is stored inline.
#[derive(Debug, Clone, Copy)]
struct IntEntry {
    key: i32,
    value_offset: u32,
    value_len: u32,
    seq: u32,
}

/// Entry layout for `String` and `Double` primary keys — the key lives
/// in the key arena.
#[derive(Debug, Clone, Copy)]
struct ByteEntry {
    key_offset: u32,
    key_len: u32,
    value_offset: u32,
    value_len: u32,
    seq: u32,
}

struct MemTableInner {
    value_arena: Arena,
    key_arena: Arena,
    int_entries: Vec<IntEntry>,
    byte_entries: Vec<ByteEntry>,
    sorted: bool,
}

impl MemTableInner {
    fn sort(&mut self, key_type: ValueType) {
        if self.sorted {
            return;
        }
        match key_type {
            ValueType::Int => {
                self.int_entries
                    .sort_unstable_by(|a, b| a.key.cmp(&b.key).then(a.seq.cmp(&b.seq)));
            }
            _ => {
                let MemTableInner {
                    byte_entries,
                    key_arena,
                    ..
                } = self;
                byte_entries.sort_unstable_by(|a, b| {
                    let ka = key_arena.slice(a.key_offset, a.key_len);
                    let kb = key_arena.slice(b.key_offset, b.key_len);
                    compare_keys(key_type, ka, kb).then(a.seq.cmp(&b.seq))
                });
            }
        }
        self.sorted = true;
    }

    fn count(&self, key_type: ValueType) -> usize {
        match key_type {
            ValueType::Int => self.int_entries.len(),
            _ => self.byte_entries.len(),
        }
    }
}

/// The vectorized mutable memtable for one table.
///
/// # Concurrency
///
/// Appends and reads synchronize on an internal `RwLock`; the lock is
/// held only for the in-memory portion of an operation (never across
/// the WAL fsync — the WAL has its own mutex). Lazy sorting upgrades to
/// the write lock for the duration of one `sort_unstable` call.
pub struct MemTable {
    id: u64,
    key_type: ValueType,
    wal: Option<Wal>,
    inner: RwLock<MemTableInner>,
    seq: AtomicU32,
    approximate_size: AtomicUsize,
}

impl MemTable {
    /// Create a memtable backed by a WAL at `wal_path`, replaying any
    /// existing records (crash recovery).
    ///
    /// When `write_log` is false no WAL is created and recovery is
    /// skipped; the memtable is purely in-memory.
    pub fn new<P: AsRef<Path>>(
        id: u64,
        key_type: ValueType,
        wal_path: P,
        write_log: bool,
    ) -> Result<Self, MemtableError> {
        let table = Self {
            id,
            key_type,
            wal: if write_log {
                Some(Wal::open(wal_path)?)
            } else {
                None
            },
            inner: RwLock::new(MemTableInner {
                value_arena: Arena::new(),
                key_arena: Arena::new(),
                int_entries: Vec::new(),
                byte_entries: Vec::new(),
                sorted: true,
            }),
            seq: AtomicU32::new(0),
            approximate_size: AtomicUsize::new(0),
        };

        if table.wal.is_some() {
            table.recover_from_wal()?;
        }

        Ok(table)
    }

    fn recover_from_wal(&self) -> Result<(), MemtableError> {
        let Some(wal) = &self.wal else {
            return Ok(());
        };

        let mut recovered = 0usize;
        for record in wal.replay_iter() {
            let (key, value) = record?;
            if let Err(e) = self.apply(&key, &value) {
                // A record with a malformed key cannot be applied; keep
                // the rest of the log.
                warn!(memtable_id = self.id, error = %e, "skipping unusable WAL record");
                continue;
            }
            recovered += 1;
        }
        if recovered > 0 {
            info!(memtable_id = self.id, records = recovered, "memtable recovered from WAL");
        }
        Ok(())
    }

    /// Insert or overwrite a key. A zero-length `value` records a
    /// tombstone.
    ///
    /// The WAL record is flushed first; on WAL failure the memtable is
    /// left unchanged.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<(), MemtableError> {
        self.check_key(key)?;
        if let Some(wal) = &self.wal {
            wal.append(key, value)?;
        }
        self.apply(key, value)
    }

    /// Insert a batch of entries with one WAL flush at the end.
    pub fn put_batch(&self, entries: &[(Vec<u8>, Vec<u8>)]) -> Result<(), MemtableError> {
        for (key, _) in entries {
            self.check_key(key)?;
        }
        if let Some(wal) = &self.wal {
            wal.append_batch(entries)?;
        }
        for (key, value) in entries {
            self.apply(key, value)?;
        }
        Ok(())
    }

    fn check_key(&self, key: &[u8]) -> Result<(), MemtableError> {
        let expected = self.key_type.fixed_size();
        if expected != 0 && key.len() != expected {
            return Err(MemtableError::InvalidKeyWidth {
                got: key.len(),
                expected,
            });
        }
        Ok(())
    }

    /// In-memory append, without WAL involvement.
    fn apply(&self, key: &[u8], value: &[u8]) -> Result<(), MemtableError> {
        self.check_key(key)?;
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);

        let mut inner = self
            .inner
            .write()
            .map_err(|_| MemtableError::Internal("lock poisoned".into()))?;

        let value_offset = inner.value_arena.copy_in(value);
        let value_len = value.len() as u32;

        match self.key_type {
            ValueType::Int => {
                // check_key guarantees the width here.
                let int_key = decode_int_key(key)
                    .ok_or_else(|| MemtableError::Internal("int key width".into()))?;
                inner.int_entries.push(IntEntry {
                    key: int_key,
                    value_offset,
                    value_len,
                    seq,
                });
            }
            _ => {
                let key_offset = inner.key_arena.copy_in(key);
                inner.byte_entries.push(ByteEntry {
                    key_offset,
                    key_len: key.len() as u32,
                    value_offset,
                    value_len,
                    seq,
                });
            }
        }
        inner.sorted = false;
        drop(inner);

        self.approximate_size
            .fetch_add(key.len() + value.len(), Ordering::Relaxed);
        Ok(())
    }

    /// Point lookup. Sorts lazily, binary-searches, and resolves equal
    /// keys to the largest sequence number.
    pub fn get(&self, key: &[u8]) -> Result<MemTableGetResult, MemtableError> {
        self.check_key(key)?;
        let inner = self.read_sorted()?;

        let found = match self.key_type {
            ValueType::Int => {
                let target = decode_int_key(key)
                    .ok_or_else(|| MemtableError::Internal("int key width".into()))?;
                // Upper bound: first entry with key > target. The entry
                // just before it, if equal, carries the largest seq.
                let idx = inner.int_entries.partition_point(|e| e.key <= target);
                (idx > 0 && inner.int_entries[idx - 1].key == target).then(|| {
                    let e = inner.int_entries[idx - 1];
                    (e.value_offset, e.value_len)
                })
            }
            _ => {
                let idx = inner.byte_entries.partition_point(|e| {
                    let k = inner.key_arena.slice(e.key_offset, e.key_len);
                    compare_keys(self.key_type, k, key) != std::cmp::Ordering::Greater
                });
                (idx > 0 && {
                    let e = inner.byte_entries[idx - 1];
                    inner.key_arena.slice(e.key_offset, e.key_len) == key
                })
                .then(|| {
                    let e = inner.byte_entries[idx - 1];
                    (e.value_offset, e.value_len)
                })
            }
        };

        Ok(match found {
            None => MemTableGetResult::NotFound,
            Some((_, 0)) => MemTableGetResult::Tombstone,
            Some((offset, len)) => {
                MemTableGetResult::Value(inner.value_arena.slice(offset, len).to_vec())
            }
        })
    }

    /// Sorted snapshot of the latest version of every key, ascending,
    /// tombstones included (zero-length values).
    ///
    /// This is the stream handed to the flush path and to the scan
    /// merge; row indices in a scan's selection vector refer to
    /// positions in this snapshot.
    pub fn entries_snapshot(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>, MemtableError> {
        let inner = self.read_sorted()?;
        let mut out = Vec::new();

        match self.key_type {
            ValueType::Int => {
                let entries = &inner.int_entries;
                let mut i = 0;
                while i < entries.len() {
                    // The run of equal keys ends at j; the entry at
                    // j - 1 has the largest seq.
                    let mut j = i + 1;
                    while j < entries.len() && entries[j].key == entries[i].key {
                        j += 1;
                    }
                    let e = entries[j - 1];
                    out.push((
                        e.key.to_le_bytes().to_vec(),
                        inner.value_arena.slice(e.value_offset, e.value_len).to_vec(),
                    ));
                    i = j;
                }
            }
            _ => {
                let entries = &inner.byte_entries;
                let mut i = 0;
                while i < entries.len() {
                    let key_i = inner
                        .key_arena
                        .slice(entries[i].key_offset, entries[i].key_len);
                    let mut j = i + 1;
                    while j < entries.len() {
                        let key_j = inner
                            .key_arena
                            .slice(entries[j].key_offset, entries[j].key_len);
                        if key_j != key_i {
                            break;
                        }
                        j += 1;
                    }
                    let e = entries[j - 1];
                    out.push((
                        inner.key_arena.slice(e.key_offset, e.key_len).to_vec(),
                        inner.value_arena.slice(e.value_offset, e.value_len).to_vec(),
                    ));
                    i = j;
                }
            }
        }

        Ok(out)
    }

    /// Serialize live entries as `u16 klen || key || u16 vlen || value`
    /// in ascending key order. Tombstones are skipped — they are only
    /// materialized during merges.
    pub fn serialize(&self) -> Result<Vec<u8>, MemtableError> {
        let snapshot = self.entries_snapshot()?;
        let mut out = Vec::with_capacity(self.approximate_size());
        for (key, value) in snapshot {
            if value.is_empty() {
                continue;
            }
            out.extend_from_slice(&(key.len() as u16).to_le_bytes());
            out.extend_from_slice(&key);
            out.extend_from_slice(&(value.len() as u16).to_le_bytes());
            out.extend_from_slice(&value);
        }
        Ok(out)
    }

    /// Acquire a read view with the entries guaranteed sorted.
    fn read_sorted(&self) -> Result<RwLockReadGuard<'_, MemTableInner>, MemtableError> {
        loop {
            {
                let guard = self
                    .inner
                    .read()
                    .map_err(|_| MemtableError::Internal("lock poisoned".into()))?;
                if guard.sorted {
                    return Ok(guard);
                }
            }
            let mut guard = self
                .inner
                .write()
                .map_err(|_| MemtableError::Internal("lock poisoned".into()))?;
            guard.sort(self.key_type);
            // Loop re-acquires in shared mode; a racing append between
            // the two acquisitions just triggers one more sort.
        }
    }

    /// Bytes of keys and values appended so far.
    pub fn approximate_size(&self) -> usize {
        self.approximate_size.load(Ordering::Relaxed)
    }

    /// Number of appended entries, shadowed versions included.
    pub fn count(&self) -> usize {
        match self.inner.read() {
            Ok(inner) => inner.count(self.key_type),
            Err(_) => 0,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key_type(&self) -> ValueType {
        self.key_type
    }

    /// Path of the backing WAL, if any.
    pub fn wal_path(&self) -> Option<PathBuf> {
        self.wal.as_ref().map(|w| w.path().to_path_buf())
    }

    /// Delete the backing WAL file. Called after this memtable's data
    /// is durable in an installed SSTable.
    pub fn delete_wal(&self) -> Result<(), MemtableError> {
        if let Some(wal) = &self.wal {
            Wal::remove(wal.path())?;
            debug!(memtable_id = self.id, "memtable WAL deleted");
        }
        Ok(())
    }
}

impl std::fmt::Debug for MemTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemTable")
            .field("id", &self.id)
            .field("key_type", &self.key_type)
            .field("count", &self.count())
            .field("approximate_size", &self.approximate_size())
            .finish_non_exhaustive()
    }
}
