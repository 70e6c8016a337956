//! # LSM-tree façade
//!
//! The public entity of the crate: one [`LsmTree`] per table. It owns
//! the mutable memtable, the immutable memtable queue, the seven-level
//! SSTable hierarchy, the manifest, and the background compaction
//! worker, and it coordinates recovery at open.
//!
//! ## Write path
//!
//! `put` → WAL append → memtable append. When the memtable reaches the
//! configured threshold it is rotated into the immutable queue and the
//! background worker flushes it to an L0 SSTable, registering the file
//! in the manifest. Writers block only when the immutable queue is full
//! (flush backpressure). Deletion is `put(key, empty)`.
//!
//! ## Read path
//!
//! `get` probes layers newest-first: mutable memtable → immutables →
//! L0 files by descending id → levels 1+ by key-range binary search.
//! A tombstone in a newer layer shadows everything older. Column scans
//! run a selection-vector merge across every layer and then materialize
//! each requested column once, using whole-chunk copies wherever an
//! SSTable RowGroup survives intact.
//!
//! ## Concurrency model
//!
//! - The mutable-memtable slot is guarded by a short-lived latch:
//!   rotation takes it exclusively, mutations and readers take it in
//!   shared mode (readers clone the `Arc` and release). A separate
//!   writer mutex serializes mutations so WAL order matches sequence
//!   order.
//! - `(immutables, levels, readers)` sit behind one readers-writer
//!   latch, held in shared mode by reads and exclusively only while a
//!   flush or compaction installs its result.
//! - The manifest serializes itself internally; the compaction worker
//!   coordinates through a channel and runs one job at a time.

pub(crate) mod scan;
pub(crate) mod utils;

#[cfg(test)]
mod tests;

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::{
        Arc, Condvar, Mutex, RwLock,
        atomic::{AtomicU32, AtomicU64, Ordering},
    },
};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::column::Column;
use crate::compaction::scheduler::CompactionScheduler;
use crate::compaction::{CompactionError, LevelMeta, LeveledSSTableMeta};
use crate::encoding::EncodingError;
use crate::manifest::{Manifest, ManifestError};
use crate::memtable::{MemTable, MemTableGetResult, MemtableError};
use crate::sstable::{SSTableBuilder, SSTableError, SsTable};
use crate::types::{ValueType, compare_keys};

/// Errors that can occur during engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Error originating from the memtable or its WAL.
    #[error("memtable error: {0}")]
    Memtable(#[from] MemtableError),

    /// Error originating from the SSTable subsystem.
    #[error("SSTable error: {0}")]
    SSTable(#[from] SSTableError),

    /// Error originating from the manifest.
    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),

    /// Error originating from compaction execution.
    #[error("compaction error: {0}")]
    Compaction(#[from] CompactionError),

    /// Row codec failure.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Underlying filesystem I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Unknown column index, bad key width, or schema mismatch.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Internal invariant violation (poisoned lock, unexpected state).
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result of a point lookup.
#[derive(Debug, PartialEq)]
pub enum GetResult {
    /// The key's current row, in row-codec form.
    Row(Vec<u8>),

    /// The key was never written or its latest version is a tombstone.
    NotFound,
}

impl GetResult {
    pub fn is_row(&self) -> bool {
        matches!(self, GetResult::Row(_))
    }

    /// Unwrap into row bytes, if any.
    pub fn into_row(self) -> Option<Vec<u8>> {
        match self {
            GetResult::Row(row) => Some(row),
            GetResult::NotFound => None,
        }
    }
}

/// Configuration for an [`LsmTree`] instance.
#[derive(Debug, Clone)]
pub struct TreeConfig {
    /// Memtable size (bytes) that triggers rotation on the next put.
    pub memtable_size: usize,

    /// Target encoded size of one RowGroup.
    pub rowgroup_target_size: usize,

    /// RowGroups are padded to a multiple of this.
    pub rowgroup_alignment: usize,

    /// Immutable memtables tolerated before writers block.
    pub max_immutable_count: usize,

    /// L0 file count that triggers an L0 → L1 compaction.
    pub l0_compaction_threshold: usize,

    /// Per-level size growth factor.
    pub level_size_multiplier: u64,

    /// Size target for L1; level `L` targets `l1 × multiplier^(L−1)`.
    pub l1_max_bytes: u64,

    /// Number of levels, L0 included.
    pub max_levels: usize,

    /// String zone-map bounds are truncated to this prefix length.
    pub zone_map_prefix_len: usize,

    /// Whether writes go through a WAL. Disabling trades crash safety
    /// for ingest speed (bulk loads).
    pub write_log: bool,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            memtable_size: 64 * 1024 * 1024,
            rowgroup_target_size: 16 * 1024 * 1024,
            rowgroup_alignment: 4096,
            max_immutable_count: 4,
            l0_compaction_threshold: 4,
            level_size_multiplier: 10,
            l1_max_bytes: 512 * 1024 * 1024,
            max_levels: 7,
            zone_map_prefix_len: 32,
            write_log: true,
        }
    }
}

impl TreeConfig {
    /// Shrunken thresholds (8 KiB memtable, 64 KiB RowGroups and L1)
    /// so tests exercise rotation, flush, and compaction with little
    /// data.
    pub fn small() -> Self {
        Self {
            memtable_size: 8 * 1024,
            rowgroup_target_size: 64 * 1024,
            l1_max_bytes: 64 * 1024,
            ..Self::default()
        }
    }
}

/// Snapshot of tree statistics returned by [`LsmTree::stats`].
#[derive(Debug)]
pub struct TreeStats {
    /// Approximate size of the mutable memtable in bytes.
    pub memtable_bytes: usize,
    /// Immutable memtables pending flush.
    pub immutable_count: usize,
    /// File count per level.
    pub level_file_counts: Vec<usize>,
    /// Total bytes per level.
    pub level_sizes: Vec<u64>,
    /// Total SSTables across all levels.
    pub sstable_count: usize,
}

// ------------------------------------------------------------------------------------------------
// Shared state
// ------------------------------------------------------------------------------------------------

/// Level state plus open readers, guarded by one readers-writer latch.
pub(crate) struct TreeState {
    /// Immutable memtables, newest first.
    pub(crate) immutables: Vec<Arc<MemTable>>,

    /// Per-level file metadata, `levels[0]` through the bottom.
    pub(crate) levels: Vec<LevelMeta>,

    /// Open mmap readers by SSTable id.
    pub(crate) readers: HashMap<u32, Arc<SsTable>>,
}

/// State shared between the façade and the background worker.
pub(crate) struct TreeCore {
    pub(crate) path: PathBuf,
    pub(crate) config: TreeConfig,
    pub(crate) column_types: Vec<ValueType>,
    pub(crate) primary_key_idx: usize,

    /// Mutable-memtable slot: single writer latch.
    pub(crate) mutable: RwLock<Arc<MemTable>>,

    pub(crate) state: RwLock<TreeState>,
    pub(crate) manifest: Manifest,

    pub(crate) next_sstable_id: AtomicU32,
    pub(crate) next_memtable_id: AtomicU64,

    /// Count of immutables, for flush backpressure.
    pub(crate) flush_gate: Mutex<usize>,
    pub(crate) flush_done: Condvar,

    /// Serializes flush execution between the worker and
    /// `flush_to_sst`.
    flush_serialize: Mutex<()>,

    /// Serializes memtable mutations so WAL order always matches
    /// sequence-number order.
    write_serialize: Mutex<()>,
}

impl TreeCore {
    pub(crate) fn key_type(&self) -> ValueType {
        self.column_types[self.primary_key_idx]
    }

    pub(crate) fn alloc_sstable_id(&self) -> u32 {
        self.next_sstable_id.fetch_add(1, Ordering::Relaxed)
    }

    fn wal_path(&self, memtable_id: u64) -> PathBuf {
        self.path.join(format!("{memtable_id}.wal"))
    }

    fn lock_state_read(&self) -> Result<std::sync::RwLockReadGuard<'_, TreeState>, EngineError> {
        self.state
            .read()
            .map_err(|_| EngineError::Internal("state lock poisoned".into()))
    }

    fn lock_state_write(&self) -> Result<std::sync::RwLockWriteGuard<'_, TreeState>, EngineError> {
        self.state
            .write()
            .map_err(|_| EngineError::Internal("state lock poisoned".into()))
    }

    /// Flush the oldest immutable memtable into an L0 SSTable and
    /// install it. Returns `false` when there was nothing to flush.
    ///
    /// Failure before the manifest record leaves the immutable queued
    /// for retry; an orphan `.sst` without a manifest entry is garbage
    /// collected on the next open.
    pub(crate) fn flush_oldest_immutable(&self) -> Result<bool, EngineError> {
        let _serialize = self
            .flush_serialize
            .lock()
            .map_err(|_| EngineError::Internal("flush lock poisoned".into()))?;

        let Some(imm) = self.lock_state_read()?.immutables.last().cloned() else {
            return Ok(false);
        };

        if imm.count() == 0 {
            debug!(memtable_id = imm.id(), "dropping empty immutable memtable");
            self.retire_immutable(&imm)?;
            return Ok(true);
        }

        // Serialize the memtable into a sorted stream: one cursor, one
        // merge, tombstones kept (the target is L0, never the bottom).
        let cursor = utils::MemRowsCursor::from_memtable(&imm)?;
        let inputs: Vec<Box<dyn utils::KvCursor + Send>> = vec![Box::new(cursor)];
        let mut stream = utils::MergeIterator::new(inputs, self.key_type());

        let sstable_id = self.alloc_sstable_id();
        let mut builder = SSTableBuilder::new(
            &self.path,
            sstable_id,
            self.column_types.clone(),
            self.primary_key_idx,
            self.config.rowgroup_target_size,
            self.config.rowgroup_alignment,
            u64::MAX, // one file per memtable
            self.config.zone_map_prefix_len,
        )?;
        let mut rows = 0u64;
        while stream.valid() {
            builder.add(stream.key(), stream.value())?;
            rows += 1;
            stream.next();
        }
        let meta = builder.finish()?;
        let reader = Arc::new(SsTable::open(
            &self.path,
            sstable_id,
            self.column_types.clone(),
        )?);

        let level_meta = LeveledSSTableMeta::new(
            sstable_id,
            0,
            meta.min_key.clone(),
            meta.max_key.clone(),
            meta.file_size,
        );

        // Linearization point: the manifest record.
        self.manifest.add_sstable(0, &level_meta)?;

        {
            let mut state = self.lock_state_write()?;
            state.readers.insert(sstable_id, reader);
            let key_type = self.key_type();
            state.levels[0].add_sstable(level_meta, key_type);
            state.immutables.pop();
        }
        self.release_flush_gate();

        if let Err(e) = imm.delete_wal() {
            warn!(memtable_id = imm.id(), error = %e, "failed to delete flushed WAL");
        }

        info!(
            memtable_id = imm.id(),
            sstable_id,
            rows,
            file_size = meta.file_size,
            "immutable memtable flushed to L0"
        );

        self.maybe_snapshot_manifest()?;
        Ok(true)
    }

    /// Drop an immutable that had nothing to persist.
    fn retire_immutable(&self, imm: &Arc<MemTable>) -> Result<(), EngineError> {
        {
            let mut state = self.lock_state_write()?;
            state
                .immutables
                .retain(|m| !Arc::ptr_eq(m, imm));
        }
        self.release_flush_gate();
        if let Err(e) = imm.delete_wal() {
            warn!(memtable_id = imm.id(), error = %e, "failed to delete WAL of empty memtable");
        }
        Ok(())
    }

    fn release_flush_gate(&self) {
        if let Ok(mut gate) = self.flush_gate.lock() {
            *gate = gate.saturating_sub(1);
            self.flush_done.notify_all();
        }
    }

    /// Rewrite the manifest snapshot once enough incremental records
    /// accumulated.
    pub(crate) fn maybe_snapshot_manifest(&self) -> Result<(), EngineError> {
        if !self.manifest.needs_snapshot() {
            return Ok(());
        }
        let levels = self.lock_state_read()?.levels.clone();
        self.manifest.save(&levels)?;
        Ok(())
    }

    /// Whether any immutable memtables are queued.
    pub(crate) fn has_immutables(&self) -> bool {
        self.lock_state_read()
            .map(|s| !s.immutables.is_empty())
            .unwrap_or(false)
    }
}

// ------------------------------------------------------------------------------------------------
// LsmTree
// ------------------------------------------------------------------------------------------------

/// The columnar LSM-tree for one table.
///
/// Thread-safe: share it behind an `Arc` across reader and writer
/// threads. One dedicated background worker per tree performs flushes
/// and compactions.
pub struct LsmTree {
    core: Arc<TreeCore>,
    scheduler: CompactionScheduler,
}

impl LsmTree {
    /// Open (or create) the tree rooted at `path`.
    ///
    /// Recovery order: manifest → SSTable readers (corrupt files are
    /// skipped and logged) → orphan `.sst` garbage collection → WAL
    /// replay into memtables (the newest WAL becomes the mutable
    /// memtable, older ones queue as immutables).
    pub fn open<P: AsRef<Path>>(
        path: P,
        column_types: Vec<ValueType>,
        primary_key_idx: usize,
        config: TreeConfig,
    ) -> Result<Self, EngineError> {
        if primary_key_idx >= column_types.len() {
            return Err(EngineError::InvalidArgument(format!(
                "primary key index {primary_key_idx} out of range (column count {})",
                column_types.len()
            )));
        }
        if !column_types[primary_key_idx].is_fixed_width()
            && column_types[primary_key_idx] != ValueType::String
        {
            return Err(EngineError::InvalidArgument(
                "primary key must be int, double, or string".into(),
            ));
        }

        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path)?;
        let key_type = column_types[primary_key_idx];

        // 1. Manifest → level state.
        let manifest = Manifest::new(&path);
        let mut levels: Vec<LevelMeta> = (0..config.max_levels as u32).map(LevelMeta::new).collect();
        manifest.load(&mut levels, key_type)?;

        // 2. Open readers; a corrupt file is dropped from its level and
        //    the rest continue to load.
        let mut readers = HashMap::new();
        let mut max_sstable_id = 0u32;
        for level in &mut levels {
            let mut lost = Vec::new();
            for meta in &level.sstables {
                match SsTable::open(&path, meta.sstable_id, column_types.clone()) {
                    Ok(reader) => {
                        max_sstable_id = max_sstable_id.max(meta.sstable_id);
                        readers.insert(meta.sstable_id, Arc::new(reader));
                    }
                    Err(e) => {
                        error!(
                            sstable_id = meta.sstable_id,
                            level = level.level_num,
                            error = %e,
                            "corrupt SSTable skipped at open"
                        );
                        lost.push(meta.sstable_id);
                    }
                }
            }
            for id in lost {
                level.remove_sstable(id);
            }
        }

        // 3. Orphan GC: `.sst` files the manifest does not reference.
        for entry in fs::read_dir(&path)? {
            let entry = entry?;
            let file_path = entry.path();
            if let Some(id) = parse_numbered_file(&file_path, "sst")
                && !readers.contains_key(&(id as u32))
            {
                warn!(sstable_id = id, "removing orphan SSTable file");
                let _ = fs::remove_file(&file_path);
            }
        }

        // 4. WAL replay: newest id becomes mutable, the rest queue as
        //    immutables (newest first) for the worker to flush.
        let mut wal_ids = Vec::new();
        for entry in fs::read_dir(&path)? {
            let entry = entry?;
            if let Some(id) = parse_numbered_file(&entry.path(), "wal") {
                wal_ids.push(id);
            }
        }
        wal_ids.sort_unstable();

        let mut immutables: Vec<Arc<MemTable>> = Vec::new();
        let mutable = match wal_ids.split_last() {
            Some((&newest, older)) => {
                for &id in older.iter().rev() {
                    let table =
                        MemTable::new(id, key_type, path.join(format!("{id}.wal")), true)?;
                    info!(memtable_id = id, rows = table.count(), "recovered immutable memtable");
                    immutables.push(Arc::new(table));
                }
                Arc::new(MemTable::new(
                    newest,
                    key_type,
                    path.join(format!("{newest}.wal")),
                    config.write_log,
                )?)
            }
            None => Arc::new(MemTable::new(
                0,
                key_type,
                path.join("0.wal"),
                config.write_log,
            )?),
        };
        let next_memtable_id = wal_ids.last().map_or(1, |id| id + 1);
        let immutable_count = immutables.len();

        let core = Arc::new(TreeCore {
            path,
            config,
            column_types,
            primary_key_idx,
            mutable: RwLock::new(mutable),
            state: RwLock::new(TreeState {
                immutables,
                levels,
                readers,
            }),
            manifest,
            next_sstable_id: AtomicU32::new(max_sstable_id + 1),
            next_memtable_id: AtomicU64::new(next_memtable_id),
            flush_gate: Mutex::new(immutable_count),
            flush_done: Condvar::new(),
            flush_serialize: Mutex::new(()),
            write_serialize: Mutex::new(()),
        });

        let scheduler = CompactionScheduler::start(Arc::clone(&core));
        if immutable_count > 0 {
            scheduler.wake();
        }

        info!(
            path = %core.path.display(),
            sstables = core.lock_state_read()?.readers.len(),
            immutables = immutable_count,
            "tree opened"
        );

        Ok(Self { core, scheduler })
    }

    /// Insert or overwrite one row. `row` is the row-codec encoding of
    /// every column (primary key included); an empty `row` is a
    /// deletion.
    pub fn put(&self, key: &[u8], row: &[u8]) -> Result<(), EngineError> {
        self.validate_key(key)?;
        self.validate_row(row)?;
        self.write_with(&|table| table.put(key, row))
    }

    /// Delete a key by writing a tombstone.
    pub fn remove(&self, key: &[u8]) -> Result<(), EngineError> {
        self.put(key, b"")
    }

    /// Insert a batch with a single WAL flush at the end. A crash
    /// mid-batch may lose the batch tail but never partial records.
    pub fn batch_insert(&self, entries: &[(Vec<u8>, Vec<u8>)]) -> Result<(), EngineError> {
        for (key, row) in entries {
            self.validate_key(key)?;
            self.validate_row(row)?;
        }
        self.write_with(&|table| table.put_batch(entries))
    }

    /// Apply a mutation to the current memtable, rotating it first when
    /// it has reached the threshold.
    ///
    /// The mutation runs under the slot latch in *shared* mode (readers
    /// are never blocked by an appending writer); rotation takes the
    /// latch exclusively and only briefly. Backpressure — waiting for
    /// the flush backlog to drain — happens with no latch held.
    fn write_with(
        &self,
        mutation: &dyn Fn(&MemTable) -> Result<(), MemtableError>,
    ) -> Result<(), EngineError> {
        loop {
            {
                let slot = self
                    .core
                    .mutable
                    .read()
                    .map_err(|_| EngineError::Internal("memtable latch poisoned".into()))?;
                if slot.approximate_size() < self.core.config.memtable_size {
                    let _exclusive = self
                        .core
                        .write_serialize
                        .lock()
                        .map_err(|_| EngineError::Internal("write lock poisoned".into()))?;
                    mutation(&slot)?;
                    return Ok(());
                }
            }

            // Backpressure: block until the oldest immutable is
            // flushed, then rotate and retry the append.
            {
                let mut gate = self
                    .core
                    .flush_gate
                    .lock()
                    .map_err(|_| EngineError::Internal("flush gate poisoned".into()))?;
                while *gate >= self.core.config.max_immutable_count {
                    gate = self
                        .core
                        .flush_done
                        .wait(gate)
                        .map_err(|_| EngineError::Internal("flush gate poisoned".into()))?;
                }
            }
            self.rotate_if_full()?;
        }
    }

    /// Rotate the mutable memtable into the immutable queue, unless a
    /// racing writer already did.
    fn rotate_if_full(&self) -> Result<(), EngineError> {
        let mut slot = self
            .core
            .mutable
            .write()
            .map_err(|_| EngineError::Internal("memtable latch poisoned".into()))?;

        if slot.approximate_size() < self.core.config.memtable_size {
            return Ok(());
        }

        // Create the replacement first so a WAL-creation failure leaves
        // the tree unchanged.
        let id = self.core.next_memtable_id.fetch_add(1, Ordering::Relaxed);
        let fresh = Arc::new(MemTable::new(
            id,
            self.core.key_type(),
            self.core.wal_path(id),
            self.core.config.write_log,
        )?);

        {
            let mut state = self.core.lock_state_write()?;
            state.immutables.insert(0, Arc::clone(&slot));
        }
        if let Ok(mut gate) = self.core.flush_gate.lock() {
            *gate += 1;
        }
        debug!(memtable_id = slot.id(), "memtable rotated to immutable");
        *slot = fresh;
        drop(slot);

        self.scheduler.wake();
        Ok(())
    }

    /// Point lookup by primary key.
    pub fn get(&self, key: &[u8]) -> Result<GetResult, EngineError> {
        self.validate_key(key)?;

        // 1. Mutable memtable.
        let mutable = {
            self.core
                .mutable
                .read()
                .map_err(|_| EngineError::Internal("memtable latch poisoned".into()))?
                .clone()
        };
        match mutable.get(key)? {
            MemTableGetResult::Value(row) => return Ok(GetResult::Row(row)),
            MemTableGetResult::Tombstone => return Ok(GetResult::NotFound),
            MemTableGetResult::NotFound => {}
        }

        // Shared snapshot of immutables and the file hierarchy.
        let (immutables, l0, leveled) = {
            let state = self.core.lock_state_read()?;
            let immutables = state.immutables.clone();

            // L0 readers by descending id — newest first.
            let mut l0_ids: Vec<u32> = state.levels[0]
                .sstables
                .iter()
                .map(|m| m.sstable_id)
                .collect();
            l0_ids.sort_unstable_by(|a, b| b.cmp(a));
            let l0: Vec<Arc<SsTable>> = l0_ids
                .iter()
                .filter_map(|id| state.readers.get(id).cloned())
                .collect();

            // Levels 1+: at most one candidate file per level.
            let key_type = self.core.key_type();
            let mut leveled = Vec::new();
            for level in state.levels.iter().skip(1) {
                let idx = level.sstables.partition_point(|m| {
                    compare_keys(key_type, &m.min_key, key) != std::cmp::Ordering::Greater
                });
                if idx == 0 {
                    continue;
                }
                let meta = &level.sstables[idx - 1];
                if compare_keys(key_type, key, &meta.max_key) == std::cmp::Ordering::Greater {
                    continue;
                }
                if let Some(reader) = state.readers.get(&meta.sstable_id) {
                    leveled.push(Arc::clone(reader));
                }
            }
            (immutables, l0, leveled)
        };

        // 2. Immutables, newest first.
        for imm in &immutables {
            match imm.get(key)? {
                MemTableGetResult::Value(row) => return Ok(GetResult::Row(row)),
                MemTableGetResult::Tombstone => return Ok(GetResult::NotFound),
                MemTableGetResult::NotFound => {}
            }
        }

        // 3. L0, newest first; 4. levels 1+ top-down.
        for reader in l0.iter().chain(leveled.iter()) {
            if let Some(row) = reader.get(key) {
                return Ok(if row.is_empty() {
                    GetResult::NotFound
                } else {
                    GetResult::Row(row)
                });
            }
        }

        Ok(GetResult::NotFound)
    }

    /// Materialize one column across every live row, in primary-key
    /// order.
    pub fn scan_column(&self, col_idx: usize) -> Result<Column, EngineError> {
        Ok(self.scan_columns(&[col_idx])?.pop().expect("one column"))
    }

    /// Materialize several columns with a single merge pass: the
    /// selection vector is computed once and reused per column.
    pub fn scan_columns(&self, col_indices: &[usize]) -> Result<Vec<Column>, EngineError> {
        for &idx in col_indices {
            if idx >= self.core.column_types.len() {
                return Err(EngineError::InvalidArgument(format!(
                    "column index {idx} out of range (column count {})",
                    self.core.column_types.len()
                )));
            }
        }
        scan::scan_columns(&self.core, col_indices)
    }

    /// Force rotation of the mutable memtable and synchronously flush
    /// every queued immutable to L0.
    pub fn flush_to_sst(&self) -> Result<(), EngineError> {
        {
            let mut slot = self
                .core
                .mutable
                .write()
                .map_err(|_| EngineError::Internal("memtable latch poisoned".into()))?;
            if slot.count() > 0 {
                let id = self.core.next_memtable_id.fetch_add(1, Ordering::Relaxed);
                let fresh = Arc::new(MemTable::new(
                    id,
                    self.core.key_type(),
                    self.core.wal_path(id),
                    self.core.config.write_log,
                )?);
                {
                    let mut state = self.core.lock_state_write()?;
                    state.immutables.insert(0, Arc::clone(&slot));
                }
                if let Ok(mut gate) = self.core.flush_gate.lock() {
                    *gate += 1;
                }
                *slot = fresh;
            }
        }

        while self.core.flush_oldest_immutable()? {}
        self.scheduler.wake();
        Ok(())
    }

    /// Hint the background worker that compaction may be due.
    pub fn trigger_compaction(&self) {
        self.scheduler.wake();
    }

    /// Snapshot of memtable, level, and file statistics.
    ///
    /// Infallible: a poisoned latch still yields a readable snapshot
    /// (the poisoning writer never leaves the state partially updated).
    pub fn stats(&self) -> TreeStats {
        let memtable_bytes = self
            .core
            .mutable
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .approximate_size();
        let state = self
            .core
            .state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        TreeStats {
            memtable_bytes,
            immutable_count: state.immutables.len(),
            level_file_counts: state.levels.iter().map(|l| l.sstables.len()).collect(),
            level_sizes: state.levels.iter().map(|l| l.total_size).collect(),
            sstable_count: state.levels.iter().map(|l| l.sstables.len()).sum(),
        }
    }

    /// Stop the background worker and persist a manifest snapshot.
    ///
    /// The mutable memtable is *not* flushed — its WAL replays on the
    /// next open.
    pub fn close(&self) -> Result<(), EngineError> {
        self.scheduler.stop();
        let levels = self.core.lock_state_read()?.levels.clone();
        self.core.manifest.save(&levels)?;
        info!(path = %self.core.path.display(), "tree closed");
        Ok(())
    }

    fn validate_key(&self, key: &[u8]) -> Result<(), EngineError> {
        let expected = self.core.key_type().fixed_size();
        if expected != 0 && key.len() != expected {
            return Err(EngineError::InvalidArgument(format!(
                "key width {} does not match primary-key type (expected {expected})",
                key.len()
            )));
        }
        if expected == 0 && key.is_empty() {
            return Err(EngineError::InvalidArgument("empty key".into()));
        }
        Ok(())
    }

    /// A non-empty row must decode against the declared schema; an
    /// empty row is a tombstone.
    fn validate_row(&self, row: &[u8]) -> Result<(), EngineError> {
        if row.is_empty() {
            return Ok(());
        }
        crate::encoding::decode_row(row, self.core.column_types.len())
            .map_err(|e| EngineError::InvalidArgument(format!("malformed row: {e}")))?;
        Ok(())
    }
}

impl Drop for LsmTree {
    fn drop(&mut self) {
        self.scheduler.stop();
    }
}

/// Parse `<n>.<ext>` file names; returns `n`.
fn parse_numbered_file(path: &Path, ext: &str) -> Option<u64> {
    if path.extension()?.to_str()? != ext {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok()
}
