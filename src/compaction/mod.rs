//! Leveled compaction: level metadata, the pure job picker, and the
//! background scheduler.
//!
//! The tree keeps up to seven levels of SSTables. L0 files come
//! straight from memtable flushes and may overlap each other; levels
//! 1+ hold files with pairwise-disjoint key ranges, sorted by
//! `min_key`. When L0 accumulates too many files, or a level exceeds
//! its size target, the [`picker`] produces a [`CompactionJob`] and the
//! [`scheduler`] merges the inputs into the next level.
//!
//! All key comparisons here are type-aware — an integer-keyed table
//! orders its files numerically, never by raw bytes.

pub mod picker;
pub mod scheduler;


use thiserror::Error;

use crate::manifest::ManifestError;
use crate::sstable::SSTableError;
use crate::types::{ValueType, compare_keys};

/// Errors surfaced by compaction execution.
#[derive(Debug, Error)]
pub enum CompactionError {
    /// SSTable build or read failure.
    #[error("SSTable error: {0}")]
    SSTable(#[from] SSTableError),

    /// Manifest edit failure.
    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal invariant violation (lost file, poisoned lock).
    #[error("internal error: {0}")]
    Internal(String),
}

/// Level-resident metadata of one SSTable.
#[derive(Debug, Clone, PartialEq)]
pub struct LeveledSSTableMeta {
    pub sstable_id: u32,
    pub level: u32,
    /// Raw byte form of the smallest primary key.
    pub min_key: Vec<u8>,
    /// Raw byte form of the largest primary key.
    pub max_key: Vec<u8>,
    pub file_size: u64,
    /// Set while a compaction job names this file.
    pub being_compacted: bool,
}

impl LeveledSSTableMeta {
    pub fn new(
        sstable_id: u32,
        level: u32,
        min_key: Vec<u8>,
        max_key: Vec<u8>,
        file_size: u64,
    ) -> Self {
        Self {
            sstable_id,
            level,
            min_key,
            max_key,
            file_size,
            being_compacted: false,
        }
    }
}

/// One level's file set and aggregate size.
#[derive(Debug, Clone, Default)]
pub struct LevelMeta {
    pub level_num: u32,
    pub sstables: Vec<LeveledSSTableMeta>,
    pub total_size: u64,
}

impl LevelMeta {
    pub fn new(level_num: u32) -> Self {
        Self {
            level_num,
            sstables: Vec::new(),
            total_size: 0,
        }
    }

    /// Register a file. Levels 1+ keep their files sorted by `min_key`
    /// (typed comparison) so reads can binary-search.
    pub fn add_sstable(&mut self, meta: LeveledSSTableMeta, key_type: ValueType) {
        self.total_size += meta.file_size;
        self.sstables.push(meta);
        if self.level_num > 0 {
            self.sstables
                .sort_by(|a, b| compare_keys(key_type, &a.min_key, &b.min_key));
        }
    }

    /// Drop a file by id; no-op when absent.
    pub fn remove_sstable(&mut self, sstable_id: u32) {
        if let Some(pos) = self
            .sstables
            .iter()
            .position(|m| m.sstable_id == sstable_id)
        {
            self.total_size -= self.sstables[pos].file_size;
            self.sstables.remove(pos);
        }
    }

    pub fn get(&self, sstable_id: u32) -> Option<&LeveledSSTableMeta> {
        self.sstables.iter().find(|m| m.sstable_id == sstable_id)
    }

    pub fn get_mut(&mut self, sstable_id: u32) -> Option<&mut LeveledSSTableMeta> {
        self.sstables
            .iter_mut()
            .find(|m| m.sstable_id == sstable_id)
    }

    pub fn clear(&mut self) {
        self.sstables.clear();
        self.total_size = 0;
    }
}

/// A unit of compaction work chosen by the picker.
#[derive(Debug, Clone, PartialEq)]
pub struct CompactionJob {
    pub input_level: u32,
    pub output_level: u32,
    /// Files taken from `input_level`.
    pub input_ids: Vec<u32>,
    /// Overlapping files at `output_level`, rewritten together with the
    /// inputs.
    pub overlap_ids: Vec<u32>,
    /// When set, the single input file's range overlaps nothing at the
    /// destination — it is reassigned without rewriting.
    pub is_trivial_move: bool,
}
