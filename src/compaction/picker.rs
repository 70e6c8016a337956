//! The compaction picker — a pure function over level state.
//!
//! Priority order:
//!
//! 1. **L0 → L1** when L0 holds at least `l0_compaction_threshold`
//!    files: all L0 files plus every overlapping L1 file.
//! 2. **L → L+1** for the first level 1+ whose total size exceeds its
//!    target (`l1_max_bytes × multiplier^(L−1)`): the file with the
//!    smallest `min_key` not already being compacted, plus its overlap
//!    at L+1.
//!
//! The picker never names a file marked `being_compacted`; if any
//! overlapping destination file is so marked, it returns no job rather
//! than a conflicting one. A job whose destination overlap is empty
//! (and whose source is not L0) becomes a trivial move.

use crate::types::{ValueType, compare_keys, key_ranges_overlap};

use super::{CompactionJob, LevelMeta};

/// Picker configuration and key type, fixed at tree open.
#[derive(Debug, Clone)]
pub struct CompactionPicker {
    pub key_type: ValueType,
    pub l0_compaction_threshold: usize,
    pub l1_max_bytes: u64,
    pub level_size_multiplier: u64,
    pub max_levels: usize,
}

impl CompactionPicker {
    /// Choose the next job, if any.
    pub fn pick(&self, levels: &[LevelMeta]) -> Option<CompactionJob> {
        if let Some(job) = self.pick_l0(levels) {
            return Some(job);
        }
        for level in 1..levels.len().saturating_sub(1) {
            if let Some(job) = self.pick_level(levels, level) {
                return Some(job);
            }
        }
        None
    }

    /// Size target for a level; L0 is governed by file count instead.
    pub fn max_level_size(&self, level: usize) -> u64 {
        if level == 0 {
            return u64::MAX;
        }
        let mut size = self.l1_max_bytes;
        for _ in 1..level {
            size = size.saturating_mul(self.level_size_multiplier);
        }
        size
    }

    fn pick_l0(&self, levels: &[LevelMeta]) -> Option<CompactionJob> {
        let l0 = levels.first()?;
        if l0.sstables.len() < self.l0_compaction_threshold {
            return None;
        }
        if l0.sstables.iter().any(|m| m.being_compacted) {
            return None;
        }

        let mut job = CompactionJob {
            input_level: 0,
            output_level: 1,
            input_ids: Vec::new(),
            overlap_ids: Vec::new(),
            is_trivial_move: false,
        };

        let mut min_key: Option<Vec<u8>> = None;
        let mut max_key: Option<Vec<u8>> = None;
        for meta in &l0.sstables {
            job.input_ids.push(meta.sstable_id);
            min_key = Some(match min_key {
                None => meta.min_key.clone(),
                Some(cur)
                    if compare_keys(self.key_type, &meta.min_key, &cur)
                        == std::cmp::Ordering::Less =>
                {
                    meta.min_key.clone()
                }
                Some(cur) => cur,
            });
            max_key = Some(match max_key {
                None => meta.max_key.clone(),
                Some(cur)
                    if compare_keys(self.key_type, &meta.max_key, &cur)
                        == std::cmp::Ordering::Greater =>
                {
                    meta.max_key.clone()
                }
                Some(cur) => cur,
            });
        }

        if let (Some(l1), Some(min), Some(max)) = (levels.get(1), &min_key, &max_key) {
            job.overlap_ids = self.overlapping_ids(l1, min, max);
            if self.any_being_compacted(l1, &job.overlap_ids) {
                return None;
            }
        }
        Some(job)
    }

    fn pick_level(&self, levels: &[LevelMeta], level: usize) -> Option<CompactionJob> {
        if level + 1 >= levels.len() || level + 1 >= self.max_levels {
            return None;
        }
        if levels[level].total_size <= self.max_level_size(level) {
            return None;
        }

        // Smallest min_key first, for predictable progress across the
        // key space.
        let candidate = levels[level]
            .sstables
            .iter()
            .filter(|m| !m.being_compacted)
            .min_by(|a, b| compare_keys(self.key_type, &a.min_key, &b.min_key))?;

        let mut job = CompactionJob {
            input_level: level as u32,
            output_level: (level + 1) as u32,
            input_ids: vec![candidate.sstable_id],
            overlap_ids: self.overlapping_ids(
                &levels[level + 1],
                &candidate.min_key,
                &candidate.max_key,
            ),
            is_trivial_move: false,
        };
        if self.any_being_compacted(&levels[level + 1], &job.overlap_ids) {
            return None;
        }
        if job.overlap_ids.is_empty() {
            job.is_trivial_move = true;
        }
        Some(job)
    }

    fn overlapping_ids(&self, level: &LevelMeta, min_key: &[u8], max_key: &[u8]) -> Vec<u32> {
        level
            .sstables
            .iter()
            .filter(|m| {
                key_ranges_overlap(self.key_type, min_key, max_key, &m.min_key, &m.max_key)
            })
            .map(|m| m.sstable_id)
            .collect()
    }

    fn any_being_compacted(&self, level: &LevelMeta, ids: &[u32]) -> bool {
        ids.iter()
            .any(|id| level.get(*id).is_some_and(|m| m.being_compacted))
    }
}
