//! Shared read-path primitives: the key/value cursor abstraction and
//! the k-way merge iterator.
//!
//! Merge inputs are key-sorted streams ordered **newest first**. At
//! every step the merge emits the minimum current key (under the
//! primary-key comparator) and, among inputs positioned at that key,
//! only the earliest — newest — contributes its value; the rest are
//! advanced past the key. Tombstones flow through as zero-length
//! values; dropping them is the caller's decision.

use crate::memtable::MemTable;
use crate::sstable::SSTableIterator;
use crate::types::{ValueType, compare_keys};

/// A positioned cursor over one key-sorted `(key, row)` stream.
pub(crate) trait KvCursor {
    fn valid(&self) -> bool;
    /// Current key; only meaningful while `valid()`.
    fn key(&self) -> &[u8];
    /// Current row bytes; empty means tombstone.
    fn value(&self) -> &[u8];
    fn advance(&mut self);
}

impl KvCursor for SSTableIterator {
    fn valid(&self) -> bool {
        SSTableIterator::valid(self)
    }

    fn key(&self) -> &[u8] {
        SSTableIterator::key(self)
    }

    fn value(&self) -> &[u8] {
        SSTableIterator::value(self)
    }

    fn advance(&mut self) {
        SSTableIterator::next(self);
    }
}

/// Cursor over an owned, sorted, deduplicated memtable snapshot, so a
/// memtable can participate in the same merges as on-disk runs.
pub(crate) struct MemRowsCursor {
    rows: Vec<(Vec<u8>, Vec<u8>)>,
    idx: usize,
}

impl MemRowsCursor {
    /// Snapshot a memtable into a cursor (tombstones included).
    pub(crate) fn from_memtable(table: &MemTable) -> Result<Self, crate::memtable::MemtableError> {
        Ok(Self {
            rows: table.entries_snapshot()?,
            idx: 0,
        })
    }
}

impl KvCursor for MemRowsCursor {
    fn valid(&self) -> bool {
        self.idx < self.rows.len()
    }

    fn key(&self) -> &[u8] {
        &self.rows[self.idx].0
    }

    fn value(&self) -> &[u8] {
        &self.rows[self.idx].1
    }

    fn advance(&mut self) {
        self.idx += 1;
    }
}

/// K-way merge over newest-first inputs with newest-wins dedup.
pub(crate) struct MergeIterator {
    inputs: Vec<Box<dyn KvCursor + Send>>,
    key_type: ValueType,
    current: Option<usize>,
}

impl MergeIterator {
    pub(crate) fn new(inputs: Vec<Box<dyn KvCursor + Send>>, key_type: ValueType) -> Self {
        let mut iter = Self {
            inputs,
            key_type,
            current: None,
        };
        iter.find_current();
        iter
    }

    pub(crate) fn valid(&self) -> bool {
        self.current.is_some()
    }

    pub(crate) fn key(&self) -> &[u8] {
        self.inputs[self.current.expect("merge exhausted")].key()
    }

    pub(crate) fn value(&self) -> &[u8] {
        self.inputs[self.current.expect("merge exhausted")].value()
    }

    /// Step past the current key in **every** input holding it.
    pub(crate) fn next(&mut self) {
        let Some(winner) = self.current else {
            return;
        };
        let key = self.inputs[winner].key().to_vec();
        for input in &mut self.inputs {
            while input.valid()
                && compare_keys(self.key_type, input.key(), &key) == std::cmp::Ordering::Equal
            {
                input.advance();
            }
        }
        self.find_current();
    }

    /// Smallest current key; ties resolve to the lowest input index —
    /// the newest source.
    fn find_current(&mut self) {
        let mut best: Option<usize> = None;
        for (idx, input) in self.inputs.iter().enumerate() {
            if !input.valid() {
                continue;
            }
            best = match best {
                None => Some(idx),
                Some(b)
                    if compare_keys(self.key_type, input.key(), self.inputs[b].key())
                        == std::cmp::Ordering::Less =>
                {
                    Some(idx)
                }
                keep => keep,
            };
        }
        self.current = best;
    }
}
