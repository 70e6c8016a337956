//! Row iteration over an SSTable.
//!
//! Walks RowGroups in order, reconstructing each row from its column
//! chunks: every column value is re-prefixed with its 4-byte length and
//! concatenated in declared order, and the primary key is surfaced
//! separately. Rows whose primary-key column is flagged NULL come back
//! as zero-length rows — the tombstone convention shared with the
//! memtable.

use std::sync::Arc;

use super::SsTable;

/// Key-ordered `(key, row_bytes)` iterator over one SSTable.
pub struct SSTableIterator {
    table: Arc<SsTable>,
    rowgroup_idx: usize,
    row_idx: usize,
    current: Option<(Vec<u8>, Vec<u8>)>,
}

impl SSTableIterator {
    pub fn new(table: Arc<SsTable>) -> Self {
        let mut iter = Self {
            table,
            rowgroup_idx: 0,
            row_idx: 0,
            current: None,
        };
        iter.load_current();
        iter
    }

    /// Whether the iterator points at a row.
    pub fn valid(&self) -> bool {
        self.current.is_some()
    }

    /// Current primary key. Panics when invalid.
    pub fn key(&self) -> &[u8] {
        &self.current.as_ref().expect("iterator exhausted").0
    }

    /// Current row bytes; empty means tombstone. Panics when invalid.
    pub fn value(&self) -> &[u8] {
        &self.current.as_ref().expect("iterator exhausted").1
    }

    /// Advance to the next row.
    pub fn next(&mut self) {
        if self.current.is_none() {
            return;
        }
        self.row_idx += 1;
        if let Some(rg) = self.table.rowgroups().get(self.rowgroup_idx)
            && self.row_idx >= rg.row_count as usize
        {
            self.rowgroup_idx += 1;
            self.row_idx = 0;
        }
        self.load_current();
    }

    fn load_current(&mut self) {
        self.current = None;
        // Skip empty RowGroups (possible only in degenerate files).
        while let Some(rg) = self.table.rowgroups().get(self.rowgroup_idx) {
            if self.row_idx < rg.row_count as usize {
                let key = self.table.key_at(rg, self.row_idx).to_vec();
                let row = self.table.row_or_tombstone(rg, self.row_idx);
                self.current = Some((key, row));
                return;
            }
            self.rowgroup_idx += 1;
            self.row_idx = 0;
        }
    }
}

impl Iterator for SSTableIterator {
    type Item = (Vec<u8>, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.current.clone()?;
        SSTableIterator::next(self);
        Some(item)
    }
}
