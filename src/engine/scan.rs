//! Selection-vector column scans.
//!
//! A scan answers "the current value of column `c` for every live
//! primary key, in key order" without materializing whole rows. It
//! runs in two phases:
//!
//! 1. **Select** — one merge pass over the primary-key streams of
//!    every source (mutable memtable, immutables, every SSTable),
//!    newest-first. The winning `(source, rowgroup, row)` of each live
//!    key is appended to the selection vector; tombstoned keys are
//!    skipped. Consecutive rows of the same RowGroup collapse into
//!    contiguous runs.
//! 2. **Materialize** — walk the runs in order, appending rows to the
//!    destination column. A run covering an entire RowGroup takes the
//!    whole-chunk fast path; partial runs decode row-by-row; memtable
//!    runs decode the stored row bytes.
//!
//! `scan_columns` computes the selection exactly once and materializes
//! each requested column from it.

use std::sync::Arc;

use tracing::debug;

use crate::column::Column;
use crate::encoding::decode_column;
use crate::sstable::column_reader::{append_rowgroup_column, append_rowgroup_rows};
use crate::sstable::SsTable;
use crate::types::compare_keys;

use super::{EngineError, TreeCore};

/// One data source feeding the scan, in precedence order.
enum ScanSource {
    /// Sorted, deduplicated memtable snapshot (tombstones included).
    Mem { rows: Vec<(Vec<u8>, Vec<u8>)> },
    /// An open SSTable.
    Table { table: Arc<SsTable> },
}

/// Cursor position within one source.
struct Cursor {
    source: usize,
    rowgroup: usize,
    row: usize,
}

/// A contiguous run of selected rows within one source RowGroup.
struct SelectedRun {
    source: usize,
    rowgroup: usize,
    start: u32,
    count: u32,
}

/// Selected rows across all sources, in global key order.
#[derive(Default)]
struct SelectionVector {
    runs: Vec<SelectedRun>,
    total_rows: usize,
}

impl SelectionVector {
    fn add_row(&mut self, source: usize, rowgroup: usize, row: u32) {
        self.total_rows += 1;
        if let Some(last) = self.runs.last_mut()
            && last.source == source
            && last.rowgroup == rowgroup
            && row == last.start + last.count
        {
            last.count += 1;
            return;
        }
        self.runs.push(SelectedRun {
            source,
            rowgroup,
            start: row,
            count: 1,
        });
    }
}

fn cursor_key<'a>(sources: &'a [ScanSource], cursor: &Cursor) -> Option<&'a [u8]> {
    match &sources[cursor.source] {
        ScanSource::Mem { rows } => rows.get(cursor.row).map(|(k, _)| k.as_slice()),
        ScanSource::Table { table } => {
            let rg = table.rowgroups().get(cursor.rowgroup)?;
            Some(table.key_at(rg, cursor.row))
        }
    }
}

fn cursor_is_tombstone(sources: &[ScanSource], cursor: &Cursor) -> bool {
    match &sources[cursor.source] {
        ScanSource::Mem { rows } => rows[cursor.row].1.is_empty(),
        ScanSource::Table { table } => {
            let rg = &table.rowgroups()[cursor.rowgroup];
            table.is_null(rg, table.primary_key_idx(), cursor.row)
        }
    }
}

fn cursor_advance(sources: &[ScanSource], cursor: &mut Cursor) {
    match &sources[cursor.source] {
        ScanSource::Mem { .. } => cursor.row += 1,
        ScanSource::Table { table } => {
            cursor.row += 1;
            while let Some(rg) = table.rowgroups().get(cursor.rowgroup) {
                if cursor.row < rg.row_count as usize {
                    break;
                }
                cursor.rowgroup += 1;
                cursor.row = 0;
            }
        }
    }
}

/// Gather sources in precedence order: mutable memtable, immutables
/// newest-first, L0 files by descending id, then levels 1+.
fn collect_sources(core: &TreeCore) -> Result<Vec<ScanSource>, EngineError> {
    let mut sources = Vec::new();

    let mutable = {
        core.mutable
            .read()
            .map_err(|_| EngineError::Internal("memtable latch poisoned".into()))?
            .clone()
    };
    sources.push(ScanSource::Mem {
        rows: mutable.entries_snapshot()?,
    });

    let state = core
        .state
        .read()
        .map_err(|_| EngineError::Internal("state lock poisoned".into()))?;

    for imm in &state.immutables {
        sources.push(ScanSource::Mem {
            rows: imm.entries_snapshot()?,
        });
    }

    let mut l0_ids: Vec<u32> = state.levels[0]
        .sstables
        .iter()
        .map(|m| m.sstable_id)
        .collect();
    l0_ids.sort_unstable_by(|a, b| b.cmp(a));
    for id in l0_ids {
        if let Some(table) = state.readers.get(&id) {
            sources.push(ScanSource::Table {
                table: Arc::clone(table),
            });
        }
    }

    for level in state.levels.iter().skip(1) {
        for meta in &level.sstables {
            if let Some(table) = state.readers.get(&meta.sstable_id) {
                sources.push(ScanSource::Table {
                    table: Arc::clone(table),
                });
            }
        }
    }

    Ok(sources)
}

/// Run the selection merge over all sources.
fn build_selection(core: &TreeCore, sources: &[ScanSource]) -> SelectionVector {
    let key_type = core.key_type();
    let mut cursors: Vec<Cursor> = (0..sources.len())
        .map(|source| Cursor {
            source,
            rowgroup: 0,
            row: 0,
        })
        .collect();
    // Seat table cursors past any empty leading RowGroups.
    for cursor in &mut cursors {
        if let ScanSource::Table { table } = &sources[cursor.source] {
            while let Some(rg) = table.rowgroups().get(cursor.rowgroup) {
                if rg.row_count > 0 {
                    break;
                }
                cursor.rowgroup += 1;
            }
        }
    }

    let mut selection = SelectionVector::default();
    loop {
        // Winner: minimum key; ties go to the earliest (newest) source.
        let mut winner: Option<usize> = None;
        for (idx, cursor) in cursors.iter().enumerate() {
            let Some(key) = cursor_key(sources, cursor) else {
                continue;
            };
            winner = match winner {
                None => Some(idx),
                Some(w) => {
                    let wkey = cursor_key(sources, &cursors[w]).expect("winner valid");
                    if compare_keys(key_type, key, wkey) == std::cmp::Ordering::Less {
                        Some(idx)
                    } else {
                        Some(w)
                    }
                }
            };
        }
        let Some(winner) = winner else {
            break;
        };

        let key = cursor_key(sources, &cursors[winner])
            .expect("winner valid")
            .to_vec();
        if !cursor_is_tombstone(sources, &cursors[winner]) {
            let cursor = &cursors[winner];
            selection.add_row(cursor.source, cursor.rowgroup, cursor.row as u32);
        }

        // Advance every source past this key.
        for cursor in &mut cursors {
            while let Some(k) = cursor_key(sources, cursor) {
                if compare_keys(key_type, k, &key) != std::cmp::Ordering::Equal {
                    break;
                }
                cursor_advance(sources, cursor);
            }
        }
    }
    selection
}

/// Materialize one column from the selection.
fn materialize(
    core: &TreeCore,
    sources: &[ScanSource],
    selection: &SelectionVector,
    col_idx: usize,
) -> Result<Column, EngineError> {
    let mut column = Column::new(core.column_types[col_idx]);
    let column_count = core.column_types.len();

    for run in &selection.runs {
        match &sources[run.source] {
            ScanSource::Mem { rows } => {
                for row in run.start..run.start + run.count {
                    let value = decode_column(&rows[row as usize].1, col_idx, column_count)?;
                    column.push_raw(value);
                }
            }
            ScanSource::Table { table } => {
                let rg = &table.rowgroups()[run.rowgroup];
                if run.start == 0 && run.count == rg.row_count {
                    // Every row selected: single-copy chunk append.
                    append_rowgroup_column(table, rg, col_idx, &mut column)?;
                } else {
                    append_rowgroup_rows(
                        table,
                        rg,
                        col_idx,
                        run.start as usize,
                        run.count as usize,
                        &mut column,
                    )?;
                }
            }
        }
    }
    Ok(column)
}

/// Entry point used by the façade: one selection pass, one
/// materialization per requested column.
pub(crate) fn scan_columns(
    core: &TreeCore,
    col_indices: &[usize],
) -> Result<Vec<Column>, EngineError> {
    let sources = collect_sources(core)?;
    let selection = build_selection(core, &sources);
    debug!(
        sources = sources.len(),
        runs = selection.runs.len(),
        rows = selection.total_rows,
        "scan selection built"
    );

    col_indices
        .iter()
        .map(|&idx| materialize(core, &sources, &selection, idx))
        .collect()
}
