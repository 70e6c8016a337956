//! Fast column materialization out of RowGroup chunks.
//!
//! Two paths feed a destination [`Column`]:
//!
//! - **Whole-chunk append** — when every row of a RowGroup is selected,
//!   fixed-width chunks are bulk-copied and string chunks append their
//!   offset table (rebased) plus one contiguous byte copy. No per-row
//!   decoding. This is what powers full-column reducers like SUM.
//! - **Selective decode** — when only some rows survive dedup, the
//!   selected rows are decoded individually.
//!
//! Null bitmaps are overlaid onto the destination column in both paths.

use crate::column::Column;
use crate::types::ValueType;

use super::{RowGroupMeta, SSTableError, SsTable};

/// Append the full contents of column `col_idx` of one RowGroup to
/// `dst` with at most one data copy.
pub fn append_rowgroup_column(
    table: &SsTable,
    rg: &RowGroupMeta,
    col_idx: usize,
    dst: &mut Column,
) -> Result<(), SSTableError> {
    if col_idx >= rg.columns.len() {
        return Err(SSTableError::InvalidArgument(format!(
            "column index {col_idx} out of range"
        )));
    }
    let row_count = rg.row_count as usize;
    if row_count == 0 {
        return Ok(());
    }

    let base = table.rowgroup_data(rg);
    let col = &rg.columns[col_idx];
    let bitmap_bytes = rg.null_bitmap_bytes(col_idx);
    let chunk = &base[col.offset as usize..(col.offset + col.size) as usize];
    let payload = &chunk[bitmap_bytes..];
    let dst_base = dst.len();

    match (table.column_types()[col_idx], dst) {
        (ValueType::Int, Column::Int(c)) => {
            c.append_chunk(payload, row_count);
            if col.has_nulls {
                c.nulls_mut()
                    .append_raw(dst_base, &chunk[..bitmap_bytes], row_count);
            }
        }
        (ValueType::Double, Column::Double(c)) => {
            c.append_chunk(payload, row_count);
            if col.has_nulls {
                c.nulls_mut()
                    .append_raw(dst_base, &chunk[..bitmap_bytes], row_count);
            }
        }
        (ValueType::String | ValueType::Null, Column::String(c)) => {
            // [offset₀ … offset_n][bytes]; offsets are chunk-relative.
            let mut offsets = Vec::with_capacity(row_count + 1);
            for raw in payload.chunks_exact(4).take(row_count + 1) {
                offsets.push(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]));
            }
            if offsets.len() < row_count + 1 {
                return Err(SSTableError::Corrupt(
                    "string offset table truncated".into(),
                ));
            }
            let data = &payload[(row_count + 1) * 4..];
            c.append_chunk(&offsets, row_count, data);
            if col.has_nulls {
                c.nulls_mut()
                    .append_raw(dst_base, &chunk[..bitmap_bytes], row_count);
            }
        }
        _ => {
            return Err(SSTableError::InvalidArgument(
                "destination column type mismatch".into(),
            ));
        }
    }
    Ok(())
}

/// Append rows `[start, start + count)` of column `col_idx`, decoding
/// row-by-row. Used when a RowGroup is only partially selected.
pub fn append_rowgroup_rows(
    table: &SsTable,
    rg: &RowGroupMeta,
    col_idx: usize,
    start: usize,
    count: usize,
    dst: &mut Column,
) -> Result<(), SSTableError> {
    if col_idx >= rg.columns.len() {
        return Err(SSTableError::InvalidArgument(format!(
            "column index {col_idx} out of range"
        )));
    }
    let ty = table.column_types()[col_idx];
    for row in start..start + count {
        if ty == ValueType::Null || table.is_null(rg, col_idx, row) {
            dst.push_raw(b"");
            continue;
        }
        let value = match ty {
            ValueType::String => table.string_value(rg, col_idx, row),
            _ => table.fixed_value(rg, col_idx, row),
        };
        dst.push_raw(value);
    }
    Ok(())
}
