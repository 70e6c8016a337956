//! Sorted on-disk runs in PAX layout.
//!
//! An SSTable persists one sorted, deduplicated run of rows for a single
//! table. Rows are grouped into **RowGroups** (16 MiB target); inside a
//! RowGroup the data is laid out column-by-column (PAX), so a column
//! scan touches one contiguous region per column instead of striding
//! through rows.
//!
//! # On-disk layout
//!
//! ```text
//! [RowGroup 0: [col₀ chunk][col₁ chunk]…[key column]]   (4096-padded)
//! [RowGroup 1: …]                                        (4096-padded)
//! ...
//! [RowGroup metadata blob]
//! [footer: meta_offset u32 | meta_size u32 | rowgroup_count u32 |
//!          column_count u16 | primary_key_idx u16 | version u16 |
//!          reserved u16 | magic u32]
//! ```
//!
//! A column chunk is `[null bitmap?][packed values]` for fixed-width
//! columns and `[null bitmap?][offset table][string bytes]` for string
//! columns — null bitmap first, then offsets, then bytes. The bitmap
//! prefix is present iff the chunk has at least one NULL. The key
//! column at the RowGroup tail packs fixed-width primary keys for
//! binary search; for string primary keys it is empty and lookups go
//! through the primary-key column chunk's offset table instead.
//!
//! Each RowGroup additionally carries a bloom filter over its primary
//! keys and a per-column zone map (32-byte prefix truncation for
//! strings).
//!
//! # Concurrency model
//!
//! A built SSTable is immutable. The reader memory-maps the file
//! read-only at open, parses the footer and metadata once, and serves
//! every subsequent read straight out of the map with no further I/O —
//! safe to share by reference across threads.

pub mod builder;
pub mod column_reader;
pub mod iterator;

#[cfg(test)]
mod tests;

use std::{fs::File, io, path::{Path, PathBuf}};

use memmap2::Mmap;
use thiserror::Error;
use tracing::debug;

use crate::bloom::BloomFilter;
use crate::encoding::{self, EncodingError};
use crate::types::{ValueType, compare_keys};

pub use builder::{SSTableBuilder, SSTableMeta};
pub use iterator::SSTableIterator;

/// Magic constant at the file tail.
pub const SSTABLE_MAGIC: u32 = 0x5A4B_5254;

/// Current format version.
pub const SSTABLE_VERSION: u16 = 2;

/// Fixed footer size: three `u32`, four `u16`, and the magic `u32`.
pub const FOOTER_SIZE: usize = 24;

/// Errors returned by SSTable operations (build, open, read).
#[derive(Debug, Error)]
pub enum SSTableError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Metadata encoding / decoding error.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Bad magic, bad version, or metadata that does not fit the file.
    #[error("corrupt SSTable: {0}")]
    Corrupt(String),

    /// Column index or schema mismatch.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

// ------------------------------------------------------------------------------------------------
// Metadata structures
// ------------------------------------------------------------------------------------------------

/// Per-column `(min, max)` summary. Values are the raw byte forms;
/// string bounds are truncated to a 32-byte prefix at build time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ZoneMap {
    pub has_value: bool,
    pub min: Vec<u8>,
    pub max: Vec<u8>,
}

impl ZoneMap {
    /// Whether any value in `[lo, hi]` can exist in this chunk.
    ///
    /// Absent zones answer `true` — a chunk without a summary can never
    /// be skipped. String bounds are prefixes, so the comparison stays
    /// conservative: a truncated `max` orders before the real maximum
    /// only when the real value extends the prefix, and prefix
    /// comparison already treats the prefix as ≤ any extension.
    pub fn may_intersect(&self, value_type: ValueType, lo: &[u8], hi: &[u8]) -> bool {
        if !self.has_value {
            return true;
        }
        if value_type == ValueType::String {
            // max is a ≤ 32-byte prefix of the true maximum; a range
            // starting beyond every extension of that prefix cannot
            // match only if lo > max-prefix extended maximally, which
            // prefix comparison cannot prove. Be conservative on that
            // side using a prefix test.
            let hi_before_min = compare_keys(value_type, hi, &self.min) == std::cmp::Ordering::Less;
            let lo_past_max = !self.max.is_empty()
                && lo.len() >= self.max.len()
                && &lo[..self.max.len()] > self.max.as_slice();
            return !hi_before_min && !lo_past_max;
        }
        crate::types::key_ranges_overlap(value_type, lo, hi, &self.min, &self.max)
    }
}

/// Location and summary of one column chunk within a RowGroup.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ColumnChunkMeta {
    /// Chunk offset relative to the RowGroup base.
    pub offset: u32,
    /// Chunk size, null bitmap included.
    pub size: u32,
    pub zone: ZoneMap,
    /// Whether the chunk starts with a null bitmap prefix.
    pub has_nulls: bool,
}

/// Metadata of one RowGroup, serialized into the file's metadata blob.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowGroupMeta {
    /// RowGroup offset within the file.
    pub offset: u32,
    pub row_count: u32,
    pub columns: Vec<ColumnChunkMeta>,
    /// Serialized bloom filter over the primary keys.
    pub bloom: Vec<u8>,
    /// Largest primary key in the group (raw byte form).
    pub max_key: Vec<u8>,
    /// Packed key column location relative to the RowGroup base;
    /// `key_column_size == 0` for string primary keys.
    pub key_column_offset: u32,
    pub key_column_size: u32,
}

impl RowGroupMeta {
    /// Append the serialized form to `out`. Zone map encoding depends on
    /// the column type: numeric bounds are written in native width even
    /// when absent (as zeros), string bounds as length-prefixed bytes.
    pub fn serialize(&self, types: &[ValueType], out: &mut Vec<u8>) {
        encoding::put_u32(out, self.offset);
        encoding::put_u32(out, self.row_count);
        for (col, &ty) in self.columns.iter().zip(types) {
            encoding::put_u32(out, col.offset);
            encoding::put_u32(out, col.size);
            out.push(col.zone.has_value as u8);
            out.push(col.has_nulls as u8);
            match ty {
                ValueType::Int => {
                    let (min, max) = fixed_zone_bounds::<4>(&col.zone);
                    out.extend_from_slice(&min);
                    out.extend_from_slice(&max);
                }
                ValueType::Double => {
                    let (min, max) = fixed_zone_bounds::<8>(&col.zone);
                    out.extend_from_slice(&min);
                    out.extend_from_slice(&max);
                }
                ValueType::String => {
                    let (min, max) = if col.zone.has_value {
                        (col.zone.min.as_slice(), col.zone.max.as_slice())
                    } else {
                        (&[][..], &[][..])
                    };
                    encoding::put_u16(out, min.len() as u16);
                    out.extend_from_slice(min);
                    encoding::put_u16(out, max.len() as u16);
                    out.extend_from_slice(max);
                }
                ValueType::Null => {}
            }
        }
        encoding::put_u32(out, self.bloom.len() as u32);
        out.extend_from_slice(&self.bloom);
        encoding::put_u32(out, self.max_key.len() as u32);
        out.extend_from_slice(&self.max_key);
        encoding::put_u32(out, self.key_column_offset);
        encoding::put_u32(out, self.key_column_size);
    }

    /// Decode one RowGroup's metadata starting at `*offset`.
    pub fn deserialize(
        buf: &[u8],
        offset: &mut usize,
        types: &[ValueType],
    ) -> Result<Self, EncodingError> {
        let mut meta = RowGroupMeta {
            offset: encoding::read_u32(buf, offset)?,
            row_count: encoding::read_u32(buf, offset)?,
            ..Default::default()
        };
        meta.columns.reserve(types.len());
        for &ty in types {
            let mut col = ColumnChunkMeta {
                offset: encoding::read_u32(buf, offset)?,
                size: encoding::read_u32(buf, offset)?,
                ..Default::default()
            };
            col.zone.has_value = encoding::take(buf, offset, 1)?[0] != 0;
            col.has_nulls = encoding::take(buf, offset, 1)?[0] != 0;
            match ty {
                ValueType::Int => {
                    let min = encoding::take(buf, offset, 4)?.to_vec();
                    let max = encoding::take(buf, offset, 4)?.to_vec();
                    if col.zone.has_value {
                        col.zone.min = min;
                        col.zone.max = max;
                    }
                }
                ValueType::Double => {
                    let min = encoding::take(buf, offset, 8)?.to_vec();
                    let max = encoding::take(buf, offset, 8)?.to_vec();
                    if col.zone.has_value {
                        col.zone.min = min;
                        col.zone.max = max;
                    }
                }
                ValueType::String => {
                    let min_len = encoding::read_u16(buf, offset)? as usize;
                    col.zone.min = encoding::take(buf, offset, min_len)?.to_vec();
                    let max_len = encoding::read_u16(buf, offset)? as usize;
                    col.zone.max = encoding::take(buf, offset, max_len)?.to_vec();
                }
                ValueType::Null => {}
            }
            meta.columns.push(col);
        }
        let bloom_size = encoding::read_u32(buf, offset)? as usize;
        meta.bloom = encoding::take(buf, offset, bloom_size)?.to_vec();
        let key_size = encoding::read_u32(buf, offset)? as usize;
        meta.max_key = encoding::take(buf, offset, key_size)?.to_vec();
        meta.key_column_offset = encoding::read_u32(buf, offset)?;
        meta.key_column_size = encoding::read_u32(buf, offset)?;
        Ok(meta)
    }

    /// Bytes occupied by the null bitmap prefix of column `col_idx`.
    pub fn null_bitmap_bytes(&self, col_idx: usize) -> usize {
        if self.columns[col_idx].has_nulls {
            (self.row_count as usize).div_ceil(8)
        } else {
            0
        }
    }
}

fn fixed_zone_bounds<const N: usize>(zone: &ZoneMap) -> ([u8; N], [u8; N]) {
    let mut min = [0u8; N];
    let mut max = [0u8; N];
    if zone.has_value && zone.min.len() == N && zone.max.len() == N {
        min.copy_from_slice(&zone.min);
        max.copy_from_slice(&zone.max);
    }
    (min, max)
}

/// The fixed file footer.
#[derive(Debug, Clone, PartialEq)]
pub struct Footer {
    pub meta_offset: u32,
    pub meta_size: u32,
    pub rowgroup_count: u32,
    pub column_count: u16,
    pub primary_key_idx: u16,
    pub version: u16,
}

impl Footer {
    pub fn serialize(&self, out: &mut Vec<u8>) {
        encoding::put_u32(out, self.meta_offset);
        encoding::put_u32(out, self.meta_size);
        encoding::put_u32(out, self.rowgroup_count);
        encoding::put_u16(out, self.column_count);
        encoding::put_u16(out, self.primary_key_idx);
        encoding::put_u16(out, self.version);
        encoding::put_u16(out, 0); // reserved
        encoding::put_u32(out, SSTABLE_MAGIC);
    }

    pub fn deserialize(buf: &[u8]) -> Result<Self, SSTableError> {
        if buf.len() != FOOTER_SIZE {
            return Err(SSTableError::Corrupt(format!(
                "footer size {} (expected {FOOTER_SIZE})",
                buf.len()
            )));
        }
        let mut offset = 0;
        let footer = Footer {
            meta_offset: encoding::read_u32(buf, &mut offset)?,
            meta_size: encoding::read_u32(buf, &mut offset)?,
            rowgroup_count: encoding::read_u32(buf, &mut offset)?,
            column_count: encoding::read_u16(buf, &mut offset)?,
            primary_key_idx: encoding::read_u16(buf, &mut offset)?,
            version: encoding::read_u16(buf, &mut offset)?,
        };
        let _reserved = encoding::read_u16(buf, &mut offset)?;
        let magic = encoding::read_u32(buf, &mut offset)?;
        if magic != SSTABLE_MAGIC {
            return Err(SSTableError::Corrupt(format!("bad magic {magic:#010x}")));
        }
        if footer.version != SSTABLE_VERSION {
            return Err(SSTableError::Corrupt(format!(
                "unsupported version {}",
                footer.version
            )));
        }
        Ok(footer)
    }
}

// ------------------------------------------------------------------------------------------------
// SsTable — immutable mmap reader
// ------------------------------------------------------------------------------------------------

/// A fully memory-mapped, immutable SSTable.
pub struct SsTable {
    /// Unique identifier (the file stem).
    pub id: u32,

    mmap: Mmap,
    path: PathBuf,
    file_size: u64,
    column_types: Vec<ValueType>,
    primary_key_idx: usize,
    rowgroups: Vec<RowGroupMeta>,
}

impl SsTable {
    /// Open and memory-map `<id>.sst` inside `dir`, validating the
    /// footer and parsing all RowGroup metadata.
    pub fn open(
        dir: &Path,
        id: u32,
        column_types: Vec<ValueType>,
    ) -> Result<Self, SSTableError> {
        let path = dir.join(format!("{id}.sst"));
        let file = File::open(&path)?;
        let file_size = file.metadata()?.len();
        if (file_size as usize) < FOOTER_SIZE {
            return Err(SSTableError::Corrupt(format!(
                "file too small ({file_size} bytes)"
            )));
        }
        // The map stays read-only for the lifetime of the reader.
        let mmap = unsafe { Mmap::map(&file)? };

        let footer = Footer::deserialize(&mmap[mmap.len() - FOOTER_SIZE..])?;
        if footer.column_count as usize != column_types.len() {
            return Err(SSTableError::Corrupt(format!(
                "column count {} does not match schema ({})",
                footer.column_count,
                column_types.len()
            )));
        }
        let meta_start = footer.meta_offset as usize;
        let meta_end = meta_start
            .checked_add(footer.meta_size as usize)
            .filter(|&end| end <= mmap.len() - FOOTER_SIZE)
            .ok_or_else(|| SSTableError::Corrupt("metadata blob out of bounds".into()))?;

        let blob = &mmap[meta_start..meta_end];
        let mut offset = 0;
        let mut rowgroups = Vec::with_capacity(footer.rowgroup_count as usize);
        for _ in 0..footer.rowgroup_count {
            rowgroups.push(RowGroupMeta::deserialize(blob, &mut offset, &column_types)?);
        }

        debug!(
            id,
            rowgroups = rowgroups.len(),
            file_size,
            path = %path.display(),
            "SSTable opened"
        );

        Ok(Self {
            id,
            mmap,
            path,
            file_size,
            primary_key_idx: footer.primary_key_idx as usize,
            column_types,
            rowgroups,
        })
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn column_types(&self) -> &[ValueType] {
        &self.column_types
    }

    pub fn primary_key_idx(&self) -> usize {
        self.primary_key_idx
    }

    pub fn rowgroups(&self) -> &[RowGroupMeta] {
        &self.rowgroups
    }

    /// Total row count across all RowGroups.
    pub fn row_count(&self) -> usize {
        self.rowgroups.iter().map(|rg| rg.row_count as usize).sum()
    }

    fn key_type(&self) -> ValueType {
        self.column_types[self.primary_key_idx]
    }

    /// Raw bytes of one RowGroup.
    pub(crate) fn rowgroup_data(&self, rg: &RowGroupMeta) -> &[u8] {
        &self.mmap[rg.offset as usize..]
    }

    /// Smallest key in the file (first key of the first RowGroup).
    pub fn min_key(&self) -> Option<Vec<u8>> {
        let rg = self.rowgroups.first()?;
        if rg.row_count == 0 {
            return None;
        }
        Some(self.key_at(rg, 0).to_vec())
    }

    /// Largest key in the file.
    pub fn max_key(&self) -> Option<Vec<u8>> {
        self.rowgroups.last().map(|rg| rg.max_key.clone())
    }

    /// Borrow the primary key of row `row_idx` within a RowGroup.
    pub(crate) fn key_at<'a>(&'a self, rg: &RowGroupMeta, row_idx: usize) -> &'a [u8] {
        let base = self.rowgroup_data(rg);
        let width = self.key_type().fixed_size();
        if width != 0 && rg.key_column_size != 0 {
            let start = rg.key_column_offset as usize + row_idx * width;
            return &base[start..start + width];
        }
        // String primary key: read through the PK column chunk.
        self.string_value(rg, self.primary_key_idx, row_idx)
    }

    /// Borrow a string column value through its offset table.
    pub(crate) fn string_value<'a>(
        &'a self,
        rg: &RowGroupMeta,
        col_idx: usize,
        row_idx: usize,
    ) -> &'a [u8] {
        let base = self.rowgroup_data(rg);
        let col = &rg.columns[col_idx];
        let chunk = &base[col.offset as usize + rg.null_bitmap_bytes(col_idx)..];
        let read_off = |i: usize| {
            let raw = &chunk[i * 4..i * 4 + 4];
            u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize
        };
        let start = read_off(row_idx);
        let end = read_off(row_idx + 1);
        let data = &chunk[(rg.row_count as usize + 1) * 4..];
        &data[start..end]
    }

    /// Borrow a fixed-width column value.
    pub(crate) fn fixed_value<'a>(
        &'a self,
        rg: &RowGroupMeta,
        col_idx: usize,
        row_idx: usize,
    ) -> &'a [u8] {
        let base = self.rowgroup_data(rg);
        let col = &rg.columns[col_idx];
        let width = self.column_types[col_idx].fixed_size();
        let start = col.offset as usize + rg.null_bitmap_bytes(col_idx) + row_idx * width;
        &base[start..start + width]
    }

    /// Whether `(col, row)` is NULL according to the chunk's bitmap.
    pub(crate) fn is_null(&self, rg: &RowGroupMeta, col_idx: usize, row_idx: usize) -> bool {
        if !rg.columns[col_idx].has_nulls {
            return false;
        }
        let base = self.rowgroup_data(rg);
        let bitmap = &base[rg.columns[col_idx].offset as usize..];
        (bitmap[row_idx / 8] >> (row_idx % 8)) & 1 == 1
    }

    /// Reconstruct one stored row in the memtable convention: the
    /// row-codec bytes for a live row, or an empty vec for a tombstone.
    ///
    /// Tombstones are stored as rows whose primary-key column is marked
    /// NULL (the key bytes themselves stay readable for merging).
    pub(crate) fn row_or_tombstone(&self, rg: &RowGroupMeta, row_idx: usize) -> Vec<u8> {
        if self.is_null(rg, self.primary_key_idx, row_idx) {
            return Vec::new();
        }
        self.row_bytes(rg, row_idx)
    }

    /// Reconstruct the full row-codec bytes of one row.
    pub(crate) fn row_bytes(&self, rg: &RowGroupMeta, row_idx: usize) -> Vec<u8> {
        let mut row = Vec::new();
        for (col_idx, &ty) in self.column_types.iter().enumerate() {
            if ty == ValueType::Null || self.is_null(rg, col_idx, row_idx) {
                encoding::append_column(&mut row, b"");
                continue;
            }
            let value = match ty {
                ValueType::String => self.string_value(rg, col_idx, row_idx),
                _ => self.fixed_value(rg, col_idx, row_idx),
            };
            encoding::append_column(&mut row, value);
        }
        row
    }

    /// Point lookup: RowGroup binary search by `max_key`, bloom probe,
    /// then binary search of the primary-key column.
    ///
    /// Returns the stored row bytes; a zero-length row is a tombstone
    /// the caller must interpret.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let key_type = self.key_type();

        // First RowGroup whose max_key >= key can contain it; groups are
        // key-sorted within the file.
        let rg_idx = self.rowgroups.partition_point(|rg| {
            compare_keys(key_type, &rg.max_key, key) == std::cmp::Ordering::Less
        });
        let rg = self.rowgroups.get(rg_idx)?;
        if rg.row_count == 0 {
            return None;
        }

        if !BloomFilter::new(&rg.bloom).may_contain(key) {
            return None;
        }

        let rows = rg.row_count as usize;
        let mut lo = 0usize;
        let mut hi = rows;
        while lo < hi {
            let mid = (lo + hi) / 2;
            match compare_keys(key_type, self.key_at(rg, mid), key) {
                std::cmp::Ordering::Less => lo = mid + 1,
                _ => hi = mid,
            }
        }
        if lo < rows && self.key_at(rg, lo) == key {
            return Some(self.row_or_tombstone(rg, lo));
        }
        None
    }

    /// Iterate `(key, row_bytes)` pairs in key order.
    pub fn iter(table: &std::sync::Arc<Self>) -> SSTableIterator {
        SSTableIterator::new(std::sync::Arc::clone(table))
    }

    /// RowGroup indices whose zone map for `col_idx` intersects
    /// `[lo, hi]` — the block-skipping entry point for predicate
    /// evaluation.
    pub fn prune_rowgroups(
        &self,
        col_idx: usize,
        lo: &[u8],
        hi: &[u8],
    ) -> Result<Vec<usize>, SSTableError> {
        if col_idx >= self.column_types.len() {
            return Err(SSTableError::InvalidArgument(format!(
                "column index {col_idx} out of range"
            )));
        }
        let value_type = self.column_types[col_idx];
        Ok(self
            .rowgroups
            .iter()
            .enumerate()
            .filter(|(_, rg)| rg.columns[col_idx].zone.may_intersect(value_type, lo, hi))
            .map(|(idx, _)| idx)
            .collect())
    }
}

impl std::fmt::Debug for SsTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SsTable")
            .field("id", &self.id)
            .field("rowgroups", &self.rowgroups.len())
            .field("file_size", &self.file_size)
            .finish_non_exhaustive()
    }
}
