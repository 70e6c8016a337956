//! SSTable builder: sorted `(key, row)` stream in, one PAX file out.
//!
//! Rows are decoded into per-column builders; when the projected
//! encoded size of the current RowGroup reaches the target, the group
//! is sealed — columns are emitted in declared order, the packed key
//! column is appended, the group is padded to the alignment boundary,
//! and its metadata (zone maps, bloom filter, key column location) is
//! staged for the file's metadata blob. `finish` writes the blob and
//! the fixed footer.
//!
//! The builder never installs the file; the caller registers it in the
//! manifest after a successful `finish`. A file without a valid footer
//! (interrupted build) is invisible to recovery and gets garbage
//! collected.
//!
//! Tombstones arrive as zero-length rows. They are stored as rows whose
//! primary-key column carries the key bytes but is flagged NULL in the
//! chunk bitmap; every other column is NULL. Readers reverse this into
//! the zero-length-row convention.

use std::{
    fs::File,
    io::Write,
    path::{Path, PathBuf},
};

use tracing::{debug, info};

use crate::bloom::BloomFilterBuilder;
use crate::encoding;
use crate::types::{ValueType, compare_keys, decode_double_key, decode_int_key};

use super::{ColumnChunkMeta, Footer, RowGroupMeta, SSTableError, ZoneMap};

/// Summary of a finished SSTable, used for level registration.
#[derive(Debug, Clone, PartialEq)]
pub struct SSTableMeta {
    pub sstable_id: u32,
    pub min_key: Vec<u8>,
    pub max_key: Vec<u8>,
    pub file_size: u64,
}

// ------------------------------------------------------------------------------------------------
// Zone map accumulation
// ------------------------------------------------------------------------------------------------

struct ZoneMapBuilder {
    ty: ValueType,
    has_value: bool,
    min_int: i32,
    max_int: i32,
    min_double: f64,
    max_double: f64,
    min_string: Vec<u8>,
    max_string: Vec<u8>,
}

impl ZoneMapBuilder {
    fn new(ty: ValueType) -> Self {
        Self {
            ty,
            has_value: false,
            min_int: 0,
            max_int: 0,
            min_double: 0.0,
            max_double: 0.0,
            min_string: Vec::new(),
            max_string: Vec::new(),
        }
    }

    fn update(&mut self, value: &[u8]) {
        if value.is_empty() {
            return;
        }
        match self.ty {
            ValueType::Int => {
                let Some(v) = decode_int_key(value) else {
                    return;
                };
                if !self.has_value {
                    self.min_int = v;
                    self.max_int = v;
                    self.has_value = true;
                } else {
                    self.min_int = self.min_int.min(v);
                    self.max_int = self.max_int.max(v);
                }
            }
            ValueType::Double => {
                let Some(v) = decode_double_key(value) else {
                    return;
                };
                if !self.has_value {
                    self.min_double = v;
                    self.max_double = v;
                    self.has_value = true;
                } else {
                    self.min_double = self.min_double.min(v);
                    self.max_double = self.max_double.max(v);
                }
            }
            ValueType::String => {
                if !self.has_value {
                    self.min_string = value.to_vec();
                    self.max_string = value.to_vec();
                    self.has_value = true;
                } else {
                    if value < self.min_string.as_slice() {
                        self.min_string = value.to_vec();
                    }
                    if value > self.max_string.as_slice() {
                        self.max_string = value.to_vec();
                    }
                }
            }
            ValueType::Null => {}
        }
    }

    fn finish(&self, prefix_len: usize) -> ZoneMap {
        if !self.has_value {
            return ZoneMap::default();
        }
        let (min, max) = match self.ty {
            ValueType::Int => (
                self.min_int.to_le_bytes().to_vec(),
                self.max_int.to_le_bytes().to_vec(),
            ),
            ValueType::Double => (
                self.min_double.to_le_bytes().to_vec(),
                self.max_double.to_le_bytes().to_vec(),
            ),
            ValueType::String => {
                let truncate = |s: &[u8]| s[..s.len().min(prefix_len)].to_vec();
                (truncate(&self.min_string), truncate(&self.max_string))
            }
            ValueType::Null => return ZoneMap::default(),
        };
        ZoneMap {
            has_value: true,
            min,
            max,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Per-column chunk accumulation
// ------------------------------------------------------------------------------------------------

struct ColumnBuilder {
    ty: ValueType,
    data: Vec<u8>,
    /// String columns only: running offsets, seeded with 0.
    offsets: Vec<u32>,
    zone: ZoneMapBuilder,
    null_bitmap: Vec<u8>,
    has_nulls: bool,
    row_count: u32,
}

impl ColumnBuilder {
    fn new(ty: ValueType) -> Self {
        Self {
            ty,
            data: Vec::new(),
            offsets: if ty == ValueType::String {
                vec![0]
            } else {
                Vec::new()
            },
            zone: ZoneMapBuilder::new(ty),
            null_bitmap: Vec::new(),
            has_nulls: false,
            row_count: 0,
        }
    }

    fn set_null_bit(&mut self) {
        let byte = (self.row_count / 8) as usize;
        if byte >= self.null_bitmap.len() {
            self.null_bitmap.resize(byte + 1, 0);
        }
        self.null_bitmap[byte] |= 1 << (self.row_count % 8);
        self.has_nulls = true;
    }

    /// Append one value; an empty slice appends NULL.
    fn append(&mut self, value: &[u8]) {
        let is_null = value.is_empty();
        match self.ty {
            ValueType::String => {
                if is_null {
                    self.set_null_bit();
                    self.offsets.push(*self.offsets.last().unwrap_or(&0));
                } else {
                    self.data.extend_from_slice(value);
                    self.offsets.push(self.data.len() as u32);
                    self.zone.update(value);
                }
            }
            ValueType::Int | ValueType::Double => {
                let width = self.ty.fixed_size();
                if is_null || value.len() != width {
                    self.set_null_bit();
                    self.data.extend(std::iter::repeat_n(0u8, width));
                } else {
                    self.data.extend_from_slice(value);
                    self.zone.update(value);
                }
            }
            ValueType::Null => {}
        }
        self.row_count += 1;
    }

    /// Append the primary key of a tombstone row: the key bytes are
    /// stored so merges can read them, but the null bit marks the row
    /// deleted.
    fn append_tombstone_key(&mut self, key: &[u8]) {
        self.set_null_bit();
        match self.ty {
            ValueType::String => {
                self.data.extend_from_slice(key);
                self.offsets.push(self.data.len() as u32);
            }
            ValueType::Int | ValueType::Double => {
                let width = self.ty.fixed_size();
                if key.len() == width {
                    self.data.extend_from_slice(key);
                } else {
                    self.data.extend(std::iter::repeat_n(0u8, width));
                }
            }
            ValueType::Null => {}
        }
        self.row_count += 1;
    }

    fn bitmap_bytes(&self) -> usize {
        if self.has_nulls {
            (self.row_count as usize).div_ceil(8)
        } else {
            0
        }
    }

    /// Emit `[bitmap?][payload]` into `out`, returning the chunk meta.
    fn emit(&self, out: &mut Vec<u8>, offset: u32, zone_prefix_len: usize) -> ColumnChunkMeta {
        let start = out.len();
        if self.has_nulls {
            let mut bitmap = self.null_bitmap.clone();
            bitmap.resize(self.bitmap_bytes(), 0);
            out.extend_from_slice(&bitmap);
        }
        if self.ty == ValueType::String {
            for &off in &self.offsets {
                encoding::put_u32(out, off);
            }
        }
        out.extend_from_slice(&self.data);

        ColumnChunkMeta {
            offset,
            size: (out.len() - start) as u32,
            zone: self.zone.finish(zone_prefix_len),
            has_nulls: self.has_nulls,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// RowGroup accumulation
// ------------------------------------------------------------------------------------------------

struct RowGroupBuilder {
    column_types: Vec<ValueType>,
    primary_key_idx: usize,
    columns: Vec<ColumnBuilder>,
    keys: Vec<Vec<u8>>,
    current_size: usize,
    target_size: usize,
    zone_prefix_len: usize,
}

impl RowGroupBuilder {
    fn new(
        column_types: Vec<ValueType>,
        primary_key_idx: usize,
        target_size: usize,
        zone_prefix_len: usize,
    ) -> Self {
        let mut builder = Self {
            column_types,
            primary_key_idx,
            columns: Vec::new(),
            keys: Vec::new(),
            current_size: 0,
            target_size,
            zone_prefix_len,
        };
        builder.reset();
        builder
    }

    fn reset(&mut self) {
        self.columns = self
            .column_types
            .iter()
            .map(|&ty| ColumnBuilder::new(ty))
            .collect();
        self.keys.clear();
        // Each string column starts with its seed offset word.
        self.current_size = self
            .column_types
            .iter()
            .filter(|ty| **ty == ValueType::String)
            .count()
            * size_of::<u32>();
    }

    fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    fn row_count(&self) -> u32 {
        self.keys.len() as u32
    }

    /// Try to add one row. Returns `false` (without adding) when the
    /// group is non-empty and the row would push it past the target.
    fn add_row(&mut self, key: &[u8], row: &[u8]) -> Result<bool, SSTableError> {
        let values: Vec<&[u8]> = if row.is_empty() {
            Vec::new() // tombstone
        } else {
            encoding::decode_row(row, self.column_types.len())?
        };

        let mut size_inc = 0usize;
        for (idx, &ty) in self.column_types.iter().enumerate() {
            let len = if values.is_empty() {
                if idx == self.primary_key_idx { key.len() } else { 0 }
            } else {
                values[idx].len()
            };
            size_inc += match ty {
                ValueType::String => size_of::<u32>() + len,
                _ => ty.fixed_size(),
            };
        }
        if !self.keys.is_empty() && self.current_size + size_inc > self.target_size {
            return Ok(false);
        }

        if values.is_empty() {
            for idx in 0..self.columns.len() {
                if idx == self.primary_key_idx {
                    self.columns[idx].append_tombstone_key(key);
                } else {
                    self.columns[idx].append(b"");
                }
            }
        } else {
            for (col, value) in self.columns.iter_mut().zip(&values) {
                col.append(value);
            }
        }
        self.keys.push(key.to_vec());
        self.current_size += size_inc;
        Ok(true)
    }

    /// Seal the group: emit all chunks plus the key column into `data`
    /// and produce its metadata (offset left for the caller to fill).
    fn build(&self, data: &mut Vec<u8>) -> RowGroupMeta {
        let mut meta = RowGroupMeta {
            row_count: self.row_count(),
            ..Default::default()
        };
        data.clear();

        for col in &self.columns {
            let offset = data.len() as u32;
            meta.columns
                .push(col.emit(data, offset, self.zone_prefix_len));
        }

        // Packed key column — fixed-width keys only; string primary
        // keys are reached through their column chunk's offset table.
        meta.key_column_offset = data.len() as u32;
        let key_width = self.column_types[self.primary_key_idx].fixed_size();
        if key_width != 0 {
            for key in &self.keys {
                data.extend_from_slice(key);
            }
            meta.key_column_size = (self.keys.len() * key_width) as u32;
        }

        if !self.keys.is_empty() {
            let mut bloom = BloomFilterBuilder::new(self.keys.len());
            for key in &self.keys {
                bloom.add_key(key);
            }
            meta.bloom = bloom.finish();
            meta.max_key = self.keys.last().cloned().unwrap_or_default();
        }
        meta
    }
}

// ------------------------------------------------------------------------------------------------
// SSTableBuilder
// ------------------------------------------------------------------------------------------------

/// Streams a sorted, deduplicated `(key, row)` sequence into one
/// `<id>.sst` file.
pub struct SSTableBuilder {
    path: PathBuf,
    file: File,
    sstable_id: u32,
    column_types: Vec<ValueType>,
    primary_key_idx: usize,
    alignment: usize,
    file_target_size: u64,
    rowgroup: RowGroupBuilder,
    rowgroups: Vec<RowGroupMeta>,
    data_size: u32,
    min_key: Option<Vec<u8>>,
    max_key: Vec<u8>,
    rows_added: u64,
}

impl SSTableBuilder {
    /// Create `<sstable_id>.sst` inside `dir` (truncating any partial
    /// previous attempt).
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        dir: &Path,
        sstable_id: u32,
        column_types: Vec<ValueType>,
        primary_key_idx: usize,
        rowgroup_target_size: usize,
        alignment: usize,
        file_target_size: u64,
        zone_map_prefix_len: usize,
    ) -> Result<Self, SSTableError> {
        if primary_key_idx >= column_types.len() {
            return Err(SSTableError::InvalidArgument(format!(
                "primary key index {primary_key_idx} out of range"
            )));
        }
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{sstable_id}.sst"));
        let file = File::create(&path)?;

        Ok(Self {
            path,
            file,
            sstable_id,
            rowgroup: RowGroupBuilder::new(
                column_types.clone(),
                primary_key_idx,
                rowgroup_target_size,
                zone_map_prefix_len,
            ),
            column_types,
            primary_key_idx,
            alignment,
            file_target_size,
            rowgroups: Vec::new(),
            data_size: 0,
            min_key: None,
            max_key: Vec::new(),
            rows_added: 0,
        })
    }

    /// Add the next row of the sorted stream. A zero-length `row`
    /// records a tombstone.
    ///
    /// Returns `Ok(false)` — with the row **not** added — when the file
    /// has reached its target size; the caller should `finish` this
    /// builder, open a new one, and re-add the row there.
    pub fn add(&mut self, key: &[u8], row: &[u8]) -> Result<bool, SSTableError> {
        if !self.rowgroup.add_row(key, row)? {
            self.seal_rowgroup()?;
            if u64::from(self.data_size) >= self.file_target_size {
                return Ok(false);
            }
            // A fresh group always accepts at least one row.
            self.rowgroup.add_row(key, row)?;
        }
        if self.min_key.is_none() {
            self.min_key = Some(key.to_vec());
        }
        self.max_key = key.to_vec();
        self.rows_added += 1;
        Ok(true)
    }

    /// Whether no rows have been added.
    pub fn is_empty(&self) -> bool {
        self.rows_added == 0
    }

    /// Bytes of sealed RowGroup data written so far.
    pub fn data_size(&self) -> u64 {
        u64::from(self.data_size)
    }

    fn seal_rowgroup(&mut self) -> Result<(), SSTableError> {
        if self.rowgroup.is_empty() {
            return Ok(());
        }
        let mut data = Vec::new();
        let mut meta = self.rowgroup.build(&mut data);
        meta.offset = self.data_size;

        let aligned = align_to(data.len(), self.alignment);
        self.file.write_all(&data)?;
        if aligned > data.len() {
            self.file.write_all(&vec![0u8; aligned - data.len()])?;
        }
        self.data_size += aligned as u32;

        debug!(
            sstable_id = self.sstable_id,
            rows = meta.row_count,
            bytes = data.len(),
            "RowGroup sealed"
        );
        self.rowgroups.push(meta);
        self.rowgroup.reset();
        Ok(())
    }

    /// Seal the last RowGroup, write the metadata blob and footer, and
    /// sync the file. Returns the file's level-registration summary.
    pub fn finish(mut self) -> Result<SSTableMeta, SSTableError> {
        self.seal_rowgroup()?;

        let mut blob = Vec::new();
        for rg in &self.rowgroups {
            rg.serialize(&self.column_types, &mut blob);
        }
        self.file.write_all(&blob)?;

        let mut footer = Vec::with_capacity(super::FOOTER_SIZE);
        Footer {
            meta_offset: self.data_size,
            meta_size: blob.len() as u32,
            rowgroup_count: self.rowgroups.len() as u32,
            column_count: self.column_types.len() as u16,
            primary_key_idx: self.primary_key_idx as u16,
            version: super::SSTABLE_VERSION,
        }
        .serialize(&mut footer);
        self.file.write_all(&footer)?;
        self.file.sync_all()?;

        let file_size = self.file.metadata()?.len();
        info!(
            sstable_id = self.sstable_id,
            rows = self.rows_added,
            rowgroups = self.rowgroups.len(),
            file_size,
            path = %self.path.display(),
            "SSTable built"
        );

        debug_assert!(self.min_key.as_deref().is_none_or(|min| {
            compare_keys(
                self.column_types[self.primary_key_idx],
                min,
                &self.max_key,
            ) != std::cmp::Ordering::Greater
        }));

        Ok(SSTableMeta {
            sstable_id: self.sstable_id,
            min_key: self.min_key.unwrap_or_default(),
            max_key: self.max_key,
            file_size,
        })
    }

    /// Abort the build, removing the partial file.
    pub fn abandon(self) -> Result<(), SSTableError> {
        let path = self.path.clone();
        drop(self);
        std::fs::remove_file(path)?;
        Ok(())
    }
}

fn align_to(size: usize, alignment: usize) -> usize {
    if alignment == 0 {
        return size;
    }
    size.div_ceil(alignment) * alignment
}
