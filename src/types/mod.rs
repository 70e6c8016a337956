//! Column value types and type-aware key comparison.
//!
//! Every column of the table carries a [`ValueType`] tag fixed at open
//! time. Hot paths branch on the tag once per column or per RowGroup,
//! never per row.
//!
//! Primary keys are compared with [`compare_keys`], which reinterprets
//! the raw bytes as the key's native type: `i32` for [`ValueType::Int`],
//! `f64` for [`ValueType::Double`], and lexicographic bytes for
//! [`ValueType::String`]. Every comparator site in the engine (memtable
//! search, merge iteration, compaction overlap tests, level binary
//! search) goes through this function.

#[cfg(test)]
mod tests;

use std::cmp::Ordering;

/// The type of a single table column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    /// 32-bit signed integer, 4 bytes little-endian on disk.
    Int,

    /// 64-bit IEEE-754 double, 8 bytes little-endian on disk.
    Double,

    /// Variable-length byte string.
    String,

    /// The untyped NULL column (no storage).
    Null,
}

impl ValueType {
    /// On-disk width of a fixed-size value, or 0 for variable-length
    /// and null types.
    pub fn fixed_size(self) -> usize {
        match self {
            ValueType::Int => size_of::<i32>(),
            ValueType::Double => size_of::<f64>(),
            ValueType::String | ValueType::Null => 0,
        }
    }

    /// Whether values of this type are stored as packed fixed-width
    /// arrays inside a RowGroup.
    pub fn is_fixed_width(self) -> bool {
        matches!(self, ValueType::Int | ValueType::Double)
    }
}

/// Decode a little-endian `i32` key. Returns `None` when the slice has
/// the wrong width.
pub fn decode_int_key(bytes: &[u8]) -> Option<i32> {
    Some(i32::from_le_bytes(bytes.try_into().ok()?))
}

/// Decode a little-endian `f64` key. Returns `None` when the slice has
/// the wrong width.
pub fn decode_double_key(bytes: &[u8]) -> Option<f64> {
    Some(f64::from_le_bytes(bytes.try_into().ok()?))
}

/// Compare two raw primary-key byte strings under the key's declared
/// type.
///
/// Keys whose width does not match the declared fixed width fall back to
/// lexicographic byte comparison, so malformed keys still order
/// deterministically instead of panicking.
pub fn compare_keys(key_type: ValueType, a: &[u8], b: &[u8]) -> Ordering {
    match key_type {
        ValueType::Int => match (decode_int_key(a), decode_int_key(b)) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => a.cmp(b),
        },
        ValueType::Double => match (decode_double_key(a), decode_double_key(b)) {
            (Some(x), Some(y)) => x.total_cmp(&y),
            _ => a.cmp(b),
        },
        ValueType::String | ValueType::Null => a.cmp(b),
    }
}

/// `true` when the ranges `[min1, max1]` and `[min2, max2]` intersect
/// under the key type's comparator.
pub fn key_ranges_overlap(
    key_type: ValueType,
    min1: &[u8],
    max1: &[u8],
    min2: &[u8],
    max2: &[u8],
) -> bool {
    compare_keys(key_type, min1, max2) != Ordering::Greater
        && compare_keys(key_type, min2, max1) != Ordering::Greater
}
