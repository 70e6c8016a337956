use tempfile::TempDir;

use crate::column::Column;
use crate::encoding::encode_row;
use crate::sstable::column_reader::{append_rowgroup_column, append_rowgroup_rows};
use crate::sstable::{SSTableBuilder, SsTable};
use crate::types::ValueType;

fn build_table(tmp: &TempDir, rows: i32) -> SsTable {
    let types = vec![ValueType::Int, ValueType::Double, ValueType::String];
    let mut builder = SSTableBuilder::new(
        tmp.path(),
        1,
        types.clone(),
        0,
        64 * 1024,
        4096,
        8 * 1024 * 1024,
        32,
    )
    .unwrap();
    for i in 0..rows {
        let key = i.to_le_bytes();
        let name = format!("name_{i:06}");
        let name_bytes: &[u8] = if i % 7 == 0 { b"" } else { name.as_bytes() };
        let row = encode_row(&[&key, &(f64::from(i) * 1.1).to_le_bytes(), name_bytes]);
        builder.add(&key, &row).unwrap();
    }
    builder.finish().unwrap();
    SsTable::open(tmp.path(), 1, types).unwrap()
}

#[test]
fn whole_chunk_append_int_column() {
    let tmp = TempDir::new().unwrap();
    let table = build_table(&tmp, 1000);

    let mut dst = Column::new(ValueType::Int);
    for rg in table.rowgroups() {
        append_rowgroup_column(&table, rg, 0, &mut dst).unwrap();
    }
    let ints = dst.as_int().unwrap();
    assert_eq!(ints.len(), 1000);
    for (i, &v) in ints.values().iter().enumerate() {
        assert_eq!(v, i as i32);
    }
}

#[test]
fn whole_chunk_append_double_column_sums_correctly() {
    let tmp = TempDir::new().unwrap();
    let table = build_table(&tmp, 10_000);

    let mut dst = Column::new(ValueType::Double);
    for rg in table.rowgroups() {
        append_rowgroup_column(&table, rg, 1, &mut dst).unwrap();
    }
    let doubles = dst.as_double().unwrap();
    assert_eq!(doubles.len(), 10_000);

    let total: f64 = doubles.values().iter().sum();
    let expected: f64 = (0..10_000).map(|i| f64::from(i) * 1.1).sum();
    assert!((total - expected).abs() < 1e-6);
}

#[test]
fn whole_chunk_append_string_column_with_nulls() {
    let tmp = TempDir::new().unwrap();
    let table = build_table(&tmp, 100);

    let mut dst = Column::new(ValueType::String);
    for rg in table.rowgroups() {
        append_rowgroup_column(&table, rg, 2, &mut dst).unwrap();
    }
    let strings = dst.as_string().unwrap();
    assert_eq!(strings.len(), 100);
    for i in 0..100 {
        if i % 7 == 0 {
            assert!(strings.value(i).is_empty());
            assert!(strings.nulls().is_null(i));
        } else {
            assert_eq!(strings.value(i), format!("name_{i:06}").as_bytes());
        }
    }
}

#[test]
fn selective_rows_match_whole_chunk() {
    let tmp = TempDir::new().unwrap();
    let table = build_table(&tmp, 500);
    let rg = &table.rowgroups()[0];

    let mut partial = Column::new(ValueType::Double);
    append_rowgroup_rows(&table, rg, 1, 100, 50, &mut partial).unwrap();

    let doubles = partial.as_double().unwrap();
    assert_eq!(doubles.len(), 50);
    for (idx, &v) in doubles.values().iter().enumerate() {
        let row = 100 + idx;
        assert!((v - row as f64 * 1.1).abs() < 1e-9);
    }
}

#[test]
fn type_mismatch_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let table = build_table(&tmp, 10);
    let rg = &table.rowgroups()[0];

    let mut wrong = Column::new(ValueType::Int);
    assert!(append_rowgroup_column(&table, rg, 1, &mut wrong).is_err());
}
