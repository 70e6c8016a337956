use tempfile::TempDir;

use crate::memtable::{MemTable, MemTableGetResult, MemtableError};
use crate::types::ValueType;

fn int_table(dir: &TempDir) -> MemTable {
    MemTable::new(0, ValueType::Int, dir.path().join("0.wal"), true).unwrap()
}

fn string_table(dir: &TempDir) -> MemTable {
    MemTable::new(0, ValueType::String, dir.path().join("0.wal"), true).unwrap()
}

fn ik(v: i32) -> Vec<u8> {
    v.to_le_bytes().to_vec()
}

#[test]
fn int_put_get() {
    let tmp = TempDir::new().unwrap();
    let table = int_table(&tmp);

    table.put(&ik(5), b"row5").unwrap();
    table.put(&ik(-2), b"rowneg").unwrap();

    assert_eq!(
        table.get(&ik(5)).unwrap(),
        MemTableGetResult::Value(b"row5".to_vec())
    );
    assert_eq!(
        table.get(&ik(-2)).unwrap(),
        MemTableGetResult::Value(b"rowneg".to_vec())
    );
    assert_eq!(table.get(&ik(99)).unwrap(), MemTableGetResult::NotFound);
}

#[test]
fn last_writer_wins_on_same_key() {
    let tmp = TempDir::new().unwrap();
    let table = int_table(&tmp);

    table.put(&ik(1), b"v1").unwrap();
    table.put(&ik(1), b"v2").unwrap();
    table.put(&ik(1), b"v3").unwrap();

    assert_eq!(
        table.get(&ik(1)).unwrap(),
        MemTableGetResult::Value(b"v3".to_vec())
    );
    // All versions are retained until flush-time dedup.
    assert_eq!(table.count(), 3);
}

#[test]
fn zero_length_value_is_tombstone() {
    let tmp = TempDir::new().unwrap();
    let table = int_table(&tmp);

    table.put(&ik(7), b"alive").unwrap();
    table.put(&ik(7), b"").unwrap();

    assert_eq!(table.get(&ik(7)).unwrap(), MemTableGetResult::Tombstone);
}

#[test]
fn wrong_key_width_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let table = int_table(&tmp);

    let err = table.put(b"abc", b"v").unwrap_err();
    assert!(matches!(
        err,
        MemtableError::InvalidKeyWidth { got: 3, expected: 4 }
    ));
    assert_eq!(table.count(), 0);
}

#[test]
fn string_keys_sort_lexicographically() {
    let tmp = TempDir::new().unwrap();
    let table = string_table(&tmp);

    table.put(b"pear", b"3").unwrap();
    table.put(b"apple", b"1").unwrap();
    table.put(b"mango", b"2").unwrap();

    let snapshot = table.entries_snapshot().unwrap();
    let keys: Vec<&[u8]> = snapshot.iter().map(|(k, _)| k.as_slice()).collect();
    assert_eq!(keys, vec![b"apple".as_slice(), b"mango", b"pear"]);
}

#[test]
fn double_keys_sort_numerically() {
    let tmp = TempDir::new().unwrap();
    let table = MemTable::new(0, ValueType::Double, tmp.path().join("0.wal"), true).unwrap();

    for v in [2.5f64, -1.0, 0.25] {
        table.put(&v.to_le_bytes(), b"x").unwrap();
    }

    let snapshot = table.entries_snapshot().unwrap();
    let keys: Vec<f64> = snapshot
        .iter()
        .map(|(k, _)| f64::from_le_bytes(k.as_slice().try_into().unwrap()))
        .collect();
    assert_eq!(keys, vec![-1.0, 0.25, 2.5]);
}

#[test]
fn snapshot_dedups_to_latest_version() {
    let tmp = TempDir::new().unwrap();
    let table = int_table(&tmp);

    for i in 0..10 {
        table.put(&ik(i), format!("old{i}").as_bytes()).unwrap();
    }
    for i in (0..10).step_by(2) {
        table.put(&ik(i), format!("new{i}").as_bytes()).unwrap();
    }

    let snapshot = table.entries_snapshot().unwrap();
    assert_eq!(snapshot.len(), 10);
    for (idx, (key, value)) in snapshot.iter().enumerate() {
        let i = idx as i32;
        assert_eq!(key, &ik(i));
        let expected = if i % 2 == 0 {
            format!("new{i}")
        } else {
            format!("old{i}")
        };
        assert_eq!(value, expected.as_bytes());
    }
}

#[test]
fn snapshot_keeps_tombstones_serialize_drops_them() {
    let tmp = TempDir::new().unwrap();
    let table = int_table(&tmp);

    table.put(&ik(1), b"live").unwrap();
    table.put(&ik(2), b"").unwrap();

    let snapshot = table.entries_snapshot().unwrap();
    assert_eq!(snapshot.len(), 2);
    assert!(snapshot[1].1.is_empty());

    let serialized = table.serialize().unwrap();
    // u16 klen + 4-byte key + u16 vlen + "live" — the tombstone is gone.
    assert_eq!(serialized.len(), 2 + 4 + 2 + 4);
    assert_eq!(&serialized[0..2], &4u16.to_le_bytes());
    assert_eq!(&serialized[2..6], &ik(1)[..]);
    assert_eq!(&serialized[6..8], &4u16.to_le_bytes());
    assert_eq!(&serialized[8..], b"live");
}

#[test]
fn approximate_size_counts_keys_and_values() {
    let tmp = TempDir::new().unwrap();
    let table = int_table(&tmp);

    table.put(&ik(1), b"12345678").unwrap();
    assert_eq!(table.approximate_size(), 4 + 8);

    table.put(&ik(2), b"").unwrap();
    assert_eq!(table.approximate_size(), 4 + 8 + 4);
}

#[test]
fn interleaved_reads_and_writes_stay_consistent() {
    let tmp = TempDir::new().unwrap();
    let table = int_table(&tmp);

    for i in 0..100 {
        table.put(&ik(i), format!("v{i}").as_bytes()).unwrap();
        // Read back a key inserted earlier; forces re-sorting mid-stream.
        let probe = i / 2;
        assert_eq!(
            table.get(&ik(probe)).unwrap(),
            MemTableGetResult::Value(format!("v{probe}").into_bytes())
        );
    }
}
