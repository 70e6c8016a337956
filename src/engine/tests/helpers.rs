use std::path::Path;
use std::time::{Duration, Instant};

use tracing_subscriber::EnvFilter;

use crate::encoding::encode_row;
use crate::engine::{GetResult, LsmTree, TreeConfig};
use crate::types::ValueType;

/// Initialize tracing controlled by `RUST_LOG`. Safe to call multiple
/// times — only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// `(id INT PRIMARY KEY, value INT)`.
pub fn int_int_types() -> Vec<ValueType> {
    vec![ValueType::Int, ValueType::Int]
}

/// `(id INT PRIMARY KEY, score DOUBLE)`.
pub fn int_double_types() -> Vec<ValueType> {
    vec![ValueType::Int, ValueType::Double]
}

/// Config whose memtable never rotates under moderate test data.
pub fn memtable_only_config() -> TreeConfig {
    init_tracing();
    TreeConfig {
        memtable_size: 4 * 1024 * 1024,
        ..TreeConfig::small()
    }
}

/// Shrunken thresholds: 8 KiB memtable, 64 KiB RowGroups and L1.
pub fn small_config() -> TreeConfig {
    init_tracing();
    TreeConfig::small()
}

pub fn open_int_int(path: &Path, config: TreeConfig) -> LsmTree {
    LsmTree::open(path, int_int_types(), 0, config).expect("open tree")
}

pub fn ik(i: i32) -> Vec<u8> {
    i.to_le_bytes().to_vec()
}

/// Row for the `(INT, INT)` schema.
pub fn int_row(key: i32, value: i32) -> Vec<u8> {
    encode_row(&[&key.to_le_bytes(), &value.to_le_bytes()])
}

/// Row for the `(INT, DOUBLE)` schema.
pub fn double_row(key: i32, value: f64) -> Vec<u8> {
    encode_row(&[&key.to_le_bytes(), &value.to_le_bytes()])
}

pub fn put_int(tree: &LsmTree, key: i32, value: i32) {
    tree.put(&ik(key), &int_row(key, value)).expect("put");
}

/// Fetch and decode the value column of an `(INT, INT)` row.
pub fn get_int(tree: &LsmTree, key: i32) -> Option<i32> {
    match tree.get(&ik(key)).expect("get") {
        GetResult::Row(row) => {
            let values = crate::encoding::decode_row(&row, 2).expect("decode");
            Some(i32::from_le_bytes(values[1].try_into().expect("width")))
        }
        GetResult::NotFound => None,
    }
}

/// Poll `predicate` until it holds or `timeout` elapses; panics on
/// timeout. Used to await background flushes and compactions.
pub fn wait_for(timeout: Duration, what: &str, mut predicate: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return;
        }
        std::thread::sleep(Duration::from_millis(25));
    }
    panic!("timed out waiting for {what}");
}
