use tempfile::TempDir;

use crate::engine::tests::helpers::*;
use crate::engine::{GetResult, LsmTree};

#[test]
fn reopen_recovers_unflushed_memtable() {
    let tmp = TempDir::new().unwrap();
    {
        let tree = open_int_int(tmp.path(), memtable_only_config());
        for i in 0..500 {
            put_int(&tree, i, i * 11);
        }
        tree.close().unwrap();
    }

    let tree = open_int_int(tmp.path(), memtable_only_config());
    for i in 0..500 {
        assert_eq!(get_int(&tree, i), Some(i * 11), "key {i}");
    }
    tree.close().unwrap();
}

#[test]
fn reopen_recovers_tombstones_from_wal() {
    let tmp = TempDir::new().unwrap();
    {
        let tree = open_int_int(tmp.path(), memtable_only_config());
        for i in 0..50 {
            put_int(&tree, i, i);
        }
        tree.flush_to_sst().unwrap();
        tree.remove(&ik(7)).unwrap();
        tree.close().unwrap();
    }

    let tree = open_int_int(tmp.path(), memtable_only_config());
    assert_eq!(tree.get(&ik(7)).unwrap(), GetResult::NotFound);
    assert_eq!(get_int(&tree, 8), Some(8));
    tree.close().unwrap();
}

#[test]
fn reopen_recovers_sstables_via_manifest() {
    let tmp = TempDir::new().unwrap();
    {
        let tree = open_int_int(tmp.path(), memtable_only_config());
        for i in 0..200 {
            put_int(&tree, i, i + 1);
        }
        tree.flush_to_sst().unwrap();
        for i in 200..300 {
            put_int(&tree, i, i + 1);
        }
        tree.flush_to_sst().unwrap();
        tree.close().unwrap();
    }

    let tree = open_int_int(tmp.path(), memtable_only_config());
    assert_eq!(tree.stats().level_file_counts[0], 2);
    for i in 0..300 {
        assert_eq!(get_int(&tree, i), Some(i + 1));
    }
    tree.close().unwrap();
}

#[test]
fn newest_layer_wins_after_reopen() {
    let tmp = TempDir::new().unwrap();
    {
        let tree = open_int_int(tmp.path(), memtable_only_config());
        put_int(&tree, 1, 100);
        tree.flush_to_sst().unwrap();
        put_int(&tree, 1, 200); // only in the WAL
        tree.close().unwrap();
    }

    let tree = open_int_int(tmp.path(), memtable_only_config());
    assert_eq!(get_int(&tree, 1), Some(200));
    tree.close().unwrap();
}

#[test]
fn orphan_sstable_is_garbage_collected() {
    let tmp = TempDir::new().unwrap();
    {
        let tree = open_int_int(tmp.path(), memtable_only_config());
        put_int(&tree, 1, 1);
        tree.flush_to_sst().unwrap();
        tree.close().unwrap();
    }

    // A leftover file from an interrupted build, unknown to the
    // manifest.
    let orphan = tmp.path().join("999.sst");
    std::fs::write(&orphan, b"partial garbage").unwrap();

    let tree = open_int_int(tmp.path(), memtable_only_config());
    assert!(!orphan.exists(), "orphan must be removed at open");
    assert_eq!(get_int(&tree, 1), Some(1));
    tree.close().unwrap();
}

#[test]
fn corrupt_sstable_is_skipped_not_fatal() {
    let tmp = TempDir::new().unwrap();
    {
        let tree = open_int_int(tmp.path(), memtable_only_config());
        put_int(&tree, 1, 1);
        tree.flush_to_sst().unwrap();
        put_int(&tree, 2, 2);
        tree.flush_to_sst().unwrap();
        tree.close().unwrap();
    }

    // Corrupt the first flushed file's footer.
    let victim = tmp.path().join("1.sst");
    assert!(victim.exists());
    let len = std::fs::metadata(&victim).unwrap().len();
    let file = std::fs::OpenOptions::new().write(true).open(&victim).unwrap();
    file.set_len(len - 8).unwrap();
    drop(file);

    let tree = open_int_int(tmp.path(), memtable_only_config());
    // The other file still serves.
    assert_eq!(get_int(&tree, 2), Some(2));
    assert_eq!(tree.stats().sstable_count, 1);
    tree.close().unwrap();
}

#[test]
fn double_reopen_is_stable() {
    let tmp = TempDir::new().unwrap();
    {
        let tree = open_int_int(tmp.path(), memtable_only_config());
        for i in 0..100 {
            put_int(&tree, i, i);
        }
        tree.close().unwrap();
    }
    {
        let tree = open_int_int(tmp.path(), memtable_only_config());
        for i in 100..200 {
            put_int(&tree, i, i);
        }
        tree.close().unwrap();
    }

    let tree = open_int_int(tmp.path(), memtable_only_config());
    for i in 0..200 {
        assert_eq!(get_int(&tree, i), Some(i));
    }
    tree.close().unwrap();
}

#[test]
fn recovered_immutables_get_flushed() {
    let tmp = TempDir::new().unwrap();
    {
        // Tiny memtable: rotations leave immutables behind when we
        // drop the tree without closing cleanly.
        let config = crate::engine::TreeConfig {
            memtable_size: 64,
            ..small_config()
        };
        let tree = open_int_int(tmp.path(), config);
        for i in 0..100 {
            put_int(&tree, i, i);
        }
        drop(tree);
    }

    let tree = open_int_int(tmp.path(), memtable_only_config());
    for i in 0..100 {
        assert_eq!(get_int(&tree, i), Some(i), "key {i}");
    }
    tree.close().unwrap();
}

#[test]
fn sstable_ids_continue_after_reopen() {
    let tmp = TempDir::new().unwrap();
    {
        let tree = open_int_int(tmp.path(), memtable_only_config());
        put_int(&tree, 1, 1);
        tree.flush_to_sst().unwrap();
        tree.close().unwrap();
    }

    let tree = open_int_int(tmp.path(), memtable_only_config());
    put_int(&tree, 2, 2);
    tree.flush_to_sst().unwrap();
    let stats = tree.stats();
    assert_eq!(stats.level_file_counts[0], 2);
    tree.close().unwrap();

    let reopened = LsmTree::open(tmp.path(), int_int_types(), 0, memtable_only_config()).unwrap();
    assert_eq!(get_int(&reopened, 1), Some(1));
    assert_eq!(get_int(&reopened, 2), Some(2));
    reopened.close().unwrap();
}
