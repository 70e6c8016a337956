//! # paxstore
//!
//! A **columnar LSM-tree storage engine** for a single analytical table:
//! write-optimized like a log-structured merge tree, but laid out on disk
//! as PAX (Partition Attributes Across) row groups so that full-column
//! scans and aggregations read contiguous, type-homogeneous data.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                        LsmTree                            │
//! │  ┌────────────┐  ┌───────────────┐  ┌─────────────────┐  │
//! │  │  Mutable   │  │   Immutable   │  │  SSTables       │  │
//! │  │  MemTable  │  │   MemTables   │  │  L0..L6 (PAX)   │  │
//! │  │  + WAL     │  │   + WALs      │  │                 │  │
//! │  └─────┬──────┘  └──────┬────────┘  └────────┬────────┘  │
//! │        │  rotate        │  flush             │           │
//! │        └─────────►      └────────►           │           │
//! │                                              │           │
//! │  ┌───────────────────────────────────────────┘           │
//! │  │  Leveled compaction (picker + background scheduler)   │
//! │  └───────────────────────────────────────────────────┐   │
//! │                                                      │   │
//! │  ┌──────────────────────────────────────────────────┐│   │
//! │  │        Manifest (ADD/DEL log + snapshots)        ││   │
//! │  └──────────────────────────────────────────────────┘│   │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`engine`] | The LSM-tree façade — open, put, get, column scans, flush, close |
//! | [`memtable`] | Vectorized in-memory write buffer with key/value separation |
//! | [`wal`] | Length-prefixed write-ahead log for memtable crash recovery |
//! | [`sstable`] | PAX-laid-out sorted runs: builder, mmap reader, column reader |
//! | [`bloom`] | Blocked per-RowGroup bloom filter over primary keys |
//! | [`compaction`] | Leveled compaction picker and background scheduler |
//! | [`manifest`] | Durable log of level-state edits with periodic snapshots |
//! | [`column`] | In-memory columns produced by scans |
//! | [`encoding`] | Row codec and low-level wire helpers |
//! | [`types`] | Column value types and type-aware key comparison |
//!
//! ## Key Features
//!
//! - **Write-ahead logging** — every mutation hits the WAL before the
//!   memtable, so an un-flushed memtable survives a crash.
//! - **Vectorized memtable** — fixed-size entry arrays with key/value
//!   separation, sorted lazily, binary-searched point gets.
//! - **PAX row groups** — rows are ingested row-wise but persisted
//!   column-by-column in 16 MiB groups with zone maps and bloom filters.
//! - **Zero-copy column scans** — whole column chunks are appended to the
//!   destination column straight out of the memory map.
//! - **Leveled compaction** — L0 file-count trigger, size-ratio triggers
//!   for L1+, trivial moves, tombstone reclamation at the bottom level.
//! - **Atomic installs** — every flush and compaction becomes visible
//!   through a single manifest edit; crashes leave either the old or the
//!   new file set, never a mix.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use paxstore::engine::{GetResult, LsmTree, TreeConfig};
//! use paxstore::types::ValueType;
//!
//! // A table (id INT PRIMARY KEY, score DOUBLE).
//! let tree = LsmTree::open(
//!     "/tmp/my_table",
//!     vec![ValueType::Int, ValueType::Double],
//!     0,
//!     TreeConfig::default(),
//! ).unwrap();
//!
//! let key = 7i32.to_le_bytes();
//! let mut row = Vec::new();
//! paxstore::encoding::append_column(&mut row, &key);
//! paxstore::encoding::append_column(&mut row, &1.5f64.to_le_bytes());
//! tree.put(&key, &row).unwrap();
//!
//! assert!(matches!(tree.get(&key).unwrap(), GetResult::Row(_)));
//!
//! // Materialize the score column for aggregation.
//! let scores = tree.scan_column(1).unwrap();
//! assert_eq!(scores.len(), 1);
//!
//! tree.close().unwrap();
//! ```

#![allow(dead_code)]

pub mod bloom;
pub mod column;
pub mod compaction;
pub mod encoding;
pub mod engine;
pub mod manifest;
pub mod memtable;
pub mod sstable;
pub mod types;
pub mod wal;
