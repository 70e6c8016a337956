//! # Manifest
//!
//! The durable source of truth for level state. Every flush and
//! compaction becomes visible through a manifest edit; on open, the
//! manifest alone decides which `.sst` files are live.
//!
//! ## File format
//!
//! A UTF-8, newline-separated text log:
//!
//! ```text
//! SNAPSHOT
//! ADD <level> <id> <file_size> <hex_min_key> <hex_max_key>
//! DEL <level> <id>
//! ```
//!
//! A `SNAPSHOT` marker resets the state; the `ADD` lines following it
//! describe the complete level set at that point. Incremental edits are
//! appended after the snapshot. Once more than 100 incremental records
//! accumulate, the next install rewrites the snapshot: the full state
//! is written to `MANIFEST.tmp` and atomically renamed over `MANIFEST`.
//!
//! ## Durability
//!
//! Appends are write-then-fsync, so a crash leaves either the prior
//! committed state or the new one — the manifest record is the
//! linearization point of every install.
//!
//! ## Thread safety
//!
//! An internal mutex serializes appends and rewrites; this is the one
//! lock in the engine deliberately held across an I/O syscall.

#[cfg(test)]
mod tests;

use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::compaction::{LevelMeta, LeveledSSTableMeta};
use crate::encoding::{decode_hex, encode_hex};
use crate::types::ValueType;

const MANIFEST_FILE: &str = "MANIFEST";
const MANIFEST_TMP_FILE: &str = "MANIFEST.tmp";
const ADD_RECORD: &str = "ADD";
const DEL_RECORD: &str = "DEL";
const SNAPSHOT_RECORD: &str = "SNAPSHOT";

/// Incremental records tolerated since the last snapshot before the
/// next install rewrites it.
const SNAPSHOT_THRESHOLD: usize = 100;

/// Errors returned by manifest operations.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The log contains a record that cannot be parsed. Fatal at open:
    /// continuing past a lost `ADD` would garbage-collect live data.
    #[error("corrupt MANIFEST record: {0}")]
    Corrupt(String),

    /// Internal invariant violation or poisoned lock.
    #[error("internal error: {0}")]
    Internal(String),
}

struct ManifestInner {
    /// Incremental records appended since the last snapshot.
    record_count: usize,
}

/// Append-only log of level edits with periodic full snapshots.
pub struct Manifest {
    path: PathBuf,
    tmp_path: PathBuf,
    inner: Mutex<ManifestInner>,
}

impl Manifest {
    /// Create a handle for the manifest inside `dir`. No file is
    /// touched until the first load or edit.
    pub fn new(dir: &Path) -> Self {
        Self {
            path: dir.join(MANIFEST_FILE),
            tmp_path: dir.join(MANIFEST_TMP_FILE),
            inner: Mutex::new(ManifestInner { record_count: 0 }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rebuild level state by replaying the log.
    ///
    /// A missing file is a fresh table. Any unparsable record is fatal
    /// — the manifest is the source of truth for which files are live.
    pub fn load(&self, levels: &mut [LevelMeta], key_type: ValueType) -> Result<(), ManifestError> {
        let mut inner = self.lock()?;

        for level in levels.iter_mut() {
            level.clear();
        }

        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no MANIFEST, starting empty");
                inner.record_count = 0;
                return Ok(());
            }
            Err(e) => return Err(ManifestError::Io(e)),
        };

        let mut records = 0usize;
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut fields = line.split_whitespace();
            match fields.next() {
                Some(SNAPSHOT_RECORD) => {
                    for level in levels.iter_mut() {
                        level.clear();
                    }
                    records = 0;
                }
                Some(ADD_RECORD) => {
                    let parsed = (|| {
                        let level: usize = fields.next()?.parse().ok()?;
                        let id: u32 = fields.next()?.parse().ok()?;
                        let size: u64 = fields.next()?.parse().ok()?;
                        let min_key = decode_hex(fields.next()?);
                        let max_key = decode_hex(fields.next()?);
                        Some((level, id, size, min_key, max_key))
                    })();
                    match parsed {
                        Some((level, id, size, min_key, max_key)) if level < levels.len() => {
                            levels[level].add_sstable(
                                LeveledSSTableMeta::new(
                                    id,
                                    level as u32,
                                    min_key,
                                    max_key,
                                    size,
                                ),
                                key_type,
                            );
                            records += 1;
                        }
                        _ => {
                            warn!(line, "malformed MANIFEST ADD record");
                            return Err(ManifestError::Corrupt(line.to_string()));
                        }
                    }
                }
                Some(DEL_RECORD) => {
                    let parsed = (|| {
                        let level: usize = fields.next()?.parse().ok()?;
                        let id: u32 = fields.next()?.parse().ok()?;
                        Some((level, id))
                    })();
                    match parsed {
                        Some((level, id)) if level < levels.len() => {
                            levels[level].remove_sstable(id);
                            records += 1;
                        }
                        _ => {
                            warn!(line, "malformed MANIFEST DEL record");
                            return Err(ManifestError::Corrupt(line.to_string()));
                        }
                    }
                }
                Some(other) => {
                    warn!(record = other, "unknown MANIFEST record");
                    return Err(ManifestError::Corrupt(line.to_string()));
                }
                None => {}
            }
        }

        inner.record_count = records;
        info!(
            path = %self.path.display(),
            records,
            files = levels.iter().map(|l| l.sstables.len()).sum::<usize>(),
            "MANIFEST loaded"
        );
        Ok(())
    }

    /// Append an `ADD` record and fsync.
    pub fn add_sstable(&self, level: u32, meta: &LeveledSSTableMeta) -> Result<(), ManifestError> {
        let record = format!(
            "{ADD_RECORD} {level} {} {} {} {}",
            meta.sstable_id,
            meta.file_size,
            encode_hex(&meta.min_key),
            encode_hex(&meta.max_key),
        );
        self.append(&record)
    }

    /// Append a `DEL` record and fsync.
    pub fn remove_sstable(&self, level: u32, sstable_id: u32) -> Result<(), ManifestError> {
        self.append(&format!("{DEL_RECORD} {level} {sstable_id}"))
    }

    /// Append a whole install edit — every `ADD` and `DEL` of one flush
    /// or compaction — as a single write followed by one fsync.
    pub fn append_edit(
        &self,
        adds: &[(u32, LeveledSSTableMeta)],
        dels: &[(u32, u32)],
    ) -> Result<(), ManifestError> {
        let mut batch = String::new();
        for (level, meta) in adds {
            batch.push_str(&format!(
                "{ADD_RECORD} {level} {} {} {} {}\n",
                meta.sstable_id,
                meta.file_size,
                encode_hex(&meta.min_key),
                encode_hex(&meta.max_key),
            ));
        }
        for (level, id) in dels {
            batch.push_str(&format!("{DEL_RECORD} {level} {id}\n"));
        }

        let mut inner = self.lock()?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(batch.as_bytes())?;
        file.sync_all()?;

        inner.record_count += adds.len() + dels.len();
        debug!(adds = adds.len(), dels = dels.len(), "MANIFEST edit appended");
        Ok(())
    }

    /// Whether enough incremental records accumulated that the caller
    /// should rewrite the snapshot.
    pub fn needs_snapshot(&self) -> bool {
        self.inner
            .lock()
            .map(|inner| inner.record_count > SNAPSHOT_THRESHOLD)
            .unwrap_or(false)
    }

    /// Rewrite the full snapshot: the complete state goes to a temp
    /// file which is fsynced and atomically renamed over the manifest.
    pub fn save(&self, levels: &[LevelMeta]) -> Result<(), ManifestError> {
        let mut inner = self.lock()?;

        {
            let mut file = File::create(&self.tmp_path)?;
            let mut out = String::new();
            out.push_str(SNAPSHOT_RECORD);
            out.push('\n');
            for level in levels {
                for meta in &level.sstables {
                    out.push_str(&format!(
                        "{ADD_RECORD} {} {} {} {} {}\n",
                        level.level_num,
                        meta.sstable_id,
                        meta.file_size,
                        encode_hex(&meta.min_key),
                        encode_hex(&meta.max_key),
                    ));
                }
            }
            file.write_all(out.as_bytes())?;
            file.sync_all()?;
        }

        std::fs::rename(&self.tmp_path, &self.path)?;
        if let Ok(dir) = File::open(self.path.parent().unwrap_or_else(|| Path::new("."))) {
            let _ = dir.sync_all();
        }

        inner.record_count = 0;
        info!(
            path = %self.path.display(),
            files = levels.iter().map(|l| l.sstables.len()).sum::<usize>(),
            "MANIFEST snapshot written"
        );
        Ok(())
    }

    fn append(&self, record: &str) -> Result<(), ManifestError> {
        let mut inner = self.lock()?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(record.as_bytes())?;
        file.write_all(b"\n")?;
        file.sync_all()?;

        inner.record_count += 1;
        debug!(record, "MANIFEST record appended");
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ManifestInner>, ManifestError> {
        self.inner
            .lock()
            .map_err(|_| ManifestError::Internal("mutex poisoned".into()))
    }
}
