//! Write-Ahead Log (WAL) for memtable crash recovery.
//!
//! One WAL file backs each mutable memtable. Every `put` appends one
//! record here **before** the memtable is touched, so that a crash loses
//! at most the writes whose records never reached disk.
//!
//! # On-disk layout
//!
//! ```text
//! [u32 klen LE][u32 vlen LE][key bytes][value bytes]
//! [u32 klen LE][u32 vlen LE][key bytes][value bytes]
//! ...
//! ```
//!
//! There is no file header: the file name (`<memtable_id>.wal`) carries
//! the identity, and replay starts at offset zero.
//!
//! # Replay semantics
//!
//! [`Wal::replay_iter`] yields records in append order. Replay stops
//! cleanly at end-of-file; a truncated trailing record (a crash in the
//! middle of an append) terminates replay with a warning rather than an
//! error — everything before the tail is intact and usable.
//!
//! # Concurrency model
//!
//! The file handle is shared behind `Arc<Mutex<File>>`; appends hold the
//! lock for the duration of one record (or one batch), and the replay
//! iterator seeks to its own logical offset before every read so it can
//! coexist with concurrent appenders.
//!
//! # Durability
//!
//! Each `append` is followed by `File::sync_all`. Batch appends write
//! every record first and sync once at the end, so a crash mid-batch may
//! lose the batch tail but never leaves a partial record ahead of a
//! complete one.


use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

const U32_SIZE: usize = size_of::<u32>();

/// Records larger than this are rejected on append and treated as a
/// corrupt tail on replay.
const MAX_RECORD_SIZE: usize = 64 * 1024 * 1024;

/// Errors returned by WAL operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WalError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Record exceeds the maximum record size.
    #[error("record size exceeds limit ({0} bytes)")]
    RecordTooLarge(usize),

    /// Internal consistency or locking error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// An append-only, length-prefixed record log for one memtable.
#[derive(Debug)]
pub struct Wal {
    /// Thread-safe file handle shared with replay iterators.
    file: Arc<Mutex<File>>,

    /// Path to the WAL file on disk.
    path: PathBuf,
}

impl Wal {
    /// Open or create a WAL file at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, WalError> {
        let path_ref = path.as_ref();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path_ref)?;

        info!(path = %path_ref.display(), "WAL opened");

        Ok(Self {
            file: Arc::new(Mutex::new(file)),
            path: path_ref.to_path_buf(),
        })
    }

    /// Append a single `(key, value)` record and fsync.
    ///
    /// A zero-length value records a tombstone.
    pub fn append(&self, key: &[u8], value: &[u8]) -> Result<(), WalError> {
        let mut guard = self.lock()?;
        Self::write_record(&mut guard, key, value)?;
        guard.sync_all()?;

        trace!(klen = key.len(), vlen = value.len(), "WAL record appended");
        Ok(())
    }

    /// Append a batch of records with a single fsync at the end.
    pub fn append_batch(&self, entries: &[(Vec<u8>, Vec<u8>)]) -> Result<(), WalError> {
        let mut guard = self.lock()?;
        for (key, value) in entries {
            Self::write_record(&mut guard, key, value)?;
        }
        guard.sync_all()?;

        debug!(count = entries.len(), "WAL batch appended");
        Ok(())
    }

    fn write_record(file: &mut File, key: &[u8], value: &[u8]) -> Result<(), WalError> {
        if key.len() > MAX_RECORD_SIZE {
            return Err(WalError::RecordTooLarge(key.len()));
        }
        if value.len() > MAX_RECORD_SIZE {
            return Err(WalError::RecordTooLarge(value.len()));
        }

        // One buffered write per record keeps the record contiguous on
        // disk even with concurrent appenders.
        let mut buf = Vec::with_capacity(2 * U32_SIZE + key.len() + value.len());
        buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
        buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
        buf.extend_from_slice(key);
        buf.extend_from_slice(value);
        file.write_all(&buf)?;
        Ok(())
    }

    /// Returns an iterator replaying all complete records in order.
    pub fn replay_iter(&self) -> WalIter {
        debug!(path = %self.path.display(), "WAL replay started");
        WalIter {
            file: Arc::clone(&self.file),
            offset: 0,
            done: false,
        }
    }

    /// Path of the underlying WAL file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current on-disk size in bytes.
    pub fn file_size(&self) -> Result<u64, WalError> {
        Ok(self.lock()?.metadata()?.len())
    }

    /// Unlink a WAL file. Called only after its memtable has been
    /// durably installed as an L0 SSTable.
    pub fn remove<P: AsRef<Path>>(path: P) -> Result<(), WalError> {
        let path_ref = path.as_ref();
        std::fs::remove_file(path_ref)?;
        info!(path = %path_ref.display(), "WAL removed");
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, File>, WalError> {
        self.file
            .lock()
            .map_err(|_| WalError::Internal("mutex poisoned".into()))
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        match self.file.lock() {
            Ok(guard) => {
                if let Err(e) = guard.sync_all() {
                    error!(path = %self.path.display(), error = %e, "WAL sync failed on drop");
                }
            }
            Err(poisoned) => {
                let file = poisoned.into_inner();
                if let Err(e) = file.sync_all() {
                    error!(path = %self.path.display(), error = %e, "WAL sync failed on drop (poisoned lock)");
                }
            }
        }
    }
}

/// Streaming WAL replay iterator.
///
/// Yields `(key, value)` pairs. Holds an `Arc` to the shared file
/// handle, so it may outlive the [`Wal`] that created it.
pub struct WalIter {
    file: Arc<Mutex<File>>,
    offset: u64,
    done: bool,
}

impl Iterator for WalIter {
    type Item = Result<(Vec<u8>, Vec<u8>), WalError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let mut guard = match self.file.lock() {
            Ok(g) => g,
            Err(_) => return Some(Err(WalError::Internal("mutex poisoned".into()))),
        };

        if let Err(e) = guard.seek(SeekFrom::Start(self.offset)) {
            self.done = true;
            return Some(Err(WalError::Io(e)));
        }

        // Length prefixes. Clean EOF before the first byte ends replay;
        // EOF anywhere inside a record is a truncated tail.
        let mut lens = [0u8; 2 * U32_SIZE];
        match read_exact_or_eof(&mut *guard, &mut lens) {
            Ok(ReadOutcome::Complete) => {}
            Ok(ReadOutcome::CleanEof) => {
                trace!(offset = self.offset, "WAL replay reached end of file");
                self.done = true;
                return None;
            }
            Ok(ReadOutcome::PartialEof) => {
                warn!(offset = self.offset, "WAL truncated record (partial length prefix)");
                self.done = true;
                return None;
            }
            Err(e) => {
                self.done = true;
                return Some(Err(WalError::Io(e)));
            }
        }

        let klen = u32::from_le_bytes([lens[0], lens[1], lens[2], lens[3]]) as usize;
        let vlen = u32::from_le_bytes([lens[4], lens[5], lens[6], lens[7]]) as usize;
        if klen > MAX_RECORD_SIZE || vlen > MAX_RECORD_SIZE {
            warn!(offset = self.offset, klen, vlen, "WAL implausible record length, stopping replay");
            self.done = true;
            return None;
        }

        let mut key = vec![0u8; klen];
        let mut value = vec![0u8; vlen];
        for buf in [&mut key, &mut value] {
            match read_exact_or_eof(&mut *guard, buf) {
                Ok(ReadOutcome::Complete) => {}
                Ok(_) => {
                    warn!(
                        offset = self.offset,
                        klen, vlen, "WAL truncated record (partial payload)"
                    );
                    self.done = true;
                    return None;
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(WalError::Io(e)));
                }
            }
        }

        self.offset += (2 * U32_SIZE + klen + vlen) as u64;
        Some(Ok((key, value)))
    }
}

enum ReadOutcome {
    Complete,
    CleanEof,
    PartialEof,
}

/// Like `read_exact`, but distinguishes a clean EOF (zero bytes read)
/// from a truncated read.
fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<ReadOutcome> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                return Ok(if filled == 0 {
                    ReadOutcome::CleanEof
                } else {
                    ReadOutcome::PartialEof
                });
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(ReadOutcome::Complete)
}
