//! The background compaction worker.
//!
//! One worker thread per tree. It sleeps on a control channel until
//! the façade wakes it (rotation, `trigger_compaction`, open with
//! pending work), then drains in two phases:
//!
//! 1. **Flushes** — every queued immutable memtable becomes an L0
//!    SSTable, oldest first, releasing writer backpressure as it goes.
//! 2. **Compactions** — snapshot the levels, run the picker, execute
//!    the job, repeat until the picker finds nothing.
//!
//! Job execution marks its inputs `being_compacted` under the level
//! write-latch, merges outside any latch, and installs through a single
//! manifest edit before swapping the in-memory level state. Failures
//! clear the marks and leave the levels untouched; old files are
//! unlinked only after the superseding manifest edit is durable. A
//! stop request is observed between jobs — an in-flight job runs to
//! completion.

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam::channel::{Receiver, Sender, TryRecvError};
use tracing::{debug, error, info};

use crate::engine::TreeCore;
use crate::engine::utils::{KvCursor, MergeIterator};
use crate::sstable::{SSTableBuilder, SSTableMeta, SsTable};
use crate::types::key_ranges_overlap;

use super::picker::CompactionPicker;
use super::{CompactionError, CompactionJob, LeveledSSTableMeta};

enum WorkerMsg {
    Wake,
    Stop,
}

/// Handle to the tree's background worker.
pub(crate) struct CompactionScheduler {
    tx: Sender<WorkerMsg>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl CompactionScheduler {
    /// Spawn the worker thread.
    pub(crate) fn start(core: Arc<TreeCore>) -> Self {
        let (tx, rx) = crossbeam::channel::unbounded();
        let handle = std::thread::Builder::new()
            .name("paxstore-worker".into())
            .spawn(move || worker_loop(&core, &rx))
            .expect("spawn compaction worker");
        Self {
            tx,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Signal that flush or compaction work may be pending.
    pub(crate) fn wake(&self) {
        let _ = self.tx.send(WorkerMsg::Wake);
    }

    /// Request shutdown and join the worker. Idempotent.
    pub(crate) fn stop(&self) {
        let _ = self.tx.send(WorkerMsg::Stop);
        if let Ok(mut guard) = self.handle.lock()
            && let Some(handle) = guard.take()
        {
            let _ = handle.join();
        }
    }
}

fn worker_loop(core: &Arc<TreeCore>, rx: &Receiver<WorkerMsg>) {
    info!("compaction worker started");
    let picker = CompactionPicker {
        key_type: core.key_type(),
        l0_compaction_threshold: core.config.l0_compaction_threshold,
        l1_max_bytes: core.config.l1_max_bytes,
        level_size_multiplier: core.config.level_size_multiplier,
        max_levels: core.config.max_levels,
    };

    'outer: loop {
        match rx.recv() {
            Ok(WorkerMsg::Wake) => {}
            Ok(WorkerMsg::Stop) | Err(_) => break,
        }
        // Collapse a burst of wakes into one drain.
        loop {
            match rx.try_recv() {
                Ok(WorkerMsg::Wake) => {}
                Ok(WorkerMsg::Stop) => break 'outer,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => break 'outer,
            }
        }

        // Phase 1: flush pending immutables, oldest first.
        while core.has_immutables() {
            match core.flush_oldest_immutable() {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    // Leave the immutable queued; the next wake retries.
                    error!(error = %e, "flush failed, will retry");
                    break;
                }
            }
        }

        // Phase 2: compact until the picker is satisfied, observing a
        // stop request between jobs.
        loop {
            match rx.try_recv() {
                Ok(WorkerMsg::Stop) | Err(TryRecvError::Disconnected) => break 'outer,
                _ => {}
            }
            match run_one_compaction(core, &picker) {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    error!(error = %e, "compaction failed, levels unchanged");
                    break;
                }
            }
        }
    }
    info!("compaction worker stopped");
}

/// Pick and execute one job. Returns `false` when there is nothing to
/// do.
fn run_one_compaction(
    core: &Arc<TreeCore>,
    picker: &CompactionPicker,
) -> Result<bool, CompactionError> {
    let levels_snapshot = {
        lock_read(core)?.levels.clone()
    };
    let Some(job) = picker.pick(&levels_snapshot) else {
        return Ok(false);
    };
    debug!(
        input_level = job.input_level,
        output_level = job.output_level,
        inputs = job.input_ids.len(),
        overlaps = job.overlap_ids.len(),
        trivial = job.is_trivial_move,
        "compaction job picked"
    );

    if !mark_job(core, &job)? {
        // Raced with another install; re-pick next round.
        return Ok(false);
    }

    let result = if job.is_trivial_move {
        execute_trivial_move(core, &job)
    } else {
        execute_merge(core, picker, &job)
    };

    match result {
        Ok(()) => Ok(true),
        Err(e) => {
            clear_marks(core, &job);
            Err(e)
        }
    }
}

/// Atomically mark every input and overlap file `being_compacted`.
/// Fails (returning `false`) when any of them vanished or is already
/// claimed — the picker will re-evaluate from fresh state.
fn mark_job(core: &TreeCore, job: &CompactionJob) -> Result<bool, CompactionError> {
    let mut state = lock_write(core)?;
    let claims: Vec<(usize, u32)> = job
        .input_ids
        .iter()
        .map(|&id| (job.input_level as usize, id))
        .chain(
            job.overlap_ids
                .iter()
                .map(|&id| (job.output_level as usize, id)),
        )
        .collect();

    for &(level, id) in &claims {
        match state.levels[level].get(id) {
            Some(meta) if !meta.being_compacted => {}
            _ => return Ok(false),
        }
    }
    for &(level, id) in &claims {
        if let Some(meta) = state.levels[level].get_mut(id) {
            meta.being_compacted = true;
        }
    }
    Ok(true)
}

fn clear_marks(core: &TreeCore, job: &CompactionJob) {
    let Ok(mut state) = core.state.write() else {
        return;
    };
    for &id in &job.input_ids {
        if let Some(meta) = state.levels[job.input_level as usize].get_mut(id) {
            meta.being_compacted = false;
        }
    }
    for &id in &job.overlap_ids {
        if let Some(meta) = state.levels[job.output_level as usize].get_mut(id) {
            meta.being_compacted = false;
        }
    }
}

/// Reassign a single file to the next level — metadata only, no I/O on
/// the file itself.
fn execute_trivial_move(core: &TreeCore, job: &CompactionJob) -> Result<(), CompactionError> {
    let id = *job
        .input_ids
        .first()
        .ok_or_else(|| CompactionError::Internal("trivial move without input".into()))?;

    let mut meta = {
        lock_read(core)?.levels[job.input_level as usize]
            .get(id)
            .cloned()
            .ok_or_else(|| CompactionError::Internal(format!("input {id} vanished")))?
    };
    meta.level = job.output_level;
    meta.being_compacted = false;

    core.manifest.append_edit(
        &[(job.output_level, meta.clone())],
        &[(job.input_level, id)],
    )?;

    {
        let mut state = lock_write(core)?;
        state.levels[job.input_level as usize].remove_sstable(id);
        let key_type = core.key_type();
        state.levels[job.output_level as usize].add_sstable(meta, key_type);
    }

    info!(
        sstable_id = id,
        from = job.input_level,
        to = job.output_level,
        "trivial move installed"
    );
    maybe_snapshot(core)
}

/// Merge the job's inputs into new files at the output level and
/// install them.
fn execute_merge(
    core: &TreeCore,
    picker: &CompactionPicker,
    job: &CompactionJob,
) -> Result<(), CompactionError> {
    let key_type = core.key_type();

    // Inputs newest-first: input-level files by descending id, then the
    // (older) overlap files at the output level.
    let mut input_ids = job.input_ids.clone();
    input_ids.sort_unstable_by(|a, b| b.cmp(a));

    let (readers, drop_tombstones) = {
        let state = lock_read(core)?;
        let mut readers: Vec<Arc<SsTable>> = Vec::new();
        for &id in input_ids.iter().chain(job.overlap_ids.iter()) {
            let reader = state
                .readers
                .get(&id)
                .cloned()
                .ok_or_else(|| CompactionError::Internal(format!("no reader for {id}")))?;
            readers.push(reader);
        }

        // Tombstones may be dropped at the bottom level, or when no
        // level below the output overlaps the job's key range.
        let bottom = job.output_level as usize == core.config.max_levels - 1;
        let drop_tombstones = bottom || {
            let metas = |level: u32, ids: &[u32]| -> Vec<LeveledSSTableMeta> {
                ids.iter()
                    .filter_map(|id| state.levels[level as usize].get(*id).cloned())
                    .collect()
            };
            let mut all = metas(job.input_level, &job.input_ids);
            all.extend(metas(job.output_level, &job.overlap_ids));
            let range = job_key_range(&all, key_type);
            match range {
                None => true,
                Some((min, max)) => !state
                    .levels
                    .iter()
                    .skip(job.output_level as usize + 1)
                    .flat_map(|l| l.sstables.iter())
                    .any(|m| key_ranges_overlap(key_type, &min, &max, &m.min_key, &m.max_key)),
            }
        };
        (readers, drop_tombstones)
    };

    let iters: Vec<Box<dyn KvCursor + Send>> = readers
        .iter()
        .map(|r| Box::new(SsTable::iter(r)) as Box<dyn KvCursor + Send>)
        .collect();
    let mut merge = MergeIterator::new(iters, key_type);

    // Stream the merge into output files, rolling to a fresh file when
    // the builder reports the current one full.
    let mut outputs: Vec<SSTableMeta> = Vec::new();
    let mut builder: Option<SSTableBuilder> = None;
    while merge.valid() {
        if drop_tombstones && merge.value().is_empty() {
            merge.next();
            continue;
        }
        if builder.is_none() {
            builder = Some(new_output_builder(core)?);
        }
        let b = builder.as_mut().expect("builder in place");
        if !b.add(merge.key(), merge.value())? {
            let finished = builder.take().expect("builder in place").finish()?;
            outputs.push(finished);
            let mut next = new_output_builder(core)?;
            next.add(merge.key(), merge.value())?;
            builder = Some(next);
        }
        merge.next();
    }
    if let Some(b) = builder.take() {
        if b.is_empty() {
            b.abandon()?;
        } else {
            outputs.push(b.finish()?);
        }
    }

    install_merge_results(core, job, &input_ids, outputs)?;
    maybe_snapshot(core)
}

fn new_output_builder(core: &TreeCore) -> Result<SSTableBuilder, CompactionError> {
    Ok(SSTableBuilder::new(
        &core.path,
        core.alloc_sstable_id(),
        core.column_types.clone(),
        core.primary_key_idx,
        core.config.rowgroup_target_size,
        core.config.rowgroup_alignment,
        core.config.memtable_size as u64,
        core.config.zone_map_prefix_len,
    )?)
}

/// One manifest edit, then the level-state swap, then old files go.
fn install_merge_results(
    core: &TreeCore,
    job: &CompactionJob,
    input_ids: &[u32],
    outputs: Vec<SSTableMeta>,
) -> Result<(), CompactionError> {
    let key_type = core.key_type();

    // Open readers for the new files before touching shared state.
    let mut new_entries = Vec::new();
    for meta in &outputs {
        let reader = Arc::new(SsTable::open(
            &core.path,
            meta.sstable_id,
            core.column_types.clone(),
        )?);
        new_entries.push((
            LeveledSSTableMeta::new(
                meta.sstable_id,
                job.output_level,
                meta.min_key.clone(),
                meta.max_key.clone(),
                meta.file_size,
            ),
            reader,
        ));
    }

    let adds: Vec<(u32, LeveledSSTableMeta)> = new_entries
        .iter()
        .map(|(meta, _)| (job.output_level, meta.clone()))
        .collect();
    let dels: Vec<(u32, u32)> = input_ids
        .iter()
        .map(|&id| (job.input_level, id))
        .chain(job.overlap_ids.iter().map(|&id| (job.output_level, id)))
        .collect();
    core.manifest.append_edit(&adds, &dels)?;

    let mut obsolete = Vec::new();
    {
        let mut state = lock_write(core)?;
        for &id in input_ids {
            state.levels[job.input_level as usize].remove_sstable(id);
            if let Some(reader) = state.readers.remove(&id) {
                obsolete.push(reader.path().to_path_buf());
            }
        }
        for &id in &job.overlap_ids {
            state.levels[job.output_level as usize].remove_sstable(id);
            if let Some(reader) = state.readers.remove(&id) {
                obsolete.push(reader.path().to_path_buf());
            }
        }
        for (meta, reader) in new_entries {
            state.readers.insert(meta.sstable_id, reader);
            state.levels[job.output_level as usize].add_sstable(meta, key_type);
        }
    }

    // The manifest edit is durable; the old files are dead. Readers
    // still holding an Arc keep their maps alive until they finish.
    for path in obsolete {
        if let Err(e) = std::fs::remove_file(&path) {
            tracing::warn!(path = %path.display(), error = %e, "failed to unlink compacted file");
        }
    }

    info!(
        input_level = job.input_level,
        output_level = job.output_level,
        inputs = input_ids.len(),
        overlaps = job.overlap_ids.len(),
        outputs = adds.len(),
        "compaction installed"
    );
    Ok(())
}

/// Combined `[min, max]` key range of the job's files.
fn job_key_range(
    metas: &[LeveledSSTableMeta],
    key_type: crate::types::ValueType,
) -> Option<(Vec<u8>, Vec<u8>)> {
    let mut min: Option<Vec<u8>> = None;
    let mut max: Option<Vec<u8>> = None;
    for meta in metas {
        min = Some(match min {
            None => meta.min_key.clone(),
            Some(cur)
                if crate::types::compare_keys(key_type, &meta.min_key, &cur)
                    == std::cmp::Ordering::Less =>
            {
                meta.min_key.clone()
            }
            Some(cur) => cur,
        });
        max = Some(match max {
            None => meta.max_key.clone(),
            Some(cur)
                if crate::types::compare_keys(key_type, &meta.max_key, &cur)
                    == std::cmp::Ordering::Greater =>
            {
                meta.max_key.clone()
            }
            Some(cur) => cur,
        });
    }
    Some((min?, max?))
}

fn maybe_snapshot(core: &TreeCore) -> Result<(), CompactionError> {
    core.maybe_snapshot_manifest()
        .map_err(|e| CompactionError::Internal(format!("manifest snapshot: {e}")))
}

fn lock_read(
    core: &TreeCore,
) -> Result<std::sync::RwLockReadGuard<'_, crate::engine::TreeState>, CompactionError> {
    core.state
        .read()
        .map_err(|_| CompactionError::Internal("state lock poisoned".into()))
}

fn lock_write(
    core: &TreeCore,
) -> Result<std::sync::RwLockWriteGuard<'_, crate::engine::TreeState>, CompactionError> {
    core.state
        .write()
        .map_err(|_| CompactionError::Internal("state lock poisoned".into()))
}
