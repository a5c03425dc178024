//! The queue itself: owns the push ring, pop ring, and file chain, and
//! coordinates the three background workers that move data between tiers.
//!
//! Foreground operations (`push`, `pop`, `at`, ...) take fine-grained locks
//! only for the duration of the in-memory bookkeeping they touch. Workers
//! never hold a lock across I/O — they read into or write from a block they
//! already own, and take a lock only to splice the result in afterward. A
//! caller sharing one `InfQ` across multiple producer or consumer threads is
//! still expected to serialize its own calls; the locks here exist to keep
//! the three background workers from corrupting ring and chain bookkeeping
//! while a foreground call is in flight, not to provide full MPMC safety.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::bg_exec::{Executor, Job};
use crate::config::InfqConfig;
use crate::error::{Error, Result};
use crate::file_block::{FileBlock, FILE_BLOCK_PREFIX, POP_BLOCK_PREFIX};
use crate::file_chain::FileChain;
use crate::mem_block::MemBlock;
use crate::mem_ring::{MemRing, PushEvent};
use crate::snapshot::{files_exclusive_to, DumpMeta, FileDumpMeta, PopqDumpMeta};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Which background worker a `suspend`/`continue` call targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorKind {
    /// The worker that spills full push-ring blocks to the file chain.
    Dump,
    /// The worker that fills the pop ring from the file chain.
    Load,
    /// The worker that removes file-chain entries no longer reachable by any
    /// retained snapshot.
    Unlink,
}

/// Snapshot of one background worker's queue depth and suspend state.
#[derive(Debug, Clone, Copy)]
pub struct ExecutorStats {
    /// Number of jobs currently queued (including one in flight, if any).
    pub pending_jobs: usize,
    /// Whether the worker is currently suspended.
    pub suspended: bool,
}

/// Aggregate counters returned by [`InfQ::fetch_stats`].
#[derive(Debug, Clone, Copy)]
pub struct InfqStats {
    /// Live elements held in memory (push ring + pop ring).
    pub mem_ele_count: i64,
    /// Total bytes occupied by file-chain entries.
    pub file_size: u64,
    /// Capacity of a single memory block, in bytes.
    pub mem_block_size: usize,
    /// Number of blocks in the push ring.
    pub pushq_blocks_num: usize,
    /// Number of blocks in the pop ring.
    pub popq_blocks_num: usize,
    /// Push-ring blocks currently holding live data.
    pub pushq_used_blocks: usize,
    /// Pop-ring blocks currently holding live data.
    pub popq_used_blocks: usize,
    /// Number of file blocks in the file chain.
    pub fileq_blocks_num: usize,
    /// Dump worker stats.
    pub dump_exec: ExecutorStats,
    /// Load worker stats.
    pub load_exec: ExecutorStats,
    /// Unlink worker stats.
    pub unlink_exec: ExecutorStats,
}

/// Push ring plus the monotonically increasing element counter assigned to
/// whatever it last accepted — kept together because both are protected by
/// the same lock (the original's `push_mu` covers `global_ele_idx` too).
struct PushState {
    ring: MemRing,
    global_ele_idx: i64,
}

/// Double-buffered snapshot metadata, plus the running suffix counter for
/// `pop_block_<N>` files, which persists across dump calls (advanced only by
/// `done_dump`, not reset per dump).
struct DumpMetaBuf {
    gens: [DumpMeta; 2],
    cur: usize,
    pop_block_suffix: i64,
}

impl Default for DumpMetaBuf {
    fn default() -> Self {
        Self { gens: [DumpMeta::default(), DumpMeta::default()], cur: 0, pop_block_suffix: 0 }
    }
}

struct Inner {
    name: String,
    dir: PathBuf,
    mem_block_size: usize,
    block_usage_to_dump: f32,
    push: Mutex<PushState>,
    pop: Mutex<MemRing>,
    file_chain: Mutex<FileChain>,
    pop_chain: Mutex<FileChain>,
    dump_meta: Mutex<DumpMetaBuf>,
    dump_exec: Executor,
    load_exec: Executor,
    unlink_exec: Executor,
}

/// An unbounded FIFO queue backed by a memory push ring, a file chain, and a
/// memory pop ring, with background workers spilling and reloading between
/// them as needed.
///
/// Dropping an `InfQ` stops its background workers and joins their threads;
/// file-chain contents are left on disk for a later [`InfQ::open`] to
/// restore from. Use [`InfQ::destroy_completely`] to remove them too.
pub struct InfQ {
    inner: Arc<Inner>,
}

impl InfQ {
    /// Opens a queue backed by `config.data_path()`, creating the directory
    /// if it does not already exist. This does not restore any previously
    /// dumped snapshot — call [`InfQ::load`] afterward for that.
    pub fn open(config: InfqConfig) -> Result<Self> {
        std::fs::create_dir_all(config.data_path())?;
        let dir = config.data_path().to_path_buf();

        let push_ring = MemRing::new(config.pushq_blocks_num, config.mem_block_size);
        let pop_ring = MemRing::new(config.popq_blocks_num, config.mem_block_size);
        let file_chain = FileChain::new(dir.clone(), FILE_BLOCK_PREFIX);
        let pop_chain = FileChain::new(dir.clone(), POP_BLOCK_PREFIX);

        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let w_dump = Weak::clone(weak);
            let w_load = Weak::clone(weak);
            let w_unlink = Weak::clone(weak);
            Inner {
                name: config.name().to_string(),
                dir,
                mem_block_size: config.mem_block_size,
                block_usage_to_dump: config.block_usage_to_dump,
                push: Mutex::new(PushState { ring: push_ring, global_ele_idx: 0 }),
                pop: Mutex::new(pop_ring),
                file_chain: Mutex::new(file_chain),
                pop_chain: Mutex::new(pop_chain),
                dump_meta: Mutex::new(DumpMetaBuf::default()),
                dump_exec: Executor::spawn("infq-dumper", move |job| {
                    if let Some(inner) = w_dump.upgrade() {
                        inner.run_dump_job(job);
                    }
                }),
                load_exec: Executor::spawn("infq-loader", move |job| {
                    if let Some(inner) = w_load.upgrade() {
                        inner.run_load_job(job);
                    }
                }),
                unlink_exec: Executor::spawn("infq-unlinker", move |job| {
                    if let Some(inner) = w_unlink.upgrade() {
                        inner.run_unlink_job(job);
                    }
                }),
            }
        });

        Ok(Self { inner })
    }

    /// The queue's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Appends `data` to the tail of the queue.
    pub fn push(&self, data: &[u8]) -> Result<()> {
        self.inner.push(data)
    }

    /// Removes and returns the oldest element, passing it to `f` without
    /// copying. Returns `Ok(None)` if the queue is empty, or
    /// [`Error::NotReady`] if the oldest element currently resides only in
    /// the file chain (retry after the loader has caught up).
    pub fn pop_zero_copy<R>(&self, f: impl FnOnce(&[u8], i64) -> R) -> Result<Option<R>> {
        self.inner.pop_zero_copy(f)
    }

    /// Copying variant of [`InfQ::pop_zero_copy`]: writes the element into
    /// `buf`, returning its length and global index.
    pub fn pop(&self, buf: &mut [u8]) -> Result<Option<(usize, i64)>> {
        let mut too_small = None;
        let result = self.pop_zero_copy(|data, idx| {
            if data.len() > buf.len() {
                too_small = Some(data.len());
                return (0usize, idx);
            }
            buf[..data.len()].copy_from_slice(data);
            (data.len(), idx)
        })?;
        if let Some(needed) = too_small {
            return Err(Error::Capacity(format!("caller buffer of {} bytes too small for element of {needed} bytes", buf.len())));
        }
        Ok(result)
    }

    /// Removes the oldest element without returning it.
    pub fn just_pop(&self) -> Result<bool> {
        Ok(self.pop_zero_copy(|_, _| ())?.is_some())
    }

    /// Returns the oldest element without removing it, passing it to `f`
    /// without copying.
    pub fn top_zero_copy<R>(&self, f: impl FnOnce(&[u8], i64) -> R) -> Result<Option<R>> {
        self.inner.top_zero_copy(f)
    }

    /// Copying variant of [`InfQ::top_zero_copy`].
    pub fn top(&self, buf: &mut [u8]) -> Result<Option<(usize, i64)>> {
        let mut too_small = None;
        let result = self.top_zero_copy(|data, idx| {
            if data.len() > buf.len() {
                too_small = Some(data.len());
                return (0usize, idx);
            }
            buf[..data.len()].copy_from_slice(data);
            (data.len(), idx)
        })?;
        if let Some(needed) = too_small {
            return Err(Error::Capacity(format!("caller buffer of {} bytes too small for element of {needed} bytes", buf.len())));
        }
        Ok(result)
    }

    /// Returns the element `i` positions from the current oldest live
    /// element (0 is the oldest), without copying. Fails if the element
    /// currently resides only in the file chain — zero-copy access is not
    /// available there.
    pub fn at_zero_copy<R>(&self, i: i64, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        self.inner.at_zero_copy(i, f)
    }

    /// Copying variant of [`InfQ::at_zero_copy`]; also reaches into the file
    /// chain if necessary.
    pub fn at(&self, i: i64, buf: &mut [u8]) -> Result<usize> {
        self.inner.at(i, buf)
    }

    /// Freezes the push ring's current write block as full, forcing the next
    /// push to start a fresh one. Used ahead of a snapshot so a background
    /// dumper never races the write path over the same block.
    pub fn push_queue_jump(&self) -> Result<()> {
        lock(&self.inner.push).ring.jump()
    }

    /// Total live elements across all three tiers.
    #[must_use]
    pub fn size(&self) -> i64 {
        let push = lock(&self.inner.push);
        let pop = lock(&self.inner.pop);
        let chain = lock(&self.inner.file_chain);
        push.ring.ele_count() + pop.ele_count() + chain.ele_count()
    }

    /// Total bytes reserved by the two memory rings.
    #[must_use]
    pub fn mem_size(&self) -> usize {
        let push = lock(&self.inner.push);
        let pop = lock(&self.inner.pop);
        push.ring.block_num() * push.ring.block(0).mem_size() + pop.block_num() * pop.block(0).mem_size()
    }

    /// Total bytes occupied by the file chain on disk.
    #[must_use]
    pub fn file_size(&self) -> u64 {
        lock(&self.inner.file_chain).total_fsize()
    }

    /// Writes a full snapshot: flushes the push ring to disk, materializes
    /// the pop ring's live blocks, and returns a serialized [`DumpMeta`]
    /// buffer the caller should persist durably (e.g. to its own metadata
    /// file or via IPC to a forked child). Call [`InfQ::done_dump`]
    /// afterward once the buffer has been durably stored, to release the
    /// previous generation's now-unreachable files.
    pub fn dump(&self) -> Result<Vec<u8>> {
        self.inner.dump()
    }

    /// Restores state from a buffer produced by [`InfQ::dump`]. Replaces the
    /// push ring, file chain, and pop ring wholesale; any data pushed since
    /// `open` is discarded.
    pub fn load(&self, buf: &[u8]) -> Result<()> {
        self.inner.load(buf)
    }

    /// Confirms the most recent [`InfQ::dump`] has been durably recorded by
    /// the caller, releasing files from the previous generation that the new
    /// one no longer needs.
    pub fn done_dump(&self) -> Result<()> {
        self.inner.done_dump()
    }

    /// Returns the currently active snapshot metadata generation.
    #[must_use]
    pub fn fetch_dump_meta(&self) -> DumpMeta {
        let meta_buf = lock(&self.inner.dump_meta);
        meta_buf.gens[meta_buf.cur].clone()
    }

    /// Returns aggregate size and background-worker counters.
    #[must_use]
    pub fn fetch_stats(&self) -> InfqStats {
        self.inner.fetch_stats()
    }

    /// Multi-line human-readable dump of internal state, for logging.
    #[must_use]
    pub fn debug_info(&self) -> String {
        self.inner.debug_info()
    }

    /// Pauses the named background worker; jobs keep queuing but none run
    /// until resumed.
    pub fn suspend_bg_exec(&self, kind: ExecutorKind) {
        self.inner.executor(kind).suspend();
    }

    /// Resumes the named background worker.
    pub fn continue_bg_exec(&self, kind: ExecutorKind) {
        self.inner.executor(kind).resume();
    }

    /// Resumes the named background worker only if it is currently
    /// suspended.
    pub fn continue_bg_exec_if_suspended(&self, kind: ExecutorKind) {
        self.inner.executor(kind).resume_if_suspended();
    }

    /// Stops background workers and removes every file the queue has ever
    /// written, including both snapshot generations. Consumes `self` because
    /// nothing about this queue's on-disk state remains valid afterward.
    pub fn destroy_completely(self) -> Result<()> {
        lock(&self.inner.file_chain).destroy_completely()?;
        lock(&self.inner.pop_chain).destroy_completely()?;
        Ok(())
    }
}

fn copy_into(data: &[u8], buf: &mut [u8]) -> Result<usize> {
    if data.len() > buf.len() {
        return Err(Error::Capacity(format!("caller buffer of {} bytes too small for element of {} bytes", buf.len(), data.len())));
    }
    buf[..data.len()].copy_from_slice(data);
    Ok(data.len())
}

impl Inner {
    fn executor(&self, kind: ExecutorKind) -> &Executor {
        match kind {
            ExecutorKind::Dump => &self.dump_exec,
            ExecutorKind::Load => &self.load_exec,
            ExecutorKind::Unlink => &self.unlink_exec,
        }
    }

    fn push(&self, data: &[u8]) -> Result<()> {
        let mut push = lock(&self.push);
        if push.ring.is_full() {
            return Err(Error::Capacity("push ring is full".to_string()));
        }
        let ele_idx = push.global_ele_idx;
        let event = push.ring.push(ele_idx, data)?;
        push.global_ele_idx += 1;
        if event == PushEvent::AdvancedBlock {
            self.on_push_block_full(&mut push);
        }
        Ok(())
    }

    /// Decides, after a push ring block just filled, whether to swap it into
    /// the pop ring in memory or hand it to the dump worker. Mirrors the
    /// original's full-block callback: prefer the in-memory swap whenever the
    /// file chain is empty and no dump/load job is already in flight, since
    /// that avoids touching disk entirely; otherwise queue a dump, eagerly if
    /// the file chain already has a backlog, or once usage crosses the
    /// configured threshold if it doesn't.
    fn on_push_block_full(&self, push: &mut PushState) {
        let file_chain_empty = lock(&self.file_chain).is_empty();

        if file_chain_empty && self.dump_exec.pending_task_num() == 0 && self.load_exec.pending_task_num() == 0 {
            let mut pop = lock(&self.pop);
            if !pop.is_full() {
                self.swap_full_block(push, &mut pop);
                return;
            }
        }

        let full = push.ring.full_block_num();
        #[allow(clippy::cast_precision_loss)]
        let threshold_reached = (full as f32) >= (push.ring.block_num() as f32) * self.block_usage_to_dump;
        if !file_chain_empty || threshold_reached {
            let job = Job::Dump { start_block: push.ring.first_block(), end_block: push.ring.last_block() };
            self.dump_exec.add_job(job);
        }
    }

    /// Moves the push ring's oldest full block into the pop ring's empty
    /// write slot by swapping block contents in place, instead of spilling
    /// to disk. Only ever swaps the one block whose completion triggered
    /// this call; a push ring with several full blocks already queued
    /// catches up one swap per subsequent full-block event.
    fn swap_full_block(&self, push: &mut PushState, pop: &mut MemRing) {
        if push.ring.full_block_num() == 0 {
            return;
        }

        let idx = push.ring.first_block();
        let (start, count) = {
            let blk = push.ring.block(idx);
            (blk.start_index(), blk.ele_count())
        };
        if count == 0 {
            if let Err(err) = push.ring.advance_first_block(0) {
                tracing::warn!(%err, "failed to advance push ring past an empty block during swap");
            }
            return;
        }

        std::mem::swap(push.ring.block_mut(idx), pop.block_mut(pop.last_block()));
        if let Err(err) = push.ring.advance_first_block(count) {
            tracing::error!(%err, "failed to advance push ring after block swap");
            return;
        }
        if let Err(err) = pop.advance_last_block(start, count) {
            tracing::error!(%err, "failed to advance pop ring after block swap");
            return;
        }
        tracing::debug!(start_index = ?start, count, "swapped full push block into pop ring");
    }

    fn pop_zero_copy<R>(&self, f: impl FnOnce(&[u8], i64) -> R) -> Result<Option<R>> {
        let mut advanced = false;
        let from_pop = {
            let mut pop = lock(&self.pop);
            match pop.pop_zero_copy()? {
                Some((data, idx, adv)) => {
                    advanced = adv;
                    Some(f(data, idx))
                }
                None => None,
            }
        };
        if let Some(r) = from_pop {
            if advanced {
                self.check_and_trigger_loader();
            }
            return Ok(Some(r));
        }
        self.pop_fallback_push_ring(f)
    }

    /// Pops directly from the push ring when both the pop ring and file
    /// chain are empty — the only case in which the push ring's own data is
    /// visible to a foreground pop.
    fn pop_fallback_push_ring<R>(&self, f: impl FnOnce(&[u8], i64) -> R) -> Result<Option<R>> {
        let mut push = lock(&self.push);
        let chain_empty = lock(&self.file_chain).is_empty();
        if !chain_empty {
            return Err(Error::NotReady);
        }
        if push.ring.is_empty() {
            return Ok(None);
        }
        let Some((data, idx, _advanced)) = push.ring.pop_zero_copy()? else {
            return Ok(None);
        };
        let result = f(data, idx);
        let new_min = push.ring.min_idx();
        drop(push);
        lock(&self.pop).set_index_range(new_min, new_min);
        Ok(Some(result))
    }

    fn top_zero_copy<R>(&self, f: impl FnOnce(&[u8], i64) -> R) -> Result<Option<R>> {
        let pop = lock(&self.pop);
        if !pop.is_empty() {
            return Ok(pop.top_zero_copy()?.map(|(data, idx)| f(data, idx)));
        }
        drop(pop);

        if !lock(&self.file_chain).is_empty() {
            return Err(Error::NotReady);
        }
        let push = lock(&self.push);
        Ok(push.ring.top_zero_copy()?.map(|(data, idx)| f(data, idx)))
    }

    fn resolve_abs_index(&self, i: i64) -> Result<i64> {
        let push = lock(&self.push);
        let pop = lock(&self.pop);
        let Some(base) = pop.min_idx().or_else(|| push.ring.min_idx()) else {
            return Err(Error::InvalidArgument("queue is empty".to_string()));
        };
        let abs = base + i;
        let upper = push.ring.max_idx().unwrap_or(base);
        if abs < base || abs >= upper {
            return Err(Error::InvalidArgument(format!("index {i} out of range [0, {})", upper - base)));
        }
        Ok(abs)
    }

    fn at_zero_copy<R>(&self, i: i64, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let abs = self.resolve_abs_index(i)?;

        let push = lock(&self.push);
        if push.ring.min_idx().is_some_and(|m| abs >= m) {
            return Ok(f(push.ring.at_zero_copy(abs)?));
        }
        drop(push);

        let pop = lock(&self.pop);
        if pop.max_idx().is_some_and(|m| abs < m) {
            return Ok(f(pop.at_zero_copy(abs)?));
        }

        Err(Error::InvalidArgument("zero-copy access is not available for data in the file chain".to_string()))
    }

    fn at(&self, i: i64, buf: &mut [u8]) -> Result<usize> {
        let abs = self.resolve_abs_index(i)?;

        {
            let push = lock(&self.push);
            if push.ring.min_idx().is_some_and(|m| abs >= m) {
                let data = push.ring.at_zero_copy(abs)?;
                return copy_into(data, buf);
            }
        }
        {
            let pop = lock(&self.pop);
            if pop.max_idx().is_some_and(|m| abs < m) {
                let data = pop.at_zero_copy(abs)?;
                return copy_into(data, buf);
            }
        }
        lock(&self.file_chain).at(abs, buf)
    }

    fn check_and_trigger_loader(&self) {
        let free = lock(&self.pop).free_block_num();
        if free == 0 {
            return;
        }
        let (start, chain_len) = {
            let chain = lock(&self.file_chain);
            (chain.front_suffix(), chain.block_num())
        };
        let Some(start) = start else { return };
        if chain_len == 0 {
            return;
        }
        let end = start + i64::try_from(free.min(chain_len)).unwrap_or(i64::MAX);
        self.load_exec.add_job(Job::Load { file_start_block: start, file_end_block: end });
    }

    /// Writes every non-empty push-ring block (including the current write
    /// block) to the file chain, then collapses the ring to empty at the
    /// write block's position. Synchronous: part of taking a snapshot, not a
    /// background job.
    fn flush_push_ring(&self) -> Result<()> {
        let (first, last, block_num) = {
            let push = lock(&self.push);
            (push.ring.first_block(), push.ring.last_block(), push.ring.block_num())
        };

        let mut idx = first;
        loop {
            let block = {
                let push = lock(&self.push);
                let blk = push.ring.block(idx);
                if blk.is_empty() {
                    None
                } else {
                    Some(blk.clone())
                }
            };
            if let Some(block) = block {
                lock(&self.file_chain).dump(&block)?;
                lock(&self.push).ring.block_mut(idx).reset(None);
            }
            if idx == last {
                break;
            }
            idx = (idx + 1) % block_num;
        }

        let mut push = lock(&self.push);
        let max = push.ring.max_idx();
        push.ring.set_cursors(last, last, max, max, 0);
        Ok(())
    }

    /// Materializes the pop ring's live blocks as `pop_block_<N>` files,
    /// reusing a hard link where a block was loaded unmodified from an
    /// existing file-chain entry. Stops at the first empty block, which by
    /// the ring's own invariant means there is no more live data beyond it.
    fn dump_pop_queue_if_need(&self) -> Result<PopqDumpMeta> {
        lock(&self.pop_chain).reset();
        let start_suffix = lock(&self.dump_meta).pop_block_suffix;
        let mut counter = start_suffix;

        let (first, last, block_num, block_size) = {
            let pop = lock(&self.pop);
            (pop.first_block(), pop.last_block(), pop.block_num(), pop.block(0).mem_size())
        };

        let mut idx = first;
        while idx != last {
            let block = {
                let pop = lock(&self.pop);
                let blk = pop.block(idx);
                if blk.is_empty() {
                    None
                } else {
                    Some(blk.clone())
                }
            };
            let Some(block) = block else { break };
            lock(&self.pop_chain).dump_or_link_at(counter, &block)?;
            counter += 1;
            idx = (idx + 1) % block_num;
        }

        let (min_idx, max_idx, ele_count) = {
            let pop = lock(&self.pop);
            (pop.min_idx().unwrap_or(0), pop.max_idx().unwrap_or(0), pop.ele_count())
        };

        Ok(PopqDumpMeta { file_range: start_suffix..counter, min_idx, max_idx, ele_count, block_num, block_size })
    }

    /// Snapshotting walks the same push-ring and pop-ring blocks the dump
    /// and load workers mutate in the background; both are paused for the
    /// duration so neither a duplicate dump nor a lost load race the
    /// snapshot, then resumed once bookkeeping is consistent again.
    fn dump(&self) -> Result<Vec<u8>> {
        self.dump_exec.suspend();
        self.load_exec.suspend();
        let result = self.dump_inner();
        self.dump_exec.resume();
        self.load_exec.resume();
        result
    }

    fn dump_inner(&self) -> Result<Vec<u8>> {
        self.flush_push_ring()?;
        let popq_meta = self.dump_pop_queue_if_need()?;

        let file_meta = {
            let chain = lock(&self.file_chain);
            let file_range = match (chain.front_suffix(), chain.back_suffix()) {
                (Some(start), Some(end)) => start..(end + 1),
                _ => 0..0,
            };
            FileDumpMeta {
                file_range,
                ele_count: chain.ele_count(),
                block_num: i64::try_from(chain.block_num()).unwrap_or(i64::MAX),
                file_size: chain.total_fsize(),
            }
        };
        let global_ele_idx = lock(&self.push).global_ele_idx;

        let mut meta_buf = lock(&self.dump_meta);
        let backup_idx = 1 - meta_buf.cur;
        meta_buf.gens[backup_idx] =
            DumpMeta { file_path: self.dir.clone(), infq_name: self.name.clone(), global_ele_idx, file_meta, popq_meta };
        Ok(meta_buf.gens[backup_idx].serialize())
    }

    /// Restoring replaces ring and file-chain state wholesale, so all three
    /// workers are paused for the duration — a background job running
    /// against the pre-restore state would corrupt the one being built.
    fn load(&self, buf: &[u8]) -> Result<()> {
        self.dump_exec.suspend();
        self.load_exec.suspend();
        self.unlink_exec.suspend();
        let result = self.load_inner(buf);
        self.dump_exec.resume();
        self.load_exec.resume();
        self.unlink_exec.resume();
        result
    }

    fn load_inner(&self, buf: &[u8]) -> Result<()> {
        let meta = DumpMeta::deserialize(buf)?;

        let (push_block_num, push_block_size) = {
            let push = lock(&self.push);
            (push.ring.block_num(), push.ring.block(0).mem_size())
        };
        lock(&self.push).ring = MemRing::new(push_block_num, push_block_size);

        {
            let mut chain = lock(&self.file_chain);
            chain.reset();
            for suffix in meta.file_meta.file_range.clone() {
                chain.add_block_by_suffix(suffix)?;
            }
            if i64::try_from(chain.block_num()).unwrap_or(i64::MAX) != meta.file_meta.block_num || chain.ele_count() != meta.file_meta.ele_count
            {
                return Err(Error::Consistency("restored file chain does not match snapshot metadata".to_string()));
            }
        }

        let popq_block_num = meta.popq_meta.block_num.max(2);
        let mut new_pop = MemRing::new(popq_block_num, meta.popq_meta.block_size);
        let mut min_idx: Option<i64> = None;
        let mut max_idx: Option<i64> = None;
        let mut total_ele = 0i64;
        for suffix in meta.popq_meta.file_range.clone() {
            let mut fblock = FileBlock::new(self.dir.clone(), POP_BLOCK_PREFIX, suffix);
            let mut scratch = MemBlock::new(meta.popq_meta.block_size);
            fblock.load(&mut scratch)?;
            if let Some(s) = scratch.start_index() {
                let c = i64::from(scratch.ele_count());
                min_idx = Some(min_idx.map_or(s, |m| m.min(s)));
                max_idx = Some(max_idx.map_or(s + c, |m| m.max(s + c)));
                total_ele += c;
            }
            new_pop.push_loaded_block(&mut scratch)?;
        }
        if total_ele != meta.popq_meta.ele_count
            || min_idx.unwrap_or(meta.popq_meta.min_idx) != meta.popq_meta.min_idx
            || max_idx.unwrap_or(meta.popq_meta.max_idx) != meta.popq_meta.max_idx
        {
            return Err(Error::Consistency("restored pop ring does not match snapshot metadata".to_string()));
        }

        *lock(&self.pop) = new_pop;

        {
            let mut push = lock(&self.push);
            push.global_ele_idx = meta.global_ele_idx;
            push.ring.set_index_range(Some(meta.global_ele_idx), Some(meta.global_ele_idx));
        }

        self.check_and_trigger_loader();

        {
            let mut meta_buf = lock(&self.dump_meta);
            let cur = meta_buf.cur;
            meta_buf.pop_block_suffix = meta.popq_meta.file_range.end;
            meta_buf.gens[cur] = meta;
        }

        Ok(())
    }

    fn done_dump(&self) -> Result<()> {
        let mut meta_buf = lock(&self.dump_meta);
        let (file_rm, pop_rm) = {
            let cur = &meta_buf.gens[meta_buf.cur];
            let backup = &meta_buf.gens[1 - meta_buf.cur];
            (
                files_exclusive_to(&cur.file_meta.file_range, &backup.file_meta.file_range),
                files_exclusive_to(&cur.popq_meta.file_range, &backup.popq_meta.file_range),
            )
        };

        for suffix in file_rm {
            self.unlink_exec.add_job(Job::Unlink { prefix: FILE_BLOCK_PREFIX, suffix });
        }
        for suffix in pop_rm {
            self.unlink_exec.add_job(Job::Unlink { prefix: POP_BLOCK_PREFIX, suffix });
        }

        meta_buf.cur = 1 - meta_buf.cur;
        let new_cur = &meta_buf.gens[meta_buf.cur];
        meta_buf.pop_block_suffix += new_cur.popq_meta.file_range.end - new_cur.popq_meta.file_range.start;
        Ok(())
    }

    fn fetch_stats(&self) -> InfqStats {
        let push = lock(&self.push);
        let pop = lock(&self.pop);
        let chain = lock(&self.file_chain);

        let pushq_used = push.ring.full_block_num() + usize::from(!push.ring.block(push.ring.last_block()).is_empty());
        let popq_used = pop.full_block_num() + usize::from(!pop.block(pop.last_block()).is_empty());

        InfqStats {
            mem_ele_count: push.ring.ele_count() + pop.ele_count(),
            file_size: chain.total_fsize(),
            mem_block_size: self.mem_block_size,
            pushq_blocks_num: push.ring.block_num(),
            popq_blocks_num: pop.block_num(),
            pushq_used_blocks: pushq_used,
            popq_used_blocks: popq_used,
            fileq_blocks_num: chain.block_num(),
            dump_exec: ExecutorStats { pending_jobs: self.dump_exec.pending_task_num(), suspended: self.dump_exec.is_suspended() },
            load_exec: ExecutorStats { pending_jobs: self.load_exec.pending_task_num(), suspended: self.load_exec.is_suspended() },
            unlink_exec: ExecutorStats { pending_jobs: self.unlink_exec.pending_task_num(), suspended: self.unlink_exec.is_suspended() },
        }
    }

    fn debug_info(&self) -> String {
        let push = lock(&self.push);
        let pop = lock(&self.pop);
        let chain = lock(&self.file_chain);
        format!(
            "infq[{}] global_ele_idx={}\n  push_ring: first={} last={} min_idx={:?} max_idx={:?} ele_count={}\n    first_block: {}\n    last_block: {}\n  pop_ring: first={} last={} min_idx={:?} max_idx={:?} ele_count={}\n    first_block: {}\n    last_block: {}\n  file_chain: {}",
            self.name,
            push.global_ele_idx,
            push.ring.first_block(),
            push.ring.last_block(),
            push.ring.min_idx(),
            push.ring.max_idx(),
            push.ring.ele_count(),
            push.ring.block(push.ring.first_block()).debug_info(),
            push.ring.block(push.ring.last_block()).debug_info(),
            pop.first_block(),
            pop.last_block(),
            pop.min_idx(),
            pop.max_idx(),
            pop.ele_count(),
            pop.block(pop.first_block()).debug_info(),
            pop.block(pop.last_block()).debug_info(),
            chain.debug_info(),
        )
    }

    /// Writes push-ring blocks `[start_block, end_block)` to the file chain,
    /// advancing `first_block` past each as it completes. Stops at the first
    /// failure, leaving the remainder for the next trigger.
    fn run_dump_job(&self, job: &Job) {
        let Job::Dump { end_block, .. } = *job else { return };
        loop {
            let block = {
                let push = lock(&self.push);
                if push.ring.first_block() == end_block {
                    return;
                }
                push.ring.block(push.ring.first_block()).clone()
            };
            if let Err(err) = lock(&self.file_chain).dump(&block) {
                tracing::error!(%err, "dump job failed to write file block");
                return;
            }
            if let Err(err) = lock(&self.push).ring.drop_first_block() {
                tracing::error!(%err, "dump job failed to advance push ring");
                return;
            }
        }
    }

    /// Loads file-chain blocks into the pop ring until the ring is full or
    /// the chain is drained past `file_end_block`.
    fn run_load_job(&self, job: &Job) {
        let Job::Load { file_end_block, .. } = *job else { return };
        let block_size = lock(&self.pop).block(0).mem_size();
        loop {
            if lock(&self.pop).is_full() {
                return;
            }
            match lock(&self.file_chain).front_suffix() {
                None => return,
                Some(s) if s == file_end_block => return,
                Some(_) => {}
            }

            let mut scratch = MemBlock::new(block_size);
            if let Err(err) = lock(&self.file_chain).load_front(&mut scratch) {
                tracing::error!(%err, "load job failed to read file block");
                return;
            }
            if let Err(err) = lock(&self.pop).push_loaded_block(&mut scratch) {
                tracing::error!(%err, "load job failed to splice loaded block into pop ring");
                return;
            }
        }
    }

    /// Removes one file-chain entry's backing file. Failure is logged, not
    /// retried — a lingering file just means diff-retention revisits it on
    /// the next `done_dump`.
    fn run_unlink_job(&self, job: &Job) {
        let Job::Unlink { prefix, suffix } = *job else { return };
        let path = self.dir.join(format!("{prefix}_{suffix}"));
        match std::fs::remove_file(&path) {
            Ok(()) => tracing::debug!(path = %path.display(), "unlinked file"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => tracing::error!(path = %path.display(), %err, "failed to unlink file"),
        }
    }
}
