//! Fixed circular array of memory blocks, used as both the push ring and
//! the pop ring.
//!
//! The slot at `last_block` is always the current write block and may
//! legitimately be empty. The ring is full when `first_block` trails
//! `last_block` by exactly one slot; it is empty when `first_block ==
//! last_block` and that block holds no live elements.
//!
//! Unlike the original's function-pointer callbacks invoked from inside
//! `push`/`pop`, this ring reports block-boundary events back to the caller
//! through its return value (`AdvancedBlock` / the `bool` third element of
//! `pop_zero_copy`'s result). The InfQ core — which alone has access to the
//! file chain and the background executors — performs the swap-or-dump and
//! loader-trigger decisions itself after inspecting the event.

use crate::error::{Error, Result};
use crate::mem_block::MemBlock;

/// Outcome of a `MemRing::push` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushEvent {
    /// The element was written into the existing current write block.
    Wrote,
    /// The current write block had no room; the ring advanced to a fresh
    /// block before writing.
    AdvancedBlock,
}

/// A fixed circular array of memory blocks.
#[derive(Debug)]
pub struct MemRing {
    blocks: Vec<MemBlock>,
    block_num: usize,
    first_block: usize,
    last_block: usize,
    min_idx: Option<i64>,
    max_idx: Option<i64>,
    ele_count: i64,
}

impl MemRing {
    /// Builds a ring of `block_num` blocks, each of `block_size` bytes.
    #[must_use]
    pub fn new(block_num: usize, block_size: usize) -> Self {
        assert!(block_num >= 2, "a ring needs at least 2 blocks (1 write + 1 free)");
        let blocks = (0..block_num).map(|_| MemBlock::new(block_size)).collect();
        Self {
            blocks,
            block_num,
            first_block: 0,
            last_block: 0,
            min_idx: None,
            max_idx: None,
            ele_count: 0,
        }
    }

    /// Number of blocks in the ring.
    #[must_use]
    pub const fn block_num(&self) -> usize {
        self.block_num
    }

    /// Physical index of the oldest block.
    #[must_use]
    pub const fn first_block(&self) -> usize {
        self.first_block
    }

    /// Physical index of the current write block.
    #[must_use]
    pub const fn last_block(&self) -> usize {
        self.last_block
    }

    /// Total number of live elements across all blocks.
    #[must_use]
    pub const fn ele_count(&self) -> i64 {
        self.ele_count
    }

    /// Global index of the oldest live element, if any.
    #[must_use]
    pub const fn min_idx(&self) -> Option<i64> {
        self.min_idx
    }

    /// Global index one past the newest live element, if any.
    #[must_use]
    pub const fn max_idx(&self) -> Option<i64> {
        self.max_idx
    }

    /// Immutable access to a block by physical index.
    #[must_use]
    pub fn block(&self, phys_idx: usize) -> &MemBlock {
        &self.blocks[phys_idx]
    }

    /// Mutable access to a block by physical index — used by the dump/load
    /// job runners and by the block-swap fast path.
    pub fn block_mut(&mut self, phys_idx: usize) -> &mut MemBlock {
        &mut self.blocks[phys_idx]
    }

    /// Number of blocks already completed and awaiting drain (all blocks
    /// strictly between `first_block` and `last_block`, exclusive of the
    /// current write block).
    #[must_use]
    pub fn full_block_num(&self) -> usize {
        (self.last_block + self.block_num - self.first_block) % self.block_num
    }

    /// Number of blocks free to become new write blocks.
    #[must_use]
    pub fn free_block_num(&self) -> usize {
        self.block_num - 1 - self.full_block_num()
    }

    /// True when there is no free block to advance into.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.first_block == (self.last_block + 1) % self.block_num
    }

    /// True when the ring holds no live elements at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.first_block == self.last_block && self.blocks[self.first_block].is_empty()
    }

    /// Appends `data` at global ordinal `ele_idx`, advancing to a fresh
    /// write block first if the current one has no room.
    pub fn push(&mut self, ele_idx: i64, data: &[u8]) -> Result<PushEvent> {
        if self.is_full() {
            return Err(Error::Capacity("push ring is full".to_string()));
        }

        let needs_advance = {
            let blk = &self.blocks[self.last_block];
            4 + data.len() > blk.mem_size() - blk.last_offset()
        };

        let event = if needs_advance {
            self.last_block = (self.last_block + 1) % self.block_num;
            self.blocks[self.last_block].reset(Some(ele_idx));
            if self.is_full() {
                return Err(Error::Capacity(
                    "push ring is full after advancing the write block".to_string(),
                ));
            }
            PushEvent::AdvancedBlock
        } else {
            PushEvent::Wrote
        };

        self.blocks[self.last_block].push(ele_idx, data)?;
        self.ele_count += 1;
        self.max_idx = Some(self.max_idx.map_or(ele_idx + 1, |m| m.max(ele_idx + 1)));
        if self.min_idx.is_none() {
            self.min_idx = Some(ele_idx);
        }
        Ok(event)
    }

    /// Pops the oldest live element. Returns `(data, global_idx,
    /// first_block_advanced)`, where the third element is `true` when the
    /// block just drained became empty and the ring still has other
    /// elements (signalling the caller to consider triggering a loader
    /// job).
    pub fn pop_zero_copy(&mut self) -> Result<Option<(&[u8], i64, bool)>> {
        if self.is_empty() {
            return Ok(None);
        }

        let first = self.first_block;
        let Some((data, idx, block_now_empty)) = self.blocks[first].pop_zero_copy()? else {
            return Ok(None);
        };

        self.ele_count -= 1;
        self.min_idx = Some(idx + 1);

        let mut advanced = false;
        if block_now_empty && self.ele_count > 0 {
            self.first_block = (self.first_block + 1) % self.block_num;
            advanced = true;
        }

        Ok(Some((data, idx, advanced)))
    }

    /// Returns the oldest live element without removing it.
    pub fn top_zero_copy(&self) -> Result<Option<(&[u8], i64)>> {
        if self.is_empty() {
            return Ok(None);
        }
        let blk = &self.blocks[self.first_block];
        let Some(idx) = blk.start_index() else { return Ok(None) };
        Ok(blk.top_zero_copy()?.map(|data| (data, idx)))
    }

    /// Returns the element at `global_idx` without copying, dispatching to
    /// whichever block's range contains it. The search range excludes the
    /// current write block if it is empty.
    pub fn at_zero_copy(&self, global_idx: i64) -> Result<&[u8]> {
        let phys = self.search_block_by_idx(global_idx)?;
        self.blocks[phys].at_zero_copy(global_idx)
    }

    /// Advances the write block without pushing, provided the current write
    /// block is non-empty and the ring is not full. Used by snapshot to
    /// freeze the current write block so background dumpers and the
    /// snapshot writer never race on it. The new write block has no known
    /// start index yet (unlike the index-driven reset on a full-block
    /// advance during `push`).
    pub fn jump(&mut self) -> Result<()> {
        if self.blocks[self.last_block].is_empty() {
            return Ok(());
        }
        if self.is_full() {
            return Err(Error::Capacity("push ring is full".to_string()));
        }
        self.last_block = (self.last_block + 1) % self.block_num;
        self.blocks[self.last_block].reset(None);
        Ok(())
    }

    /// Advances `first_block` by one slot given the element count it was
    /// carrying, refreshing `min_idx` from the new first block. Takes the
    /// dropped count as a parameter rather than reading the slot because
    /// some callers (the block-swap fast path) have already moved the
    /// slot's content elsewhere by the time they call this.
    pub fn advance_first_block(&mut self, dropped_ele_count: i32) -> Result<()> {
        if self.first_block == self.last_block {
            return Err(Error::Consistency("cannot advance past the ring's only block".to_string()));
        }
        self.first_block = (self.first_block + 1) % self.block_num;
        self.ele_count -= i64::from(dropped_ele_count);
        self.min_idx = self.blocks[self.first_block].start_index();
        Ok(())
    }

    /// Advances `first_block` past a block that a dump job has already
    /// written out, without touching its contents (stale data lingers
    /// harmlessly until the slot is reset on reuse). Used by the dump job
    /// runner, which writes a block to the file chain without holding this
    /// ring's lock, then calls back in just to record the effect.
    pub fn drop_first_block(&mut self) -> Result<()> {
        let dropped = self.blocks[self.first_block].ele_count();
        self.advance_first_block(dropped)
    }

    /// Advances `last_block` to a fresh empty slot after the prior write
    /// block's content was placed there directly (by the block-swap fast
    /// path's `mem::swap` via `block_mut`), given that content's start
    /// index and element count for bookkeeping.
    pub fn advance_last_block(&mut self, moved_start: Option<i64>, moved_ele_count: i32) -> Result<()> {
        if self.is_full() {
            return Err(Error::Capacity("ring is full".to_string()));
        }
        self.last_block = (self.last_block + 1) % self.block_num;
        self.blocks[self.last_block].reset(None);
        if self.min_idx.is_none() {
            self.min_idx = moved_start;
        }
        if let Some(start) = moved_start {
            self.max_idx = Some(self.max_idx.map_or(start + i64::from(moved_ele_count), |m| m.max(start + i64::from(moved_ele_count))));
        }
        self.ele_count += i64::from(moved_ele_count);
        Ok(())
    }

    /// Splices a block loaded from the file chain in as the new write
    /// block, then advances to a fresh empty one. `loaded` is swapped with
    /// the ring's current (always-empty) write block rather than copied, so
    /// the caller gets that block's allocation back to reuse as the next
    /// load's scratch buffer.
    pub fn push_loaded_block(&mut self, loaded: &mut MemBlock) -> Result<()> {
        if self.is_full() {
            return Err(Error::Capacity("pop ring is full".to_string()));
        }
        std::mem::swap(&mut self.blocks[self.last_block], loaded);
        let start = self.blocks[self.last_block].start_index();
        let ele_count = self.blocks[self.last_block].ele_count();
        self.advance_last_block(start, ele_count)
    }

    /// Overwrites ring bookkeeping directly — used when reconstructing a
    /// ring from a restored snapshot.
    pub fn set_cursors(&mut self, first_block: usize, last_block: usize, min_idx: Option<i64>, max_idx: Option<i64>, ele_count: i64) {
        self.first_block = first_block;
        self.last_block = last_block;
        self.min_idx = min_idx;
        self.max_idx = max_idx;
        self.ele_count = ele_count;
    }

    /// Sets only the index range, leaving block cursors and `ele_count`
    /// untouched. Used when the push ring pops its own data because both
    /// the pop ring and the file chain are empty, to keep the pop ring's
    /// future index range contiguous with what just left the push ring.
    pub fn set_index_range(&mut self, min_idx: Option<i64>, max_idx: Option<i64>) {
        self.min_idx = min_idx;
        self.max_idx = max_idx;
    }

    fn live_block_range(&self) -> (usize, usize) {
        if self.first_block == self.last_block {
            let count = usize::from(!self.blocks[self.last_block].is_empty());
            return (self.first_block, count);
        }
        let span = self.full_block_num();
        let last_live = usize::from(!self.blocks[self.last_block].is_empty());
        (self.first_block, span + last_live)
    }

    fn search_block_by_idx(&self, global_idx: i64) -> Result<usize> {
        let (first, total) = self.live_block_range();
        if total == 0 {
            return Err(Error::InvalidArgument(format!(
                "index {global_idx} not found: ring has no live blocks"
            )));
        }

        let (mut lo, mut hi) = (0usize, total);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let phys = (first + mid) % self.block_num;
            let blk = &self.blocks[phys];
            let Some(start) = blk.start_index() else {
                hi = mid;
                continue;
            };
            if global_idx < start {
                hi = mid;
            } else if global_idx >= start + i64::from(blk.ele_count()) {
                lo = mid + 1;
            } else {
                return Ok(phys);
            }
        }

        Err(Error::InvalidArgument(format!("index {global_idx} not found in ring")))
    }
}

#[cfg(test)]
mod tests {
    use super::{MemRing, PushEvent};

    fn push_n(ring: &mut MemRing, n: i64) {
        for i in 0..n {
            ring.push(i, &i.to_le_bytes()).unwrap();
        }
    }

    #[test]
    fn push_advances_block_when_full_and_reports_event() {
        let mut ring = MemRing::new(3, 16);
        assert_eq!(ring.push(0, b"1234").unwrap(), PushEvent::Wrote);
        // second push of 4+4=8 bytes won't fit in remaining 8 bytes of a
        // 16-byte block after an 8-byte first element, forcing an advance.
        assert_eq!(ring.push(1, b"1234").unwrap(), PushEvent::Wrote);
        let event = ring.push(2, b"1234").unwrap();
        assert_eq!(event, PushEvent::AdvancedBlock);
    }

    #[test]
    fn full_block_num_and_free_block_num_partition_block_num_minus_one() {
        let mut ring = MemRing::new(4, 16);
        assert_eq!(ring.full_block_num() + ring.free_block_num(), 3);
        ring.push(0, b"1234").unwrap();
        ring.push(1, b"1234").unwrap();
        ring.push(2, b"1234").unwrap(); // forces advance to block 1
        assert_eq!(ring.full_block_num(), 1);
    }

    #[test]
    fn pop_in_fifo_order() {
        let mut ring = MemRing::new(4, 64);
        push_n(&mut ring, 5);
        for i in 0..5 {
            let (data, idx, _) = ring.pop_zero_copy().unwrap().unwrap();
            assert_eq!(idx, i);
            assert_eq!(i64::from_le_bytes(data.try_into().unwrap()), i);
        }
        assert!(ring.is_empty());
    }

    #[test]
    fn at_zero_copy_finds_elements_across_blocks() {
        let mut ring = MemRing::new(4, 16);
        for i in 0..6 {
            ring.push(i, &(i as i32).to_le_bytes()).unwrap();
        }
        for i in 0..6 {
            let data = ring.at_zero_copy(i).unwrap();
            assert_eq!(i32::from_le_bytes(data.try_into().unwrap()), i as i32);
        }
        assert!(ring.at_zero_copy(6).is_err());
    }

    #[test]
    fn jump_is_noop_on_empty_write_block() {
        let mut ring = MemRing::new(3, 16);
        let before = ring.last_block();
        ring.jump().unwrap();
        assert_eq!(ring.last_block(), before);
    }

    #[test]
    fn drop_first_block_advances_past_a_dumped_block() {
        let mut ring = MemRing::new(3, 16);
        push_n(&mut ring, 3); // forces an advance to block 1
        assert_eq!(ring.full_block_num(), 1);
        ring.drop_first_block().unwrap();
        assert_eq!(ring.first_block(), 1);
        assert_eq!(ring.full_block_num(), 0);
    }

    #[test]
    fn push_loaded_block_splices_in_loaded_data_and_returns_scratch() {
        use crate::mem_block::MemBlock;

        let mut ring = MemRing::new(3, 64);
        let mut loaded = MemBlock::new(64);
        loaded.reset(Some(10));
        loaded.push(10, b"hi").unwrap();

        ring.push_loaded_block(&mut loaded).unwrap();
        assert_eq!(ring.min_idx(), Some(10));
        assert_eq!(ring.ele_count(), 1);
        assert_eq!(ring.at_zero_copy(10).unwrap(), b"hi");
        // `loaded` now holds the ring's old (empty) write block.
        assert!(loaded.is_empty());
    }
}
