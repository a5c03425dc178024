//! Ordered collection of on-disk file blocks, the middle tier of the queue.
//!
//! Unlike the original's linked list paired with a separate doubling-array
//! search index, the chain here is a single `VecDeque<FileBlock>`: push to
//! the back on dump, pop from the front on load, and binary-search by index
//! directly over the deque for random access (`at`). This collapses two
//! data structures into one without changing the lookup's asymptotics.

use std::collections::VecDeque;
use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::file_block::{FileBlock, FILE_BLOCK_PREFIX};
use crate::mem_block::MemBlock;

/// The file chain: zero or more file blocks in strictly increasing,
/// contiguous index order.
#[derive(Debug)]
pub struct FileChain {
    dir: PathBuf,
    prefix: &'static str,
    blocks: VecDeque<FileBlock>,
    next_suffix: i64,
    ele_count: i64,
    total_fsize: u64,
}

impl FileChain {
    /// Creates an empty chain rooted at `dir`, naming its files
    /// `<prefix>_<suffix>`.
    #[must_use]
    pub fn new(dir: PathBuf, prefix: &'static str) -> Self {
        Self { dir, prefix, blocks: VecDeque::new(), next_suffix: 0, ele_count: 0, total_fsize: 0 }
    }

    /// True when the chain holds no file blocks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Number of file blocks currently in the chain.
    #[must_use]
    pub fn block_num(&self) -> usize {
        self.blocks.len()
    }

    /// Total live element count across all file blocks.
    #[must_use]
    pub const fn ele_count(&self) -> i64 {
        self.ele_count
    }

    /// Total bytes occupied by all file blocks on disk.
    #[must_use]
    pub const fn total_fsize(&self) -> u64 {
        self.total_fsize
    }

    /// Global index of the oldest element in the chain, if any.
    #[must_use]
    pub fn start_index(&self) -> Option<i64> {
        self.blocks.front().map(FileBlock::start_index)
    }

    /// Global index one past the newest element in the chain, if any.
    #[must_use]
    pub fn end_index(&self) -> Option<i64> {
        self.blocks.back().map(|b| b.start_index() + i64::from(b.ele_count()))
    }

    /// Suffix that will be assigned to the next dumped block.
    #[must_use]
    pub const fn next_suffix(&self) -> i64 {
        self.next_suffix
    }

    /// Suffix of the chain's head block, if any.
    #[must_use]
    pub fn front_suffix(&self) -> Option<i64> {
        self.blocks.front().map(FileBlock::suffix)
    }

    /// Suffix of the chain's tail block, if any.
    #[must_use]
    pub fn back_suffix(&self) -> Option<i64> {
        self.blocks.back().map(FileBlock::suffix)
    }

    /// Writes `mem_block` out as a new file block appended to the chain's
    /// tail, returning the suffix it was written under.
    pub fn dump(&mut self, mem_block: &MemBlock) -> Result<i64> {
        let suffix = self.next_suffix;
        let mut fblock = FileBlock::new(self.dir.clone(), self.prefix, suffix);
        fblock.write(mem_block)?;

        self.next_suffix += 1;
        self.ele_count += i64::from(fblock.ele_count());
        self.total_fsize += fblock.file_size();
        self.blocks.push_back(fblock);

        tracing::debug!(suffix, "dumped file block");
        Ok(suffix)
    }

    /// Loads the chain's head block fully into `mem_block` and removes it
    /// from the chain, returning the suffix it was loaded from.
    pub fn load_front(&mut self, mem_block: &mut MemBlock) -> Result<i64> {
        let Some(mut fblock) = self.blocks.pop_front() else {
            return Err(Error::Consistency("load_front called on an empty file chain".to_string()));
        };

        let result = fblock.load(mem_block);
        match result {
            Ok(()) => {
                self.ele_count -= i64::from(fblock.ele_count());
                self.total_fsize -= fblock.file_size();
                let suffix = fblock.suffix();
                mem_block.set_file_block_no(Some(suffix));
                tracing::debug!(suffix, "loaded file block");
                Ok(suffix)
            }
            Err(err) => {
                // Head is already detached; put it back so the chain stays
                // consistent for a retry.
                self.blocks.push_front(fblock);
                Err(err)
            }
        }
    }

    /// Writes `mem_block` as a snapshot-materialized block at a
    /// caller-assigned `suffix` (snapshot suffixes come from a counter the
    /// snapshot layer owns, not this chain's own `next_suffix`). If the
    /// block's content was itself loaded unmodified from an existing
    /// `file_block_<N>` file (`mem_block.file_block_no()`), and that file's
    /// trailing digest still matches the block's current digest, hard-links
    /// to it instead of rewriting the bytes — both chains share the same
    /// directory, so the source path is `file_block_<N>` alongside this
    /// chain's own files. Falls back to a fresh write on any mismatch or
    /// link failure.
    pub fn dump_or_link_at(&mut self, suffix: i64, mem_block: &MemBlock) -> Result<()> {
        if let Some(src_suffix) = mem_block.file_block_no() {
            if self.try_link_from_file_block(suffix, src_suffix, mem_block) {
                return Ok(());
            }
        }

        let mut fblock = FileBlock::new(self.dir.clone(), self.prefix, suffix);
        fblock.write(mem_block)?;
        self.ele_count += i64::from(fblock.ele_count());
        self.total_fsize += fblock.file_size();
        self.next_suffix = self.next_suffix.max(suffix + 1);
        self.blocks.push_back(fblock);
        Ok(())
    }

    fn try_link_from_file_block(&mut self, suffix: i64, src_suffix: i64, mem_block: &MemBlock) -> bool {
        let source_path = self.dir.join(format!("{FILE_BLOCK_PREFIX}_{src_suffix}"));
        let Ok(src_digest) = FileBlock::fetch_digest(&source_path) else { return false };
        let Ok(cur_digest) = mem_block.digest() else { return false };
        if src_digest != cur_digest {
            return false;
        }

        let target_path = self.dir.join(format!("{}_{}", self.prefix, suffix));
        if target_path.exists() && std::fs::remove_file(&target_path).is_err() {
            return false;
        }
        if std::fs::hard_link(&source_path, &target_path).is_err() {
            return false;
        }

        let mut fblock = FileBlock::new(self.dir.clone(), self.prefix, suffix);
        if fblock.load_header().is_err() {
            let _ = std::fs::remove_file(&target_path);
            return false;
        }
        self.ele_count += i64::from(fblock.ele_count());
        self.total_fsize += fblock.file_size();
        self.next_suffix = self.next_suffix.max(suffix + 1);
        self.blocks.push_back(fblock);
        tracing::debug!(suffix, source = %source_path.display(), "hard-linked pop block to file block");
        true
    }

    /// Rebuilds a chain entry for an existing file by suffix, without
    /// loading its data — used when restoring from a snapshot. Blocks must
    /// be added in increasing suffix order.
    pub fn add_block_by_suffix(&mut self, suffix: i64) -> Result<()> {
        let mut fblock = FileBlock::new(self.dir.clone(), self.prefix, suffix);
        fblock.load_header()?;
        self.ele_count += i64::from(fblock.ele_count());
        self.total_fsize += fblock.file_size();
        self.next_suffix = self.next_suffix.max(suffix + 1);
        self.blocks.push_back(fblock);
        Ok(())
    }

    /// Reads the element at `global_idx`, binary-searching the chain for
    /// the file block whose range contains it.
    pub fn at(&mut self, global_idx: i64, buf: &mut [u8]) -> Result<usize> {
        let phys = self.search(global_idx)?;
        self.blocks[phys].at(global_idx, buf)
    }

    /// Finds and removes the chain entry at or after `suffix`, unlinking its
    /// backing file. Used by the unlink job once a diff-retention pass
    /// determines a generation's files are no longer reachable by any live
    /// snapshot.
    pub fn unlink_suffix(&mut self, suffix: i64) -> Result<()> {
        if let Some(pos) = self.blocks.iter().position(|b| suffix_of(b) == suffix) {
            let mut fblock = self.blocks.remove(pos).expect("position just found");
            fblock.file_delete()?;
        } else {
            // The block may have already been evicted from the in-memory
            // chain by a normal load; still attempt to remove its file.
            let path = self.dir.join(format!("{}_{suffix}", self.prefix));
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    /// Clears all bookkeeping without touching files on disk.
    pub fn reset(&mut self) {
        self.blocks.clear();
        self.next_suffix = 0;
        self.ele_count = 0;
        self.total_fsize = 0;
    }

    /// Unlinks every file block's backing file, then resets.
    pub fn destroy_completely(&mut self) -> Result<()> {
        for mut fblock in std::mem::take(&mut self.blocks) {
            fblock.file_delete()?;
        }
        self.reset();
        Ok(())
    }

    /// One-line summary for logging and `debug_info`.
    #[must_use]
    pub fn debug_info(&self) -> String {
        format!(
            "block_num={} ele_count={} total_fsize={} next_suffix={}",
            self.blocks.len(),
            self.ele_count,
            self.total_fsize,
            self.next_suffix
        )
    }

    fn search(&self, global_idx: i64) -> Result<usize> {
        let (mut lo, mut hi) = (0usize, self.blocks.len());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let blk = &self.blocks[mid];
            let start = blk.start_index();
            if global_idx < start {
                hi = mid;
            } else if global_idx >= start + i64::from(blk.ele_count()) {
                lo = mid + 1;
            } else {
                return Ok(mid);
            }
        }
        Err(Error::InvalidArgument(format!("index {global_idx} not found in file chain")))
    }
}

fn suffix_of(block: &FileBlock) -> i64 {
    block.suffix()
}

#[cfg(test)]
mod tests {
    use super::FileChain;
    use crate::file_block::FILE_BLOCK_PREFIX;
    use crate::mem_block::MemBlock;

    fn block_with(start: i64, elems: &[&[u8]]) -> MemBlock {
        let mut b = MemBlock::new(256);
        b.reset(Some(start));
        for (i, e) in elems.iter().enumerate() {
            b.push(start + i as i64, e).unwrap();
        }
        b
    }

    #[test]
    fn dump_then_load_front_roundtrips_in_fifo_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut chain = FileChain::new(dir.path().to_path_buf(), FILE_BLOCK_PREFIX);

        chain.dump(&block_with(0, &[b"a", b"b"])).unwrap();
        chain.dump(&block_with(2, &[b"c"])).unwrap();
        assert_eq!(chain.block_num(), 2);
        assert_eq!(chain.ele_count(), 3);

        let mut scratch = MemBlock::new(256);
        let suffix = chain.load_front(&mut scratch).unwrap();
        assert_eq!(suffix, 0);
        assert_eq!(scratch.at_zero_copy(0).unwrap(), b"a");
        assert_eq!(scratch.at_zero_copy(1).unwrap(), b"b");
        assert_eq!(chain.block_num(), 1);

        let suffix2 = chain.load_front(&mut scratch).unwrap();
        assert_eq!(suffix2, 1);
        assert_eq!(scratch.at_zero_copy(2).unwrap(), b"c");
        assert!(chain.is_empty());
    }

    #[test]
    fn at_resolves_across_multiple_file_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let mut chain = FileChain::new(dir.path().to_path_buf(), FILE_BLOCK_PREFIX);
        chain.dump(&block_with(0, &[b"a", b"bb"])).unwrap();
        chain.dump(&block_with(2, &[b"ccc"])).unwrap();

        let mut buf = [0u8; 16];
        let n = chain.at(1, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"bb");
        let n = chain.at(2, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"ccc");
        assert!(chain.at(3, &mut buf).is_err());
    }

    #[test]
    fn unlink_suffix_removes_entry_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut chain = FileChain::new(dir.path().to_path_buf(), FILE_BLOCK_PREFIX);
        chain.dump(&block_with(0, &[b"a"])).unwrap();
        let path = dir.path().join("file_block_0");
        assert!(path.exists());

        chain.unlink_suffix(0).unwrap();
        assert!(!path.exists());
        assert!(chain.is_empty());
    }

    #[test]
    fn add_block_by_suffix_rebuilds_chain_from_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut chain = FileChain::new(dir.path().to_path_buf(), FILE_BLOCK_PREFIX);
            chain.dump(&block_with(0, &[b"a", b"b"])).unwrap();
            chain.dump(&block_with(2, &[b"c"])).unwrap();
        }

        let mut restored = FileChain::new(dir.path().to_path_buf(), FILE_BLOCK_PREFIX);
        restored.add_block_by_suffix(0).unwrap();
        restored.add_block_by_suffix(1).unwrap();
        assert_eq!(restored.ele_count(), 3);
        assert_eq!(restored.next_suffix(), 2);

        let mut buf = [0u8; 16];
        let n = restored.at(2, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"c");
    }
}
