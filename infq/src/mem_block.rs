//! Fixed-capacity byte arena storing length-prefixed elements.
//!
//! Layout of the data area (`mem`), growing from byte 0 towards `mem_size`:
//!
//! ```text
//! +----------+-----------+----------+-----------+-----
//! | len (4B) | bytes (L) | len (4B) | bytes (L) | ...
//! +----------+-----------+----------+-----------+-----
//!  ^                                             ^
//!  first_offset (oldest live element)            last_offset (next write)
//! ```
//!
//! Each element's end is padded so the next element starts on an 8-byte
//! boundary. The padding rule is intentionally asymmetric between push and
//! pop — see `push` and `pop_zero_copy` below — to keep on-disk byte
//! positions byte-identical to their in-memory counterparts.

use sha1::{Digest, Sha1};

use crate::error::{Error, Result};
use crate::offset_index::OffsetIndex;

/// Rounds `n` up to the next multiple of 8.
const fn round_up_8(n: usize) -> usize {
    (n + 7) & !7
}

/// A fixed-capacity arena of length-prefixed elements with an offset index
/// for O(1) random access and FIFO pop-cursor semantics.
#[derive(Debug, Clone)]
pub struct MemBlock {
    mem: Vec<u8>,
    mem_size: usize,
    start_index: Option<i64>,
    ele_count: i32,
    first_offset: usize,
    last_offset: usize,
    file_block_no: Option<i64>,
    offset_index: OffsetIndex,
}

impl MemBlock {
    /// Creates an empty block with the given capacity, rounded up to a
    /// multiple of 8 bytes.
    #[must_use]
    pub fn new(mem_size: usize) -> Self {
        let mem_size = round_up_8(mem_size.max(8));
        Self {
            mem: vec![0u8; mem_size],
            mem_size,
            start_index: None,
            ele_count: 0,
            first_offset: 0,
            last_offset: 0,
            file_block_no: None,
            offset_index: OffsetIndex::new(),
        }
    }

    /// Block capacity in bytes.
    #[must_use]
    pub const fn mem_size(&self) -> usize {
        self.mem_size
    }

    /// Global ordinal of the first live element, if any has ever been
    /// pushed since the last reset.
    #[must_use]
    pub const fn start_index(&self) -> Option<i64> {
        self.start_index
    }

    /// Number of live elements.
    #[must_use]
    pub const fn ele_count(&self) -> i32 {
        self.ele_count
    }

    /// Byte offset of the oldest live element.
    #[must_use]
    pub const fn first_offset(&self) -> usize {
        self.first_offset
    }

    /// Byte offset one past the newest live element (next write position).
    #[must_use]
    pub const fn last_offset(&self) -> usize {
        self.last_offset
    }

    /// Suffix of the on-disk file block this memory block was loaded from.
    #[must_use]
    pub const fn file_block_no(&self) -> Option<i64> {
        self.file_block_no
    }

    /// Sets the file block suffix this memory block was loaded from.
    pub fn set_file_block_no(&mut self, suffix: Option<i64>) {
        self.file_block_no = suffix;
    }

    /// Raw bytes in `[0, last_offset)` — used when dumping to disk, which
    /// preserves the full written range, not only the live slice.
    #[must_use]
    pub fn dumped_range(&self) -> &[u8] {
        &self.mem[..self.last_offset]
    }

    /// The offset index backing this block.
    #[must_use]
    pub const fn offset_index(&self) -> &OffsetIndex {
        &self.offset_index
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.first_offset >= self.last_offset
    }

    /// Appends `data` as a new element, assigning it global ordinal
    /// `ele_idx` if this is the block's first element since init/reset.
    ///
    /// Fails if `4 + data.len()` exceeds the remaining capacity.
    pub fn push(&mut self, ele_idx: i64, data: &[u8]) -> Result<()> {
        if data.is_empty() || data.len() > self.mem_size - 4 {
            return Err(Error::InvalidArgument(format!(
                "element length {} invalid for block of size {}",
                data.len(),
                self.mem_size
            )));
        }

        let needed = 4 + data.len();
        let avail = self.mem_size - self.last_offset;
        if needed > avail {
            return Err(Error::Capacity(format!(
                "block full: need {needed} bytes, {avail} available"
            )));
        }

        if self.start_index.is_none() {
            self.start_index = Some(ele_idx);
        }

        let off = self.last_offset;
        self.offset_index.push(u32::try_from(off).expect("offset fits in u32"));
        self.mem[off..off + 4].copy_from_slice(&u32::try_from(data.len())
            .expect("element length fits in u32")
            .to_le_bytes());
        self.mem[off + 4..off + 4 + data.len()].copy_from_slice(data);

        let written_to = off + 4 + data.len();
        // Asymmetric padding: rounding up is skipped if it would overrun the
        // block, unlike the unconditional round-up on the pop side below.
        let rounded = round_up_8(written_to);
        self.last_offset = if rounded <= self.mem_size { rounded } else { written_to };
        self.ele_count += 1;
        Ok(())
    }

    /// Returns the element at global ordinal `global_idx` without copying.
    pub fn at_zero_copy(&self, global_idx: i64) -> Result<&[u8]> {
        let start = self
            .start_index
            .ok_or_else(|| Error::InvalidArgument("block has no live elements".to_string()))?;
        let local = global_idx - start;
        if local < 0 || local >= i64::from(self.ele_count) {
            return Err(Error::InvalidArgument(format!(
                "index {global_idx} out of block range [{start}, {})",
                start + i64::from(self.ele_count)
            )));
        }

        let offset = self.offset_index.get(usize::try_from(local).expect("local index is non-negative"))? as usize;
        if offset < self.first_offset || offset >= self.last_offset {
            return Err(Error::Consistency(format!(
                "offset {offset} outside live range [{}, {})",
                self.first_offset, self.last_offset
            )));
        }
        self.read_element_at(offset)
    }

    /// Copying variant of `at_zero_copy`: writes into `buf`, returns the
    /// element length.
    pub fn at(&self, global_idx: i64, buf: &mut [u8]) -> Result<usize> {
        let data = self.at_zero_copy(global_idx)?;
        if data.len() > buf.len() {
            return Err(Error::Capacity(format!(
                "caller buffer of {} bytes too small for element of {} bytes",
                buf.len(),
                data.len()
            )));
        }
        buf[..data.len()].copy_from_slice(data);
        Ok(data.len())
    }

    /// Returns the oldest live element without removing it.
    pub fn top_zero_copy(&self) -> Result<Option<&[u8]>> {
        if self.is_empty() {
            return Ok(None);
        }
        self.read_element_at(self.first_offset).map(Some)
    }

    /// Copying variant of `top_zero_copy`.
    pub fn top(&self, buf: &mut [u8]) -> Result<Option<usize>> {
        match self.top_zero_copy()? {
            None => Ok(None),
            Some(data) => {
                if data.len() > buf.len() {
                    return Err(Error::Capacity(format!(
                        "caller buffer of {} bytes too small for element of {} bytes",
                        buf.len(),
                        data.len()
                    )));
                }
                buf[..data.len()].copy_from_slice(data);
                Ok(Some(data.len()))
            }
        }
    }

    /// Removes and returns the oldest live element along with its global
    /// ordinal, without copying. The third element of the tuple is `true`
    /// when this pop left the block empty, which the owning ring uses to
    /// decide whether to advance past it.
    pub fn pop_zero_copy(&mut self) -> Result<Option<(&[u8], i64, bool)>> {
        if self.is_empty() {
            return Ok(None);
        }

        let offset = self.first_offset;
        let idx = self.start_index.expect("non-empty block has a start index");
        let len = self.element_len_at(offset)?;

        // Unlike push's conditional round-up, the pop-side advance always
        // rounds up to the 8-byte boundary, regardless of mem_size.
        self.first_offset = round_up_8(offset + 4 + len);
        self.ele_count -= 1;
        self.start_index = Some(idx + 1);
        self.offset_index.advance_start()?;

        let now_empty = self.is_empty();
        Ok(Some((&self.mem[offset + 4..offset + 4 + len], idx, now_empty)))
    }

    /// Removes and discards the oldest live element.
    pub fn just_pop(&mut self) -> Result<bool> {
        Ok(self.pop_zero_copy()?.is_some())
    }

    /// Copying variant of `pop_zero_copy`.
    pub fn pop(&mut self, buf: &mut [u8]) -> Result<Option<(usize, i64)>> {
        let offset = self.first_offset;
        if self.is_empty() {
            return Ok(None);
        }
        let len = self.element_len_at(offset)?;
        if len > buf.len() {
            return Err(Error::Capacity(format!(
                "caller buffer of {} bytes too small for element of {len} bytes",
                buf.len()
            )));
        }
        let (data, idx, _) = self.pop_zero_copy()?.expect("checked non-empty above");
        buf[..data.len()].copy_from_slice(data);
        Ok(Some((len, idx)))
    }

    /// Resets the block to empty, assigning it a fresh start index (or
    /// `None` if the next element's index is not yet known, as when the
    /// push ring freezes a block ahead of its next write).
    pub fn reset(&mut self, start_index: Option<i64>) {
        self.first_offset = 0;
        self.last_offset = 0;
        self.ele_count = 0;
        self.file_block_no = None;
        self.start_index = start_index;
        self.offset_index.reset();
    }

    /// Replaces this block's contents with data loaded from a file block:
    /// `data` becomes `[0, data.len())` of the arena, `offsets` (already
    /// absolute within `data`) become the live offset index from position 0,
    /// and `first_offset`/`last_offset` are derived the same way the
    /// original on-disk loader derives them (first offset is the file's
    /// first recorded offset; last offset is the full data length, since the
    /// dumped range always covers `[0, last_offset)`).
    pub fn load_from_file(&mut self, start_index: i64, ele_count: i32, offsets: &[u32], data: &[u8]) -> Result<()> {
        if data.len() > self.mem_size {
            return Err(Error::Capacity(format!(
                "mem block of {} bytes too small to hold {} bytes loaded from file",
                self.mem_size,
                data.len()
            )));
        }

        self.mem[..data.len()].fill(0);
        self.mem[..data.len()].copy_from_slice(data);
        self.start_index = Some(start_index);
        self.ele_count = ele_count;
        self.offset_index.reset();
        for &o in offsets {
            self.offset_index.push(o);
        }
        self.first_offset = offsets.first().copied().unwrap_or(0) as usize;
        self.last_offset = data.len();
        self.file_block_no = None;
        Ok(())
    }

    /// SHA-1 digest over the block's identity coordinates
    /// (`si=..;fo=..;lo=..;ec=..`). Not a content hash: it authenticates
    /// that two blocks claim the same logical range, used to validate
    /// hard-link reuse during snapshot.
    pub fn digest(&self) -> Result<[u8; 20]> {
        let start = self
            .start_index
            .ok_or_else(|| Error::InvalidArgument("digest requires a defined start_index".to_string()))?;
        let sig = format!(
            "si={start};fo={};lo={};ec={}",
            self.first_offset, self.last_offset, self.ele_count
        );
        let mut hasher = Sha1::new();
        hasher.update(sig.as_bytes());
        Ok(hasher.finalize().into())
    }

    /// One-line human-readable summary for logging and stats.
    #[must_use]
    pub fn debug_info(&self) -> String {
        format!(
            "start_index={:?} ele_count={} first_offset={} last_offset={} mem_size={} file_block_no={:?}",
            self.start_index, self.ele_count, self.first_offset, self.last_offset, self.mem_size, self.file_block_no
        )
    }

    fn element_len_at(&self, offset: usize) -> Result<usize> {
        if offset + 4 > self.mem_size {
            return Err(Error::Consistency("element header out of bounds".to_string()));
        }
        let len = u32::from_le_bytes(self.mem[offset..offset + 4].try_into().expect("4-byte slice"));
        let len = len as usize;
        if offset + 4 + len > self.last_offset {
            return Err(Error::Consistency(format!(
                "element at offset {offset} of length {len} overruns last_offset {}",
                self.last_offset
            )));
        }
        Ok(len)
    }

    fn read_element_at(&self, offset: usize) -> Result<&[u8]> {
        let len = self.element_len_at(offset)?;
        Ok(&self.mem[offset + 4..offset + 4 + len])
    }
}

#[cfg(test)]
mod tests {
    use super::{round_up_8, MemBlock};

    #[test]
    fn round_up_8_boundaries() {
        assert_eq!(round_up_8(0), 0);
        assert_eq!(round_up_8(1), 8);
        assert_eq!(round_up_8(8), 8);
        assert_eq!(round_up_8(9), 16);
    }

    #[test]
    fn push_then_pop_preserves_order() {
        let mut blk = MemBlock::new(64);
        blk.push(0, b"a").unwrap();
        blk.push(1, b"bb").unwrap();
        blk.push(2, b"ccc").unwrap();
        assert_eq!(blk.ele_count(), 3);

        let (data, idx, _) = blk.pop_zero_copy().unwrap().unwrap();
        assert_eq!(data, b"a");
        assert_eq!(idx, 0);
        let (data, idx, _) = blk.pop_zero_copy().unwrap().unwrap();
        assert_eq!(data, b"bb");
        assert_eq!(idx, 1);
    }

    #[test]
    fn at_zero_copy_resolves_by_global_index() {
        let mut blk = MemBlock::new(64);
        blk.push(10, b"x").unwrap();
        blk.push(11, b"yy").unwrap();
        assert_eq!(blk.at_zero_copy(10).unwrap(), b"x");
        assert_eq!(blk.at_zero_copy(11).unwrap(), b"yy");
        assert!(blk.at_zero_copy(12).is_err());
        assert!(blk.at_zero_copy(9).is_err());
    }

    #[test]
    fn push_fails_when_block_full() {
        let mut blk = MemBlock::new(16);
        blk.push(0, b"1234").unwrap();
        assert!(blk.push(1, b"1234").is_err());
    }

    #[test]
    fn push_pads_to_8_byte_boundary_when_it_fits() {
        let mut blk = MemBlock::new(64);
        blk.push(0, b"a").unwrap();
        // header(4) + 1 byte = 5, rounds up to 8.
        assert_eq!(blk.last_offset(), 8);
    }

    #[test]
    fn push_skips_padding_when_it_would_overrun_mem_size() {
        // mem_size 16: header(4)+len(9)=13, rounds to 16 which fits exactly.
        // Use a size where the rounded value would exceed mem_size to hit
        // the asymmetric skip-padding branch.
        let mut blk = MemBlock::new(16);
        blk.push(0, b"1234567").unwrap(); // 4 + 7 = 11, round_up_8 -> 16 (fits)
        assert_eq!(blk.last_offset(), 16);

        let mut blk2 = MemBlock::new(13);
        // round_up_8(13) == 16, but mem_size only 13, so rounding is for the
        // write_to position (13) which exceeds mem_size's own rounding base;
        // construct a case where write_to itself fits but its rounded value
        // would not.
        blk2.push(0, b"123").unwrap(); // write_to = 4+3 = 7, rounds to 8 <= 13, rounds
        assert_eq!(blk2.last_offset(), 8);
    }

    #[test]
    fn pop_advance_always_rounds_up_unconditionally() {
        // Build a block whose push path left last_offset unrounded (because
        // rounding would have overrun mem_size), then verify pop still
        // rounds its own cursor up regardless of mem_size.
        let mut blk = MemBlock::new(12);
        blk.push(0, b"1234").unwrap(); // write_to = 4+4=8, rounds to 8 (fits exactly)
        assert_eq!(blk.last_offset(), 8);
        let (data, _, _) = blk.pop_zero_copy().unwrap().unwrap();
        assert_eq!(data, b"1234");
        // first_offset rounds up from 8 to 8 (already aligned); re-push to
        // exercise an unaligned pop advance.
        let mut blk2 = MemBlock::new(24);
        blk2.push(0, b"123").unwrap(); // header 4 + 3 = 7
        blk2.push(1, b"1").unwrap();
        let (_, _, _) = blk2.pop_zero_copy().unwrap().unwrap();
        // first element occupied [0,7), popped cursor rounds to 8 even
        // though 7 itself is not a push-side boundary decision.
        assert_eq!(blk2.first_offset(), 8);
    }

    #[test]
    fn digest_requires_start_index_and_is_deterministic() {
        let mut blk = MemBlock::new(32);
        assert!(blk.digest().is_err());
        blk.push(5, b"hi").unwrap();
        let d1 = blk.digest().unwrap();
        let d2 = blk.digest().unwrap();
        assert_eq!(d1, d2);
    }

    #[test]
    fn reset_clears_state_and_assigns_new_start_index() {
        let mut blk = MemBlock::new(32);
        blk.push(0, b"a").unwrap();
        blk.reset(Some(100));
        assert_eq!(blk.ele_count(), 0);
        assert!(blk.is_empty());
        assert_eq!(blk.start_index(), Some(100));
    }
}
