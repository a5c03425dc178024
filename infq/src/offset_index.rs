//! Per-block mapping from element ordinal to byte offset within the block's
//! data area.
//!
//! A growable array of offsets with a logical start cursor: entries before
//! `start` have already been popped and are no longer addressable. Visible
//! size is `len() - start`. The backing `Vec` grows on demand, which
//! subsumes the original's manual doubling-on-overflow reallocation.

use crate::error::{Error, Result};

/// Growable offset array with a pop-side start cursor.
#[derive(Debug, Default, Clone)]
pub struct OffsetIndex {
    offsets: Vec<u32>,
    start: usize,
}

impl OffsetIndex {
    /// Creates an empty offset index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an offset.
    pub fn push(&mut self, offset: u32) {
        self.offsets.push(offset);
    }

    /// Returns the offset at logical position `idx`, i.e. `start + idx`.
    pub fn get(&self, idx: usize) -> Result<u32> {
        if idx >= self.visible_size() {
            return Err(Error::InvalidArgument(format!(
                "offset index out of range: {idx} >= {}",
                self.visible_size()
            )));
        }
        Ok(self.offsets[self.start + idx])
    }

    /// Advances the start cursor past the first live entry.
    pub fn advance_start(&mut self) -> Result<()> {
        if self.start >= self.offsets.len() {
            return Err(Error::Consistency(
                "advance_start called on an empty offset index".to_string(),
            ));
        }
        self.start += 1;
        Ok(())
    }

    /// Number of live (not-yet-popped) entries.
    #[must_use]
    pub fn visible_size(&self) -> usize {
        self.offsets.len() - self.start
    }

    /// Copies the live slice into `dst`, resetting `dst`'s start cursor to 0.
    pub fn clone_into(&self, dst: &mut Self) {
        dst.offsets.clear();
        dst.offsets.extend_from_slice(&self.offsets[self.start..]);
        dst.start = 0;
    }

    /// Returns the live entries as a slice, for bulk serialization.
    #[must_use]
    pub fn live_slice(&self) -> &[u32] {
        &self.offsets[self.start..]
    }

    /// Zeroes both cursors, discarding all entries.
    pub fn reset(&mut self) {
        self.offsets.clear();
        self.start = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::OffsetIndex;

    #[test]
    fn push_and_get_roundtrip() {
        let mut idx = OffsetIndex::new();
        idx.push(0);
        idx.push(12);
        idx.push(28);
        assert_eq!(idx.visible_size(), 3);
        assert_eq!(idx.get(0).unwrap(), 0);
        assert_eq!(idx.get(2).unwrap(), 28);
        assert!(idx.get(3).is_err());
    }

    #[test]
    fn advance_start_shrinks_visible_size_without_shifting_offsets() {
        let mut idx = OffsetIndex::new();
        idx.push(0);
        idx.push(12);
        idx.advance_start().unwrap();
        assert_eq!(idx.visible_size(), 1);
        assert_eq!(idx.get(0).unwrap(), 12);
    }

    #[test]
    fn advance_start_on_empty_fails() {
        let mut idx = OffsetIndex::new();
        assert!(idx.advance_start().is_err());
    }

    #[test]
    fn clone_into_copies_only_live_slice_and_resets_start() {
        let mut src = OffsetIndex::new();
        src.push(0);
        src.push(12);
        src.push(28);
        src.advance_start().unwrap();

        let mut dst = OffsetIndex::new();
        dst.push(999);
        src.clone_into(&mut dst);

        assert_eq!(dst.visible_size(), 2);
        assert_eq!(dst.get(0).unwrap(), 12);
        assert_eq!(dst.get(1).unwrap(), 28);
    }

    #[test]
    fn reset_clears_everything() {
        let mut idx = OffsetIndex::new();
        idx.push(0);
        idx.advance_start().unwrap();
        idx.reset();
        assert_eq!(idx.visible_size(), 0);
        idx.push(5);
        assert_eq!(idx.get(0).unwrap(), 5);
    }
}
