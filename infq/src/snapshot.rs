//! Snapshot metadata: the double-buffered structure describing a persisted
//! snapshot, and its wire serialization.
//!
//! Two generations of [`DumpMeta`] are kept so that a previously taken
//! snapshot remains restorable until the caller confirms a newer one via
//! `done_dump`. Unlike the original, which places both generations in
//! `mmap(MAP_ANON|MAP_SHARED)` so a forked child can read them without
//! coordination, this crate has no equivalent of `fork()` in its API surface
//! — `InfQ::fetch_dump_meta` is the portable substitute: a caller that is
//! about to fork reads the active generation through it first.

use std::ops::Range;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// 8-byte magic stamped at the start of a serialized snapshot buffer.
pub const MAGIC: &[u8; 8] = b"INFQUEUE";
/// 8-byte, NUL-padded version stamped after the magic.
pub const VERSION: &[u8; 8] = b"v0.1.0\0\0";

/// File-range portion of [`FileDumpMeta`]/[`PopqDumpMeta`]: metadata about
/// the file chain at snapshot time.
#[derive(Debug, Clone, Default)]
pub struct FileDumpMeta {
    /// Half-open suffix range `[start, end)` of file-chain entries.
    pub file_range: Range<i64>,
    /// Live element count across that range.
    pub ele_count: i64,
    /// Number of file blocks in that range.
    pub block_num: i64,
    /// Total bytes occupied by those files.
    pub file_size: u64,
}

/// Metadata about the pop ring's on-disk materialization (`pop_block_<N>`
/// files) at snapshot time.
#[derive(Debug, Clone, Default)]
pub struct PopqDumpMeta {
    /// Half-open suffix range `[start, end)` of `pop_block_<N>` files.
    pub file_range: Range<i64>,
    /// Global index of the oldest element captured.
    pub min_idx: i64,
    /// Global index one past the newest element captured.
    pub max_idx: i64,
    /// Live element count.
    pub ele_count: i64,
    /// Number of blocks the pop ring had at snapshot time.
    pub block_num: usize,
    /// Capacity of each pop-ring block at snapshot time.
    pub block_size: usize,
}

/// One generation of persisted snapshot metadata.
#[derive(Debug, Clone, Default)]
pub struct DumpMeta {
    /// Directory the file blocks live under.
    pub file_path: PathBuf,
    /// Name of the queue that produced this snapshot.
    pub infq_name: String,
    /// Next global element index to be assigned, at snapshot time.
    pub global_ele_idx: i64,
    /// File chain metadata.
    pub file_meta: FileDumpMeta,
    /// Pop-ring materialization metadata.
    pub popq_meta: PopqDumpMeta,
}

impl DumpMeta {
    /// Serializes this generation into the wire format: magic, version,
    /// fixed-width fields, then the NUL-terminated path and name.
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(128 + self.file_path.as_os_str().len() + self.infq_name.len());
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(VERSION);

        let mut push_i64 = |v: i64| buf.extend_from_slice(&v.to_le_bytes());
        push_i64(self.global_ele_idx);
        push_i64(self.file_meta.file_range.start);
        push_i64(self.file_meta.file_range.end);
        push_i64(self.file_meta.ele_count);
        push_i64(self.file_meta.block_num);
        push_i64(i64::try_from(self.file_meta.file_size).unwrap_or(i64::MAX));
        push_i64(self.popq_meta.file_range.start);
        push_i64(self.popq_meta.file_range.end);
        push_i64(self.popq_meta.min_idx);
        push_i64(self.popq_meta.max_idx);
        push_i64(self.popq_meta.ele_count);
        push_i64(i64::try_from(self.popq_meta.block_num).unwrap_or(i64::MAX));
        push_i64(i64::try_from(self.popq_meta.block_size).unwrap_or(i64::MAX));

        buf.extend_from_slice(self.file_path.to_string_lossy().as_bytes());
        buf.push(0);
        buf.extend_from_slice(self.infq_name.as_bytes());
        buf.push(0);
        buf
    }

    /// Parses a buffer produced by [`DumpMeta::serialize`].
    pub fn deserialize(buf: &[u8]) -> Result<Self> {
        const FIXED_LEN: usize = 13 * 8;
        if buf.len() < 16 + FIXED_LEN {
            return Err(Error::Format("snapshot buffer too small for header".to_string()));
        }
        if &buf[0..8] != MAGIC {
            return Err(Error::Format("snapshot buffer has bad magic".to_string()));
        }
        if &buf[8..16] != VERSION {
            tracing::debug!("snapshot buffer has an unexpected version tag");
        }

        let mut cursor = 16;
        let mut read_i64 = || {
            let v = i64::from_le_bytes(buf[cursor..cursor + 8].try_into().expect("8-byte slice"));
            cursor += 8;
            v
        };

        let global_ele_idx = read_i64();
        let file_range = read_i64()..read_i64();
        let file_ele_count = read_i64();
        let file_block_num = read_i64();
        let file_size = u64::try_from(read_i64()).unwrap_or(0);
        let popq_range = read_i64()..read_i64();
        let popq_min = read_i64();
        let popq_max = read_i64();
        let popq_ele_count = read_i64();
        let popq_block_num = usize::try_from(read_i64()).unwrap_or(0);
        let popq_block_size = usize::try_from(read_i64()).unwrap_or(0);

        let rest = &buf[cursor..];
        let path_end = rest.iter().position(|&b| b == 0).ok_or_else(|| Error::Format("snapshot buffer missing path terminator".to_string()))?;
        let file_path = PathBuf::from(String::from_utf8_lossy(&rest[..path_end]).into_owned());
        let name_start = path_end + 1;
        let name_rest = &rest[name_start..];
        let name_end = name_rest.iter().position(|&b| b == 0).ok_or_else(|| Error::Format("snapshot buffer missing name terminator".to_string()))?;
        let infq_name = String::from_utf8_lossy(&name_rest[..name_end]).into_owned();

        Ok(Self {
            file_path,
            infq_name,
            global_ele_idx,
            file_meta: FileDumpMeta { file_range, ele_count: file_ele_count, block_num: file_block_num, file_size },
            popq_meta: PopqDumpMeta {
                file_range: popq_range,
                min_idx: popq_min,
                max_idx: popq_max,
                ele_count: popq_ele_count,
                block_num: popq_block_num,
                block_size: popq_block_size,
            },
        })
    }
}

/// Computes the suffix range exclusively owned by `old` relative to `new`:
/// `[old.start, min(new.start, old.end))`. Used by `done_dump` to find
/// files from the outgoing generation no longer reachable by the incoming
/// one. An empty `new` range means every file in `old` can go; an empty
/// `old` range means there is nothing to remove.
#[must_use]
pub fn files_exclusive_to(old: &Range<i64>, new: &Range<i64>) -> Range<i64> {
    if new.is_empty() {
        return old.clone();
    }
    if old.is_empty() {
        return 0..0;
    }
    old.start..new.start.min(old.end)
}

/// Directory-qualified path a file block or pop block lives at.
#[must_use]
pub fn block_path(dir: &Path, prefix: &str, suffix: i64) -> PathBuf {
    dir.join(format!("{prefix}_{suffix}"))
}
