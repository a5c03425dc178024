//! One file on disk encoding a memory block's live data plus a header and a
//! trailing content digest.
//!
//! On-disk layout:
//!
//! ```text
//! +------------------------------------+
//! | magic  "INFQUEUE"           8 B    |
//! | version "v0.1.0"            8 B    |
//! | start_index (i64 LE)        8 B    |
//! | element_count (i64 LE)      8 B    |
//! | offset[0..n] (u32 LE each)  4n B   |
//! | data area (raw bytes)              |
//! | digest (20 B)                      |
//! +------------------------------------+
//! ```
//!
//! Per `mem_block`'s dump policy, the data area is the block's full `[0,
//! last_offset)` range, not only the live slice — this keeps on-disk offsets
//! byte-identical to their in-memory counterparts.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::mem_block::MemBlock;

/// 8-byte magic stamped at the start of every file block.
pub const MAGIC: &[u8; 8] = b"INFQUEUE";
/// 8-byte, NUL-padded version stamped after the magic.
pub const VERSION: &[u8; 8] = b"v0.1.0\0\0";
/// Length in bytes of the trailing content digest.
pub const DIGEST_LEN: usize = 20;
/// `magic(8) + version(8) + start_index(8) + element_count(8)`.
const META_LEN: u64 = 32;
/// Chunk size for positional reads/writes, matching the original's
/// `INFQ_IO_BUF_UNIT`.
const IO_CHUNK: usize = 4096;

/// Prefix for file-chain entries.
pub const FILE_BLOCK_PREFIX: &str = "file_block";
/// Prefix for snapshot-materialized pop-ring blocks.
pub const POP_BLOCK_PREFIX: &str = "pop_block";

/// A file block: either freshly written by a dump, or opened (lazily) to
/// read a previously-written one back.
#[derive(Debug)]
pub struct FileBlock {
    dir: PathBuf,
    prefix: &'static str,
    suffix: i64,
    file: Option<File>,
    file_size: u64,
    start_index: i64,
    ele_count: i32,
    offsets: Vec<u32>,
    digest: [u8; DIGEST_LEN],
}

fn pwrite_chunked(file: &File, data: &[u8], mut offset: u64) -> std::io::Result<()> {
    for chunk in data.chunks(IO_CHUNK) {
        file.write_all_at(chunk, offset)?;
        offset += chunk.len() as u64;
    }
    Ok(())
}

fn pread_chunked(file: &File, buf: &mut [u8], mut offset: u64) -> std::io::Result<()> {
    for chunk in buf.chunks_mut(IO_CHUNK) {
        file.read_exact_at(chunk, offset)?;
        offset += chunk.len() as u64;
    }
    Ok(())
}

impl FileBlock {
    /// Creates an unopened handle for `<dir>/<prefix>_<suffix>`.
    #[must_use]
    pub fn new(dir: PathBuf, prefix: &'static str, suffix: i64) -> Self {
        Self {
            dir,
            prefix,
            suffix,
            file: None,
            file_size: 0,
            start_index: 0,
            ele_count: 0,
            offsets: Vec::new(),
            digest: [0u8; DIGEST_LEN],
        }
    }

    /// Suffix of this file block's name.
    #[must_use]
    pub const fn suffix(&self) -> i64 {
        self.suffix
    }

    /// `start_index` recorded in the header (valid after `write`/`load_header`).
    #[must_use]
    pub const fn start_index(&self) -> i64 {
        self.start_index
    }

    /// Element count recorded in the header.
    #[must_use]
    pub const fn ele_count(&self) -> i32 {
        self.ele_count
    }

    /// Total file size in bytes.
    #[must_use]
    pub const fn file_size(&self) -> u64 {
        self.file_size
    }

    fn path(&self) -> PathBuf {
        self.dir.join(format!("{}_{}", self.prefix, self.suffix))
    }

    fn header_len(&self) -> u64 {
        META_LEN + self.offsets.len() as u64 * 4
    }

    /// Writes `mem_block` to a fresh file at this handle's path, truncating
    /// any existing file. On any I/O failure the partial file is unlinked.
    pub fn write(&mut self, mem_block: &MemBlock) -> Result<()> {
        let digest = mem_block.digest()?;
        let path = self.path();

        let result = (|| -> Result<()> {
            let file = OpenOptions::new().create(true).write(true).truncate(true).open(&path)?;

            let mut meta = [0u8; META_LEN as usize];
            meta[0..8].copy_from_slice(MAGIC);
            meta[8..16].copy_from_slice(VERSION);
            meta[16..24].copy_from_slice(&mem_block.start_index().unwrap_or(0).to_le_bytes());
            let ele_count = mem_block.ele_count();
            meta[24..32].copy_from_slice(&i64::from(ele_count).to_le_bytes());
            pwrite_chunked(&file, &meta, 0)?;

            let offsets = mem_block.offset_index().live_slice();
            let mut offset_bytes = Vec::with_capacity(offsets.len() * 4);
            for o in offsets {
                offset_bytes.extend_from_slice(&o.to_le_bytes());
            }
            pwrite_chunked(&file, &offset_bytes, META_LEN)?;

            let data = mem_block.dumped_range();
            pwrite_chunked(&file, data, META_LEN + offset_bytes.len() as u64)?;
            pwrite_chunked(&file, &digest, META_LEN + offset_bytes.len() as u64 + data.len() as u64)?;

            self.file_size = META_LEN + offset_bytes.len() as u64 + data.len() as u64 + DIGEST_LEN as u64;
            self.start_index = mem_block.start_index().unwrap_or(0);
            self.ele_count = ele_count;
            self.offsets = offsets.to_vec();
            self.digest = digest;
            self.file = Some(file);
            Ok(())
        })();

        if let Err(err) = result {
            tracing::error!(path = %path.display(), %err, "failed to write file block, removing partial file");
            self.file = None;
            let _ = std::fs::remove_file(&path);
            return Err(err);
        }

        Ok(())
    }

    fn ensure_open_read(&mut self) -> Result<&File> {
        if self.file.is_none() {
            let file = File::open(self.path())?;
            self.file = Some(file);
        }
        Ok(self.file.as_ref().expect("file just opened"))
    }

    /// Loads the header (magic, version, start index, element count, offset
    /// array) without reading the data area. Idempotent: a no-op if the
    /// offsets are already populated.
    pub fn load_header(&mut self) -> Result<()> {
        if !self.offsets.is_empty() {
            return Ok(());
        }

        let path = self.path();
        let file = self.ensure_open_read()?;
        self.file_size = file.metadata()?.len();

        let mut meta = [0u8; META_LEN as usize];
        file.read_exact_at(&mut meta, 0)?;
        if &meta[0..8] != MAGIC {
            return Err(Error::Format(format!("bad magic in file block {}", path.display())));
        }
        self.start_index = i64::from_le_bytes(meta[16..24].try_into().expect("8-byte slice"));
        self.ele_count = i64::from_le_bytes(meta[24..32].try_into().expect("8-byte slice")) as i32;

        let mut buf = vec![0u8; self.ele_count as usize * 4];
        pread_chunked(file, &mut buf, META_LEN)?;
        self.offsets = buf.chunks_exact(4).map(|c| u32::from_le_bytes(c.try_into().expect("4-byte slice"))).collect();

        tracing::debug!(
            path = %path.display(),
            start_index = self.start_index,
            ele_count = self.ele_count,
            "loaded file block header"
        );
        Ok(())
    }

    /// Loads header (if needed) and data area fully into `mem_block`,
    /// replacing its contents. `mem_block.file_block_no` is left untouched;
    /// callers set it from `self.suffix()`.
    pub fn load(&mut self, mem_block: &mut MemBlock) -> Result<()> {
        self.load_header()?;

        let header_len = self.header_len();
        let total_size = self.file_size - header_len - DIGEST_LEN as u64;
        if mem_block.mem_size() < total_size as usize {
            return Err(Error::Capacity(format!(
                "mem block of {} bytes too small for file block data of {total_size} bytes",
                mem_block.mem_size()
            )));
        }

        let mut data = vec![0u8; total_size as usize];
        let file = self.ensure_open_read()?;
        pread_chunked(file, &mut data, header_len)?;
        file.read_exact_at(&mut self.digest, header_len + total_size)?;

        mem_block.load_from_file(self.start_index, self.ele_count, &self.offsets, &data)?;
        Ok(())
    }

    /// Resolves `global_idx` to an offset and reads just that element into
    /// `buf`, without materializing the whole block.
    pub fn at(&mut self, global_idx: i64, buf: &mut [u8]) -> Result<usize> {
        self.load_header()?;

        let local = global_idx - self.start_index;
        if local < 0 || local >= i64::from(self.ele_count) {
            return Err(Error::InvalidArgument(format!(
                "index {global_idx} out of file block range [{}, {})",
                self.start_index,
                self.start_index + i64::from(self.ele_count)
            )));
        }

        let offset = u64::from(self.offsets[usize::try_from(local).expect("non-negative")]);
        let header_len = self.header_len();
        let file = self.ensure_open_read()?;

        let mut len_bytes = [0u8; 4];
        file.read_exact_at(&mut len_bytes, header_len + offset)?;
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > buf.len() {
            return Err(Error::Capacity(format!("caller buffer of {} bytes too small for element of {len} bytes", buf.len())));
        }
        file.read_exact_at(&mut buf[..len], header_len + offset + 4)?;
        Ok(len)
    }

    /// The content digest read from (or written to) this file's trailer.
    #[must_use]
    pub const fn digest(&self) -> [u8; DIGEST_LEN] {
        self.digest
    }

    /// Reads just the trailing digest of the file at `path`, without
    /// loading the header or data.
    pub fn fetch_digest(path: &Path) -> Result<[u8; DIGEST_LEN]> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        if size < DIGEST_LEN as u64 {
            return Err(Error::Format(format!("file {} too small to hold a digest", path.display())));
        }
        let mut digest = [0u8; DIGEST_LEN];
        file.read_exact_at(&mut digest, size - DIGEST_LEN as u64)?;
        Ok(digest)
    }

    /// Fsyncs the underlying file descriptor.
    pub fn sync(&self) -> Result<()> {
        match &self.file {
            Some(f) => {
                f.sync_all()?;
                Ok(())
            }
            None => Err(Error::Consistency("sync called on a file block with no open handle".to_string())),
        }
    }

    /// Closes the handle (if open) and unlinks the backing file.
    pub fn file_delete(&mut self) -> Result<()> {
        self.file = None;
        std::fs::remove_file(self.path())?;
        Ok(())
    }

    /// One-line summary for logging and `debug_info`.
    #[must_use]
    pub fn debug_info(&self) -> String {
        format!(
            "start_index={} suffix={} ele_count={} prefix={} file_size={}",
            self.start_index, self.suffix, self.ele_count, self.prefix, self.file_size
        )
    }
}

#[cfg(test)]
mod tests {
    use super::{FileBlock, FILE_BLOCK_PREFIX};
    use crate::mem_block::MemBlock;

    #[test]
    fn write_then_load_roundtrips_data_and_header() {
        let dir = tempfile::tempdir().unwrap();
        let mut blk = MemBlock::new(256);
        blk.push(10, b"hello").unwrap();
        blk.push(11, b"world!!").unwrap();

        let mut fblock = FileBlock::new(dir.path().to_path_buf(), FILE_BLOCK_PREFIX, 0);
        fblock.write(&blk).unwrap();
        assert_eq!(fblock.start_index(), 10);
        assert_eq!(fblock.ele_count(), 2);

        let mut loaded = MemBlock::new(256);
        fblock.load(&mut loaded).unwrap();
        assert_eq!(loaded.start_index(), Some(10));
        assert_eq!(loaded.ele_count(), 2);
        assert_eq!(loaded.at_zero_copy(10).unwrap(), b"hello");
        assert_eq!(loaded.at_zero_copy(11).unwrap(), b"world!!");
    }

    #[test]
    fn at_reads_single_element_without_loading_whole_block() {
        let dir = tempfile::tempdir().unwrap();
        let mut blk = MemBlock::new(256);
        blk.push(0, b"a").unwrap();
        blk.push(1, b"bb").unwrap();
        blk.push(2, b"ccc").unwrap();

        let mut fblock = FileBlock::new(dir.path().to_path_buf(), FILE_BLOCK_PREFIX, 7);
        fblock.write(&blk).unwrap();

        let mut buf = [0u8; 16];
        let n = fblock.at(1, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"bb");
        assert!(fblock.at(3, &mut buf).is_err());
    }

    #[test]
    fn load_header_rejects_bad_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file_block_0");
        std::fs::write(&path, b"NOTINFQ!garbage bytes here").unwrap();

        let mut fblock = FileBlock::new(dir.path().to_path_buf(), FILE_BLOCK_PREFIX, 0);
        assert!(fblock.load_header().is_err());
    }

    #[test]
    fn write_failure_unlinks_partial_file() {
        // A block with no start_index (never pushed) has no digest, so
        // write() fails before creating content but must not leave a file.
        let dir = tempfile::tempdir().unwrap();
        let blk = MemBlock::new(64);
        let mut fblock = FileBlock::new(dir.path().to_path_buf(), FILE_BLOCK_PREFIX, 0);
        assert!(fblock.write(&blk).is_err());
        assert!(!dir.path().join("file_block_0").exists());
    }

    #[test]
    fn digest_matches_between_write_and_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let mut blk = MemBlock::new(64);
        blk.push(0, b"x").unwrap();
        let digest = blk.digest().unwrap();

        let mut fblock = FileBlock::new(dir.path().to_path_buf(), FILE_BLOCK_PREFIX, 3);
        fblock.write(&blk).unwrap();
        let path = dir.path().join("file_block_3");
        let fetched = FileBlock::fetch_digest(&path).unwrap();
        assert_eq!(fetched, digest);
    }
}
