//! Configuration for opening a queue.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Default capacity of a single memory block, in bytes.
pub const DEFAULT_MEM_BLOCK_SIZE: usize = 4 * 1024 * 1024;
/// Default number of blocks in the push ring.
pub const DEFAULT_PUSHQ_BLOCKS: usize = 4;
/// Default number of blocks in the pop ring.
pub const DEFAULT_POPQ_BLOCKS: usize = 4;
/// Default push-ring usage ratio, beyond which a dump is triggered even
/// while the file chain is empty.
pub const DEFAULT_BLOCK_USAGE_TO_DUMP: f32 = 0.5;

/// Fluent builder for [`InfqConfig`].
///
/// # Example
///
/// ```no_run
/// use infq::InfqConfig;
///
/// let config = InfqConfig::builder()
///     .data_path("/var/lib/myapp/queue")
///     .mem_block_size(8 * 1024 * 1024)
///     .pushq_blocks_num(8)
///     .build()
///     .expect("invalid queue config");
/// ```
#[derive(Debug, Default)]
#[must_use = "an InfqConfigBuilder does nothing until .build() is called"]
pub struct InfqConfigBuilder {
    data_path: Option<PathBuf>,
    name: Option<String>,
    mem_block_size: Option<usize>,
    pushq_blocks_num: Option<usize>,
    popq_blocks_num: Option<usize>,
    block_usage_to_dump: Option<f32>,
}

impl InfqConfigBuilder {
    /// Sets the directory file blocks and snapshot metadata are written
    /// under. Required.
    pub fn data_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_path = Some(path.into());
        self
    }

    /// Sets the queue's name, used as a prefix for its snapshot metadata
    /// file. Defaults to `"infq"`.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the capacity of a single memory block, in bytes (default: 4
    /// MiB). Must be large enough to hold the largest element ever pushed
    /// plus its 4-byte length header.
    pub const fn mem_block_size(mut self, bytes: usize) -> Self {
        self.mem_block_size = Some(bytes);
        self
    }

    /// Sets the number of blocks in the push ring (default: 4). Must be at
    /// least 2.
    pub const fn pushq_blocks_num(mut self, n: usize) -> Self {
        self.pushq_blocks_num = Some(n);
        self
    }

    /// Sets the number of blocks in the pop ring (default: 4). Must be at
    /// least 2.
    pub const fn popq_blocks_num(mut self, n: usize) -> Self {
        self.popq_blocks_num = Some(n);
        self
    }

    /// Sets the push-ring usage ratio (0.0-1.0) beyond which a dump is
    /// triggered even while the file chain is empty (default: 0.5).
    pub const fn block_usage_to_dump(mut self, ratio: f32) -> Self {
        self.block_usage_to_dump = Some(ratio);
        self
    }

    /// Validates the configuration and produces an [`InfqConfig`].
    pub fn build(self) -> Result<InfqConfig> {
        let data_path = self.data_path.ok_or_else(|| Error::InvalidArgument("data_path is required".to_string()))?;
        let name = self.name.unwrap_or_else(|| "infq".to_string());
        let mem_block_size = self.mem_block_size.unwrap_or(DEFAULT_MEM_BLOCK_SIZE);
        let pushq_blocks_num = self.pushq_blocks_num.unwrap_or(DEFAULT_PUSHQ_BLOCKS);
        let popq_blocks_num = self.popq_blocks_num.unwrap_or(DEFAULT_POPQ_BLOCKS);
        let block_usage_to_dump = self.block_usage_to_dump.unwrap_or(DEFAULT_BLOCK_USAGE_TO_DUMP);

        if mem_block_size < 64 {
            return Err(Error::InvalidArgument(format!("mem_block_size of {mem_block_size} bytes is too small")));
        }
        if pushq_blocks_num < 2 {
            return Err(Error::InvalidArgument("pushq_blocks_num must be at least 2".to_string()));
        }
        if popq_blocks_num < 2 {
            return Err(Error::InvalidArgument("popq_blocks_num must be at least 2".to_string()));
        }
        if !(0.0..=1.0).contains(&block_usage_to_dump) {
            return Err(Error::InvalidArgument(format!("block_usage_to_dump of {block_usage_to_dump} must be in [0.0, 1.0]")));
        }

        Ok(InfqConfig { data_path, name, mem_block_size, pushq_blocks_num, popq_blocks_num, block_usage_to_dump })
    }
}

/// Validated configuration for opening a queue.
#[derive(Debug, Clone)]
pub struct InfqConfig {
    pub(crate) data_path: PathBuf,
    pub(crate) name: String,
    pub(crate) mem_block_size: usize,
    pub(crate) pushq_blocks_num: usize,
    pub(crate) popq_blocks_num: usize,
    pub(crate) block_usage_to_dump: f32,
}

impl InfqConfig {
    /// Starts a new builder.
    #[must_use]
    pub fn builder() -> InfqConfigBuilder {
        InfqConfigBuilder::default()
    }

    /// The directory this queue's data lives under.
    #[must_use]
    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    /// The queue's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::InfqConfig;

    #[test]
    fn build_requires_data_path() {
        assert!(InfqConfig::builder().build().is_err());
    }

    #[test]
    fn build_applies_defaults() {
        let config = InfqConfig::builder().data_path("/tmp/q").build().unwrap();
        assert_eq!(config.mem_block_size, super::DEFAULT_MEM_BLOCK_SIZE);
        assert_eq!(config.pushq_blocks_num, super::DEFAULT_PUSHQ_BLOCKS);
        assert_eq!(config.name(), "infq");
    }

    #[test]
    fn build_rejects_too_few_blocks() {
        let err = InfqConfig::builder().data_path("/tmp/q").pushq_blocks_num(1).build();
        assert!(err.is_err());
    }

    #[test]
    fn build_rejects_out_of_range_dump_ratio() {
        let err = InfqConfig::builder().data_path("/tmp/q").block_usage_to_dump(1.5).build();
        assert!(err.is_err());
    }
}
