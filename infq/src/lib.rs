//! An unbounded FIFO queue backed by memory and disk.
//!
//! Elements flow through three tiers: a push ring held entirely in memory,
//! a file chain on disk for overflow, and a pop ring that stages data back
//! into memory for consumption. Under light load, full push-ring blocks
//! swap directly into the pop ring without ever touching disk; under
//! sustained load, background workers spill push-ring blocks to the file
//! chain and reload file-chain blocks into the pop ring as the consumer
//! drains it. The result behaves like an ordinary FIFO to callers, bounded
//! only by disk space, while keeping hot data in memory.
//!
//! ```no_run
//! use infq::{InfQ, InfqConfig};
//!
//! let config = InfqConfig::builder().data_path("/var/lib/myapp/queue").build()?;
//! let q = InfQ::open(config)?;
//! q.push(b"hello")?;
//! let mut buf = [0u8; 64];
//! let (len, idx) = q.pop(&mut buf)?.expect("just pushed");
//! assert_eq!(&buf[..len], b"hello");
//! assert_eq!(idx, 0);
//! # Ok::<(), infq::Error>(())
//! ```

mod bg_exec;
mod config;
mod error;
mod file_block;
mod file_chain;
mod mem_block;
mod mem_ring;
mod offset_index;
mod queue;
mod snapshot;

pub use config::{InfqConfig, InfqConfigBuilder};
pub use error::{Error, Result};
pub use queue::{ExecutorKind, ExecutorStats, InfQ, InfqStats};
pub use snapshot::{DumpMeta, FileDumpMeta, PopqDumpMeta};
