//! Error types for infq operations.

/// Alias for `Result<T, infq::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by InfQ operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A null handle, out-of-range index, or oversized name/path was passed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The push ring is full, no free block is available to load into, or a
    /// caller-supplied buffer is too small for a copying read.
    #[error("capacity exceeded: {0}")]
    Capacity(String),

    /// The requested element currently resides only in the file chain; the
    /// loader has not yet brought it into the pop ring. Callers retry.
    #[error("not ready: data resides in the file chain, retry after load completes")]
    NotReady,

    /// An I/O error: open/read/write/unlink/link/fsync/fstat failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A file block's header failed to parse: bad magic or version.
    #[error("format error: {0}")]
    Format(String),

    /// An internal invariant was violated (block/ring accounting, digest
    /// mismatch on hard-link reuse). In debug builds these also trip a
    /// `debug_assert!` at the call site before this error is constructed.
    #[error("consistency violation: {0}")]
    Consistency(String),
}
