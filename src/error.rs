use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds produced by the core engine.
///
/// Every fallible core operation ultimately surfaces one of these. Most
/// read/set operations are total; I/O failures observed by the
/// [`crate::page::PageManager`] only become visible to callers through the
/// future returned by `commit` (spec §7).
#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid page file magic")]
    InvalidMagic,

    #[error("unsupported page size: {0}")]
    UnsupportedPageSize(u64),

    #[error("page address {0} out of range")]
    PageAddressOutOfRange(u32),

    #[error("operation attempted on a disposed batch")]
    BatchClosed,

    #[error("a write batch is already open on this database")]
    ConcurrentWriteBatch,

    #[error("no historical root matches the requested state hash")]
    UnknownStateHash,

    #[error("bump allocator reached the end of the file")]
    StorageExhausted,

    #[error("internal invariant violated: {0}")]
    InvariantViolated(&'static str),

    #[error("finalization failed: {0}")]
    FinalizerFailed(String),
}
