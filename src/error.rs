use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, FilesigError>;

/// Everything that can go wrong while building or driving a signature
/// pipeline. Cancellation is *not* an error - it surfaces as
/// [`crate::WaitResult::Canceled`] instead.
#[derive(Error, Debug)]
pub enum FilesigError {
    #[error("cannot open {path:?}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("memory mapping failed: {0}")]
    Mmap(std::io::Error),

    #[error("block offset {offset} / size {size} is not page-aligned, required by per-block mmap reader")]
    UnalignedBlock { offset: u64, size: u32 },

    #[error("file is larger than this build can address ({size} bytes)")]
    FileTooLarge { size: u64 },

    #[error("pushed a record after the aggregator was frozen")]
    PushAfterFreeze,

    #[error("released a buffer the reader never handed out")]
    UnknownBufferRelease,
}
