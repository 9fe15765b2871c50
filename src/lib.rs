//! Parallel content-signature pipeline: partitions a file into fixed-size
//! blocks, hashes each block independently across a worker pool, and
//! reassembles the hashes back into strict file order.

mod aggregator;
mod block;
mod config;
mod error;
mod hash;
mod pipeline;
mod reader;
mod record;

pub use aggregator::{OrderedAggregator, WaitResult};
pub use block::{BlockHandle, BlockReader};
pub use config::{worker_count_for, PipelineConfig, ReaderKind};
pub use error::{FilesigError, Result};
pub use hash::{Crc32Hasher, Hasher, Sha256Hasher};
pub use pipeline::Pipeline;
pub use reader::{MmapReader, StreamingReader};
pub use record::{Digest, Record};
