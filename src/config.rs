use std::thread::available_parallelism;

/// Which concrete [`crate::BlockReader`] backs a pipeline.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum ReaderKind {
    /// Background-prefetching streaming reader (C2).
    Streaming,
    /// Each block mapped and unmapped on demand (C3).
    Map,
    /// The whole file mapped once at construction (C3).
    MapAll,
}

/// Construction-time configuration, mirroring the enumeration in
/// spec.md §6 and the defaults from `original_source/file_signature/
/// main.cpp`.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub reader: ReaderKind,
    pub chunk_size: u32,
    pub worker_count: usize,
    /// Streaming reader only: number of pooled buffers. Typically
    /// `2 * worker_count` (one in flight, one prefetched per worker).
    pub cached_chunks_count: usize,
}

impl PipelineConfig {
    pub const DEFAULT_CHUNK_SIZE: u32 = 1024 * 1024;

    pub fn new(reader: ReaderKind) -> Self {
        let worker_count = worker_count_for(reader);
        Self {
            reader,
            chunk_size: Self::DEFAULT_CHUNK_SIZE,
            worker_count,
            cached_chunks_count: worker_count * 2,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: u32) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count.max(1);
        self.cached_chunks_count = self.worker_count * 2;
        self
    }
}

/// Recommended worker count for a reader kind (spec.md §4.5): one per CPU
/// for the streaming reader (readers rarely block beyond the buffer
/// pool), roughly 3x CPU count for mmap readers to overlap page-fault
/// stalls inherent to on-demand paging.
pub fn worker_count_for(reader: ReaderKind) -> usize {
    let cpus = available_parallelism().map(|v| v.get()).unwrap_or(1);
    match reader {
        ReaderKind::Streaming => cpus,
        ReaderKind::Map | ReaderKind::MapAll => cpus.saturating_mul(3),
    }
}
