mod mmap;
mod streaming;

pub use mmap::MmapReader;
pub use streaming::StreamingReader;
