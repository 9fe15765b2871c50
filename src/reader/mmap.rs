use std::collections::HashMap;
use std::fs::File;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use memmap2::{Mmap, MmapOptions};
use parking_lot::Mutex;

use crate::block::{BlockHandle, BlockReader};
use crate::error::{FilesigError, Result};

/// Conservative common-denominator page size across the platforms this
/// crate targets (x86_64/aarch64 Linux, macOS, Windows all use 4 KiB
/// pages; only some less common architectures use larger ones). Used
/// only to produce a clear [`FilesigError::UnalignedBlock`] before the
/// kernel would otherwise reject an unaligned `mmap` with `EINVAL`.
const ASSUMED_PAGE_SIZE: u64 = 4096;

struct State {
    pos: u64,
}

/// Zero-copy reader (C3): hands out subslices of a memory mapping
/// instead of copying file bytes into worker-owned buffers. Grounded on
/// `FileMappingChunkReader` in the C++ original, which offers the same
/// two modes via a `mapAllFile` flag - map the whole file once, or map
/// each block on demand and unmap it on release.
pub struct MmapReader {
    file: File,
    file_size: u64,
    chunk_size: u32,
    state: Mutex<State>,
    stopped: AtomicBool,
    whole: Option<Mmap>,
    live: Mutex<HashMap<u64, Mmap>>,
}

impl MmapReader {
    pub fn new(path: impl AsRef<Path>, chunk_size: u32, map_all: bool) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| FilesigError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let file_size = file.metadata()?.len();

        if map_all && file_size > usize::MAX as u64 {
            return Err(FilesigError::FileTooLarge { size: file_size });
        }

        let whole = if map_all && file_size > 0 {
            // SAFETY: the backing file is not truncated or modified for
            // the lifetime of this reader by any cooperating caller;
            // same caveat `memmap2` documents for all of its mappings.
            let mmap = unsafe { MmapOptions::new().map(&file) }.map_err(FilesigError::Mmap)?;
            let _ = mmap.advise(memmap2::Advice::Sequential);
            let _ = mmap.advise(memmap2::Advice::WillNeed);
            Some(mmap)
        } else {
            None
        };

        Ok(Self {
            file,
            file_size,
            chunk_size: chunk_size.max(1),
            state: Mutex::new(State { pos: 0 }),
            stopped: AtomicBool::new(false),
            whole,
            live: Mutex::new(HashMap::new()),
        })
    }
}

impl BlockReader for MmapReader {
    fn acquire_next(&self) -> Result<Option<BlockHandle<'_>>> {
        if self.stopped.load(Ordering::Acquire) {
            return Ok(None);
        }

        let (offset, size) = {
            let mut state = self.state.lock();
            if state.pos >= self.file_size {
                return Ok(None);
            }
            let remaining = self.file_size - state.pos;
            let size = (self.chunk_size as u64).min(remaining) as u32;
            let offset = state.pos;
            state.pos += size as u64;
            (offset, size)
        };

        if let Some(whole) = &self.whole {
            let data = &whole[offset as usize..offset as usize + size as usize];
            return Ok(Some(BlockHandle::new(self, data, offset)));
        }

        if offset % ASSUMED_PAGE_SIZE != 0 {
            return Err(FilesigError::UnalignedBlock { offset, size });
        }

        // SAFETY: same file-mutation caveat as the whole-file mapping.
        let mmap = unsafe {
            MmapOptions::new()
                .offset(offset)
                .len(size as usize)
                .map(&self.file)
        }
        .map_err(FilesigError::Mmap)?;

        let data: &[u8] = unsafe { std::slice::from_raw_parts(mmap.as_ptr(), mmap.len()) };
        self.live.lock().insert(offset, mmap);
        Ok(Some(BlockHandle::new(self, data, offset)))
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    fn release_raw(&self, offset: u64, _size: u32) {
        if self.whole.is_some() {
            // The whole file stays mapped for the reader's lifetime;
            // nothing to release per block.
            return;
        }
        if self.live.lock().remove(&offset).is_none() {
            tracing::error!(offset, "{}", FilesigError::UnknownBufferRelease);
            panic!("{}", FilesigError::UnknownBufferRelease);
        }
    }
}
