use crate::error::Result;

/// Uniform pull API implemented by every concrete reader.
///
/// `acquire_next` is safe to call concurrently from multiple worker
/// threads - implementations own their internal synchronization. Returns
/// `Ok(None)` at end of file.
pub trait BlockReader: Send + Sync {
    /// Acquire the next block in file order. Blocks the calling thread
    /// until data is ready, the reader reaches EOF, or it observes a
    /// cancellation signal forwarded from the pipeline.
    fn acquire_next(&self) -> Result<Option<BlockHandle<'_>>>;

    /// Forward a cancellation signal: unblock any waiter so in-flight
    /// `acquire_next` calls return `Ok(None)` promptly. Idempotent.
    fn stop(&self);

    /// Internal: release a previously acquired block back to the reader.
    /// Must not fail - any inconsistency here is a programmer error.
    #[doc(hidden)]
    fn release_raw(&self, offset: u64, size: u32);
}

/// A scoped ownership token over one [`Block`]. Release is mandatory on
/// every exit path (normal, early, or via `Drop`) and happens at most
/// once per acquisition.
pub struct BlockHandle<'a> {
    reader: &'a dyn BlockReader,
    data: &'a [u8],
    offset: u64,
    released: bool,
}

impl<'a> BlockHandle<'a> {
    pub(crate) fn new(reader: &'a dyn BlockReader, data: &'a [u8], offset: u64) -> Self {
        Self {
            reader,
            data,
            offset,
            released: false,
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> u32 {
        self.data.len() as u32
    }

    /// Programmer error to call this on an already-released handle -
    /// matches the original's `assert(m_reader)` guard on moved-from
    /// chunks. The returned slice borrows from `&self`, not from the
    /// reader directly, so it cannot outlive a subsequent `release()`.
    pub fn data(&self) -> &[u8] {
        assert!(!self.released, "accessing data of a released BlockHandle");
        self.data
    }

    /// Release early, ahead of `Drop`. The worker loop calls this right
    /// after hashing so the slot is free for the next block before the
    /// record is pushed into the aggregator.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.reader.release_raw(self.offset, self.data.len() as u32);
            self.released = true;
        }
    }
}

impl Drop for BlockHandle<'_> {
    fn drop(&mut self) {
        self.release_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct RecordingReader {
        released: Mutex<Vec<(u64, u32)>>,
    }

    impl BlockReader for RecordingReader {
        fn acquire_next(&self) -> Result<Option<BlockHandle<'_>>> {
            Ok(None)
        }
        fn stop(&self) {}
        fn release_raw(&self, offset: u64, size: u32) {
            self.released.lock().push((offset, size));
        }
    }

    #[test]
    fn drop_releases_exactly_once() {
        let reader = RecordingReader {
            released: Mutex::new(Vec::new()),
        };
        let data = [1u8, 2, 3, 4];
        {
            let handle = BlockHandle::new(&reader, &data, 8);
            assert_eq!(handle.offset(), 8);
            assert_eq!(handle.data(), &data);
        }
        assert_eq!(*reader.released.lock(), vec![(8, 4)]);
    }

    #[test]
    fn explicit_release_suppresses_drop_release() {
        let reader = RecordingReader {
            released: Mutex::new(Vec::new()),
        };
        let data = [1u8, 2, 3, 4];
        let handle = BlockHandle::new(&reader, &data, 0);
        handle.release();
        assert_eq!(*reader.released.lock(), vec![(0, 4)]);
    }

    #[test]
    #[should_panic(expected = "released BlockHandle")]
    fn accessing_released_handle_panics() {
        let reader = RecordingReader {
            released: Mutex::new(Vec::new()),
        };
        let data = [1u8];
        let mut handle = BlockHandle::new(&reader, &data, 0);
        handle.release_inner();
        handle.data();
    }
}
