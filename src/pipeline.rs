use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

use crate::aggregator::{OrderedAggregator, WaitResult};
use crate::block::BlockReader;
use crate::error::Result;
use crate::hash::Hasher;
use crate::record::Record;

/// Links a reader, a hasher, and a worker pool into one running
/// signature computation, and reassembles results in file order. The
/// "hard part" wiring here is grounded on `SigPipeline` in the C++
/// original: a fixed pool of worker threads each pull-hash-push in a
/// loop, and the last thread to finish freezes the aggregator.
pub struct Pipeline {
    records: Arc<OrderedAggregator>,
    reader: Arc<dyn BlockReader>,
    workers: Vec<JoinHandle<()>>,
}

impl Pipeline {
    /// Spawns `thread_count` (clamped to at least 1) worker threads that
    /// immediately start pulling blocks from `reader`.
    pub fn new(reader: Arc<dyn BlockReader>, hasher: Arc<dyn Hasher>, thread_count: usize) -> Self {
        let thread_count = thread_count.max(1);
        let records = Arc::new(OrderedAggregator::new());
        let active = Arc::new(AtomicUsize::new(thread_count));

        let workers = (0..thread_count)
            .map(|i| {
                let reader = reader.clone();
                let hasher = hasher.clone();
                let records = records.clone();
                let active = active.clone();
                thread::Builder::new()
                    .name(format!("filesig-worker-{i}"))
                    .spawn(move || Self::worker_loop(&*reader, &*hasher, &records, &active))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        Self {
            records,
            reader,
            workers,
        }
    }

    fn worker_loop(reader: &dyn BlockReader, hasher: &dyn Hasher, records: &OrderedAggregator, active: &AtomicUsize) {
        loop {
            let block = match reader.acquire_next() {
                Ok(Some(block)) => block,
                Ok(None) => break,
                Err(err) => {
                    warn!(error = %err, "reader failed, stopping worker");
                    records.set_exception(err);
                    break;
                }
            };

            let offset = block.offset();
            let hash = hasher.hash(block.data());
            let record = Record::new(offset, block.size(), hash);
            block.release();

            debug!(offset, "block hashed");

            if !records.push(record) {
                // Aggregator was canceled; stop pulling more work.
                break;
            }
        }

        // The last worker to finish is the only one allowed to freeze -
        // matches the atomic countdown in the C++ original's hasherThread.
        if active.fetch_sub(1, Ordering::AcqRel) == 1 {
            records.set_frozen();
        }
    }

    /// Register (or replace) the push-side emit callback. See
    /// [`OrderedAggregator::set_callback`].
    pub fn set_records_callback<F>(&self, cb: F)
    where
        F: Fn(Record) + Send + 'static,
    {
        self.records.set_callback(cb);
    }

    /// Signal every worker to stop pulling new blocks and discard
    /// anything already pending. If `sync`, blocks until every worker
    /// thread has exited, then re-raises any captured exception.
    pub fn cancel(&mut self, sync: bool) -> Result<()> {
        self.reader.stop();
        self.records.set_cleaned();

        if sync {
            self.join_workers();
            self.records.check_exception()?;
        }
        Ok(())
    }

    /// Wait for any progress (a record ready to pop, or a terminal
    /// state) without consuming a record. Intended for callback-driven
    /// callers that just want to know when to stop polling.
    pub fn wait(&self, timeout: Duration) -> Result<WaitResult> {
        self.records.wait_for_any(timeout)
    }

    /// Wait for and pop the next in-order record, or a terminal state.
    pub fn wait_for_record(&self, timeout: Duration) -> Result<WaitResult> {
        self.records.try_pop(timeout)
    }

    fn join_workers(&mut self) {
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.reader.stop();
        self.records.set_cleaned();
        self.join_workers();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::Crc32Hasher;
    use crate::reader::StreamingReader;
    use std::io::Write;
    use std::sync::Mutex;

    fn write_temp(contents: &[u8]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(contents).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn produces_records_covering_the_whole_file_in_order() {
        let data: Vec<u8> = (0..200u8).cycle().take(5000).collect();
        let f = write_temp(&data);
        let reader: Arc<dyn BlockReader> = Arc::new(StreamingReader::new(f.path(), 4, 512).unwrap());
        let hasher: Arc<dyn Hasher> = Arc::new(Crc32Hasher);
        let pipeline = Pipeline::new(reader, hasher, 4);

        let mut offset = 0u64;
        let mut total = 0usize;
        loop {
            match pipeline.wait_for_record(Duration::from_secs(5)).unwrap() {
                WaitResult::Ready(r) => {
                    assert_eq!(r.offset, offset);
                    offset = r.end_offset();
                    total += r.size as usize;
                }
                WaitResult::Finished => break,
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(total, data.len());
    }

    #[test]
    fn callback_receives_every_record_in_order() {
        let data: Vec<u8> = (0..64u8).collect();
        let f = write_temp(&data);
        let reader: Arc<dyn BlockReader> = Arc::new(StreamingReader::new(f.path(), 2, 16).unwrap());
        let hasher: Arc<dyn Hasher> = Arc::new(Crc32Hasher);
        let pipeline = Pipeline::new(reader, hasher, 3);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        pipeline.set_records_callback(move |r| seen2.lock().unwrap().push(r.offset));

        loop {
            match pipeline.wait(Duration::from_secs(5)).unwrap() {
                WaitResult::Finished => break,
                _ => {}
            }
        }
        assert_eq!(*seen.lock().unwrap(), vec![0, 16, 32, 48]);
    }

    #[test]
    fn cancel_sync_stops_promptly_and_returns_ok_without_error() {
        let data: Vec<u8> = vec![0u8; 1_000_000];
        let f = write_temp(&data);
        let reader: Arc<dyn BlockReader> = Arc::new(StreamingReader::new(f.path(), 2, 64).unwrap());
        let hasher: Arc<dyn Hasher> = Arc::new(Crc32Hasher);
        let mut pipeline = Pipeline::new(reader, hasher, 2);
        pipeline.cancel(true).unwrap();
    }
}
