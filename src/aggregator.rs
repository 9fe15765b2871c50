use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{FilesigError, Result};
use crate::record::Record;

/// Outcome of a timed wait against the aggregator, once any captured
/// exception has already been re-raised as an `Err`.
#[derive(Debug)]
pub enum WaitResult {
    /// Timed out before anything interesting happened.
    Timeout,
    /// A record is ready (only returned by `try_pop`).
    Ready(Record),
    /// `frozen` and every pending record has been drained - no more
    /// records will ever arrive.
    Finished,
    /// `cancel` was called; all pending work was discarded.
    Canceled,
}

type Callback = Box<dyn Fn(Record) + Send>;

struct Inner {
    pending: BTreeMap<u64, Record>,
    next_offset: u64,
    callback: Option<Callback>,
    exception: Option<FilesigError>,
    cleaned: bool,
    frozen: bool,
}

/// Reorders out-of-order worker completions back into strict file order
/// and marshals the push-side emit path (spec.md §4.4).
///
/// Workers complete at different speeds; the aggregator emits a record
/// only once the minimum pending offset equals `next_offset`, guaranteeing
/// bit-exact, file-order output despite parallel hashing.
pub struct OrderedAggregator {
    inner: Mutex<Inner>,
    cv: Condvar,
}

impl Default for OrderedAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl OrderedAggregator {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                pending: BTreeMap::new(),
                next_offset: 0,
                callback: None,
                exception: None,
                cleaned: false,
                frozen: false,
            }),
            cv: Condvar::new(),
        }
    }

    /// Register (or replace) the push-side emit callback. Takes effect on
    /// the next `push`. The callback must be non-blocking and
    /// non-reentrant; it runs on the pushing worker's thread while the
    /// aggregator's lock is held, which serializes all invocations and
    /// guarantees at-most-once delivery per record.
    pub fn set_callback<F>(&self, cb: F)
    where
        F: Fn(Record) + Send + 'static,
    {
        self.inner.lock().callback = Some(Box::new(cb));
    }

    /// Insert a freshly hashed record. Returns `false` if the aggregator
    /// has been canceled (the record is discarded, the caller should stop
    /// pulling more blocks). Panics if called after `set_frozen` - by
    /// protocol, the last worker to decrement the active count is the
    /// only one allowed to freeze, and it does so only after its own
    /// final push.
    pub fn push(&self, record: Record) -> bool {
        let mut inner = self.inner.lock();

        if inner.cleaned {
            return false;
        }

        if inner.frozen {
            panic!("{}", FilesigError::PushAfterFreeze);
        }

        inner.pending.insert(record.offset, record);

        if inner.callback.is_some() {
            while let Some(ready) = Self::try_take_next(&mut inner) {
                // Safe to unwrap: checked `is_some` above, and the
                // callback field is never cleared while we hold the lock.
                (inner.callback.as_ref().unwrap())(ready);
            }
        } else {
            self.cv.notify_all();
        }

        true
    }

    /// Wait for the next in-order record, a terminal state, or `timeout`
    /// to elapse. Uses an absolute deadline so spurious wakeups cannot
    /// extend the caller's total wait past `timeout`. The first captured
    /// exception is re-raised here, to exactly one caller, then cleared.
    pub fn try_pop(&self, timeout: Duration) -> Result<WaitResult> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();

        loop {
            if let Some(err) = inner.exception.take() {
                return Err(err);
            }

            if inner.cleaned {
                return Ok(WaitResult::Canceled);
            }

            if let Some(record) = Self::try_take_next(&mut inner) {
                return Ok(WaitResult::Ready(record));
            }

            if inner.frozen {
                return Ok(WaitResult::Finished);
            }

            if Instant::now() >= deadline {
                return Ok(WaitResult::Timeout);
            }
            self.cv.wait_until(&mut inner, deadline);
            // Loop back around: re-check every predicate regardless of
            // whether this was a real notify or a spurious wakeup.
        }
    }

    /// Same wake conditions as `try_pop` but never extracts a record -
    /// for callback-driven callers that only want to know when to stop
    /// polling.
    pub fn wait_for_any(&self, timeout: Duration) -> Result<WaitResult> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();

        loop {
            if let Some(err) = inner.exception.take() {
                return Err(err);
            }

            if inner.cleaned {
                return Ok(WaitResult::Canceled);
            }

            if inner.frozen && inner.pending.is_empty() {
                return Ok(WaitResult::Finished);
            }

            if Self::peek_next(&inner).is_some() {
                return Ok(WaitResult::Timeout);
            }

            if Instant::now() >= deadline {
                return Ok(WaitResult::Timeout);
            }
            self.cv.wait_until(&mut inner, deadline);
        }
    }

    /// Mark cancellation: discard all pending records and wake every
    /// waiter with `Canceled`. Idempotent.
    pub fn set_cleaned(&self) {
        let mut inner = self.inner.lock();
        inner.cleaned = true;
        inner.pending.clear();
        self.cv.notify_all();
    }

    /// Mark end-of-input: no more pushes will happen. Waiters drain
    /// remaining pending records to `Finished`.
    pub fn set_frozen(&self) {
        let mut inner = self.inner.lock();
        inner.frozen = true;
        self.cv.notify_all();
    }

    /// Store the first captured exception; later calls are no-ops (the
    /// first failure wins, matching spec.md §7).
    pub fn set_exception(&self, err: FilesigError) {
        let mut inner = self.inner.lock();
        if inner.exception.is_none() {
            inner.exception = Some(err);
            self.cv.notify_all();
        }
    }

    /// Non-blocking check for a captured exception, re-raising and
    /// clearing it if one is present. Used by `cancel(sync: true)` to
    /// surface a worker failure after joining every thread.
    pub fn check_exception(&self) -> Result<()> {
        match self.inner.lock().exception.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn peek_next(inner: &Inner) -> Option<&Record> {
        inner.pending.get(&inner.next_offset)
    }

    fn try_take_next(inner: &mut Inner) -> Option<Record> {
        let offset = inner.next_offset;
        let record = inner.pending.remove(&offset)?;
        inner.next_offset = record.end_offset();
        Some(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Digest;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    fn rec(offset: u64, size: u32) -> Record {
        Record::new(offset, size, Digest::new(vec![offset as u8]))
    }

    #[test]
    fn emits_in_order_even_when_pushed_out_of_order() {
        let agg = OrderedAggregator::new();
        assert!(agg.push(rec(4, 4)));
        assert!(agg.push(rec(0, 4)));
        assert!(agg.push(rec(8, 3)));
        agg.set_frozen();

        let mut offsets = Vec::new();
        loop {
            match agg.try_pop(Duration::from_millis(100)).unwrap() {
                WaitResult::Ready(r) => offsets.push(r.offset),
                WaitResult::Finished => break,
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(offsets, vec![0, 4, 8]);
    }

    #[test]
    fn empty_then_frozen_finishes_immediately() {
        let agg = OrderedAggregator::new();
        agg.set_frozen();
        match agg.wait_for_any(Duration::from_millis(50)).unwrap() {
            WaitResult::Finished => {}
            other => panic!("expected Finished, got {other:?}"),
        }
    }

    #[test]
    fn cancel_discards_pending_and_future_pushes() {
        let agg = OrderedAggregator::new();
        assert!(agg.push(rec(0, 4)));
        agg.set_cleaned();
        assert!(!agg.push(rec(4, 4)));
        match agg.try_pop(Duration::from_millis(10)).unwrap() {
            WaitResult::Canceled => {}
            other => panic!("expected Canceled, got {other:?}"),
        }
    }

    #[test]
    fn cancel_is_idempotent() {
        let agg = OrderedAggregator::new();
        agg.set_cleaned();
        agg.set_cleaned();
        agg.set_cleaned();
        match agg.try_pop(Duration::from_millis(10)).unwrap() {
            WaitResult::Canceled => {}
            other => panic!("expected Canceled, got {other:?}"),
        }
    }

    #[test]
    fn timeout_returned_without_progress() {
        let agg = OrderedAggregator::new();
        match agg.try_pop(Duration::from_millis(20)).unwrap() {
            WaitResult::Timeout => {}
            other => panic!("expected Timeout, got {other:?}"),
        }
    }

    #[test]
    #[should_panic(expected = "frozen")]
    fn push_after_freeze_is_a_programmer_error() {
        let agg = OrderedAggregator::new();
        agg.set_frozen();
        agg.push(rec(0, 4));
    }

    #[test]
    fn callback_delivers_every_record_exactly_once_in_order() {
        let agg = OrderedAggregator::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        agg.set_callback(move |r| seen2.lock().push(r.offset));

        assert!(agg.push(rec(4, 4)));
        assert!(agg.push(rec(0, 4)));
        assert!(agg.push(rec(8, 3)));

        assert_eq!(*seen.lock(), vec![0, 4, 8]);
    }

    #[test]
    fn exception_is_reraised_exactly_once_then_cleared() {
        let agg = OrderedAggregator::new();
        agg.set_exception(FilesigError::PushAfterFreeze);
        assert!(agg.try_pop(Duration::from_millis(10)).is_err());
        // second call: exception already consumed, nothing pending, not
        // frozen yet -> times out rather than erroring again.
        match agg.try_pop(Duration::from_millis(10)).unwrap() {
            WaitResult::Timeout => {}
            other => panic!("expected Timeout, got {other:?}"),
        }
    }

    #[test]
    fn concurrent_pushes_still_drain_strictly_in_order() {
        let agg = Arc::new(OrderedAggregator::new());
        let count = Arc::new(AtomicUsize::new(0));

        thread::scope(|scope| {
            for i in 0..8u64 {
                let agg = agg.clone();
                scope.spawn(move || {
                    // simulate skewed completion order
                    thread::sleep(Duration::from_millis((7 - i % 7) as u64));
                    agg.push(rec(i * 4, 4));
                });
            }
        });
        agg.set_frozen();

        let mut last = None;
        loop {
            match agg.try_pop(Duration::from_millis(200)).unwrap() {
                WaitResult::Ready(r) => {
                    if let Some(prev) = last {
                        assert!(r.offset > prev);
                    }
                    last = Some(r.offset);
                    count.fetch_add(1, Ordering::Relaxed);
                }
                WaitResult::Finished => break,
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(count.load(Ordering::Relaxed), 8);
    }
}
