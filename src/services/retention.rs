//! In-memory retention of readings not yet persisted
//!
//! The scheduler appends every fetched reading here and periodically hands the
//! whole buffer to the store. The buffer also carries the last-flush watermark
//! the scheduler uses to decide when the next flush is due.
//!
//! Invariants:
//! - pending readings are ordered by timestamp, one entry per timestamp
//! - a successful flush empties the buffer, so no reading is written twice
//! - a failed flush leaves both the buffer and the watermark untouched

use crate::domain::Reading;
use crate::io::store::Store;
use crate::services::error::PollError;
use chrono::NaiveDateTime;
use std::time::Duration;
use tracing::{debug, info};

/// Result of a successful flush
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    /// Number of readings handed to the store
    pub flushed: usize,
    /// New watermark
    pub at: NaiveDateTime,
}

/// True iff at least `flush_interval` has passed since `last_flush`
///
/// A clock that went backwards never makes a flush due.
pub fn should_flush(now: NaiveDateTime, flush_interval: Duration, last_flush: NaiveDateTime) -> bool {
    match (now - last_flush).to_std() {
        Ok(elapsed) => elapsed >= flush_interval,
        Err(_) => false,
    }
}

#[derive(Debug)]
pub struct RetentionBuffer {
    pending: Vec<Reading>,
    last_flush: NaiveDateTime,
}

impl RetentionBuffer {
    /// Create an empty buffer whose watermark starts at `started_at`
    pub fn new(started_at: NaiveDateTime) -> Self {
        Self { pending: Vec::new(), last_flush: started_at }
    }

    /// Insert a reading, replacing any entry at the same timestamp
    pub fn append(&mut self, reading: Reading) {
        let ts = reading.timestamp;
        match self.pending.last().map(|r| r.timestamp) {
            None => self.pending.push(reading),
            Some(last) if last < ts => self.pending.push(reading),
            Some(_) => {
                // Timestamp collision or late arrival; keep the buffer sorted
                match self.pending.binary_search_by(|r| r.timestamp.cmp(&ts)) {
                    Ok(idx) => self.pending[idx] = reading,
                    Err(idx) => self.pending.insert(idx, reading),
                }
            }
        }
    }

    pub fn should_flush(&self, now: NaiveDateTime, flush_interval: Duration) -> bool {
        should_flush(now, flush_interval, self.last_flush)
    }

    /// Write everything pending to `store`, then clear and advance the watermark
    ///
    /// An empty buffer skips the store write but still advances the watermark.
    pub fn flush<S: Store + ?Sized>(
        &mut self,
        store: &S,
        now: NaiveDateTime,
    ) -> Result<FlushReport, PollError> {
        let flushed = self.pending.len();
        if flushed > 0 {
            store
                .append_batch(&self.pending)
                .map_err(|source| PollError::FlushFailed { pending: flushed, source })?;
            self.pending.clear();
            info!(flushed, at = %now, "buffer_flushed");
        } else {
            debug!(at = %now, "buffer_flush_empty");
        }
        self.last_flush = now;
        Ok(FlushReport { flushed, at: now })
    }

    /// Copy of the pending readings, oldest first
    pub fn snapshot(&self) -> Vec<Reading> {
        self.pending.clone()
    }

    pub fn pending(&self) -> &[Reading] {
        &self.pending
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    #[inline]
    pub fn last_flush(&self) -> NaiveDateTime {
        self.last_flush
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::store::StoreError;
    use chrono::{Duration as ChronoDuration, NaiveDate};
    use parking_lot::Mutex;

    /// Store double that records batches and can be told to fail
    #[derive(Default)]
    struct RecordingStore {
        batches: Mutex<Vec<Vec<Reading>>>,
        fail: bool,
    }

    impl Store for RecordingStore {
        fn append_batch(&self, readings: &[Reading]) -> Result<(), StoreError> {
            if self.fail {
                return Err(StoreError::Corrupt("disk full".to_string()));
            }
            self.batches.lock().push(readings.to_vec());
            Ok(())
        }

        fn query_day(&self, _date: NaiveDate) -> Result<Vec<Reading>, StoreError> {
            Ok(Vec::new())
        }

        fn close(&self) -> Result<(), StoreError> {
            Ok(())
        }
    }

    fn t0() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 10, 16).unwrap().and_hms_opt(9, 0, 0).unwrap()
    }

    fn secs(s: i64) -> NaiveDateTime {
        t0() + ChronoDuration::seconds(s)
    }

    fn reading(ts: NaiveDateTime, pool: u32) -> Reading {
        Reading::from_counts(ts, [("swimming_pool", pool)])
    }

    #[test]
    fn test_flush_two_readings_in_order() {
        let store = RecordingStore::default();
        let mut buffer = RetentionBuffer::new(t0());
        buffer.append(reading(secs(5), 1));
        buffer.append(reading(secs(10), 2));

        let report = buffer.flush(&store, secs(12)).unwrap();

        assert_eq!(report, FlushReport { flushed: 2, at: secs(12) });
        let batches = store.batches.lock();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0], vec![reading(secs(5), 1), reading(secs(10), 2)]);
        assert!(buffer.is_empty());
        assert_eq!(buffer.last_flush(), secs(12));
    }

    #[test]
    fn test_failed_flush_keeps_buffer_and_watermark() {
        let store = RecordingStore { fail: true, ..Default::default() };
        let mut buffer = RetentionBuffer::new(t0());
        buffer.append(reading(secs(5), 1));
        buffer.append(reading(secs(10), 2));

        let err = buffer.flush(&store, secs(70)).unwrap_err();

        assert!(matches!(err, PollError::FlushFailed { pending: 2, .. }));
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.last_flush(), t0());
    }

    #[test]
    fn test_empty_flush_skips_store_but_advances_watermark() {
        let store = RecordingStore::default();
        let mut buffer = RetentionBuffer::new(t0());

        let report = buffer.flush(&store, secs(30)).unwrap();

        assert_eq!(report.flushed, 0);
        assert!(store.batches.lock().is_empty());
        assert_eq!(buffer.last_flush(), secs(30));
    }

    #[test]
    fn test_flush_never_writes_readings_twice() {
        let store = RecordingStore::default();
        let mut buffer = RetentionBuffer::new(t0());
        buffer.append(reading(secs(5), 1));
        buffer.flush(&store, secs(60)).unwrap();
        buffer.append(reading(secs(65), 2));
        buffer.flush(&store, secs(120)).unwrap();

        let batches = store.batches.lock();
        assert_eq!(batches[0], vec![reading(secs(5), 1)]);
        assert_eq!(batches[1], vec![reading(secs(65), 2)]);
    }

    #[test]
    fn test_same_timestamp_overwrites() {
        let mut buffer = RetentionBuffer::new(t0());
        buffer.append(reading(secs(5), 1));
        buffer.append(reading(secs(5), 9));

        assert_eq!(buffer.pending(), &[reading(secs(5), 9)]);
    }

    #[test]
    fn test_out_of_order_append_stays_sorted() {
        let mut buffer = RetentionBuffer::new(t0());
        buffer.append(reading(secs(10), 2));
        buffer.append(reading(secs(20), 3));
        buffer.append(reading(secs(5), 1));
        buffer.append(reading(secs(10), 7));

        let stamps: Vec<_> = buffer.pending().iter().map(|r| r.timestamp).collect();
        assert_eq!(stamps, vec![secs(5), secs(10), secs(20)]);
        assert_eq!(buffer.pending()[1].count("swimming_pool"), Some(7));
    }

    #[test]
    fn test_should_flush_boundary() {
        let interval = Duration::from_secs(60);
        assert!(!should_flush(secs(59), interval, t0()));
        assert!(should_flush(secs(60), interval, t0()));
        assert!(should_flush(secs(61), interval, t0()));
    }

    #[test]
    fn test_should_flush_ignores_clock_going_backwards() {
        assert!(!should_flush(secs(-5), Duration::ZERO, t0()));
    }

    #[test]
    fn test_snapshot_is_independent_copy() {
        let mut buffer = RetentionBuffer::new(t0());
        buffer.append(reading(secs(1), 1));
        let snapshot = buffer.snapshot();
        buffer.append(reading(secs(2), 2));

        assert_eq!(snapshot.len(), 1);
        assert_eq!(buffer.len(), 2);
    }
}
