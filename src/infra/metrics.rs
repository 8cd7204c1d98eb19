//! Lock-free metrics collection and periodic reporting
//!
//! Counters are plain atomics updated from the polling task and read by the
//! dashboard and the periodic reporter. Periodic values (fetch latency) are
//! swapped to zero on `report()`; totals are monotonic.
//!
//! NOTE: All atomics use Relaxed ordering; these are statistical counters only.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Fetch latency bucket boundaries (milliseconds)
/// Buckets: ≤25, ≤50, ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, >12800
const BUCKET_BOUNDS: [u64; 10] = [25, 50, 100, 200, 400, 800, 1600, 3200, 6400, 12800];
const NUM_BUCKETS: usize = 11;

#[inline]
fn bucket_index(latency_ms: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_ms)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

#[inline]
fn swap_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.swap(0, Ordering::Relaxed);
    }
    result
}

/// Upper bound of the bucket containing the given percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = (total as f64 * percentile) as u64;
    let mut cumulative = 0u64;

    const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] =
        [25, 50, 100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

/// Lock-free metrics collector for the polling service
pub struct Metrics {
    /// Fetch attempts, successful or not (monotonic)
    fetch_attempts: AtomicU64,
    /// Failed fetches (monotonic)
    fetch_failures: AtomicU64,
    /// Readings accepted into the buffer (monotonic)
    readings_total: AtomicU64,
    /// Sleeps until opening because the facility was closed (monotonic)
    closed_waits: AtomicU64,
    /// Successful flushes (monotonic)
    flushes_total: AtomicU64,
    /// Failed flushes (monotonic)
    flush_failures: AtomicU64,
    /// Readings written to the store (monotonic)
    rows_flushed: AtomicU64,
    /// Subscribers dropped after a callback failure (monotonic)
    subscriber_failures: AtomicU64,
    /// Fetch latency histogram (reset on report)
    fetch_latency_buckets: [AtomicU64; NUM_BUCKETS],
    fetch_latency_sum_ms: AtomicU64,
    fetch_latency_max_ms: AtomicU64,
    /// Readings waiting for the next flush (gauge)
    buffer_len: AtomicU64,
    /// Live subscriptions (gauge)
    subscribers: AtomicU64,
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            fetch_attempts: AtomicU64::new(0),
            fetch_failures: AtomicU64::new(0),
            readings_total: AtomicU64::new(0),
            closed_waits: AtomicU64::new(0),
            flushes_total: AtomicU64::new(0),
            flush_failures: AtomicU64::new(0),
            rows_flushed: AtomicU64::new(0),
            subscriber_failures: AtomicU64::new(0),
            fetch_latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            fetch_latency_sum_ms: AtomicU64::new(0),
            fetch_latency_max_ms: AtomicU64::new(0),
            buffer_len: AtomicU64::new(0),
            subscribers: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    /// Record one fetch attempt and how long it took
    #[inline]
    pub fn record_fetch(&self, ok: bool, latency_ms: u64) {
        self.fetch_attempts.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.fetch_failures.fetch_add(1, Ordering::Relaxed);
        }
        self.fetch_latency_buckets[bucket_index(latency_ms)].fetch_add(1, Ordering::Relaxed);
        self.fetch_latency_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
        update_atomic_max(&self.fetch_latency_max_ms, latency_ms);
    }

    #[inline]
    pub fn record_reading(&self) {
        self.readings_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_closed_wait(&self) {
        self.closed_waits.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_flush(&self, rows: usize) {
        self.flushes_total.fetch_add(1, Ordering::Relaxed);
        self.rows_flushed.fetch_add(rows as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_flush_failure(&self) {
        self.flush_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_subscriber_failures(&self, failed: usize) {
        self.subscriber_failures.fetch_add(failed as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn set_buffer_len(&self, len: usize) {
        self.buffer_len.store(len as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn set_subscribers(&self, count: usize) {
        self.subscribers.store(count as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn fetch_attempts(&self) -> u64 {
        self.fetch_attempts.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn fetch_failures(&self) -> u64 {
        self.fetch_failures.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn readings_total(&self) -> u64 {
        self.readings_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn closed_waits(&self) -> u64 {
        self.closed_waits.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn flushes_total(&self) -> u64 {
        self.flushes_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn flush_failures(&self) -> u64 {
        self.flush_failures.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn rows_flushed(&self) -> u64 {
        self.rows_flushed.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn subscriber_failures(&self) -> u64 {
        self.subscriber_failures.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn buffer_len(&self) -> u64 {
        self.buffer_len.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn subscribers(&self) -> u64 {
        self.subscribers.load(Ordering::Relaxed)
    }

    /// Snapshot all counters and reset the periodic latency window
    pub fn report(&self) -> MetricsSummary {
        let latency_buckets = swap_buckets(&self.fetch_latency_buckets);
        let latency_sum = self.fetch_latency_sum_ms.swap(0, Ordering::Relaxed);
        let latency_max = self.fetch_latency_max_ms.swap(0, Ordering::Relaxed);
        let window_fetches: u64 = latency_buckets.iter().sum();

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        MetricsSummary {
            fetch_attempts: self.fetch_attempts(),
            fetch_failures: self.fetch_failures(),
            readings_total: self.readings_total(),
            closed_waits: self.closed_waits(),
            flushes_total: self.flushes_total(),
            flush_failures: self.flush_failures(),
            rows_flushed: self.rows_flushed(),
            subscriber_failures: self.subscriber_failures(),
            window_secs: elapsed.as_secs_f64(),
            window_fetches,
            fetch_latency_buckets: latency_buckets,
            fetch_avg_ms: if window_fetches > 0 { latency_sum / window_fetches } else { 0 },
            fetch_max_ms: latency_max,
            fetch_p95_ms: percentile_from_buckets(&latency_buckets, 0.95),
            buffer_len: self.buffer_len(),
            subscribers: self.subscribers(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Number of histogram buckets (exported for the Prometheus endpoint)
pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;

/// Exported bucket bounds for Prometheus formatting
pub const METRICS_BUCKET_BOUNDS: [u64; 10] = BUCKET_BOUNDS;

#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub fetch_attempts: u64,
    pub fetch_failures: u64,
    pub readings_total: u64,
    pub closed_waits: u64,
    pub flushes_total: u64,
    pub flush_failures: u64,
    pub rows_flushed: u64,
    pub subscriber_failures: u64,
    /// Seconds covered by the latency window
    pub window_secs: f64,
    /// Fetches recorded in the latency window
    pub window_fetches: u64,
    /// Fetch latency histogram for the window
    pub fetch_latency_buckets: [u64; NUM_BUCKETS],
    pub fetch_avg_ms: u64,
    pub fetch_max_ms: u64,
    pub fetch_p95_ms: u64,
    pub buffer_len: u64,
    pub subscribers: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            fetches = %self.fetch_attempts,
            fetch_failures = %self.fetch_failures,
            readings = %self.readings_total,
            closed_waits = %self.closed_waits,
            flushes = %self.flushes_total,
            flush_failures = %self.flush_failures,
            rows_flushed = %self.rows_flushed,
            buffered = %self.buffer_len,
            subscribers = %self.subscribers,
            window_fetches = %self.window_fetches,
            fetch_avg_ms = %self.fetch_avg_ms,
            fetch_p95_ms = %self.fetch_p95_ms,
            window_secs = format!("{:.1}", self.window_secs),
            "metrics"
        );
    }
}
