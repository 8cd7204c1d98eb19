//! Polling scheduler
//!
//! Owns the fetch loop and the lifecycle of everything downstream of it:
//!
//! ```text
//! Idle --start()--> Running --shutdown()--> ShuttingDown --> Stopped
//! ```
//!
//! One tokio task runs the loop. Each iteration sleeps for the previously
//! computed delay, performs one fetch, and computes the next delay from the
//! result: the error delay after a failure, otherwise the fetch period while open
//! or the time until reopening while closed.
//!
//! Accepted readings are appended to the retention buffer and published to live
//! subscribers while the buffer lock is held. `subscribe` takes the same lock to
//! build its catch-up snapshot, so a subscriber sees every reading exactly once:
//! either in the snapshot or through `on_next`. Subscriber callbacks therefore
//! run under that lock and must not call back into the scheduler.

use crate::domain::Reading;
use crate::infra::clock::Clock;
use crate::infra::config::Config;
use crate::infra::metrics::{Metrics, MetricsSummary};
use crate::io::store::Store;
use crate::io::upstream::Fetcher;
use crate::services::broadcaster::{LiveBroadcaster, Subscription};
use crate::services::business_hours::BusinessHours;
use crate::services::error::{PollError, SchedulerError};
use crate::services::retention::{FlushReport, RetentionBuffer};
use chrono::{Datelike, Days, NaiveDate};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Log fetch failure (cold path)
#[cold]
fn log_fetch_failed(e: &PollError, retry_in: Duration) {
    warn!(error = %e, retry_in_ms = retry_in.as_millis() as u64, "fetch_failed");
}

/// Log flush failure (cold path)
#[cold]
fn log_flush_failed(e: &PollError) {
    error!(error = %e, "flush_failed");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
    ShuttingDown,
    Stopped,
}

/// Loop cadence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerTiming {
    /// Delay between successful fetches while open
    pub fetch_period: Duration,
    /// Delay after a failed fetch
    pub error_delay: Duration,
    /// Minimum time between store flushes
    pub flush_interval: Duration,
}

impl SchedulerTiming {
    pub fn from_config(config: &Config) -> Self {
        Self {
            fetch_period: Duration::from_secs(config.fetch_period_secs()),
            error_delay: Duration::from_secs(config.error_delay_secs()),
            flush_interval: Duration::from_secs(config.flush_interval_secs()),
        }
    }
}

impl Default for SchedulerTiming {
    fn default() -> Self {
        Self {
            fetch_period: Duration::from_secs(5),
            error_delay: Duration::from_secs(3),
            flush_interval: Duration::from_secs(60),
        }
    }
}

/// Result of `subscribe`: the live registration plus everything seen today
/// up to the moment of registration, oldest first
#[derive(Debug)]
pub struct LiveFeed {
    pub subscription: Subscription,
    pub snapshot: Vec<Reading>,
}

pub struct PollingScheduler<F, S> {
    fetcher: F,
    store: S,
    hours: BusinessHours,
    timing: SchedulerTiming,
    clock: Arc<dyn Clock>,
    buffer: Mutex<RetentionBuffer>,
    broadcaster: LiveBroadcaster,
    metrics: Arc<Metrics>,
    state: Mutex<SchedulerState>,
    cancel: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<F, S> PollingScheduler<F, S>
where
    F: Fetcher + 'static,
    S: Store + 'static,
{
    /// The last-flush watermark starts at the clock's current instant
    pub fn new(
        fetcher: F,
        store: S,
        hours: BusinessHours,
        timing: SchedulerTiming,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (cancel, _) = watch::channel(false);
        let buffer = RetentionBuffer::new(clock.now());
        Self {
            fetcher,
            store,
            hours,
            timing,
            clock,
            buffer: Mutex::new(buffer),
            broadcaster: LiveBroadcaster::new(),
            metrics,
            state: Mutex::new(SchedulerState::Idle),
            cancel,
            worker: Mutex::new(None),
        }
    }

    /// Spawn the polling task. Must be called within a tokio runtime.
    pub fn start(self: &Arc<Self>) -> Result<(), SchedulerError> {
        let mut state = self.state.lock();
        match *state {
            SchedulerState::Idle => {}
            SchedulerState::Running => return Err(SchedulerError::AlreadyStarted),
            SchedulerState::ShuttingDown | SchedulerState::Stopped => {
                return Err(SchedulerError::Stopped)
            }
        }

        let initial_delay = self.next_delay(self.clock.now());
        let cancel = self.cancel.subscribe();
        let handle = tokio::spawn(Arc::clone(self).run(initial_delay, cancel));
        *self.worker.lock() = Some(handle);
        *state = SchedulerState::Running;

        info!(
            opens_at = self.hours.opens_at(),
            closes_at = self.hours.closes_at(),
            fetch_period_ms = self.timing.fetch_period.as_millis() as u64,
            initial_delay_ms = initial_delay.as_millis() as u64,
            "scheduler_started"
        );
        Ok(())
    }

    async fn run(self: Arc<Self>, initial_delay: Duration, mut cancel: watch::Receiver<bool>) {
        let mut delay = initial_delay;
        loop {
            if *cancel.borrow() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        break;
                    }
                    continue;
                }
            }
            delay = self.poll_once().await;
        }
        debug!("poll_loop_exited");
    }

    /// One fetch attempt; returns the delay before the next one
    pub async fn poll_once(&self) -> Duration {
        let started = Instant::now();
        let result = self.fetcher.fetch().await;
        self.metrics.record_fetch(result.is_ok(), started.elapsed().as_millis() as u64);
        // Subscribers may have cancelled since the last reading
        self.metrics.set_subscribers(self.broadcaster.subscriber_count());

        match result {
            Ok(reading) => {
                let at = reading.timestamp;
                self.accept(reading);
                let delay = self.next_delay(at);
                if self.hours.is_closed(at) {
                    self.metrics.record_closed_wait();
                    info!(at = %at, wait_secs = delay.as_secs(), "facility_closed_waiting");
                }
                delay
            }
            Err(e) => {
                let delay = self.timing.error_delay;
                log_fetch_failed(&PollError::from(e), delay);
                delay
            }
        }
    }

    /// Delay before the next fetch when the last one succeeded at `now`
    pub fn next_delay(&self, now: chrono::NaiveDateTime) -> Duration {
        if self.hours.is_closed(now) {
            self.hours.wait_duration(now)
        } else {
            self.timing.fetch_period
        }
    }

    /// Buffer and publish one reading, then flush if the interval has elapsed
    ///
    /// The reading's own timestamp drives the flush decision and becomes the
    /// new watermark. Returns the flush report when a flush succeeded.
    pub fn accept(&self, reading: Reading) -> Option<FlushReport> {
        let now = reading.timestamp;
        let mut buffer = self.buffer.lock();

        buffer.append(reading.clone());
        self.metrics.record_reading();

        let published = self.broadcaster.publish(&reading);
        if published.failed > 0 {
            self.metrics.record_subscriber_failures(published.failed);
        }
        self.metrics.set_subscribers(self.broadcaster.subscriber_count());

        let mut flushed = None;
        if buffer.should_flush(now, self.timing.flush_interval) {
            match buffer.flush(&self.store, now) {
                Ok(report) => {
                    self.metrics.record_flush(report.flushed);
                    flushed = Some(report);
                }
                Err(e) => {
                    self.metrics.record_flush_failure();
                    log_flush_failed(&e);
                }
            }
        }
        self.metrics.set_buffer_len(buffer.len());

        debug!(
            at = %now,
            total = reading.total(),
            delivered = published.delivered,
            buffered = buffer.len(),
            "reading_accepted"
        );
        flushed
    }

    /// Stop polling, persist what is buffered, and release the store
    ///
    /// Waits for an in-flight fetch to finish. Only the first call does any
    /// work; it returns true, every other call returns false.
    pub async fn shutdown(&self) -> bool {
        {
            let mut state = self.state.lock();
            match *state {
                SchedulerState::ShuttingDown | SchedulerState::Stopped => return false,
                SchedulerState::Idle | SchedulerState::Running => {
                    *state = SchedulerState::ShuttingDown;
                }
            }
        }
        info!("scheduler_shutting_down");

        self.cancel.send_replace(true);
        let worker = self.worker.lock().take();
        if let Some(handle) = worker {
            if let Err(e) = handle.await {
                error!(error = %e, "poll_task_join_failed");
            }
        }

        let now = self.clock.now();
        let pending = {
            let mut buffer = self.buffer.lock();
            let pending = buffer.len();
            match buffer.flush(&self.store, now) {
                Ok(report) => self.metrics.record_flush(report.flushed),
                Err(e) => {
                    self.metrics.record_flush_failure();
                    log_flush_failed(&e);
                }
            }
            self.metrics.set_buffer_len(buffer.len());
            pending
        };

        if let Err(e) = self.store.close() {
            error!(error = %e, "store_close_failed");
        }

        let closed = self.broadcaster.close();
        self.metrics.set_subscribers(0);
        *self.state.lock() = SchedulerState::Stopped;

        info!(flushed = pending, subscriptions_closed = closed, "scheduler_stopped");
        true
    }

    /// Register a live subscriber and return today's readings so far
    ///
    /// The snapshot holds today's persisted readings followed by buffered ones.
    /// `on_next` then sees every reading accepted after the snapshot was taken.
    pub fn subscribe<N, E>(&self, on_next: N, on_error: E) -> Result<LiveFeed, SchedulerError>
    where
        N: FnMut(&Reading) -> anyhow::Result<()> + Send + 'static,
        E: FnMut(&PollError) + Send + 'static,
    {
        self.ensure_open()?;
        let buffer = self.buffer.lock();
        let snapshot = self.snapshot_locked(&buffer)?;
        let subscription = self.broadcaster.subscribe(on_next, on_error);
        drop(buffer);

        self.metrics.set_subscribers(self.broadcaster.subscriber_count());
        info!(
            subscription = subscription.id(),
            snapshot = snapshot.len(),
            "live_subscriber_added"
        );
        Ok(LiveFeed { subscription, snapshot })
    }

    /// Today's readings (persisted then buffered) without subscribing
    pub fn today_snapshot(&self) -> Result<Vec<Reading>, SchedulerError> {
        self.ensure_open()?;
        let buffer = self.buffer.lock();
        self.snapshot_locked(&buffer)
    }

    fn snapshot_locked(&self, buffer: &RetentionBuffer) -> Result<Vec<Reading>, SchedulerError> {
        let today = self.clock.now().date();
        let mut snapshot = self.store.query_day(today)?;
        snapshot.extend(buffer.pending().iter().filter(|r| r.date() == today).cloned());
        Ok(snapshot)
    }

    /// Persisted readings for the 7 days ending at `end`, indexed Monday = 0
    pub fn query_week(&self, end: NaiveDate) -> Result<[Vec<Reading>; 7], SchedulerError> {
        self.ensure_open()?;
        let mut week: [Vec<Reading>; 7] = Default::default();
        for back in 0..7u64 {
            let Some(date) = end.checked_sub_days(Days::new(back)) else {
                continue;
            };
            week[date.weekday().num_days_from_monday() as usize] = self.store.query_day(date)?;
        }
        Ok(week)
    }

    /// The most recent complete week
    ///
    /// Ends yesterday while today's business day is still open, otherwise today.
    pub fn query_last_week(&self) -> Result<(NaiveDate, [Vec<Reading>; 7]), SchedulerError> {
        let end = self.last_week_end();
        Ok((end, self.query_week(end)?))
    }

    /// End date used by `query_last_week`
    pub fn last_week_end(&self) -> NaiveDate {
        let now = self.clock.now();
        let today = now.date();
        if now <= self.hours.closing_time(today) {
            today.pred_opt().unwrap_or(today)
        } else {
            today
        }
    }

    fn ensure_open(&self) -> Result<(), SchedulerError> {
        match *self.state.lock() {
            SchedulerState::ShuttingDown | SchedulerState::Stopped => Err(SchedulerError::Stopped),
            SchedulerState::Idle | SchedulerState::Running => Ok(()),
        }
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.lock()
    }

    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Refresh the gauges from live state, then take a metrics report
    pub fn report_metrics(&self) -> MetricsSummary {
        if !matches!(self.state(), SchedulerState::Stopped) {
            self.metrics.set_subscribers(self.broadcaster.subscriber_count());
            self.metrics.set_buffer_len(self.buffered_len());
        }
        self.metrics.report()
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.lock().len()
    }

    pub fn last_flush(&self) -> chrono::NaiveDateTime {
        self.buffer.lock().last_flush()
    }

    pub fn subscriber_count(&self) -> usize {
        self.broadcaster.subscriber_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::clock::ManualClock;
    use crate::io::store::{SqliteStore, StoreError};
    use crate::io::upstream::FetchError;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, NaiveDateTime};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn t0() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 10, 16).unwrap().and_hms_opt(9, 0, 0).unwrap()
    }

    fn secs(s: i64) -> NaiveDateTime {
        t0() + ChronoDuration::seconds(s)
    }

    fn reading(ts: NaiveDateTime, pool: u32) -> Reading {
        Reading::from_counts(ts, [("swimming_pool", pool), ("gym", pool / 2)])
    }

    struct FailingFetcher;

    #[async_trait]
    impl Fetcher for FailingFetcher {
        async fn fetch(&self) -> Result<Reading, FetchError> {
            Err(FetchError::Status(502))
        }
    }

    /// Takes a while to answer, like a slow upstream
    struct SlowFetcher {
        delay: Duration,
        reading: Reading,
        completed: AtomicUsize,
    }

    #[async_trait]
    impl Fetcher for SlowFetcher {
        async fn fetch(&self) -> Result<Reading, FetchError> {
            tokio::time::sleep(self.delay).await;
            self.completed.fetch_add(1, Ordering::SeqCst);
            Ok(self.reading.clone())
        }
    }

    /// Replays scripted readings, advancing the shared clock to each timestamp
    struct ScriptedFetcher {
        clock: Arc<ManualClock>,
        script: Mutex<VecDeque<Reading>>,
    }

    #[async_trait]
    impl Fetcher for ScriptedFetcher {
        async fn fetch(&self) -> Result<Reading, FetchError> {
            let next = self.script.lock().pop_front();
            match next {
                Some(reading) => {
                    self.clock.set(reading.timestamp);
                    Ok(reading)
                }
                None => Err(FetchError::Malformed("script exhausted".to_string())),
            }
        }
    }

    /// Store double counting batches and closes
    #[derive(Default)]
    struct CountingStore {
        batches: Mutex<Vec<Vec<Reading>>>,
        closes: AtomicUsize,
    }

    impl Store for CountingStore {
        fn append_batch(&self, readings: &[Reading]) -> Result<(), StoreError> {
            self.batches.lock().push(readings.to_vec());
            Ok(())
        }

        fn query_day(&self, date: NaiveDate) -> Result<Vec<Reading>, StoreError> {
            Ok(self
                .batches
                .lock()
                .iter()
                .flatten()
                .filter(|r| r.date() == date)
                .cloned()
                .collect())
        }

        fn close(&self) -> Result<(), StoreError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn timing() -> SchedulerTiming {
        SchedulerTiming {
            fetch_period: Duration::from_secs(5),
            error_delay: Duration::from_secs(3),
            flush_interval: Duration::from_secs(60),
        }
    }

    fn scheduler<F: Fetcher + 'static>(
        fetcher: F,
        clock: Arc<ManualClock>,
    ) -> Arc<PollingScheduler<F, CountingStore>> {
        Arc::new(PollingScheduler::new(
            fetcher,
            CountingStore::default(),
            BusinessHours::default(),
            timing(),
            clock,
            Arc::new(Metrics::new()),
        ))
    }

    fn scripted(clock: &Arc<ManualClock>, readings: Vec<Reading>) -> ScriptedFetcher {
        ScriptedFetcher { clock: clock.clone(), script: Mutex::new(readings.into()) }
    }

    #[test]
    fn test_next_delay_open_and_closed() {
        let clock = Arc::new(ManualClock::new(t0()));
        let sched = scheduler(FailingFetcher, clock);

        assert_eq!(sched.next_delay(t0()), Duration::from_secs(5));
        let late = NaiveDate::from_ymd_opt(2026, 10, 16).unwrap().and_hms_opt(23, 0, 0).unwrap();
        assert_eq!(sched.next_delay(late), Duration::from_secs(7 * 3600));
    }

    #[tokio::test]
    async fn test_failing_fetcher_touches_nothing() {
        let clock = Arc::new(ManualClock::new(t0()));
        let sched = scheduler(FailingFetcher, clock);
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        sched
            .subscribe(
                move |_r: &Reading| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
                |_e: &PollError| {},
            )
            .unwrap();

        for _ in 0..4 {
            assert_eq!(sched.poll_once().await, Duration::from_secs(3));
        }

        assert_eq!(sched.buffered_len(), 0);
        assert_eq!(seen.load(Ordering::SeqCst), 0);
        assert!(sched.store().batches.lock().is_empty());
        assert_eq!(sched.metrics().fetch_failures(), 4);
    }

    #[tokio::test]
    async fn test_flushes_once_after_interval() {
        let clock = Arc::new(ManualClock::new(t0()));
        let fetcher = scripted(&clock, vec![reading(secs(30), 10), reading(secs(61), 12)]);
        let sched = scheduler(fetcher, clock);

        assert_eq!(sched.poll_once().await, Duration::from_secs(5));
        assert!(sched.store().batches.lock().is_empty());
        assert_eq!(sched.poll_once().await, Duration::from_secs(5));

        let batches = sched.store().batches.lock();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0], vec![reading(secs(30), 10), reading(secs(61), 12)]);
        assert_eq!(sched.last_flush(), secs(61));
        assert_eq!(sched.buffered_len(), 0);
    }

    #[tokio::test]
    async fn test_reading_after_close_waits_until_opening() {
        let late = NaiveDate::from_ymd_opt(2026, 10, 16).unwrap().and_hms_opt(22, 30, 0).unwrap();
        let clock = Arc::new(ManualClock::new(late));
        let fetcher = scripted(&clock, vec![reading(late, 0)]);
        let sched = scheduler(fetcher, clock);

        let delay = sched.poll_once().await;

        assert_eq!(delay, Duration::from_secs(7 * 3600 + 30 * 60));
        assert_eq!(sched.buffered_len(), 1);
        assert_eq!(sched.metrics().closed_waits(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_twice_closes_store_once() {
        let clock = Arc::new(ManualClock::new(t0()));
        let fetcher = scripted(&clock, vec![reading(secs(10), 3)]);
        let sched = scheduler(fetcher, clock);
        sched.poll_once().await;

        assert!(sched.shutdown().await);
        assert!(!sched.shutdown().await);

        assert_eq!(sched.store().closes.load(Ordering::SeqCst), 1);
        assert_eq!(sched.store().batches.lock().len(), 1);
        assert_eq!(sched.state(), SchedulerState::Stopped);
        assert!(matches!(sched.start(), Err(SchedulerError::Stopped)));
    }

    #[tokio::test]
    async fn test_concurrent_shutdown_runs_once() {
        let clock = Arc::new(ManualClock::new(t0()));
        let sched = scheduler(FailingFetcher, clock);

        let (a, b) = tokio::join!(sched.shutdown(), sched.shutdown());

        assert!(a ^ b);
        assert_eq!(sched.store().closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_subscribe_snapshot_has_no_gap_or_duplicate() {
        let clock = Arc::new(ManualClock::new(t0()));
        let fetcher = scripted(
            &clock,
            vec![reading(secs(10), 1), reading(secs(70), 2), reading(secs(80), 3)],
        );
        let sched = scheduler(fetcher, clock);
        sched.poll_once().await;
        sched.poll_once().await; // flushes the first two

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let feed = sched
            .subscribe(
                move |r: &Reading| {
                    sink.lock().push(r.timestamp);
                    Ok(())
                },
                |_e: &PollError| {},
            )
            .unwrap();
        sched.poll_once().await;

        let stamps: Vec<_> = feed.snapshot.iter().map(|r| r.timestamp).collect();
        assert_eq!(stamps, vec![secs(10), secs(70)]);
        assert_eq!(*seen.lock(), vec![secs(80)]);
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected_and_stop_joins_loop() {
        let clock = Arc::new(ManualClock::new(t0()));
        let sched = Arc::new(PollingScheduler::new(
            FailingFetcher,
            CountingStore::default(),
            BusinessHours::default(),
            SchedulerTiming {
                fetch_period: Duration::from_millis(20),
                error_delay: Duration::from_millis(10),
                flush_interval: Duration::from_secs(60),
            },
            clock,
            Arc::new(Metrics::new()),
        ));

        sched.start().unwrap();
        assert!(matches!(sched.start(), Err(SchedulerError::AlreadyStarted)));
        assert_eq!(sched.state(), SchedulerState::Running);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(sched.shutdown().await);

        let attempts = sched.metrics().fetch_attempts();
        assert!(attempts >= 1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sched.metrics().fetch_attempts(), attempts);
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_in_flight_fetch() {
        let clock = Arc::new(ManualClock::new(t0()));
        let fetcher = SlowFetcher {
            delay: Duration::from_millis(200),
            reading: reading(secs(5), 9),
            completed: AtomicUsize::new(0),
        };
        let sched = Arc::new(PollingScheduler::new(
            fetcher,
            CountingStore::default(),
            BusinessHours::default(),
            SchedulerTiming {
                fetch_period: Duration::from_millis(10),
                error_delay: Duration::from_millis(10),
                flush_interval: Duration::from_secs(60),
            },
            clock,
            Arc::new(Metrics::new()),
        ));

        sched.start().unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(sched.fetcher().completed.load(Ordering::SeqCst), 0);

        assert!(sched.shutdown().await);

        assert_eq!(sched.fetcher().completed.load(Ordering::SeqCst), 1);
        assert_eq!(sched.metrics().fetch_attempts(), 1);
        let persisted: Vec<Reading> = sched.store().batches.lock().iter().flatten().cloned().collect();
        assert_eq!(persisted, vec![reading(secs(5), 9)]);
        assert_eq!(sched.store().closes.load(Ordering::SeqCst), 1);
        assert_eq!(sched.state(), SchedulerState::Stopped);
    }

    #[tokio::test]
    async fn test_subscriber_gauge_follows_cancel() {
        let clock = Arc::new(ManualClock::new(t0()));
        let sched = scheduler(FailingFetcher, clock);
        let feed = sched.subscribe(|_r: &Reading| Ok(()), |_e: &PollError| {}).unwrap();
        assert_eq!(sched.metrics().subscribers(), 1);

        feed.subscription.cancel();
        sched.poll_once().await;
        assert_eq!(sched.metrics().report().subscribers, 0);

        let again = sched.subscribe(|_r: &Reading| Ok(()), |_e: &PollError| {}).unwrap();
        again.subscription.cancel();
        assert_eq!(sched.report_metrics().subscribers, 0);
    }

    #[test]
    fn test_query_week_indexes_by_weekday() {
        // 2026-10-16 is a Friday
        let clock = Arc::new(ManualClock::new(t0()));
        let sched = scheduler(FailingFetcher, clock);
        let monday = NaiveDate::from_ymd_opt(2026, 10, 12).unwrap().and_hms_opt(8, 0, 0).unwrap();
        let sunday = NaiveDate::from_ymd_opt(2026, 10, 11).unwrap().and_hms_opt(8, 0, 0).unwrap();
        sched.store().append_batch(&[reading(monday, 4), reading(sunday, 6)]).unwrap();

        let end = NaiveDate::from_ymd_opt(2026, 10, 16).unwrap();
        let week = sched.query_week(end).unwrap();

        assert_eq!(week[0], vec![reading(monday, 4)]);
        assert_eq!(week[6], vec![reading(sunday, 6)]);
        assert!(week[1..6].iter().all(Vec::is_empty));
    }

    #[test]
    fn test_last_week_end_depends_on_closing() {
        let clock = Arc::new(ManualClock::new(t0()));
        let sched = scheduler(FailingFetcher, clock.clone());
        let today = t0().date();

        assert_eq!(sched.last_week_end(), today.pred_opt().unwrap());
        clock.set(today.and_hms_opt(22, 30, 0).unwrap());
        assert_eq!(sched.last_week_end(), today);
    }

    #[tokio::test]
    async fn test_queries_after_shutdown_fail() {
        let clock = Arc::new(ManualClock::new(t0()));
        let sched = Arc::new(PollingScheduler::new(
            FailingFetcher,
            SqliteStore::open_in_memory().unwrap(),
            BusinessHours::default(),
            timing(),
            clock,
            Arc::new(Metrics::new()),
        ));
        sched.shutdown().await;

        assert!(matches!(sched.today_snapshot(), Err(SchedulerError::Stopped)));
        assert!(sched.store().is_closed());
    }
}
