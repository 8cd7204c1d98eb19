//! Durable reading store backed by SQLite
//!
//! Rows are stored in long format, one row per (timestamp, room), so new rooms
//! upstream need no schema change. Timestamps are fixed-width ISO text, which
//! keeps lexical order equal to time order and lets day queries run as plain
//! range scans.

use crate::domain::{Occupancy, Reading};
use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

const TS_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.9f";
const TS_PARSE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS room_occupancy (
    ts    TEXT    NOT NULL,
    room  TEXT    NOT NULL,
    count INTEGER NOT NULL,
    PRIMARY KEY (ts, room)
);
";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store is closed")]
    Closed,
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Persistence for readings
///
/// Writes come only from the scheduler; reads may come from dashboard requests
/// at any time of day.
pub trait Store: Send + Sync {
    /// Persist a batch in one unit. Rows at an existing timestamp are replaced.
    fn append_batch(&self, readings: &[Reading]) -> Result<(), StoreError>;

    /// All readings whose timestamp falls on `date`, ordered by timestamp
    fn query_day(&self, date: NaiveDate) -> Result<Vec<Reading>, StoreError>;

    /// Release the underlying connection
    fn close(&self) -> Result<(), StoreError>;
}

pub struct SqliteStore {
    conn: Mutex<Option<Connection>>,
    label: String,
}

impl SqliteStore {
    /// Open (or create) the database file at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        Self::init(conn, path.display().to_string())
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?, ":memory:".to_string())
    }

    fn init(conn: Connection, label: String) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        info!(path = %label, "store_opened");
        Ok(Self { conn: Mutex::new(Some(conn)), label })
    }

    pub fn is_closed(&self) -> bool {
        self.conn.lock().is_none()
    }
}

impl Store for SqliteStore {
    fn append_batch(&self, readings: &[Reading]) -> Result<(), StoreError> {
        let mut guard = self.conn.lock();
        let conn = guard.as_mut().ok_or(StoreError::Closed)?;

        let tx = conn.transaction()?;
        let mut rows = 0usize;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR REPLACE INTO room_occupancy (ts, room, count) VALUES (?1, ?2, ?3)",
            )?;
            for reading in readings {
                let ts = format_ts(reading.timestamp);
                for (room, count) in &reading.occupancy {
                    stmt.execute(params![ts, room, i64::from(*count)])?;
                    rows += 1;
                }
            }
        }
        tx.commit()?;

        debug!(path = %self.label, readings = readings.len(), rows, "store_batch_written");
        Ok(())
    }

    fn query_day(&self, date: NaiveDate) -> Result<Vec<Reading>, StoreError> {
        let guard = self.conn.lock();
        let conn = guard.as_ref().ok_or(StoreError::Closed)?;

        let start = date.and_time(NaiveTime::MIN);
        let end = start + Duration::days(1);

        let mut stmt = conn.prepare_cached(
            "SELECT ts, room, count FROM room_occupancy
             WHERE ts >= ?1 AND ts < ?2
             ORDER BY ts ASC, room ASC",
        )?;
        let rows = stmt.query_map(params![format_ts(start), format_ts(end)], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, i64>(2)?))
        })?;

        let mut readings: Vec<Reading> = Vec::new();
        for row in rows {
            let (ts, room, count) = row?;
            let timestamp = parse_ts(&ts)?;
            let count = u32::try_from(count)
                .map_err(|_| StoreError::Corrupt(format!("count {count} out of range at {ts}")))?;

            match readings.last_mut() {
                Some(last) if last.timestamp == timestamp => {
                    last.occupancy.insert(room, count);
                }
                _ => {
                    let mut occupancy = Occupancy::new();
                    occupancy.insert(room, count);
                    readings.push(Reading::new(timestamp, occupancy));
                }
            }
        }
        Ok(readings)
    }

    fn close(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().take().ok_or(StoreError::Closed)?;
        conn.close().map_err(|(_, e)| StoreError::Sqlite(e))?;
        info!(path = %self.label, "store_closed");
        Ok(())
    }
}

fn format_ts(ts: NaiveDateTime) -> String {
    ts.format(TS_FORMAT).to_string()
}

fn parse_ts(raw: &str) -> Result<NaiveDateTime, StoreError> {
    NaiveDateTime::parse_from_str(raw, TS_PARSE_FORMAT)
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp '{raw}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn at(day: u32, h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 10, day).unwrap().and_hms_opt(h, m, s).unwrap()
    }

    fn reading(ts: NaiveDateTime, pool: u32, gym: u32) -> Reading {
        Reading::from_counts(ts, [("swimming_pool", pool), ("gym", gym)])
    }

    #[test]
    fn test_append_and_query_day() {
        let store = SqliteStore::open_in_memory().unwrap();
        let batch = vec![reading(at(16, 9, 0, 0), 10, 4), reading(at(16, 9, 0, 5), 11, 5)];
        store.append_batch(&batch).unwrap();

        let day = store.query_day(NaiveDate::from_ymd_opt(2026, 10, 16).unwrap()).unwrap();
        assert_eq!(day, batch);
    }

    #[test]
    fn test_query_day_excludes_neighbouring_days() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .append_batch(&[
                reading(at(15, 23, 59, 59), 1, 1),
                reading(at(16, 0, 0, 0), 2, 2),
                reading(at(16, 23, 59, 59), 3, 3),
                reading(at(17, 0, 0, 0), 4, 4),
            ])
            .unwrap();

        let day = store.query_day(NaiveDate::from_ymd_opt(2026, 10, 16).unwrap()).unwrap();
        let pools: Vec<u32> = day.iter().map(|r| r.count("swimming_pool").unwrap()).collect();
        assert_eq!(pools, vec![2, 3]);
    }

    #[test]
    fn test_results_ordered_by_timestamp() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.append_batch(&[reading(at(16, 12, 0, 0), 2, 0)]).unwrap();
        store.append_batch(&[reading(at(16, 8, 0, 0), 1, 0)]).unwrap();

        let day = store.query_day(NaiveDate::from_ymd_opt(2026, 10, 16).unwrap()).unwrap();
        assert_eq!(day[0].timestamp, at(16, 8, 0, 0));
        assert_eq!(day[1].timestamp, at(16, 12, 0, 0));
    }

    #[test]
    fn test_same_timestamp_last_write_wins() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.append_batch(&[reading(at(16, 9, 0, 0), 10, 4)]).unwrap();
        store.append_batch(&[reading(at(16, 9, 0, 0), 99, 4)]).unwrap();

        let day = store.query_day(NaiveDate::from_ymd_opt(2026, 10, 16).unwrap()).unwrap();
        assert_eq!(day.len(), 1);
        assert_eq!(day[0].count("swimming_pool"), Some(99));
    }

    #[test]
    fn test_subsecond_timestamps_survive() {
        let store = SqliteStore::open_in_memory().unwrap();
        let ts = at(16, 9, 0, 0) + Duration::nanoseconds(123_456_789);
        store.append_batch(&[reading(ts, 1, 2)]).unwrap();

        let day = store.query_day(ts.date()).unwrap();
        assert_eq!(day[0].timestamp, ts);
    }

    #[test]
    fn test_close_then_operations_fail() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.close().unwrap();
        assert!(store.is_closed());
        assert!(matches!(store.append_batch(&[]), Err(StoreError::Closed)));
        assert!(matches!(
            store.query_day(NaiveDate::from_ymd_opt(2026, 10, 16).unwrap()),
            Err(StoreError::Closed)
        ));
        assert!(matches!(store.close(), Err(StoreError::Closed)));
    }

    #[test]
    fn test_file_store_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("data.sqlite");

        let store = SqliteStore::open(&path).unwrap();
        store.append_batch(&[reading(at(16, 10, 0, 0), 7, 3)]).unwrap();
        store.close().unwrap();

        let reopened = SqliteStore::open(&path).unwrap();
        let day = reopened.query_day(NaiveDate::from_ymd_opt(2026, 10, 16).unwrap()).unwrap();
        assert_eq!(day.len(), 1);
        assert_eq!(day[0].count("gym"), Some(3));
    }

    #[test]
    fn test_open_under_a_file_reports_io_error() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"not a directory").unwrap();

        let result = SqliteStore::open(blocker.join("sub").join("data.sqlite"));
        assert!(matches!(result, Err(StoreError::Io(_))));
    }
}
