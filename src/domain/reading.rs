//! Occupancy reading - one normalized sample of the facility

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Room name to current head count
pub type Occupancy = BTreeMap<String, u32>;

/// A single occupancy sample, produced once per successful fetch
///
/// Timestamps are facility-local wall clock time. Room keys are stable across
/// readings from the same upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reading {
    pub timestamp: NaiveDateTime,
    pub occupancy: Occupancy,
}

impl Reading {
    pub fn new(timestamp: NaiveDateTime, occupancy: Occupancy) -> Self {
        Self { timestamp, occupancy }
    }

    /// Build a reading from (room, count) pairs
    pub fn from_counts<I, K>(timestamp: NaiveDateTime, counts: I) -> Self
    where
        I: IntoIterator<Item = (K, u32)>,
        K: Into<String>,
    {
        let occupancy = counts.into_iter().map(|(room, count)| (room.into(), count)).collect();
        Self { timestamp, occupancy }
    }

    /// Calendar day this reading belongs to
    #[inline]
    pub fn date(&self) -> NaiveDate {
        self.timestamp.date()
    }

    /// Head count for a single room
    pub fn count(&self, room: &str) -> Option<u32> {
        self.occupancy.get(room).copied()
    }

    /// Sum over all rooms, widened so large upstream counts cannot overflow
    pub fn total(&self) -> u64 {
        self.occupancy.values().map(|&count| u64::from(count)).sum()
    }
}
