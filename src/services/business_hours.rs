//! Facility operating hours policy
//!
//! Hours are whole hours of the day forming a half-open interval
//! `[opens_at, closes_at)`. When `opens_at > closes_at` the open interval spans
//! midnight. Equal hours mean the facility never closes.
//!
//! All functions are pure: they only look at the configured hours and the instant
//! passed in.

use chrono::{Duration as ChronoDuration, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid business hours: opens_at={opens_at} closes_at={closes_at} (expected 0..=23)")]
pub struct InvalidHours {
    pub opens_at: u32,
    pub closes_at: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusinessHours {
    opens_at: u32,
    closes_at: u32,
}

impl BusinessHours {
    pub fn new(opens_at: u32, closes_at: u32) -> Result<Self, InvalidHours> {
        if opens_at > 23 || closes_at > 23 {
            return Err(InvalidHours { opens_at, closes_at });
        }
        Ok(Self { opens_at, closes_at })
    }

    #[inline]
    pub fn opens_at(&self) -> u32 {
        self.opens_at
    }

    #[inline]
    pub fn closes_at(&self) -> u32 {
        self.closes_at
    }

    /// True when `instant` falls outside operating hours
    pub fn is_closed(&self, instant: NaiveDateTime) -> bool {
        let hour = instant.hour();
        if self.opens_at < self.closes_at {
            !(self.opens_at <= hour && hour < self.closes_at)
        } else {
            self.closes_at <= hour && hour < self.opens_at
        }
    }

    /// Time until the next opening boundary at or after `instant`
    ///
    /// Zero when `instant` sits exactly on the opening hour.
    pub fn wait_duration(&self, instant: NaiveDateTime) -> Duration {
        let today_open = self.opening_time(instant.date());
        let next_open =
            if today_open >= instant { today_open } else { today_open + ChronoDuration::days(1) };
        (next_open - instant).to_std().unwrap_or(Duration::ZERO)
    }

    /// Opening instant of the business day starting on `date`
    pub fn opening_time(&self, date: NaiveDate) -> NaiveDateTime {
        date.and_time(hour_start(self.opens_at))
    }

    /// Closing instant of the business day starting on `date`
    ///
    /// Falls on the next calendar day when the hours wrap past midnight.
    pub fn closing_time(&self, date: NaiveDate) -> NaiveDateTime {
        let close = date.and_time(hour_start(self.closes_at));
        if self.opens_at < self.closes_at {
            close
        } else {
            close + ChronoDuration::days(1)
        }
    }
}

impl Default for BusinessHours {
    fn default() -> Self {
        Self { opens_at: 6, closes_at: 22 }
    }
}

fn hour_start(hour: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(hour, 0, 0).unwrap_or(NaiveTime::MIN)
}
