//! Conversion between upstream UTC milliseconds and local wall-clock storage
//! time.
//!
//! Rules implemented:
//! - the zone is resolved once from an IANA name, with a fixed-offset fallback
//! - a `LocalInstant` keeps the offset that applied, so `to_utc_millis` is an
//!   exact inverse of `to_local`
//! - stored wall-clock values resolve to the earliest instant on a DST fold

use chrono::{DateTime, FixedOffset, LocalResult, NaiveDateTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use thiserror::Error;
use tracing::warn;

use crate::interval::Interval;

pub type LocalInstant = DateTime<FixedOffset>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimeError {
    #[error("timestamp out of range: {0}ms")]
    OutOfRange(i64),
    #[error("invalid UTC offset: {0}h")]
    InvalidOffset(i32),
    #[error("local time {0} does not exist in the configured zone")]
    NonexistentLocalTime(NaiveDateTime),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Zone {
    Named(Tz),
    Fixed(FixedOffset),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeNormalizer {
    zone: Zone,
}

impl TimeNormalizer {
    /// Resolves `name` as an IANA zone, falling back to a fixed `offset_hours`
    /// zone when the name is unknown.
    pub fn resolve(name: &str, offset_hours: i32) -> Result<Self, TimeError> {
        match name.trim().parse::<Tz>() {
            Ok(tz) => Ok(Self::named(tz)),
            Err(_) => {
                warn!(
                    component = "timezone",
                    event = "timezone.fallback",
                    zone = name,
                    offset_hours
                );
                Self::fixed(offset_hours)
            }
        }
    }

    pub fn named(tz: Tz) -> Self {
        Self {
            zone: Zone::Named(tz),
        }
    }

    pub fn fixed(offset_hours: i32) -> Result<Self, TimeError> {
        let offset = offset_hours
            .checked_mul(3_600)
            .and_then(FixedOffset::east_opt)
            .ok_or(TimeError::InvalidOffset(offset_hours))?;
        Ok(Self {
            zone: Zone::Fixed(offset),
        })
    }

    pub fn zone_name(&self) -> String {
        match self.zone {
            Zone::Named(tz) => tz.name().to_string(),
            Zone::Fixed(offset) => offset.to_string(),
        }
    }

    pub fn to_local(&self, utc_ms: i64) -> Result<LocalInstant, TimeError> {
        let utc = Utc
            .timestamp_millis_opt(utc_ms)
            .single()
            .ok_or(TimeError::OutOfRange(utc_ms))?;
        Ok(self.in_zone(utc))
    }

    pub fn to_utc_millis(&self, local: &LocalInstant) -> i64 {
        local.timestamp_millis()
    }

    pub fn now_local(&self, now_utc: DateTime<Utc>) -> LocalInstant {
        self.in_zone(now_utc)
    }

    /// Wall-clock value written to storage, truncated to whole seconds.
    pub fn to_wall_clock(&self, local: &LocalInstant) -> NaiveDateTime {
        let naive = local.naive_local();
        naive.with_nanosecond(0).unwrap_or(naive)
    }

    pub fn from_wall_clock(&self, wall: NaiveDateTime) -> Result<LocalInstant, TimeError> {
        match self.zone {
            Zone::Named(tz) => pick_earliest(tz.from_local_datetime(&wall), wall)
                .map(|dt| dt.fixed_offset()),
            Zone::Fixed(offset) => pick_earliest(offset.from_local_datetime(&wall), wall),
        }
    }

    pub fn default_history_start(&self, interval: Interval) -> Result<LocalInstant, TimeError> {
        let midnight = interval
            .history_start_date()
            .and_hms_opt(0, 0, 0)
            .unwrap_or_default();
        self.from_wall_clock(midnight)
    }

    fn in_zone(&self, utc: DateTime<Utc>) -> LocalInstant {
        match self.zone {
            Zone::Named(tz) => utc.with_timezone(&tz).fixed_offset(),
            Zone::Fixed(offset) => utc.with_timezone(&offset),
        }
    }
}

fn pick_earliest<T: TimeZone>(
    result: LocalResult<DateTime<T>>,
    wall: NaiveDateTime,
) -> Result<DateTime<T>, TimeError> {
    result
        .earliest()
        .ok_or(TimeError::NonexistentLocalTime(wall))
}
