//! Supported kline intervals and their fixed properties.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Interval {
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
}

pub const ALL_INTERVALS: [Interval; 4] = [Interval::M5, Interval::M30, Interval::H1, Interval::H4];

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unsupported interval: {0}")]
pub struct UnsupportedInterval(pub String);

impl Interval {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::M5 => "5m",
            Self::M30 => "30m",
            Self::H1 => "1h",
            Self::H4 => "4h",
        }
    }

    pub fn duration_ms(self) -> i64 {
        match self {
            Self::M5 => 5 * 60 * 1_000,
            Self::M30 => 30 * 60 * 1_000,
            Self::H1 => 60 * 60 * 1_000,
            Self::H4 => 4 * 60 * 60 * 1_000,
        }
    }

    /// Polling cadence before any adaptive widening.
    pub fn base_update_frequency_secs(self) -> u64 {
        match self {
            Self::M5 => 5 * 60,
            Self::M30 => 30 * 60,
            Self::H1 => 60 * 60,
            Self::H4 => 4 * 60 * 60,
        }
    }

    /// First local calendar day that is backfilled for an empty table. Short
    /// intervals start later to keep the initial backfill bounded.
    pub fn history_start_date(self) -> NaiveDate {
        let (year, month, day) = match self {
            Self::M5 => (2025, 1, 1),
            Self::M30 => (2022, 1, 1),
            Self::H1 | Self::H4 => (2020, 1, 1),
        };
        NaiveDate::from_ymd_opt(year, month, day).unwrap_or_default()
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Interval {
    type Err = UnsupportedInterval;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim() {
            "5m" => Ok(Self::M5),
            "30m" => Ok(Self::M30),
            "1h" => Ok(Self::H1),
            "4h" => Ok(Self::H4),
            other => Err(UnsupportedInterval(other.to_string())),
        }
    }
}
