//! Candle intervals
//!
//! The fixed set of candle durations a feed can publish. Variants are
//! declared shortest first, so the derived `Ord` matches duration order.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::DecodeError;

/// Supported candle intervals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Interval {
    #[serde(rename = "1s")]
    S1,
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "3m")]
    M3,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "2h")]
    H2,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "6h")]
    H6,
    #[serde(rename = "8h")]
    H8,
    #[serde(rename = "12h")]
    H12,
    #[serde(rename = "1d")]
    D1,
    #[serde(rename = "3d")]
    D3,
    #[serde(rename = "1w")]
    W1,
    /// Calendar month, treated as 30 days.
    #[serde(rename = "1M")]
    Mo1,
}

impl Interval {
    pub const ALL: [Self; 16] = [
        Self::S1,
        Self::M1,
        Self::M3,
        Self::M5,
        Self::M15,
        Self::M30,
        Self::H1,
        Self::H2,
        Self::H4,
        Self::H6,
        Self::H8,
        Self::H12,
        Self::D1,
        Self::D3,
        Self::W1,
        Self::Mo1,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::S1 => "1s",
            Self::M1 => "1m",
            Self::M3 => "3m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::M30 => "30m",
            Self::H1 => "1h",
            Self::H2 => "2h",
            Self::H4 => "4h",
            Self::H6 => "6h",
            Self::H8 => "8h",
            Self::H12 => "12h",
            Self::D1 => "1d",
            Self::D3 => "3d",
            Self::W1 => "1w",
            Self::Mo1 => "1M",
        }
    }

    /// Length of one candle in seconds.
    pub const fn duration_secs(self) -> u64 {
        const MIN: u64 = 60;
        const HOUR: u64 = 60 * MIN;
        const DAY: u64 = 24 * HOUR;
        match self {
            Self::S1 => 1,
            Self::M1 => MIN,
            Self::M3 => 3 * MIN,
            Self::M5 => 5 * MIN,
            Self::M15 => 15 * MIN,
            Self::M30 => 30 * MIN,
            Self::H1 => HOUR,
            Self::H2 => 2 * HOUR,
            Self::H4 => 4 * HOUR,
            Self::H6 => 6 * HOUR,
            Self::H8 => 8 * HOUR,
            Self::H12 => 12 * HOUR,
            Self::D1 => DAY,
            Self::D3 => 3 * DAY,
            Self::W1 => 7 * DAY,
            Self::Mo1 => 30 * DAY,
        }
    }

    pub fn duration(self) -> Duration {
        Duration::from_secs(self.duration_secs())
    }

    /// Grace period after a candle's nominal end before the cached value
    /// counts as stale. Never shrinks as intervals get longer.
    pub const fn freshness_margin_secs(self) -> u64 {
        match self {
            Self::S1 => 5,
            Self::M1 => 10,
            Self::M3 => 15,
            Self::M5 => 30,
            Self::M15 => 60,
            Self::M30 => 2 * 60,
            Self::H1 | Self::H2 => 5 * 60,
            Self::H4 | Self::H6 => 10 * 60,
            Self::H8 | Self::H12 => 15 * 60,
            Self::D1 | Self::D3 => 30 * 60,
            Self::W1 | Self::Mo1 => 60 * 60,
        }
    }

    /// Default max age for freshness checks: one full interval plus margin.
    pub fn default_max_age(self) -> Duration {
        Duration::from_secs(self.duration_secs() + self.freshness_margin_secs())
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Interval {
    type Err = DecodeError;

    // Case matters: "1m" is a minute, "1M" a month.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        Self::ALL
            .iter()
            .copied()
            .find(|interval| interval.as_str() == value)
            .ok_or_else(|| DecodeError::UnknownInterval(value.to_string()))
    }
}
