//! Last-value snapshots held by the cache
//!
//! A snapshot is immutable once built; the cache replaces whole snapshots
//! and never patches individual fields.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use types::ids::Symbol;
use types::interval::Interval;

/// Latest price and 24h statistics for one symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickerSnapshot {
    pub symbol: Symbol,
    pub last_price: Decimal,
    pub volume_24h: Decimal,
    pub price_change_24h: Decimal,
    pub price_change_percent_24h: Decimal,
    /// When this value was received by the core.
    pub updated_at: DateTime<Utc>,
}

impl TickerSnapshot {
    /// Time elapsed since `updated_at`, clamped at zero.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.updated_at).max(Duration::zero())
    }
}

/// Latest OHLCV values for one (symbol, interval) series.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandleSnapshot {
    pub symbol: Symbol,
    pub interval: Interval,
    pub open_time: DateTime<Utc>,
    pub close_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    /// Whether the feed reported this candle as final.
    pub is_closed: bool,
    pub updated_at: DateTime<Utc>,
}

impl CandleSnapshot {
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.updated_at).max(Duration::zero())
    }

    /// Validate candle integrity (OHLCV invariants).
    pub fn is_valid(&self) -> bool {
        self.high >= self.open
            && self.high >= self.close
            && self.high >= self.low
            && self.low <= self.open
            && self.low <= self.close
            && self.volume >= Decimal::ZERO
            && self.close_time > self.open_time
    }
}
