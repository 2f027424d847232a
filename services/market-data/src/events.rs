//! Feed event definitions and per-connection decoding
//!
//! Feed connections deliver raw JSON text. Each subscription decodes its
//! own events against the channel it was opened for, so a payload for the
//! wrong symbol or interval is rejected rather than cached under the wrong
//! key. Decode errors are scoped to the single event.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use types::errors::DecodeError;
use types::ids::Symbol;
use types::interval::Interval;

use crate::snapshot::{CandleSnapshot, TickerSnapshot};

/// Ticker event as delivered by the feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickerEvent {
    pub symbol: String,
    pub last_price: Decimal,
    pub volume_24h: Decimal,
    pub price_change_24h: Decimal,
    pub price_change_percent_24h: Decimal,
}

/// Candle event as delivered by the feed. Times are Unix milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandleEvent {
    pub symbol: String,
    pub interval: String,
    pub open_time: i64,
    pub close_time: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub is_closed: bool,
}

/// Decode a raw ticker payload for the `expected` symbol.
pub fn decode_ticker(
    expected: &Symbol,
    raw: &str,
    received_at: DateTime<Utc>,
) -> Result<TickerSnapshot, DecodeError> {
    let event: TickerEvent = serde_json::from_str(raw)?;
    let symbol = check_symbol(expected, &event.symbol)?;

    if event.last_price < Decimal::ZERO {
        return Err(DecodeError::NegativeValue { field: "last_price" });
    }
    if event.volume_24h < Decimal::ZERO {
        return Err(DecodeError::NegativeValue { field: "volume_24h" });
    }

    Ok(TickerSnapshot {
        symbol,
        last_price: event.last_price,
        volume_24h: event.volume_24h,
        price_change_24h: event.price_change_24h,
        price_change_percent_24h: event.price_change_percent_24h,
        updated_at: received_at,
    })
}

/// Decode a raw candle payload for the `expected` symbol and interval.
pub fn decode_candle(
    expected: &Symbol,
    interval: Interval,
    raw: &str,
    received_at: DateTime<Utc>,
) -> Result<CandleSnapshot, DecodeError> {
    let event: CandleEvent = serde_json::from_str(raw)?;
    let symbol = check_symbol(expected, &event.symbol)?;

    let actual: Interval = event.interval.parse()?;
    if actual != interval {
        return Err(DecodeError::IntervalMismatch {
            expected: interval.to_string(),
            actual: actual.to_string(),
        });
    }

    let snapshot = CandleSnapshot {
        symbol,
        interval,
        open_time: millis_to_utc(event.open_time)?,
        close_time: millis_to_utc(event.close_time)?,
        open: event.open,
        high: event.high,
        low: event.low,
        close: event.close,
        volume: event.volume,
        is_closed: event.is_closed,
        updated_at: received_at,
    };

    if !snapshot.is_valid() {
        return Err(DecodeError::InvalidCandle {
            reason: format!(
                "o={} h={} l={} c={} v={} open_time={} close_time={}",
                snapshot.open,
                snapshot.high,
                snapshot.low,
                snapshot.close,
                snapshot.volume,
                event.open_time,
                event.close_time
            ),
        });
    }

    Ok(snapshot)
}

fn check_symbol(expected: &Symbol, actual: &str) -> Result<Symbol, DecodeError> {
    let actual = Symbol::new(actual);
    if &actual != expected {
        return Err(DecodeError::SymbolMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        });
    }
    Ok(actual)
}

fn millis_to_utc(millis: i64) -> Result<DateTime<Utc>, DecodeError> {
    DateTime::from_timestamp_millis(millis).ok_or(DecodeError::InvalidTimestamp(millis))
}
