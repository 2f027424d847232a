//! Error types shared by feed integrations
//!
//! Error taxonomy using thiserror

use thiserror::Error;

/// Failures reported by the market data feed collaborator.
///
/// All variants are transient from the core's point of view: they are
/// logged and surfaced as a failed operation, never as a crash.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FeedError {
    #[error("Connect failed: {reason}")]
    Connect { reason: String },

    #[error("Subscribe to {channel} failed: {reason}")]
    Subscribe { channel: String, reason: String },

    #[error("Close failed: {reason}")]
    Close { reason: String },

    #[error("Query failed: {reason}")]
    Query { reason: String },

    #[error("Connection closed")]
    Disconnected,
}

/// Failures decoding a single feed event.
///
/// Scoped to the one event; the owning connection keeps running.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Malformed payload: {0}")]
    Malformed(String),

    #[error("Symbol mismatch: expected {expected}, got {actual}")]
    SymbolMismatch { expected: String, actual: String },

    #[error("Interval mismatch: expected {expected}, got {actual}")]
    IntervalMismatch { expected: String, actual: String },

    #[error("Unknown interval: {0}")]
    UnknownInterval(String),

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(i64),

    #[error("Negative value for {field}")]
    NegativeValue { field: &'static str },

    #[error("Invalid candle: {reason}")]
    InvalidCandle { reason: String },
}

impl From<serde_json::Error> for DecodeError {
    fn from(err: serde_json::Error) -> Self {
        DecodeError::Malformed(err.to_string())
    }
}
