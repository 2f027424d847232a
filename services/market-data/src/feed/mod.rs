//! Market data feed collaborator interface
//!
//! The core never speaks the feed's wire protocol. It consumes a feed
//! through these traits: connect, subscribe a channel with a callback,
//! close. A connection delivers each event as raw text to the callback of
//! the subscription it belongs to.
//!
//! Channel naming follows the `kind@SYMBOL[@interval]` convention:
//! - `ticker@BTCUSDT`
//! - `candles@BTCUSDT@1m`

pub mod simulated;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use types::errors::FeedError;
use types::ids::{ConnectionId, Symbol, SubscriptionId};
use types::interval::Interval;

/// Channel a subscription is opened for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ChannelSpec {
    /// Latest price and 24h statistics: `ticker@{symbol}`
    Ticker { symbol: Symbol },
    /// OHLCV candle updates: `candles@{symbol}@{interval}`
    Candle { symbol: Symbol, interval: Interval },
}

impl ChannelSpec {
    pub fn ticker(symbol: Symbol) -> Self {
        ChannelSpec::Ticker { symbol }
    }

    pub fn candle(symbol: Symbol, interval: Interval) -> Self {
        ChannelSpec::Candle { symbol, interval }
    }

    pub fn symbol(&self) -> &Symbol {
        match self {
            ChannelSpec::Ticker { symbol } | ChannelSpec::Candle { symbol, .. } => symbol,
        }
    }

    /// Parse a channel string into a ChannelSpec.
    pub fn parse(s: &str) -> Option<Self> {
        let parts: Vec<&str> = s.split('@').collect();
        match parts.as_slice() {
            ["ticker", symbol] => Some(ChannelSpec::Ticker {
                symbol: Symbol::try_new(symbol)?,
            }),
            ["candles", symbol, interval] => Some(ChannelSpec::Candle {
                symbol: Symbol::try_new(symbol)?,
                interval: interval.parse().ok()?,
            }),
            _ => None,
        }
    }

    /// Serialize as channel string.
    pub fn to_channel_string(&self) -> String {
        match self {
            ChannelSpec::Ticker { symbol } => format!("ticker@{}", symbol),
            ChannelSpec::Candle { symbol, interval } => {
                format!("candles@{}@{}", symbol, interval)
            }
        }
    }
}

impl fmt::Display for ChannelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_channel_string())
    }
}

/// Credentials handed to [`MarketFeed::connect`].
#[derive(Clone, PartialEq, Eq)]
pub struct FeedCredentials {
    pub api_key: String,
    pub api_secret: String,
    pub endpoint: String,
}

// Keep the secret out of logs.
impl fmt::Debug for FeedCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedCredentials")
            .field("api_key", &self.api_key)
            .field("api_secret", &"***")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

/// Callback invoked on the connection's delivery path for every event.
///
/// Must not block: the connection delivers its next event only after the
/// callback returns.
pub type EventCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Entry point into the feed provider.
#[async_trait]
pub trait MarketFeed: Send + Sync {
    /// Open a new independent connection.
    async fn connect(
        &self,
        credentials: &FeedCredentials,
    ) -> Result<Box<dyn FeedConnection>, FeedError>;

    /// Symbols the provider can stream.
    async fn list_symbols(&self) -> Result<Vec<Symbol>, FeedError>;

    /// Account balance for `asset`.
    async fn asset_balance(&self, asset: &str) -> Result<Decimal, FeedError>;
}

/// One live connection to the feed.
#[async_trait]
pub trait FeedConnection: Send + Sync {
    fn id(&self) -> ConnectionId;

    /// Subscribe `channel`; `on_event` receives every payload for it.
    async fn subscribe(
        &self,
        channel: ChannelSpec,
        on_event: EventCallback,
    ) -> Result<Box<dyn FeedSubscription>, FeedError>;

    /// Close the connection. Idempotent.
    async fn close(&self) -> Result<(), FeedError>;
}

/// Handle to one active channel subscription.
#[async_trait]
pub trait FeedSubscription: Send + Sync {
    fn id(&self) -> SubscriptionId;

    fn channel(&self) -> &ChannelSpec;

    /// Stop delivery. Idempotent.
    async fn close(&self) -> Result<(), FeedError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_parse() {
        let ticker = ChannelSpec::parse("ticker@btcusdt").unwrap();
        assert_eq!(ticker, ChannelSpec::ticker(Symbol::new("BTCUSDT")));

        let candle = ChannelSpec::parse("candles@ETHUSDT@15m").unwrap();
        assert_eq!(
            candle,
            ChannelSpec::candle(Symbol::new("ETHUSDT"), Interval::M15)
        );

        assert!(ChannelSpec::parse("invalid").is_none());
        assert!(ChannelSpec::parse("candles@ETHUSDT@7m").is_none());
    }

    #[test]
    fn test_channel_to_string() {
        let ch = ChannelSpec::candle(Symbol::new("BTCUSDT"), Interval::Mo1);
        assert_eq!(ch.to_channel_string(), "candles@BTCUSDT@1M");
        assert_eq!(ChannelSpec::parse(&ch.to_channel_string()), Some(ch));
    }

    #[test]
    fn test_credentials_debug_hides_secret() {
        let creds = FeedCredentials {
            api_key: "key".to_string(),
            api_secret: "hunter2".to_string(),
            endpoint: "wss://feed".to_string(),
        };
        let printed = format!("{:?}", creds);
        assert!(!printed.contains("hunter2"));
        assert!(printed.contains("key"));
    }
}
