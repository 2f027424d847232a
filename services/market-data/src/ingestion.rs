//! Feed event ingestion
//!
//! Turns raw feed payloads into cache writes. This is the only work done
//! on a connection's delivery path: decode, one atomic cache put, counter
//! updates. A payload that fails to decode is logged and dropped; the
//! callback never propagates the failure back into the connection.

use std::sync::Arc;

use tracing::{trace, warn};
use types::errors::DecodeError;

use crate::cache::SnapshotCache;
use crate::events::{decode_candle, decode_ticker};
use crate::feed::{ChannelSpec, EventCallback};
use crate::metrics::ServiceMetrics;

/// Decodes feed payloads and writes them into the snapshot cache.
pub struct FeedIngestor {
    cache: Arc<SnapshotCache>,
    metrics: Arc<ServiceMetrics>,
}

impl FeedIngestor {
    pub fn new(cache: Arc<SnapshotCache>, metrics: Arc<ServiceMetrics>) -> Self {
        Self { cache, metrics }
    }

    /// Decode one payload for `channel` and store it.
    pub fn ingest(&self, channel: &ChannelSpec, raw: &str) -> Result<(), DecodeError> {
        let received_at = self.cache.clock().now();
        match channel {
            ChannelSpec::Ticker { symbol } => {
                let snapshot = decode_ticker(symbol, raw, received_at)?;
                self.cache.put_ticker(snapshot);
            }
            ChannelSpec::Candle { symbol, interval } => {
                let snapshot = decode_candle(symbol, *interval, raw, received_at)?;
                self.cache.put_candle(snapshot);
            }
        }
        Ok(())
    }

    /// Build the delivery callback for a subscription on `channel`.
    pub fn callback_for(self: &Arc<Self>, channel: ChannelSpec) -> EventCallback {
        let ingestor = Arc::clone(self);
        Arc::new(move |raw: &str| match ingestor.ingest(&channel, raw) {
            Ok(()) => {
                ingestor.metrics.record_event_decoded();
                trace!(channel = %channel, "Feed event stored");
            }
            Err(err) => {
                ingestor.metrics.record_decode_failure();
                warn!(
                    channel = %channel,
                    error = %err,
                    "Dropping undecodable feed event"
                );
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::clock::ManualClock;
    use chrono::{TimeZone, Utc};
    use rust_decimal::Decimal;
    use std::sync::atomic::Ordering;
    use types::ids::Symbol;
    use types::interval::Interval;

    fn ingestor() -> (Arc<FeedIngestor>, Arc<SnapshotCache>, Arc<ServiceMetrics>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 2, 17, 12, 0, 0).unwrap(),
        ));
        let cache = Arc::new(SnapshotCache::new(CacheConfig::default(), clock));
        let metrics = Arc::new(ServiceMetrics::new());
        let ingestor = Arc::new(FeedIngestor::new(Arc::clone(&cache), Arc::clone(&metrics)));
        (ingestor, cache, metrics)
    }

    #[test]
    fn test_callback_stores_ticker() {
        let (ingestor, cache, metrics) = ingestor();
        let sym = Symbol::new("BTCUSDT");
        let callback = ingestor.callback_for(ChannelSpec::ticker(sym.clone()));

        callback(
            r#"{"symbol":"BTCUSDT","last_price":"101.5","volume_24h":"10",
                "price_change_24h":"1.5","price_change_percent_24h":"1.49"}"#,
        );

        let snap = cache.get_ticker(&sym).unwrap();
        assert_eq!(snap.last_price, Decimal::new(1015, 1));
        assert_eq!(metrics.events_decoded.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_bad_event_is_isolated() {
        let (ingestor, cache, metrics) = ingestor();
        let sym = Symbol::new("BTCUSDT");
        let callback = ingestor.callback_for(ChannelSpec::candle(sym.clone(), Interval::M1));

        callback("garbage");
        callback(
            r#"{"symbol":"BTCUSDT","interval":"1m","open_time":1708171200000,
                "close_time":1708171259999,"open":"1","high":"2","low":"1",
                "close":"2","volume":"3","is_closed":true}"#,
        );

        assert_eq!(metrics.decode_failures.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.events_decoded.load(Ordering::Relaxed), 1);
        assert!(cache.get_candle(&sym, Interval::M1).unwrap().is_closed);
    }

    #[test]
    fn test_wrong_symbol_not_cached() {
        let (ingestor, cache, _) = ingestor();
        let result = ingestor.ingest(
            &ChannelSpec::ticker(Symbol::new("ETHUSDT")),
            r#"{"symbol":"BTCUSDT","last_price":"1","volume_24h":"1",
                "price_change_24h":"0","price_change_percent_24h":"0"}"#,
        );
        assert!(matches!(result, Err(DecodeError::SymbolMismatch { .. })));
        assert_eq!(cache.stats().ticker_count, 0);
    }
}
