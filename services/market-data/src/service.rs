//! Front-end facing market data service
//!
//! Wires the cache, registry and dispatcher together and exposes the
//! operations the application calls. Symbols arrive as plain strings and
//! are normalised here; an unusable symbol is rejected before the
//! registry sees it.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rust_decimal::Decimal;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use types::errors::FeedError;
use types::ids::Symbol;
use types::interval::Interval;

use crate::cache::{CacheStats, SnapshotCache};
use crate::clock::Clock;
use crate::config::ServiceConfig;
use crate::dispatcher::{ConsumerFilter, NotificationDispatcher, UpdateStream};
use crate::feed::MarketFeed;
use crate::ingestion::FeedIngestor;
use crate::metrics::ServiceMetrics;
use crate::registry::{CandleSubscribeReport, SubscriptionRegistry, SymbolState};
use crate::snapshot::{CandleSnapshot, TickerSnapshot};

pub struct MarketDataService {
    feed: Arc<dyn MarketFeed>,
    cache: Arc<SnapshotCache>,
    registry: SubscriptionRegistry,
    dispatcher: NotificationDispatcher,
    metrics: Arc<ServiceMetrics>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl MarketDataService {
    /// Build the service. Must be called from within a tokio runtime.
    pub fn new(config: &ServiceConfig, feed: Arc<dyn MarketFeed>, clock: Arc<dyn Clock>) -> Self {
        let metrics = Arc::new(ServiceMetrics::new());
        let cache = Arc::new(SnapshotCache::new(config.cache_config(), clock));
        let ingestor = Arc::new(FeedIngestor::new(Arc::clone(&cache), Arc::clone(&metrics)));
        let registry = SubscriptionRegistry::new(
            Arc::clone(&feed),
            config.credentials.clone(),
            ingestor,
            Arc::clone(&metrics),
        );
        let dispatcher = NotificationDispatcher::start(
            &cache,
            config.dispatcher_config(),
            Arc::clone(&metrics),
        );
        info!(endpoint = %config.credentials.endpoint, "MarketDataService initialized");

        Self {
            feed,
            cache,
            registry,
            dispatcher,
            metrics,
            sweeper: Mutex::new(None),
        }
    }

    fn parse_symbol(symbol: &str) -> Option<Symbol> {
        let parsed = Symbol::try_new(symbol);
        if parsed.is_none() {
            warn!(symbol, "Rejected malformed symbol");
        }
        parsed
    }

    /// Ensure ticker streaming for `symbol`.
    pub async fn subscribe(&self, symbol: &str) -> bool {
        match Self::parse_symbol(symbol) {
            Some(symbol) => self.registry.subscribe(&symbol).await,
            None => false,
        }
    }

    /// Add candle streams; true only if all intervals are subscribed.
    pub async fn subscribe_candles(
        &self,
        symbol: &str,
        short_intervals: &[Interval],
        long_intervals: &[Interval],
    ) -> bool {
        self.subscribe_candles_detailed(symbol, short_intervals, long_intervals)
            .await
            .all_succeeded()
    }

    pub async fn subscribe_candles_detailed(
        &self,
        symbol: &str,
        short_intervals: &[Interval],
        long_intervals: &[Interval],
    ) -> CandleSubscribeReport {
        let Some(parsed) = Self::parse_symbol(symbol) else {
            return CandleSubscribeReport {
                symbol: Symbol::new(symbol),
                group_found: false,
                intervals: Default::default(),
            };
        };
        self.registry
            .subscribe_candles_detailed(&parsed, short_intervals, long_intervals)
            .await
    }

    /// Stop streaming `symbol`. Cached snapshots stay readable.
    pub async fn unsubscribe(&self, symbol: &str) -> bool {
        match Self::parse_symbol(symbol) {
            Some(symbol) => self.registry.unsubscribe(&symbol).await,
            None => false,
        }
    }

    pub fn get_ticker(&self, symbol: &str) -> Option<Arc<TickerSnapshot>> {
        let symbol = Symbol::try_new(symbol)?;
        self.cache.get_ticker(&symbol)
    }

    pub fn get_candle(&self, symbol: &str, interval: Interval) -> Option<Arc<CandleSnapshot>> {
        let symbol = Symbol::try_new(symbol)?;
        self.cache.get_candle(&symbol, interval)
    }

    pub fn is_ticker_fresh(&self, symbol: &str) -> bool {
        Symbol::try_new(symbol)
            .map(|s| self.cache.is_ticker_fresh(&s))
            .unwrap_or(false)
    }

    pub fn is_candle_fresh(&self, symbol: &str, interval: Interval) -> bool {
        Symbol::try_new(symbol)
            .map(|s| self.cache.is_candle_fresh(&s, interval))
            .unwrap_or(false)
    }

    /// Symbols the feed can stream.
    pub async fn list_available_symbols(&self) -> Result<Vec<Symbol>, FeedError> {
        self.feed.list_symbols().await
    }

    pub async fn asset_balance(&self, asset: &str) -> Result<Decimal, FeedError> {
        self.feed.asset_balance(asset).await
    }

    pub fn symbol_state(&self, symbol: &str) -> SymbolState {
        Symbol::try_new(symbol)
            .map(|s| self.registry.symbol_state(&s))
            .unwrap_or(SymbolState::None)
    }

    pub fn active_symbols(&self) -> Vec<Symbol> {
        self.registry.active_symbols()
    }

    /// Stream of cache updates matching `filter`.
    pub fn updates(&self, filter: ConsumerFilter) -> UpdateStream {
        self.dispatcher.register(filter)
    }

    pub fn cache(&self) -> &Arc<SnapshotCache> {
        &self.cache
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<ServiceMetrics> {
        &self.metrics
    }

    /// Sweep the cache every `every`, removing entries at least `max_age`
    /// old. Replaces a previously spawned sweeper.
    ///
    /// A zero period is refused: nothing is spawned, any running sweeper
    /// is left alone, and false is returned.
    pub fn spawn_sweeper(&self, every: Duration, max_age: Duration) -> bool {
        if every.is_zero() {
            warn!("Cache sweeper not started: zero sweep period");
            return false;
        }

        let cache = Arc::clone(&self.cache);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = cache.sweep(max_age);
                debug!(removed, "Periodic cache sweep");
            }
        });

        if let Ok(mut slot) = self.sweeper.lock() {
            if let Some(previous) = slot.replace(handle) {
                previous.abort();
            }
        }
        info!(
            every_secs = every.as_secs(),
            max_age_secs = max_age.as_secs(),
            "Cache sweeper started"
        );
        true
    }

    /// Whether a sweeper task is currently running.
    pub fn sweeper_running(&self) -> bool {
        self.sweeper
            .lock()
            .map(|slot| slot.as_ref().is_some_and(|handle| !handle.is_finished()))
            .unwrap_or(false)
    }

    /// Tear down every stream group, then stop background tasks.
    pub async fn shutdown(self) {
        let stopped = self.registry.stop_all().await;
        if let Ok(mut slot) = self.sweeper.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
        self.dispatcher.shutdown();
        info!(groups = stopped, "MarketDataService shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::feed::simulated::SimulatedFeed;
    use crate::feed::FeedCredentials;
    use chrono::{TimeZone, Utc};

    fn service(feed: &SimulatedFeed, clock: Arc<ManualClock>) -> MarketDataService {
        let config = ServiceConfig::with_credentials(FeedCredentials {
            api_key: "k".to_string(),
            api_secret: "s".to_string(),
            endpoint: "sim://local".to_string(),
        });
        MarketDataService::new(&config, Arc::new(feed.clone()), clock)
    }

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 2, 17, 12, 0, 0).unwrap(),
        ))
    }

    #[tokio::test]
    async fn test_malformed_symbol_rejected() {
        let feed = SimulatedFeed::new(vec![]);
        let svc = service(&feed, clock());

        assert!(!svc.subscribe("BTC/USDT").await);
        assert!(!svc.subscribe("").await);
        assert_eq!(feed.connections_opened(), 0);
        assert!(svc.get_ticker("").is_none());
    }

    #[tokio::test]
    async fn test_symbols_normalised() {
        let feed = SimulatedFeed::new(vec![]);
        let svc = service(&feed, clock());

        assert!(svc.subscribe("btcusdt").await);
        assert!(svc.subscribe(" BTCUSDT ").await);
        assert_eq!(feed.connections_opened(), 1);
        assert_eq!(svc.symbol_state("BtcUsdt"), SymbolState::Active);
        svc.shutdown().await;
    }

    #[tokio::test]
    async fn test_passthrough_queries() {
        let feed = SimulatedFeed::new(vec![Symbol::new("BTCUSDT"), Symbol::new("ETHUSDT")]);
        feed.set_balance("usdt", Decimal::new(12_345, 2));
        let svc = service(&feed, clock());

        let symbols = svc.list_available_symbols().await.unwrap();
        assert_eq!(symbols.len(), 2);
        assert_eq!(svc.asset_balance("USDT").await.unwrap(), Decimal::new(12_345, 2));
        assert_eq!(svc.asset_balance("BTC").await.unwrap(), Decimal::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_purges_stale_entries() {
        let feed = SimulatedFeed::new(vec![]);
        let clk = clock();
        let svc = service(&feed, Arc::clone(&clk));
        svc.cache().put_ticker(TickerSnapshot {
            symbol: Symbol::new("BTCUSDT"),
            last_price: Decimal::ONE,
            volume_24h: Decimal::ONE,
            price_change_24h: Decimal::ZERO,
            price_change_percent_24h: Decimal::ZERO,
            updated_at: clk.now(),
        });

        assert!(svc.spawn_sweeper(Duration::from_secs(10), Duration::from_secs(60)));
        assert!(svc.sweeper_running());
        clk.advance(chrono::Duration::seconds(120));
        tokio::time::sleep(Duration::from_secs(11)).await;

        assert!(svc.get_ticker("BTCUSDT").is_none());
        svc.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_sweep_period_refused() {
        let feed = SimulatedFeed::new(vec![]);
        let svc = service(&feed, clock());

        assert!(!svc.spawn_sweeper(Duration::ZERO, Duration::from_secs(60)));
        assert!(!svc.sweeper_running());

        assert!(svc.spawn_sweeper(Duration::from_secs(10), Duration::from_secs(60)));
        assert!(!svc.spawn_sweeper(Duration::ZERO, Duration::ZERO));
        tokio::time::sleep(Duration::from_secs(25)).await;
        assert!(svc.sweeper_running());
        svc.shutdown().await;
    }
}
