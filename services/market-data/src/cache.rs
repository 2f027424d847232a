//! Concurrent last-value cache for ticker and candle snapshots
//!
//! Keys live in sharded `DashMap`s, so readers and writers on different
//! keys never contend on a global lock. Each entry holds an `Arc` to an
//! immutable snapshot: a put swaps the whole pointer, which makes every
//! per-key read and write atomic without any cross-key transaction.
//!
//! Every successful put publishes a [`CacheUpdate`] on a bounded tokio
//! broadcast channel. Publishing never blocks; receivers that fall behind
//! observe `RecvError::Lagged` instead of slowing down the writer.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, info};
use types::ids::Symbol;
use types::interval::Interval;

use crate::clock::{Clock, SystemClock};
use crate::snapshot::{CandleSnapshot, TickerSnapshot};

/// Default max age for ticker freshness checks.
pub const DEFAULT_TICKER_MAX_AGE: Duration = Duration::from_secs(60);

/// Update published after every put.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheUpdate {
    Ticker(Arc<TickerSnapshot>),
    Candle(Arc<CandleSnapshot>),
}

impl CacheUpdate {
    pub fn symbol(&self) -> &Symbol {
        match self {
            CacheUpdate::Ticker(t) => &t.symbol,
            CacheUpdate::Candle(c) => &c.symbol,
        }
    }

    /// Label for logging.
    pub fn kind_label(&self) -> &'static str {
        match self {
            CacheUpdate::Ticker(_) => "ticker",
            CacheUpdate::Candle(_) => "candle",
        }
    }
}

/// Entry counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub ticker_count: usize,
    pub candle_series_count: usize,
}

/// Configuration for the snapshot cache.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Capacity of the update broadcast channel.
    pub update_channel_capacity: usize,
    /// Max age used by [`SnapshotCache::is_ticker_fresh`].
    pub ticker_max_age: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            update_channel_capacity: 4096,
            ticker_max_age: DEFAULT_TICKER_MAX_AGE,
        }
    }
}

/// Last-value store for ticker and candle snapshots.
pub struct SnapshotCache {
    tickers: DashMap<Symbol, Arc<TickerSnapshot>>,
    candles: DashMap<(Symbol, Interval), Arc<CandleSnapshot>>,
    updates: broadcast::Sender<CacheUpdate>,
    clock: Arc<dyn Clock>,
    ticker_max_age: Duration,
}

impl SnapshotCache {
    pub fn new(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        let (updates, _) = broadcast::channel(config.update_channel_capacity.max(1));
        info!(
            update_channel_capacity = config.update_channel_capacity,
            ticker_max_age_secs = config.ticker_max_age.as_secs(),
            "SnapshotCache initialized"
        );
        Self {
            tickers: DashMap::new(),
            candles: DashMap::new(),
            updates,
            clock,
            ticker_max_age: config.ticker_max_age,
        }
    }

    /// Cache on the wall clock with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(CacheConfig::default(), Arc::new(SystemClock))
    }

    /// Clock used for freshness checks and sweeps.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Receive every update published after this call.
    pub fn subscribe_updates(&self) -> broadcast::Receiver<CacheUpdate> {
        self.updates.subscribe()
    }

    /// Insert or replace the ticker for `snapshot.symbol`, then publish it.
    pub fn put_ticker(&self, snapshot: TickerSnapshot) {
        let snapshot = Arc::new(snapshot);
        self.tickers.insert(snapshot.symbol.clone(), Arc::clone(&snapshot));
        // No receivers is not an error for the writer.
        let _ = self.updates.send(CacheUpdate::Ticker(snapshot));
    }

    pub fn get_ticker(&self, symbol: &Symbol) -> Option<Arc<TickerSnapshot>> {
        self.tickers.get(symbol).map(|entry| Arc::clone(entry.value()))
    }

    /// Insert or replace the candle for `(snapshot.symbol, snapshot.interval)`,
    /// then publish it.
    pub fn put_candle(&self, snapshot: CandleSnapshot) {
        let snapshot = Arc::new(snapshot);
        self.candles.insert(
            (snapshot.symbol.clone(), snapshot.interval),
            Arc::clone(&snapshot),
        );
        let _ = self.updates.send(CacheUpdate::Candle(snapshot));
    }

    pub fn get_candle(&self, symbol: &Symbol, interval: Interval) -> Option<Arc<CandleSnapshot>> {
        self.candles
            .get(&(symbol.clone(), interval))
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Whether the ticker exists and is no older than the configured default.
    pub fn is_ticker_fresh(&self, symbol: &Symbol) -> bool {
        self.is_ticker_fresh_within(symbol, self.ticker_max_age)
    }

    pub fn is_ticker_fresh_within(&self, symbol: &Symbol, max_age: Duration) -> bool {
        let now = self.clock.now();
        self.get_ticker(symbol)
            .map(|t| within(t.age(now), max_age))
            .unwrap_or(false)
    }

    /// Whether the candle exists and is no older than the interval's
    /// default max age (one interval plus margin).
    pub fn is_candle_fresh(&self, symbol: &Symbol, interval: Interval) -> bool {
        self.is_candle_fresh_within(symbol, interval, interval.default_max_age())
    }

    pub fn is_candle_fresh_within(
        &self,
        symbol: &Symbol,
        interval: Interval,
        max_age: Duration,
    ) -> bool {
        let now = self.clock.now();
        self.get_candle(symbol, interval)
            .map(|c| within(c.age(now), max_age))
            .unwrap_or(false)
    }

    /// Remove every entry whose age has reached `max_age`.
    ///
    /// Sweeping treats `age == max_age` as expired while the freshness
    /// checks treat it as fresh: an entry exactly `max_age` old reads as
    /// fresh and is still removed by `sweep(max_age)`. This keeps
    /// `sweep(Duration::ZERO)` removing everything, including entries
    /// written at the current instant.
    /// Returns the number of entries removed across both maps.
    pub fn sweep(&self, max_age: Duration) -> usize {
        let now = self.clock.now();
        let max_age = to_chrono(max_age);
        let mut removed = 0usize;

        self.tickers.retain(|_, snap| {
            let keep = snap.age(now) < max_age;
            if !keep {
                removed += 1;
            }
            keep
        });
        self.candles.retain(|_, snap| {
            let keep = snap.age(now) < max_age;
            if !keep {
                removed += 1;
            }
            keep
        });

        debug!(removed, "Cache sweep complete");
        removed
    }

    /// Remove all entries unconditionally.
    pub fn clear(&self) {
        self.tickers.clear();
        self.candles.clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            ticker_count: self.tickers.len(),
            candle_series_count: self.candles.len(),
        }
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

fn within(age: chrono::Duration, max_age: Duration) -> bool {
    age <= to_chrono(max_age)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::{DateTime, TimeZone, Utc};
    use rust_decimal::Decimal;
    use std::thread;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 17, 12, 0, 0).unwrap()
    }

    fn cache_with_clock() -> (SnapshotCache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start()));
        let cache = SnapshotCache::new(CacheConfig::default(), clock.clone());
        (cache, clock)
    }

    fn ticker(symbol: &str, price: i64, at: DateTime<Utc>) -> TickerSnapshot {
        TickerSnapshot {
            symbol: Symbol::new(symbol),
            last_price: Decimal::from(price),
            volume_24h: Decimal::from(price * 10),
            price_change_24h: Decimal::from(price / 100),
            price_change_percent_24h: Decimal::new(price, 4),
            updated_at: at,
        }
    }

    fn candle(symbol: &str, interval: Interval, close: i64, at: DateTime<Utc>) -> CandleSnapshot {
        CandleSnapshot {
            symbol: Symbol::new(symbol),
            interval,
            open_time: start(),
            close_time: start() + chrono::Duration::seconds(interval.duration_secs() as i64),
            open: Decimal::from(close),
            high: Decimal::from(close),
            low: Decimal::from(close),
            close: Decimal::from(close),
            volume: Decimal::ONE,
            is_closed: false,
            updated_at: at,
        }
    }

    #[test]
    fn test_put_replaces_ticker() {
        let (cache, _) = cache_with_clock();
        cache.put_ticker(ticker("BTCUSDT", 50000, start()));
        cache.put_ticker(ticker("BTCUSDT", 51000, start()));

        let got = cache.get_ticker(&Symbol::new("btcusdt")).unwrap();
        assert_eq!(got.last_price, Decimal::from(51000));
        assert_eq!(cache.stats().ticker_count, 1);
    }

    #[test]
    fn test_candles_keyed_by_interval() {
        let (cache, _) = cache_with_clock();
        let sym = Symbol::new("BTCUSDT");
        cache.put_candle(candle("BTCUSDT", Interval::M1, 100, start()));
        cache.put_candle(candle("BTCUSDT", Interval::M5, 500, start()));
        cache.put_candle(candle("BTCUSDT", Interval::H1, 600, start()));

        let m1 = cache.get_candle(&sym, Interval::M1).unwrap();
        assert_eq!(m1.close, Decimal::from(100));
        assert_eq!(m1.interval, Interval::M1);
        assert!(cache.get_candle(&sym, Interval::M15).is_none());
        assert_eq!(cache.stats().candle_series_count, 3);
    }

    #[test]
    fn test_ticker_freshness_expires() {
        let (cache, clock) = cache_with_clock();
        let sym = Symbol::new("BTCUSDT");
        assert!(!cache.is_ticker_fresh(&sym));

        cache.put_ticker(ticker("BTCUSDT", 50000, clock.now()));
        assert!(cache.is_ticker_fresh(&sym));

        clock.advance(chrono::Duration::seconds(60));
        assert!(cache.is_ticker_fresh(&sym)); // boundary is inclusive

        clock.advance(chrono::Duration::seconds(1));
        assert!(!cache.is_ticker_fresh(&sym));
        assert!(cache.is_ticker_fresh_within(&sym, Duration::from_secs(120)));
    }

    #[test]
    fn test_candle_freshness_uses_interval_default() {
        let (cache, clock) = cache_with_clock();
        let sym = Symbol::new("BTCUSDT");
        cache.put_candle(candle("BTCUSDT", Interval::M1, 100, clock.now()));
        cache.put_candle(candle("BTCUSDT", Interval::H1, 100, clock.now()));

        // 1m default is 70s, 1h default is 65m.
        clock.advance(chrono::Duration::seconds(71));
        assert!(!cache.is_candle_fresh(&sym, Interval::M1));
        assert!(cache.is_candle_fresh(&sym, Interval::H1));

        clock.advance(chrono::Duration::minutes(65));
        assert!(!cache.is_candle_fresh(&sym, Interval::H1));
    }

    #[test]
    fn test_sweep_zero_empties_cache() {
        let (cache, clock) = cache_with_clock();
        cache.put_ticker(ticker("BTCUSDT", 1, clock.now()));
        cache.put_ticker(ticker("ETHUSDT", 1, clock.now()));
        cache.put_candle(candle("BTCUSDT", Interval::M1, 1, clock.now()));

        assert_eq!(cache.sweep(Duration::ZERO), 3);
        assert_eq!(cache.stats(), CacheStats::default());
    }

    #[test]
    fn test_sweep_large_age_keeps_everything() {
        let (cache, clock) = cache_with_clock();
        cache.put_ticker(ticker("BTCUSDT", 1, clock.now()));
        cache.put_candle(candle("BTCUSDT", Interval::M1, 1, clock.now()));
        clock.advance(chrono::Duration::days(30));

        assert_eq!(cache.sweep(Duration::from_secs(u64::MAX)), 0);
        assert_eq!(cache.stats().ticker_count, 1);
        assert_eq!(cache.stats().candle_series_count, 1);
    }

    #[test]
    fn test_sweep_removes_only_old_entries() {
        let (cache, clock) = cache_with_clock();
        cache.put_ticker(ticker("OLDUSDT", 1, clock.now()));
        clock.advance(chrono::Duration::minutes(10));
        cache.put_ticker(ticker("NEWUSDT", 1, clock.now()));

        assert_eq!(cache.sweep(Duration::from_secs(300)), 1);
        assert!(cache.get_ticker(&Symbol::new("OLDUSDT")).is_none());
        assert!(cache.get_ticker(&Symbol::new("NEWUSDT")).is_some());
    }

    #[test]
    fn test_entry_at_exact_max_age_is_fresh_but_swept() {
        let (cache, clock) = cache_with_clock();
        let btc = Symbol::new("BTCUSDT");
        let max_age = Duration::from_secs(60);
        cache.put_ticker(ticker("BTCUSDT", 1, clock.now()));
        cache.put_candle(candle("BTCUSDT", Interval::M1, 1, clock.now()));
        clock.advance(chrono::Duration::seconds(60));

        assert!(cache.is_ticker_fresh_within(&btc, max_age));
        assert!(cache.is_candle_fresh_within(&btc, Interval::M1, max_age));
        assert_eq!(cache.sweep(max_age), 2);
        assert!(!cache.is_ticker_fresh_within(&btc, max_age));
        assert_eq!(cache.stats(), CacheStats::default());
    }

    #[test]
    fn test_clear() {
        let (cache, clock) = cache_with_clock();
        cache.put_ticker(ticker("BTCUSDT", 1, clock.now()));
        cache.put_candle(candle("BTCUSDT", Interval::D1, 1, clock.now()));
        cache.clear();
        assert_eq!(cache.stats(), CacheStats::default());
    }

    #[test]
    fn test_put_publishes_update() {
        let (cache, clock) = cache_with_clock();
        let mut rx = cache.subscribe_updates();

        cache.put_ticker(ticker("BTCUSDT", 42, clock.now()));
        cache.put_candle(candle("BTCUSDT", Interval::M5, 7, clock.now()));

        match rx.try_recv().unwrap() {
            CacheUpdate::Ticker(t) => assert_eq!(t.last_price, Decimal::from(42)),
            other => panic!("Expected ticker update, got {:?}", other),
        }
        match rx.try_recv().unwrap() {
            CacheUpdate::Candle(c) => assert_eq!(c.interval, Interval::M5),
            other => panic!("Expected candle update, got {:?}", other),
        }
    }

    #[test]
    fn test_put_without_receivers_does_not_fail() {
        let (cache, clock) = cache_with_clock();
        cache.put_ticker(ticker("BTCUSDT", 1, clock.now()));
        assert!(cache.get_ticker(&Symbol::new("BTCUSDT")).is_some());
    }

    #[test]
    fn test_concurrent_writers_never_interleave_fields() {
        let (cache, clock) = cache_with_clock();
        let cache = Arc::new(cache);
        let now = clock.now();
        let num_threads = 8;
        let num_iterations = 500;

        let handles: Vec<_> = (0..num_threads)
            .map(|t| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    for i in 0..num_iterations {
                        let price = (t * 1_000_000 + i) as i64;
                        cache.put_ticker(ticker("BTCUSDT", price, now));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let last = cache.get_ticker(&Symbol::new("BTCUSDT")).unwrap();
        let price: i64 = last.last_price.try_into().unwrap();
        // Every field must come from the same input.
        assert_eq!(*last, ticker("BTCUSDT", price, now));
        assert!(price % 1_000_000 < num_iterations as i64);
    }

    proptest::proptest! {
        #[test]
        fn prop_last_write_wins(prices in proptest::collection::vec(0i64..1_000_000, 1..50)) {
            let (cache, clock) = cache_with_clock();
            for p in &prices {
                cache.put_ticker(ticker("BTCUSDT", *p, clock.now()));
            }
            let got = cache.get_ticker(&Symbol::new("BTCUSDT")).unwrap();
            proptest::prop_assert_eq!(got.last_price, Decimal::from(*prices.last().unwrap()));
            proptest::prop_assert_eq!(cache.stats().ticker_count, 1);
        }
    }
}
