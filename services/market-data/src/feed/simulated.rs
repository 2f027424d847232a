//! In-process simulated feed
//!
//! Implements [`MarketFeed`] without any network I/O. Events are pushed
//! with [`SimulatedFeed::publish`] or generated by a random walk, and
//! delivered synchronously to every active subscription of the channel.
//!
//! Failures and latency are scriptable so the registry's lifecycle can be
//! exercised deterministically: refused connects, refused channels, failed
//! closes, and a delay on every connect/subscribe/close call.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use rand::Rng;
use rust_decimal::Decimal;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use types::errors::FeedError;
use types::ids::{ConnectionId, Symbol, SubscriptionId};
use types::interval::Interval;

use super::{ChannelSpec, EventCallback, FeedConnection, FeedCredentials, FeedSubscription, MarketFeed};

struct Route {
    id: SubscriptionId,
    callback: EventCallback,
}

/// Candle being built by the random walk for one (symbol, interval).
#[derive(Debug, Clone)]
struct WalkCandle {
    open_time_ms: i64,
    open: Decimal,
    high: Decimal,
    low: Decimal,
    close: Decimal,
    volume: Decimal,
}

impl WalkCandle {
    fn new(open_time_ms: i64, price: Decimal, volume: Decimal) -> Self {
        Self {
            open_time_ms,
            open: price,
            high: price,
            low: price,
            close: price,
            volume,
        }
    }

    fn update(&mut self, price: Decimal, volume: Decimal) {
        if price > self.high {
            self.high = price;
        }
        if price < self.low {
            self.low = price;
        }
        self.close = price;
        self.volume += volume;
    }
}

#[derive(Default)]
struct SimState {
    symbols: Vec<Symbol>,
    balances: Mutex<HashMap<String, Decimal>>,
    routes: DashMap<ChannelSpec, Vec<Route>>,
    fail_connect: AtomicBool,
    fail_close: AtomicBool,
    failing_channels: Mutex<HashSet<ChannelSpec>>,
    latency_ms: AtomicU64,
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
    subscribe_calls: AtomicU64,
    prices: Mutex<BTreeMap<Symbol, Decimal>>,
    candles: Mutex<BTreeMap<(Symbol, Interval), WalkCandle>>,
}

impl SimState {
    async fn delay(&self) {
        let ms = self.latency_ms.load(Ordering::Relaxed);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    fn remove_route(&self, channel: &ChannelSpec, id: SubscriptionId) {
        let mut now_empty = false;
        if let Some(mut routes) = self.routes.get_mut(channel) {
            routes.retain(|r| r.id != id);
            now_empty = routes.is_empty();
        }
        if now_empty {
            self.routes.remove_if(channel, |_, routes| routes.is_empty());
        }
    }
}

/// Scriptable in-process feed.
#[derive(Clone, Default)]
pub struct SimulatedFeed {
    state: Arc<SimState>,
}

impl SimulatedFeed {
    /// Feed listing `symbols` as available.
    pub fn new(symbols: impl IntoIterator<Item = Symbol>) -> Self {
        Self {
            state: Arc::new(SimState {
                symbols: symbols.into_iter().collect(),
                ..SimState::default()
            }),
        }
    }

    pub fn set_balance(&self, asset: &str, amount: Decimal) {
        if let Ok(mut balances) = self.state.balances.lock() {
            balances.insert(asset.to_ascii_uppercase(), amount);
        }
    }

    /// Make every subsequent connect fail.
    pub fn set_fail_connect(&self, fail: bool) {
        self.state.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent subscription close fail.
    pub fn set_fail_close(&self, fail: bool) {
        self.state.fail_close.store(fail, Ordering::SeqCst);
    }

    /// Refuse subscriptions to `channel` until cleared.
    pub fn fail_channel(&self, channel: ChannelSpec) {
        if let Ok(mut failing) = self.state.failing_channels.lock() {
            failing.insert(channel);
        }
    }

    pub fn clear_failing_channels(&self) {
        if let Ok(mut failing) = self.state.failing_channels.lock() {
            failing.clear();
        }
    }

    /// Delay applied to every connect, subscribe and close call.
    pub fn set_latency(&self, latency: Duration) {
        self.state
            .latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    /// Deliver `payload` to every active subscription of `channel`.
    ///
    /// Returns the number of subscriptions the payload reached.
    pub fn publish(&self, channel: &ChannelSpec, payload: &str) -> usize {
        // Clone callbacks out so no map shard is locked while they run.
        let callbacks: Vec<EventCallback> = match self.state.routes.get(channel) {
            Some(routes) => routes.iter().map(|r| Arc::clone(&r.callback)).collect(),
            None => return 0,
        };
        for callback in &callbacks {
            callback(payload);
        }
        callbacks.len()
    }

    /// Number of active subscriptions for `channel`.
    pub fn active_subscriptions(&self, channel: &ChannelSpec) -> usize {
        self.state
            .routes
            .get(channel)
            .map(|routes| routes.len())
            .unwrap_or(0)
    }

    /// Total active subscriptions across all channels.
    pub fn total_active_subscriptions(&self) -> usize {
        self.state.routes.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn connections_opened(&self) -> u64 {
        self.state.connections_opened.load(Ordering::SeqCst)
    }

    pub fn connections_closed(&self) -> u64 {
        self.state.connections_closed.load(Ordering::SeqCst)
    }

    /// Connections opened and not yet closed.
    pub fn open_connections(&self) -> u64 {
        self.connections_opened()
            .saturating_sub(self.connections_closed())
    }

    pub fn subscribe_calls(&self) -> u64 {
        self.state.subscribe_calls.load(Ordering::SeqCst)
    }

    /// Advance the random walk one step and publish to every active channel.
    pub fn step_random_walk(&self) -> usize {
        let channels: Vec<ChannelSpec> =
            self.state.routes.iter().map(|entry| entry.key().clone()).collect();
        let now_ms = Utc::now().timestamp_millis();
        let mut rng = rand::thread_rng();
        let mut delivered = 0;

        for channel in channels {
            let symbol = channel.symbol().clone();
            let bps: i64 = rng.gen_range(-25..=25);
            let volume = Decimal::new(rng.gen_range(1..=500), 2);
            let price = self.next_price(&symbol, bps);

            let payload = match &channel {
                ChannelSpec::Ticker { .. } => json!({
                    "symbol": symbol.as_str(),
                    "last_price": price.to_string(),
                    "volume_24h": (volume * Decimal::from(1000)).to_string(),
                    "price_change_24h": (price - Decimal::from(100)).to_string(),
                    "price_change_percent_24h": (price - Decimal::from(100)).to_string(),
                }),
                ChannelSpec::Candle { interval, .. } => {
                    let candle = self.next_candle(&symbol, *interval, now_ms, price, volume);
                    let duration_ms = interval.duration_secs() as i64 * 1000;
                    json!({
                        "symbol": symbol.as_str(),
                        "interval": interval.as_str(),
                        "open_time": candle.open_time_ms,
                        "close_time": candle.open_time_ms + duration_ms - 1,
                        "open": candle.open.to_string(),
                        "high": candle.high.to_string(),
                        "low": candle.low.to_string(),
                        "close": candle.close.to_string(),
                        "volume": candle.volume.to_string(),
                        "is_closed": false,
                    })
                }
            };
            delivered += self.publish(&channel, &payload.to_string());
        }
        delivered
    }

    /// Run the random walk every `period` until the handle is aborted.
    pub fn spawn_random_walk(&self, period: Duration) -> JoinHandle<()> {
        let feed = self.clone();
        info!(period_ms = period.as_millis() as u64, "Random walk started");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let delivered = feed.step_random_walk();
                debug!(delivered, "Random walk step");
            }
        })
    }

    fn next_price(&self, symbol: &Symbol, bps: i64) -> Decimal {
        let mut prices = match self.state.prices.lock() {
            Ok(prices) => prices,
            Err(poisoned) => poisoned.into_inner(),
        };
        let price = prices.entry(symbol.clone()).or_insert_with(|| Decimal::from(100));
        let next = (*price * Decimal::from(10_000 + bps) / Decimal::from(10_000)).round_dp(4);
        *price = next;
        next
    }

    fn next_candle(
        &self,
        symbol: &Symbol,
        interval: Interval,
        now_ms: i64,
        price: Decimal,
        volume: Decimal,
    ) -> WalkCandle {
        let duration_ms = interval.duration_secs() as i64 * 1000;
        let open_time_ms = (now_ms / duration_ms) * duration_ms;
        let mut candles = match self.state.candles.lock() {
            Ok(candles) => candles,
            Err(poisoned) => poisoned.into_inner(),
        };
        let candle = candles
            .entry((symbol.clone(), interval))
            .or_insert_with(|| WalkCandle::new(open_time_ms, price, volume));
        if candle.open_time_ms == open_time_ms {
            candle.update(price, volume);
        } else {
            *candle = WalkCandle::new(open_time_ms, price, volume);
        }
        candle.clone()
    }
}

#[async_trait]
impl MarketFeed for SimulatedFeed {
    async fn connect(
        &self,
        credentials: &FeedCredentials,
    ) -> Result<Box<dyn FeedConnection>, FeedError> {
        self.state.delay().await;
        if self.state.fail_connect.load(Ordering::SeqCst) {
            return Err(FeedError::Connect {
                reason: format!("simulated refusal from {}", credentials.endpoint),
            });
        }
        self.state.connections_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SimConnection {
            id: ConnectionId::new(),
            state: Arc::clone(&self.state),
            closed: AtomicBool::new(false),
        }))
    }

    async fn list_symbols(&self) -> Result<Vec<Symbol>, FeedError> {
        Ok(self.state.symbols.clone())
    }

    async fn asset_balance(&self, asset: &str) -> Result<Decimal, FeedError> {
        let balances = self.state.balances.lock().map_err(|_| FeedError::Query {
            reason: "balance table poisoned".to_string(),
        })?;
        Ok(balances
            .get(&asset.to_ascii_uppercase())
            .copied()
            .unwrap_or(Decimal::ZERO))
    }
}

struct SimConnection {
    id: ConnectionId,
    state: Arc<SimState>,
    closed: AtomicBool,
}

#[async_trait]
impl FeedConnection for SimConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    async fn subscribe(
        &self,
        channel: ChannelSpec,
        on_event: EventCallback,
    ) -> Result<Box<dyn FeedSubscription>, FeedError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(FeedError::Disconnected);
        }
        self.state.delay().await;
        self.state.subscribe_calls.fetch_add(1, Ordering::SeqCst);

        let refused = self
            .state
            .failing_channels
            .lock()
            .map(|failing| failing.contains(&channel))
            .unwrap_or(false);
        if refused {
            return Err(FeedError::Subscribe {
                channel: channel.to_channel_string(),
                reason: "simulated refusal".to_string(),
            });
        }

        let id = SubscriptionId::new();
        self.state
            .routes
            .entry(channel.clone())
            .or_default()
            .push(Route {
                id,
                callback: on_event,
            });
        Ok(Box::new(SimSubscription {
            id,
            channel,
            state: Arc::clone(&self.state),
            closed: AtomicBool::new(false),
        }))
    }

    async fn close(&self) -> Result<(), FeedError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.state.connections_closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

struct SimSubscription {
    id: SubscriptionId,
    channel: ChannelSpec,
    state: Arc<SimState>,
    closed: AtomicBool,
}

#[async_trait]
impl FeedSubscription for SimSubscription {
    fn id(&self) -> SubscriptionId {
        self.id
    }

    fn channel(&self) -> &ChannelSpec {
        &self.channel
    }

    async fn close(&self) -> Result<(), FeedError> {
        self.state.delay().await;
        // Delivery stops even when the close is reported as failed.
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.state.remove_route(&self.channel, self.id);
        }
        if self.state.fail_close.load(Ordering::SeqCst) {
            return Err(FeedError::Close {
                reason: format!("simulated failure closing {}", self.channel),
            });
        }
        Ok(())
    }
}
