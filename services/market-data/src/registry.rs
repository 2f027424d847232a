//! Subscription registry
//!
//! Maps each symbol to at most one [`StreamGroup`] and drives its
//! lifecycle:
//!
//! ```text
//!   None ──subscribe──▶ Subscribing ──ok──▶ Active ──unsubscribe──▶ Unsubscribing ──▶ None
//!                            │
//!                            └──failure──▶ None
//! ```
//!
//! Every transition for a symbol runs while holding that symbol's slot
//! lock, so concurrent callers on one symbol are serialised and callers on
//! different symbols never wait on each other. Transitions run on their
//! own task: a caller that stops waiting cannot leave a half-opened or
//! half-closed group behind.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use types::ids::Symbol;
use types::interval::Interval;

use crate::feed::{FeedCredentials, MarketFeed};
use crate::ingestion::FeedIngestor;
use crate::metrics::ServiceMetrics;
use crate::stream_group::{CadenceClass, CandleAdd, StreamChannel, StreamGroup};

/// Lifecycle state of a symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SymbolState {
    None = 0,
    Subscribing = 1,
    Active = 2,
    Unsubscribing = 3,
}

impl SymbolState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => SymbolState::Subscribing,
            2 => SymbolState::Active,
            3 => SymbolState::Unsubscribing,
            _ => SymbolState::None,
        }
    }
}

/// Outcome for one requested candle interval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntervalOutcome {
    Subscribed,
    AlreadyActive,
    Failed(String),
}

impl IntervalOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, IntervalOutcome::Failed(_))
    }
}

/// Per-interval result of a candle subscription request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandleSubscribeReport {
    pub symbol: Symbol,
    /// False when the symbol had no active group; nothing was attempted.
    pub group_found: bool,
    pub intervals: BTreeMap<Interval, IntervalOutcome>,
}

impl CandleSubscribeReport {
    fn no_group(symbol: Symbol) -> Self {
        Self {
            symbol,
            group_found: false,
            intervals: BTreeMap::new(),
        }
    }

    /// True if the group exists and every interval is subscribed.
    pub fn all_succeeded(&self) -> bool {
        self.group_found && self.intervals.values().all(IntervalOutcome::is_success)
    }

    pub fn failed_intervals(&self) -> Vec<Interval> {
        self.intervals
            .iter()
            .filter(|(_, outcome)| !outcome.is_success())
            .map(|(interval, _)| *interval)
            .collect()
    }
}

struct SymbolSlot {
    state: AtomicU8,
    group: Arc<Mutex<Option<StreamGroup>>>,
}

impl SymbolSlot {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(SymbolState::None as u8),
            group: Arc::new(Mutex::new(None)),
        }
    }

    fn state(&self) -> SymbolState {
        SymbolState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: SymbolState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

/// Owns every stream group, keyed by symbol.
pub struct SubscriptionRegistry {
    feed: Arc<dyn MarketFeed>,
    credentials: FeedCredentials,
    ingestor: Arc<FeedIngestor>,
    metrics: Arc<ServiceMetrics>,
    slots: DashMap<Symbol, Arc<SymbolSlot>>,
    closed: AtomicBool,
}

impl SubscriptionRegistry {
    pub fn new(
        feed: Arc<dyn MarketFeed>,
        credentials: FeedCredentials,
        ingestor: Arc<FeedIngestor>,
        metrics: Arc<ServiceMetrics>,
    ) -> Self {
        Self {
            feed,
            credentials,
            ingestor,
            metrics,
            slots: DashMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn slot(&self, symbol: &Symbol) -> Option<Arc<SymbolSlot>> {
        self.slots.get(symbol).map(|entry| Arc::clone(entry.value()))
    }

    /// Drop the slot for `symbol` once it is idle and unreferenced.
    ///
    /// Runs under the shard write lock, so nobody can clone the slot
    /// concurrently; a strong count of one means no caller is waiting on
    /// its mutex.
    fn prune_slot(&self, symbol: &Symbol) {
        self.slots.remove_if(symbol, |_, slot| {
            Arc::strong_count(slot) == 1 && slot.state() == SymbolState::None
        });
    }

    fn slot_or_create(&self, symbol: &Symbol) -> Arc<SymbolSlot> {
        Arc::clone(
            self.slots
                .entry(symbol.clone())
                .or_insert_with(|| Arc::new(SymbolSlot::new()))
                .value(),
        )
    }

    /// Ensure a stream group exists for `symbol` with its ticker channel.
    ///
    /// Returns true if the group exists on return, whether created now or
    /// already present. Concurrent calls for one symbol create at most one
    /// group.
    pub async fn subscribe(&self, symbol: &Symbol) -> bool {
        if self.is_closed() {
            warn!(symbol = %symbol, "Subscribe rejected: registry stopped");
            return false;
        }

        let slot = self.slot_or_create(symbol);
        let guard = Arc::clone(&slot.group).lock_owned().await;
        if guard.is_some() {
            debug!(symbol = %symbol, "Stream group already active");
            return true;
        }
        if self.is_closed() {
            warn!(symbol = %symbol, "Subscribe rejected: registry stopped");
            drop(guard);
            drop(slot);
            self.prune_slot(symbol);
            return false;
        }

        let feed = Arc::clone(&self.feed);
        let credentials = self.credentials.clone();
        let ingestor = Arc::clone(&self.ingestor);
        let metrics = Arc::clone(&self.metrics);
        let sym = symbol.clone();
        let transition = async move {
            let mut guard = guard;
            slot.set_state(SymbolState::Subscribing);
            match StreamGroup::open(sym.clone(), &*feed, &credentials, &ingestor).await {
                Ok(group) => {
                    *guard = Some(group);
                    slot.set_state(SymbolState::Active);
                    metrics.record_group_opened();
                    true
                }
                Err(err) => {
                    slot.set_state(SymbolState::None);
                    metrics.record_subscribe_failure();
                    warn!(symbol = %sym, error = %err, "Failed to open stream group");
                    false
                }
            }
        };
        let opened = run_transition(symbol, "subscribe", transition)
            .await
            .unwrap_or(false);
        if !opened {
            self.prune_slot(symbol);
        }
        opened
    }

    /// Add candle channels to an existing group. True only if every
    /// interval ends up subscribed.
    pub async fn subscribe_candles(
        &self,
        symbol: &Symbol,
        short_intervals: &[Interval],
        long_intervals: &[Interval],
    ) -> bool {
        self.subscribe_candles_detailed(symbol, short_intervals, long_intervals)
            .await
            .all_succeeded()
    }

    /// Add candle channels, reporting the outcome of each interval.
    ///
    /// Short intervals share the short-horizon connection and long
    /// intervals share the long-horizon connection. A failed interval does
    /// not stop the rest and does not roll back those that succeeded.
    pub async fn subscribe_candles_detailed(
        &self,
        symbol: &Symbol,
        short_intervals: &[Interval],
        long_intervals: &[Interval],
    ) -> CandleSubscribeReport {
        let Some(slot) = self.slot(symbol) else {
            warn!(symbol = %symbol, "Candle subscribe without stream group");
            return CandleSubscribeReport::no_group(symbol.clone());
        };
        let guard = Arc::clone(&slot.group).lock_owned().await;
        if guard.is_none() {
            warn!(symbol = %symbol, "Candle subscribe without stream group");
            drop(guard);
            drop(slot);
            self.prune_slot(symbol);
            return CandleSubscribeReport::no_group(symbol.clone());
        }

        // One attempt per interval; the first class listing it wins.
        let mut seen = BTreeSet::new();
        let requests: Vec<(CadenceClass, Interval)> = short_intervals
            .iter()
            .map(|i| (CadenceClass::ShortHorizon, *i))
            .chain(long_intervals.iter().map(|i| (CadenceClass::LongHorizon, *i)))
            .filter(|(class, interval)| {
                let first = seen.insert(*interval);
                if !first {
                    debug!(
                        symbol = %symbol,
                        interval = %interval,
                        class = %class,
                        "Ignoring repeated candle interval"
                    );
                }
                first
            })
            .collect();
        let feed = Arc::clone(&self.feed);
        let credentials = self.credentials.clone();
        let ingestor = Arc::clone(&self.ingestor);
        let metrics = Arc::clone(&self.metrics);
        let sym = symbol.clone();

        let transition = async move {
            let mut guard = guard;
            let mut report = CandleSubscribeReport {
                symbol: sym.clone(),
                group_found: true,
                intervals: BTreeMap::new(),
            };
            let Some(group) = guard.as_mut() else {
                return CandleSubscribeReport::no_group(sym);
            };

            for (class, interval) in requests {
                let outcome = match group
                    .add_candle(&*feed, &credentials, class, interval, &ingestor)
                    .await
                {
                    Ok(CandleAdd::Subscribed) => IntervalOutcome::Subscribed,
                    Ok(CandleAdd::AlreadyActive) => IntervalOutcome::AlreadyActive,
                    Err(err) => {
                        metrics.record_candle_subscribe_failure();
                        warn!(
                            symbol = %sym,
                            interval = %interval,
                            class = %class,
                            error = %err,
                            "Candle subscription failed"
                        );
                        IntervalOutcome::Failed(err.to_string())
                    }
                };
                report.intervals.entry(interval).or_insert(outcome);
            }

            info!(
                symbol = %sym,
                requested = report.intervals.len(),
                failed = report.failed_intervals().len(),
                "Candle subscriptions updated"
            );
            report
        };

        run_transition(symbol, "subscribe_candles", transition)
            .await
            .unwrap_or_else(|| CandleSubscribeReport::no_group(symbol.clone()))
    }

    /// Tear down the group for `symbol`. Cached snapshots are kept.
    ///
    /// Returns false if there was no group.
    pub async fn unsubscribe(&self, symbol: &Symbol) -> bool {
        let Some(slot) = self.slot(symbol) else {
            debug!(symbol = %symbol, "Unsubscribe for unknown symbol");
            return false;
        };
        let guard = Arc::clone(&slot.group).lock_owned().await;
        if guard.is_none() {
            debug!(symbol = %symbol, "Unsubscribe without stream group");
            drop(guard);
            drop(slot);
            self.prune_slot(symbol);
            return false;
        }

        let metrics = Arc::clone(&self.metrics);
        let transition = async move {
            let mut guard = guard;
            let Some(group) = guard.take() else {
                return false;
            };
            slot.set_state(SymbolState::Unsubscribing);
            let report = group.shutdown().await;
            metrics.record_group_closed(report.close_failures as u64);
            slot.set_state(SymbolState::None);
            true
        };
        let closed = run_transition(symbol, "unsubscribe", transition)
            .await
            .unwrap_or(false);
        self.prune_slot(symbol);
        closed
    }

    /// Stop accepting subscribes and tear down every group concurrently.
    ///
    /// Returns the number of groups torn down.
    pub async fn stop_all(&self) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        let symbols: Vec<Symbol> = self.slots.iter().map(|e| e.key().clone()).collect();
        let results = join_all(symbols.iter().map(|symbol| self.unsubscribe(symbol))).await;
        let stopped = results.into_iter().filter(|closed| *closed).count();
        info!(groups = stopped, "Subscription registry stopped");
        stopped
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Current lifecycle state of `symbol`; lock-free.
    pub fn symbol_state(&self, symbol: &Symbol) -> SymbolState {
        self.slot(symbol)
            .map(|slot| slot.state())
            .unwrap_or(SymbolState::None)
    }

    /// Symbols the registry currently holds a slot for, in any state.
    pub fn tracked_symbols(&self) -> usize {
        self.slots.len()
    }

    /// Symbols whose group is active, sorted.
    pub fn active_symbols(&self) -> Vec<Symbol> {
        let mut symbols: Vec<Symbol> = self
            .slots
            .iter()
            .filter(|entry| entry.value().state() == SymbolState::Active)
            .map(|entry| entry.key().clone())
            .collect();
        symbols.sort();
        symbols
    }

    /// Channels held by the group for `symbol`. Waits for any in-flight
    /// transition on that symbol.
    pub async fn channels(&self, symbol: &Symbol) -> Vec<StreamChannel> {
        let Some(slot) = self.slot(symbol) else {
            return Vec::new();
        };
        let guard = slot.group.lock().await;
        guard.as_ref().map(StreamGroup::channels).unwrap_or_default()
    }
}

/// Run a lifecycle transition to completion on its own task.
async fn run_transition<T, F>(symbol: &Symbol, op: &'static str, transition: F) -> Option<T>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::spawn(transition).await {
        Ok(value) => Some(value),
        Err(err) => {
            error!(symbol = %symbol, op, error = %err, "Registry transition aborted");
            None
        }
    }
}
