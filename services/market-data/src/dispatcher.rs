//! Notification dispatcher
//!
//! Moves cache updates off the feed delivery path. The cache publishes on
//! a broadcast channel; one dispatcher task drains it and fans each update
//! out to the bounded queue of every matching consumer. Neither hop waits
//! on a consumer, so a slow consumer can only lose its own updates.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use types::ids::Symbol;

use crate::backpressure::{DropPolicy, Enqueued, SharedQueue};
use crate::cache::{CacheUpdate, SnapshotCache};
use crate::metrics::ServiceMetrics;

/// Consumer queue settings.
#[derive(Debug, Clone, Copy)]
pub struct DispatcherConfig {
    pub queue_capacity: usize,
    pub drop_policy: DropPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1000,
            drop_policy: DropPolicy::DropOldest,
        }
    }
}

/// Which updates a consumer receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerFilter {
    All,
    Symbols(BTreeSet<Symbol>),
}

impl ConsumerFilter {
    pub fn symbols(symbols: impl IntoIterator<Item = Symbol>) -> Self {
        ConsumerFilter::Symbols(symbols.into_iter().collect())
    }

    pub fn matches(&self, update: &CacheUpdate) -> bool {
        match self {
            ConsumerFilter::All => true,
            ConsumerFilter::Symbols(set) => set.contains(update.symbol()),
        }
    }
}

struct ConsumerEntry {
    filter: ConsumerFilter,
    queue: Arc<SharedQueue>,
}

type ConsumerMap = DashMap<u64, ConsumerEntry>;

/// Receiving end handed to a consumer.
///
/// Dropping it unregisters the consumer on the next dispatch.
pub struct UpdateStream {
    id: u64,
    queue: Arc<SharedQueue>,
}

impl UpdateStream {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next update, or None once the consumer was disconnected or the
    /// dispatcher stopped.
    pub async fn recv(&mut self) -> Option<CacheUpdate> {
        self.queue.pop().await
    }

    pub fn try_recv(&mut self) -> Option<CacheUpdate> {
        self.queue.try_pop()
    }

    /// Updates discarded by the drop-oldest policy.
    pub fn dropped(&self) -> u64 {
        self.queue.messages_dropped()
    }

    pub fn is_disconnected(&self) -> bool {
        self.queue.is_closed()
    }

    /// True while the consumer is falling behind: its queue filled up and
    /// has not yet drained below half capacity.
    pub fn is_lagging(&self) -> bool {
        self.queue.is_lagging()
    }
}

impl Drop for UpdateStream {
    fn drop(&mut self) {
        self.queue.abandon();
    }
}

/// Fans cache updates out to registered consumers.
pub struct NotificationDispatcher {
    consumers: Arc<ConsumerMap>,
    next_id: AtomicU64,
    config: DispatcherConfig,
    metrics: Arc<ServiceMetrics>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl NotificationDispatcher {
    /// Subscribe to `cache` updates and spawn the dispatch task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        cache: &SnapshotCache,
        config: DispatcherConfig,
        metrics: Arc<ServiceMetrics>,
    ) -> Self {
        let consumers: Arc<ConsumerMap> = Arc::new(DashMap::new());
        let task = tokio::spawn(dispatch_loop(
            cache.subscribe_updates(),
            Arc::clone(&consumers),
            Arc::clone(&metrics),
        ));
        info!(
            queue_capacity = config.queue_capacity,
            drop_policy = ?config.drop_policy,
            "Notification dispatcher started"
        );
        Self {
            consumers,
            next_id: AtomicU64::new(1),
            config,
            metrics,
            task: Mutex::new(Some(task)),
        }
    }

    /// Register a consumer with the configured queue settings.
    pub fn register(&self, filter: ConsumerFilter) -> UpdateStream {
        self.register_with(filter, self.config.queue_capacity, self.config.drop_policy)
    }

    pub fn register_with(
        &self,
        filter: ConsumerFilter,
        queue_capacity: usize,
        drop_policy: DropPolicy,
    ) -> UpdateStream {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(SharedQueue::new(queue_capacity, drop_policy));
        self.consumers.insert(
            id,
            ConsumerEntry {
                filter,
                queue: Arc::clone(&queue),
            },
        );
        self.metrics
            .set_connected_consumers(self.consumers.len() as u64);
        debug!(consumer_id = id, "Consumer registered");
        UpdateStream { id, queue }
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    /// Stop the dispatch task and end every consumer stream.
    pub fn shutdown(&self) {
        if let Ok(mut task) = self.task.lock() {
            if let Some(handle) = task.take() {
                handle.abort();
            }
        }
        for entry in self.consumers.iter() {
            entry.value().queue.close();
        }
        self.consumers.clear();
        self.metrics.set_connected_consumers(0);
        info!("Notification dispatcher stopped");
    }
}

impl Drop for NotificationDispatcher {
    fn drop(&mut self) {
        if let Ok(mut task) = self.task.lock() {
            if let Some(handle) = task.take() {
                handle.abort();
            }
        }
    }
}

async fn dispatch_loop(
    mut updates: broadcast::Receiver<CacheUpdate>,
    consumers: Arc<ConsumerMap>,
    metrics: Arc<ServiceMetrics>,
) {
    loop {
        match updates.recv().await {
            Ok(update) => dispatch(&consumers, &metrics, update),
            Err(RecvError::Lagged(skipped)) => {
                metrics.record_dispatcher_lag(skipped);
                warn!(skipped, "Dispatcher lagged behind cache updates");
            }
            Err(RecvError::Closed) => {
                debug!("Cache update channel closed");
                break;
            }
        }
    }
}

fn dispatch(consumers: &ConsumerMap, metrics: &ServiceMetrics, update: CacheUpdate) {
    let mut delivered = 0u64;
    let mut to_remove = Vec::new();

    for entry in consumers.iter() {
        let consumer = entry.value();
        if consumer.queue.is_abandoned() {
            to_remove.push(*entry.key());
            continue;
        }
        if !consumer.filter.matches(&update) {
            continue;
        }
        match consumer.queue.push(update.clone()) {
            Ok(Enqueued::Queued) => delivered += 1,
            Ok(Enqueued::DroppedOldest) => {
                delivered += 1;
                metrics.record_backpressure_drop();
            }
            Err(_) => {
                consumer.queue.close();
                metrics.record_consumer_disconnected();
                warn!(
                    consumer_id = *entry.key(),
                    symbol = %update.symbol(),
                    "Disconnecting lagging consumer"
                );
                to_remove.push(*entry.key());
            }
        }
    }

    if !to_remove.is_empty() {
        for id in to_remove {
            consumers.remove(&id);
        }
        metrics.set_connected_consumers(consumers.len() as u64);
    }
    metrics.record_dispatch(delivered);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::TickerSnapshot;
    use chrono::Utc;
    use rust_decimal::Decimal;
    use std::time::Duration;

    fn ticker(symbol: &str, price: i64) -> TickerSnapshot {
        TickerSnapshot {
            symbol: Symbol::new(symbol),
            last_price: Decimal::from(price),
            volume_24h: Decimal::ONE,
            price_change_24h: Decimal::ZERO,
            price_change_percent_24h: Decimal::ZERO,
            updated_at: Utc::now(),
        }
    }

    async fn recv_timeout(stream: &mut UpdateStream) -> Option<CacheUpdate> {
        tokio::time::timeout(Duration::from_secs(1), stream.recv())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn test_consumer_receives_puts() {
        let cache = SnapshotCache::with_defaults();
        let metrics = Arc::new(ServiceMetrics::new());
        let dispatcher =
            NotificationDispatcher::start(&cache, DispatcherConfig::default(), metrics);
        let mut stream = dispatcher.register(ConsumerFilter::All);

        cache.put_ticker(ticker("BTCUSDT", 100));

        let update = recv_timeout(&mut stream).await.unwrap();
        assert_eq!(update.symbol(), &Symbol::new("BTCUSDT"));
        assert_eq!(update.kind_label(), "ticker");
    }

    #[tokio::test]
    async fn test_symbol_filter() {
        let cache = SnapshotCache::with_defaults();
        let dispatcher = NotificationDispatcher::start(
            &cache,
            DispatcherConfig::default(),
            Arc::new(ServiceMetrics::new()),
        );
        let mut eth_only = dispatcher.register(ConsumerFilter::symbols([Symbol::new("ETHUSDT")]));

        cache.put_ticker(ticker("BTCUSDT", 100));
        cache.put_ticker(ticker("ETHUSDT", 5));

        let update = recv_timeout(&mut eth_only).await.unwrap();
        assert_eq!(update.symbol(), &Symbol::new("ETHUSDT"));
        assert!(eth_only.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_lagging_consumer_disconnected() {
        let cache = SnapshotCache::with_defaults();
        let metrics = Arc::new(ServiceMetrics::new());
        let dispatcher = NotificationDispatcher::start(
            &cache,
            DispatcherConfig::default(),
            Arc::clone(&metrics),
        );
        let mut slow =
            dispatcher.register_with(ConsumerFilter::All, 1, DropPolicy::Disconnect);

        cache.put_ticker(ticker("BTCUSDT", 1));
        cache.put_ticker(ticker("BTCUSDT", 2));

        // First update is still delivered, then the stream ends.
        assert!(recv_timeout(&mut slow).await.is_some());
        assert!(recv_timeout(&mut slow).await.is_none());
        assert!(slow.is_disconnected());
        assert_eq!(metrics.consumers_disconnected.load(Ordering::Relaxed), 1);
        assert_eq!(dispatcher.consumer_count(), 0);
    }

    #[tokio::test]
    async fn test_slow_consumer_reports_lagging() {
        let cache = SnapshotCache::with_defaults();
        let dispatcher = NotificationDispatcher::start(
            &cache,
            DispatcherConfig::default(),
            Arc::new(ServiceMetrics::new()),
        );
        let mut slow =
            dispatcher.register_with(ConsumerFilter::All, 4, DropPolicy::DropOldest);
        assert!(!slow.is_lagging());

        for price in 1..=5 {
            cache.put_ticker(ticker("BTCUSDT", price));
        }

        assert!(recv_timeout(&mut slow).await.is_some());
        assert!(slow.is_lagging());
        assert_eq!(slow.dropped(), 1);

        // Drains below half capacity.
        assert!(slow.try_recv().is_some());
        assert!(slow.is_lagging());
        assert!(slow.try_recv().is_some());
        assert!(!slow.is_lagging());
        assert!(!slow.is_disconnected());
    }

    #[tokio::test]
    async fn test_shutdown_ends_streams() {
        let cache = SnapshotCache::with_defaults();
        let dispatcher = NotificationDispatcher::start(
            &cache,
            DispatcherConfig::default(),
            Arc::new(ServiceMetrics::new()),
        );
        let mut stream = dispatcher.register(ConsumerFilter::All);

        dispatcher.shutdown();
        assert!(stream.recv().await.is_none());
        assert_eq!(dispatcher.consumer_count(), 0);
    }
}
