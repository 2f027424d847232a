//! Observability counters for the Market Data Service
//!
//! Lock-free counters updated from feed delivery paths, the registry and
//! the dispatcher. `export` renders them as a sorted map for
//! Prometheus-style exposition.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Core metrics for the Market Data Service.
#[derive(Debug, Default)]
pub struct ServiceMetrics {
    // Ingestion
    pub events_decoded: AtomicU64,
    pub decode_failures: AtomicU64,

    // Registry
    pub groups_opened: AtomicU64,
    pub groups_closed: AtomicU64,
    pub subscribe_failures: AtomicU64,
    pub candle_subscribe_failures: AtomicU64,
    pub close_failures: AtomicU64,

    // Dispatch
    pub updates_dispatched: AtomicU64,
    pub updates_dropped_backpressure: AtomicU64,
    pub consumers_disconnected: AtomicU64,
    pub dispatcher_lagged: AtomicU64,
    pub connected_consumers: AtomicU64,
}

impl ServiceMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_event_decoded(&self) {
        self.events_decoded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_group_opened(&self) {
        self.groups_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_group_closed(&self, close_failures: u64) {
        self.groups_closed.fetch_add(1, Ordering::Relaxed);
        self.close_failures.fetch_add(close_failures, Ordering::Relaxed);
    }

    pub fn record_subscribe_failure(&self) {
        self.subscribe_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_candle_subscribe_failure(&self) {
        self.candle_subscribe_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dispatch(&self, delivered: u64) {
        self.updates_dispatched.fetch_add(delivered, Ordering::Relaxed);
    }

    pub fn record_backpressure_drop(&self) {
        self.updates_dropped_backpressure.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_consumer_disconnected(&self) {
        self.consumers_disconnected.fetch_add(1, Ordering::Relaxed);
    }

    /// Updates the dispatcher skipped because it fell behind the cache.
    pub fn record_dispatcher_lag(&self, skipped: u64) {
        self.dispatcher_lagged.fetch_add(skipped, Ordering::Relaxed);
    }

    pub fn set_connected_consumers(&self, count: u64) {
        self.connected_consumers.store(count, Ordering::Relaxed);
    }

    /// Export metrics as a BTreeMap for Prometheus-style exposition.
    pub fn export(&self) -> BTreeMap<String, u64> {
        let mut m = BTreeMap::new();
        m.insert("events_decoded".to_string(), self.events_decoded.load(Ordering::Relaxed));
        m.insert("decode_failures".to_string(), self.decode_failures.load(Ordering::Relaxed));
        m.insert("groups_opened".to_string(), self.groups_opened.load(Ordering::Relaxed));
        m.insert("groups_closed".to_string(), self.groups_closed.load(Ordering::Relaxed));
        m.insert("subscribe_failures".to_string(), self.subscribe_failures.load(Ordering::Relaxed));
        m.insert(
            "candle_subscribe_failures".to_string(),
            self.candle_subscribe_failures.load(Ordering::Relaxed),
        );
        m.insert("close_failures".to_string(), self.close_failures.load(Ordering::Relaxed));
        m.insert("updates_dispatched".to_string(), self.updates_dispatched.load(Ordering::Relaxed));
        m.insert(
            "updates_dropped_backpressure".to_string(),
            self.updates_dropped_backpressure.load(Ordering::Relaxed),
        );
        m.insert(
            "consumers_disconnected".to_string(),
            self.consumers_disconnected.load(Ordering::Relaxed),
        );
        m.insert("dispatcher_lagged".to_string(), self.dispatcher_lagged.load(Ordering::Relaxed));
        m.insert(
            "connected_consumers".to_string(),
            self.connected_consumers.load(Ordering::Relaxed),
        );
        m
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_recording() {
        let metrics = ServiceMetrics::new();

        metrics.record_event_decoded();
        metrics.record_event_decoded();
        metrics.record_decode_failure();

        let exported = metrics.export();
        assert_eq!(exported["events_decoded"], 2);
        assert_eq!(exported["decode_failures"], 1);
    }

    #[test]
    fn test_group_close_accumulates_failures() {
        let metrics = ServiceMetrics::new();
        metrics.record_group_opened();
        metrics.record_group_closed(2);
        metrics.record_group_closed(0);

        let exported = metrics.export();
        assert_eq!(exported["groups_opened"], 1);
        assert_eq!(exported["groups_closed"], 2);
        assert_eq!(exported["close_failures"], 2);
    }

    #[test]
    fn test_dispatch_metrics_export() {
        let metrics = ServiceMetrics::new();
        metrics.record_dispatch(3);
        metrics.record_backpressure_drop();
        metrics.record_dispatcher_lag(10);
        metrics.set_connected_consumers(5);

        let exported = metrics.export();
        assert_eq!(exported["updates_dispatched"], 3);
        assert_eq!(exported["updates_dropped_backpressure"], 1);
        assert_eq!(exported["dispatcher_lagged"], 10);
        assert_eq!(exported["connected_consumers"], 5);
    }
}
