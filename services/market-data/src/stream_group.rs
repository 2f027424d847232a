//! Per-symbol stream group
//!
//! A stream group owns every feed resource for one symbol: at most one
//! connection per cadence class and at most one subscription per channel.
//! Channels are partitioned across connections so that a burst on one
//! cadence never delays delivery on another:
//!
//! ```text
//!   Ticker        ── ticker@SYM
//!   ShortHorizon  ── candles@SYM@1m, candles@SYM@5m, ...
//!   LongHorizon   ── candles@SYM@1h, candles@SYM@1d, ...
//! ```
//!
//! The group is plain data. Serialising access to it is the registry's job.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, info, warn};
use types::errors::FeedError;
use types::ids::Symbol;
use types::interval::Interval;

use crate::feed::{ChannelSpec, FeedConnection, FeedCredentials, FeedSubscription, MarketFeed};
use crate::ingestion::FeedIngestor;

/// Update cadence of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CadenceClass {
    Ticker,
    ShortHorizon,
    LongHorizon,
}

impl CadenceClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            CadenceClass::Ticker => "ticker",
            CadenceClass::ShortHorizon => "short_horizon",
            CadenceClass::LongHorizon => "long_horizon",
        }
    }
}

impl fmt::Display for CadenceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Channel kind held by a group. The symbol is implied by the group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StreamChannel {
    Ticker,
    Candle(Interval),
}

impl StreamChannel {
    fn spec(&self, symbol: &Symbol) -> ChannelSpec {
        match self {
            StreamChannel::Ticker => ChannelSpec::ticker(symbol.clone()),
            StreamChannel::Candle(interval) => ChannelSpec::candle(symbol.clone(), *interval),
        }
    }
}

/// Result of adding a candle channel to a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandleAdd {
    Subscribed,
    AlreadyActive,
}

/// Summary of a group teardown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub subscriptions_closed: usize,
    pub connections_closed: usize,
    pub close_failures: usize,
}

struct ActiveSubscription {
    class: CadenceClass,
    handle: Box<dyn FeedSubscription>,
}

/// Feed resources for one symbol.
pub struct StreamGroup {
    symbol: Symbol,
    connections: BTreeMap<CadenceClass, Box<dyn FeedConnection>>,
    subscriptions: BTreeMap<StreamChannel, ActiveSubscription>,
}

impl StreamGroup {
    /// Open the ticker connection and subscribe the ticker channel.
    ///
    /// If the subscription is refused the fresh connection is closed
    /// before the error is returned.
    pub async fn open(
        symbol: Symbol,
        feed: &dyn MarketFeed,
        credentials: &FeedCredentials,
        ingestor: &Arc<FeedIngestor>,
    ) -> Result<Self, FeedError> {
        let mut group = Self {
            symbol,
            connections: BTreeMap::new(),
            subscriptions: BTreeMap::new(),
        };
        group
            .add_channel(
                feed,
                credentials,
                CadenceClass::Ticker,
                StreamChannel::Ticker,
                ingestor,
            )
            .await?;
        info!(symbol = %group.symbol, "Stream group opened");
        Ok(group)
    }

    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    pub fn has_channel(&self, channel: StreamChannel) -> bool {
        self.subscriptions.contains_key(&channel)
    }

    /// Active channels in sorted order.
    pub fn channels(&self) -> Vec<StreamChannel> {
        self.subscriptions.keys().copied().collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Cadence class serving `channel`, if active.
    pub fn class_of(&self, channel: StreamChannel) -> Option<CadenceClass> {
        self.subscriptions.get(&channel).map(|s| s.class)
    }

    /// Subscribe a candle interval on the connection for `class`,
    /// opening that connection on first use.
    pub async fn add_candle(
        &mut self,
        feed: &dyn MarketFeed,
        credentials: &FeedCredentials,
        class: CadenceClass,
        interval: Interval,
        ingestor: &Arc<FeedIngestor>,
    ) -> Result<CandleAdd, FeedError> {
        let channel = StreamChannel::Candle(interval);
        if self.has_channel(channel) {
            return Ok(CandleAdd::AlreadyActive);
        }
        self.add_channel(feed, credentials, class, channel, ingestor)
            .await?;
        Ok(CandleAdd::Subscribed)
    }

    async fn add_channel(
        &mut self,
        feed: &dyn MarketFeed,
        credentials: &FeedCredentials,
        class: CadenceClass,
        channel: StreamChannel,
        ingestor: &Arc<FeedIngestor>,
    ) -> Result<(), FeedError> {
        if !self.connections.contains_key(&class) {
            let connection = feed.connect(credentials).await?;
            debug!(
                symbol = %self.symbol,
                class = %class,
                connection_id = %connection.id(),
                "Opened feed connection"
            );
            self.connections.insert(class, connection);
        }

        let spec = channel.spec(&self.symbol);
        let subscribed = match self.connections.get(&class) {
            Some(connection) => {
                connection
                    .subscribe(spec.clone(), ingestor.callback_for(spec.clone()))
                    .await
            }
            None => Err(FeedError::Disconnected),
        };

        match subscribed {
            Ok(handle) => {
                debug!(
                    symbol = %self.symbol,
                    channel = %spec,
                    subscription_id = %handle.id(),
                    "Channel subscribed"
                );
                self.subscriptions
                    .insert(channel, ActiveSubscription { class, handle });
                Ok(())
            }
            Err(err) => {
                self.release_idle_connection(class).await;
                Err(err)
            }
        }
    }

    /// Close and drop the connection for `class` if nothing uses it.
    async fn release_idle_connection(&mut self, class: CadenceClass) {
        let in_use = self.subscriptions.values().any(|s| s.class == class);
        if in_use {
            return;
        }
        if let Some(connection) = self.connections.remove(&class) {
            if let Err(err) = connection.close().await {
                warn!(
                    symbol = %self.symbol,
                    class = %class,
                    error = %err,
                    "Failed to release idle connection"
                );
            }
        }
    }

    /// Close every subscription, then every connection.
    ///
    /// Closes within each phase run concurrently. A failed close is logged
    /// and counted; it never stops the remaining closes.
    pub async fn shutdown(self) -> TeardownReport {
        let StreamGroup {
            symbol,
            connections,
            subscriptions,
        } = self;
        let mut report = TeardownReport::default();

        let sub_results = join_all(subscriptions.iter().map(|(channel, sub)| async move {
            (*channel, sub.handle.close().await)
        }))
        .await;
        for (channel, result) in sub_results {
            match result {
                Ok(()) => report.subscriptions_closed += 1,
                Err(err) => {
                    report.close_failures += 1;
                    warn!(
                        symbol = %symbol,
                        channel = %channel.spec(&symbol),
                        error = %err,
                        "Subscription close failed"
                    );
                }
            }
        }

        let conn_results = join_all(connections.iter().map(|(class, connection)| async move {
            (*class, connection.close().await)
        }))
        .await;
        for (class, result) in conn_results {
            match result {
                Ok(()) => report.connections_closed += 1,
                Err(err) => {
                    report.close_failures += 1;
                    warn!(
                        symbol = %symbol,
                        class = %class,
                        error = %err,
                        "Connection close failed"
                    );
                }
            }
        }

        info!(
            symbol = %symbol,
            subscriptions = report.subscriptions_closed,
            connections = report.connections_closed,
            failures = report.close_failures,
            "Stream group closed"
        );
        report
    }
}

impl fmt::Debug for StreamGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamGroup")
            .field("symbol", &self.symbol)
            .field("connections", &self.connections.keys().collect::<Vec<_>>())
            .field("channels", &self.subscriptions.keys().collect::<Vec<_>>())
            .finish()
    }
}
