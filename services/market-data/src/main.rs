use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use market_data::clock::SystemClock;
use market_data::config::ServiceConfig;
use market_data::dispatcher::ConsumerFilter;
use market_data::feed::simulated::SimulatedFeed;
use market_data::MarketDataService;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = ServiceConfig::from_env().context("invalid market data configuration")?;
    tracing::info!(
        version = market_data::SERVICE_VERSION,
        symbols = config.symbols.len(),
        "Starting Market Data service"
    );

    // Simulated feed until a real provider adapter is plugged in
    let feed = SimulatedFeed::new(config.symbols.clone());
    let walk = feed.spawn_random_walk(Duration::from_millis(500));

    let service = MarketDataService::new(&config, Arc::new(feed), Arc::new(SystemClock));
    if !service.spawn_sweeper(config.sweep_interval, config.sweep_max_age) {
        tracing::warn!("Running without a cache sweeper");
    }

    for symbol in &config.symbols {
        if !service.subscribe(symbol.as_str()).await {
            tracing::warn!(symbol = %symbol, "Initial subscribe failed");
            continue;
        }
        let report = service
            .subscribe_candles_detailed(
                symbol.as_str(),
                &config.short_intervals,
                &config.long_intervals,
            )
            .await;
        if !report.all_succeeded() {
            tracing::warn!(
                symbol = %symbol,
                failed = ?report.failed_intervals(),
                "Some candle subscriptions failed"
            );
        }
    }

    let mut updates = service.updates(ConsumerFilter::All);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown signal received");
                break;
            }
            update = updates.recv() => match update {
                Some(update) => tracing::debug!(
                    symbol = %update.symbol(),
                    kind = update.kind_label(),
                    "Cache update"
                ),
                None => break,
            },
        }
    }

    walk.abort();
    let metrics = service.metrics().export();
    service.shutdown().await;
    tracing::info!(?metrics, "Market Data service stopped");

    Ok(())
}
