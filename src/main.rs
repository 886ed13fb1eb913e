#![allow(dead_code)]

mod cache;
mod config;
mod demand;
mod feeds;
mod hub;
mod limits;
mod models;
mod poller;

use crate::config::Config;
use crate::hub::Hub;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .init();

    info!("================================================");
    info!("  TICKERHUB - market data aggregation hub v0.1.0");
    info!("  bybit / blofin / bitunix / hyperliquid / binance");
    info!("================================================");

    let config = Config::load_or_default();
    if let Err(e) = config.validate() {
        error!("Config validation failed: {e}");
        return Err(e);
    }

    info!("--- Hub configuration ---");
    info!("  Poll interval:   {}s", config.hub.poll_interval_secs);
    info!("  Stale threshold: {}s", config.hub.stale_threshold_secs);
    info!("  Cleanup delay:   {}s", config.hub.cleanup_delay_secs);
    info!("  Hot set size:    {}", config.hub.hot_set_size);
    info!("  Client buffer:   {}", config.hub.client_buffer);

    let hub = Hub::new(config);
    hub.start().await?;

    // Periodic health line so operators can see the hub breathe.
    {
        let hub = hub.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(60));
            interval.tick().await; // skip the immediate tick
            loop {
                interval.tick().await;
                let health = hub.health();
                let connected: Vec<&str> = health
                    .exchanges
                    .iter()
                    .filter(|(_, ex)| ex.connected)
                    .map(|(name, _)| name.as_str())
                    .collect();
                info!(
                    "health: {} | connected=[{}] clients={} tickers={} subs={}",
                    health.status,
                    connected.join(","),
                    health.clients,
                    health.cache.tickers,
                    health.demand_tracker.total_subscriptions,
                );
            }
        });
    }

    info!("=== TICKERHUB running, press Ctrl+C to shut down ===");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received. Cleaning up...");

    hub.stop();
    info!("TICKERHUB shutdown complete.");
    Ok(())
}
