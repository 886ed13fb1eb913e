use serde::{Deserialize, Serialize};

/// Exchanges the hub knows how to speak to, in connect order.
pub const EXCHANGES: [&str; 5] = ["bybit", "blofin", "bitunix", "hyperliquid", "binance"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub hub: HubConfig,
    pub bybit: ExchangeConfig,
    pub blofin: ExchangeConfig,
    pub bitunix: ExchangeConfig,
    pub hyperliquid: ExchangeConfig,
    pub binance: ExchangeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    pub ws_url: String,
    pub rest_url: String,
}

/// Scheduling and sizing knobs for the hub core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    pub poll_interval_secs: u64,      // REST refresh cadence
    pub stale_threshold_secs: u64,    // age at which reads carry a _stale marker
    pub sweep_ttl_secs: u64,          // age at which the sweeper deletes entries
    pub sweep_interval_secs: u64,     // sweeper cadence
    pub cleanup_delay_secs: u64,      // delayed-unsubscribe hysteresis
    pub hot_set_size: usize,          // top-N by turnover pinned upstream
    pub hot_kline_warmup_size: usize, // top-N symbols to pre-fetch 1m klines for
    pub trade_ring: usize,
    pub kline_ring: usize,
    pub liquidation_ring: usize,
    pub bitunix_sub_limit: usize,     // hard cap of topics per Bitunix socket
    pub bybit_liquidations_cap: usize,
    pub ping_interval_secs: u64,
    pub reconnect_cap_ms: u64,
    pub rate_limit_window_secs: u64,
    pub rate_limit_backoff_secs: u64,
    pub startup_budget_secs: u64,     // global deadline for the connect phase
    pub adapter_connect_budget_secs: u64,
    pub client_buffer: usize,         // bounded per-client outbound queue
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            stale_threshold_secs: 300,
            sweep_ttl_secs: 300,
            sweep_interval_secs: 600,
            cleanup_delay_secs: 60,
            hot_set_size: 30,
            hot_kline_warmup_size: 3,
            trade_ring: 100,
            kline_ring: 500,
            liquidation_ring: 100,
            bitunix_sub_limit: 300,
            bybit_liquidations_cap: 50,
            ping_interval_secs: 20,
            reconnect_cap_ms: 30_000,
            rate_limit_window_secs: 60,
            rate_limit_backoff_secs: 30,
            startup_budget_secs: 15,
            adapter_connect_budget_secs: 10,
            client_buffer: 256,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hub: HubConfig::default(),
            bybit: ExchangeConfig {
                ws_url: "wss://stream.bybit.com/v5/public/linear".into(),
                rest_url: "https://api.bybit.com".into(),
            },
            blofin: ExchangeConfig {
                ws_url: "wss://openapi.blofin.com/ws/public".into(),
                rest_url: "https://openapi.blofin.com".into(),
            },
            bitunix: ExchangeConfig {
                ws_url: "wss://fapi.bitunix.com/public/".into(),
                rest_url: "https://fapi.bitunix.com".into(),
            },
            hyperliquid: ExchangeConfig {
                ws_url: "wss://api.hyperliquid.xyz/ws".into(),
                rest_url: "https://api.hyperliquid.xyz".into(),
            },
            binance: ExchangeConfig {
                // combined-stream endpoint: frames arrive wrapped with their
                // stream name, which is what the adapter parses
                ws_url: "wss://fstream.binance.com/stream".into(),
                rest_url: "https://fapi.binance.com".into(),
            },
        }
    }
}

impl Config {
    /// Load configuration from environment variables (.env file) with defaults.
    ///
    /// Optional env vars:
    ///   HUB_POLL_INTERVAL_SECS - REST refresh cadence (default: 30)
    ///   HUB_HOT_SET_SIZE - pinned top-by-volume symbols per exchange (default: 30)
    ///   HUB_CLEANUP_DELAY_SECS - delayed-unsubscribe hysteresis (default: 60)
    ///   HUB_CLIENT_BUFFER - per-client outbound queue capacity (default: 256)
    ///   RUST_LOG - log filter (default: info)
    pub fn load_or_default() -> Self {
        let _ = dotenv::dotenv();

        let mut config = Self::default();

        if let Some(v) = env_parse("HUB_POLL_INTERVAL_SECS") {
            config.hub.poll_interval_secs = v;
        }
        if let Some(v) = env_parse("HUB_HOT_SET_SIZE") {
            config.hub.hot_set_size = v;
        }
        if let Some(v) = env_parse("HUB_CLEANUP_DELAY_SECS") {
            config.hub.cleanup_delay_secs = v;
        }
        if let Some(v) = env_parse("HUB_CLIENT_BUFFER") {
            config.hub.client_buffer = v;
        }
        if let Some(v) = env_parse("HUB_STALE_THRESHOLD_SECS") {
            config.hub.stale_threshold_secs = v;
            config.hub.sweep_ttl_secs = v;
        }
        if let Some(v) = env_parse("HUB_SWEEP_TTL_SECS") {
            config.hub.sweep_ttl_secs = v;
        }

        config
    }

    pub fn exchange(&self, name: &str) -> Option<&ExchangeConfig> {
        match name {
            "bybit" => Some(&self.bybit),
            "blofin" => Some(&self.blofin),
            "bitunix" => Some(&self.bitunix),
            "hyperliquid" => Some(&self.hyperliquid),
            "binance" => Some(&self.binance),
            _ => None,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.hub.poll_interval_secs > 0, "poll_interval_secs must be positive");
        anyhow::ensure!(self.hub.client_buffer > 0, "client_buffer must be positive");
        anyhow::ensure!(
            self.hub.sweep_ttl_secs >= self.hub.stale_threshold_secs,
            "sweep_ttl_secs must not be below stale_threshold_secs"
        );
        for name in EXCHANGES {
            let ex = self.exchange(name).expect("known exchange");
            anyhow::ensure!(
                ex.ws_url.starts_with("ws"),
                "{name} ws_url must be a websocket URL"
            );
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
