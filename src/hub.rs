use anyhow::{Context, Result};
use dashmap::DashMap;
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{CacheCounts, StateCache};
use crate::config::Config;
use crate::demand::{DemandCounts, DemandTracker};
use crate::feeds::{
    binance::BinanceAdapter, bitunix::BitunixAdapter, blofin::BlofinAdapter, bybit::BybitAdapter,
    hyperliquid::HyperliquidAdapter, ExchangeAdapter,
};
use crate::limits::{RateLimitCoordinator, RateLimitSnapshot, RequestDeduplicator};
use crate::models::candle::{one_minute_token, Candle};
use crate::models::event::{
    Channel, ClientRequest, EventData, ExchangeSummary, MarketEvent, PushMessage, StatusEvent,
};
use crate::models::market::{Instrument, Liquidation, Trade};
use crate::poller::RestPoller;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Cached klines below this depth trigger a REST backfill on read.
const KLINE_FALLBACK_MIN: usize = 50;
const KLINE_FETCH_LIMIT: usize = 200;

struct SubHandle {
    channel: Channel,
    exchange: String,
    /// Symbol as the cache sees it (compound `SYM:interval` for klines).
    symbol: String,
    base_symbol: String,
    interval: Option<String>,
    cache_id: u64,
}

struct ClientState {
    tx: mpsc::Sender<PushMessage>,
    subs: HashMap<String, SubHandle>,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: &'static str,
    pub ready: bool,
    pub uptime: u64,
    pub exchanges: BTreeMap<String, ExchangeHealth>,
    pub clients: usize,
    pub cache: CacheCounts,
    pub demand_tracker: DemandCounts,
    pub rate_limits: HashMap<String, RateLimitSnapshot>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeHealth {
    pub connected: bool,
    pub symbols: usize,
    pub last_update: i64,
    pub cache: usize,
}

/// Owner and wiring point for the whole hub: adapters feed the cache, the
/// cache fans out to per-client push channels, the demand tracker turns
/// client interest into upstream subscriptions, and the poller keeps
/// slow-moving data warm.
pub struct Hub {
    config: Config,
    cache: Arc<StateCache>,
    limits: Arc<RateLimitCoordinator>,
    dedup: Arc<RequestDeduplicator>,
    adapters: HashMap<&'static str, Arc<dyn ExchangeAdapter>>,
    poller: Arc<RestPoller>,
    demand: Arc<DemandTracker>,
    clients: DashMap<Uuid, ClientState>,
    ready: AtomicBool,
    started_at: std::time::Instant,
    shutdown: broadcast::Sender<()>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<MarketEvent>>>,
    status_rx: Mutex<Option<mpsc::UnboundedReceiver<StatusEvent>>>,
}

impl Hub {
    /// Build the hub with the standard adapter set.
    pub fn new(config: Config) -> Arc<Self> {
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(4)
            .tcp_keepalive(Some(Duration::from_secs(30)))
            .timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to build HTTP client");

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = mpsc::unbounded_channel();

        let mut adapters: HashMap<&'static str, Arc<dyn ExchangeAdapter>> = HashMap::new();
        adapters.insert(
            crate::feeds::bybit::NAME,
            Arc::new(BybitAdapter::new(
                &config.bybit,
                &config.hub,
                http.clone(),
                events_tx.clone(),
                status_tx.clone(),
            )),
        );
        adapters.insert(
            crate::feeds::blofin::NAME,
            Arc::new(BlofinAdapter::new(
                &config.blofin,
                &config.hub,
                http.clone(),
                events_tx.clone(),
                status_tx.clone(),
            )),
        );
        adapters.insert(
            crate::feeds::bitunix::NAME,
            Arc::new(BitunixAdapter::new(
                &config.bitunix,
                &config.hub,
                http.clone(),
                events_tx.clone(),
                status_tx.clone(),
            )),
        );
        adapters.insert(
            crate::feeds::hyperliquid::NAME,
            Arc::new(HyperliquidAdapter::new(
                &config.hyperliquid,
                &config.hub,
                http.clone(),
                events_tx.clone(),
                status_tx.clone(),
            )),
        );
        adapters.insert(
            crate::feeds::binance::NAME,
            Arc::new(BinanceAdapter::new(
                &config.binance,
                &config.hub,
                http.clone(),
                events_tx.clone(),
                status_tx.clone(),
            )),
        );

        Self::assemble(config, http, adapters, events_rx, status_rx)
    }

    /// Build the hub around caller-provided adapters. Used by tests.
    pub fn with_adapters(
        config: Config,
        adapters: HashMap<&'static str, Arc<dyn ExchangeAdapter>>,
        events_rx: mpsc::UnboundedReceiver<MarketEvent>,
        status_rx: mpsc::UnboundedReceiver<StatusEvent>,
    ) -> Arc<Self> {
        let http = reqwest::Client::new();
        Self::assemble(config, http, adapters, events_rx, status_rx)
    }

    fn assemble(
        config: Config,
        http: reqwest::Client,
        adapters: HashMap<&'static str, Arc<dyn ExchangeAdapter>>,
        events_rx: mpsc::UnboundedReceiver<MarketEvent>,
        status_rx: mpsc::UnboundedReceiver<StatusEvent>,
    ) -> Arc<Self> {
        let cache = Arc::new(StateCache::new(&config.hub));
        let limits = Arc::new(RateLimitCoordinator::new(
            Duration::from_secs(config.hub.rate_limit_window_secs),
            Duration::from_secs(config.hub.rate_limit_backoff_secs),
        ));
        let poller = Arc::new(RestPoller::new(
            config.clone(),
            http,
            cache.clone(),
            limits.clone(),
        ));
        let demand = Arc::new(DemandTracker::new(
            adapters.clone(),
            Duration::from_secs(config.hub.cleanup_delay_secs),
        ));
        let (shutdown, _) = broadcast::channel(1);

        Arc::new(Self {
            config,
            cache,
            limits,
            dedup: Arc::new(RequestDeduplicator::new()),
            adapters,
            poller,
            demand,
            clients: DashMap::new(),
            ready: AtomicBool::new(false),
            started_at: std::time::Instant::now(),
            shutdown,
            events_rx: Mutex::new(Some(events_rx)),
            status_rx: Mutex::new(Some(status_rx)),
        })
    }

    /// Bring the hub up: wire dispatch, connect adapters, warm caches, seed
    /// hot sets, start periodic work. Ready when at least one exchange is up.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.spawn_dispatch()?;
        self.spawn_status_fanout()?;

        // Connect everything concurrently; stragglers get cut off at the
        // startup budget and keep reconnecting in the background.
        let connect_budget = Duration::from_secs(self.config.hub.adapter_connect_budget_secs);
        let connects = self.adapters.values().map(|adapter| {
            let adapter = adapter.clone();
            async move {
                if tokio::time::timeout(connect_budget, adapter.connect())
                    .await
                    .is_err()
                {
                    warn!("{} connect timed out", adapter.name());
                }
            }
        });
        let startup_budget = Duration::from_secs(self.config.hub.startup_budget_secs);
        if tokio::time::timeout(startup_budget, futures_util::future::join_all(connects))
            .await
            .is_err()
        {
            warn!("startup budget elapsed before every adapter settled");
        }

        // Blocking warm-up poll so first reads are served from cache.
        self.poller.poll_all().await;

        // Pin the busiest symbols per connected exchange.
        for (&name, adapter) in &self.adapters {
            if !adapter.is_connected() {
                continue;
            }
            let top = self
                .poller
                .top_symbols_by_volume(name, self.config.hub.hot_set_size);
            if top.is_empty() {
                continue;
            }
            self.warm_hot_klines(name, &top);
            self.demand.set_hot_symbols(name, top);
        }

        self.cache.start_sweeper(&self.shutdown);
        self.poller.start(&self.shutdown);

        let connected = self.connected_count();
        self.ready.store(connected > 0, Ordering::SeqCst);
        info!(
            "hub ready={} with {connected}/{} exchanges connected",
            connected > 0,
            self.adapters.len()
        );
        Ok(())
    }

    fn spawn_dispatch(self: &Arc<Self>) -> Result<()> {
        let mut events_rx = self
            .events_rx
            .lock()
            .take()
            .context("hub already started")?;
        let cache = self.cache.clone();
        let mut shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events_rx.recv() => {
                        let Some(event) = event else { break };
                        dispatch_event(&cache, event);
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
        Ok(())
    }

    fn spawn_status_fanout(self: &Arc<Self>) -> Result<()> {
        let mut status_rx = self
            .status_rx
            .lock()
            .take()
            .context("hub already started")?;
        let hub = self.clone();
        let mut shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    status = status_rx.recv() => {
                        let Some(status) = status else { break };
                        info!("{} connected={}", status.exchange, status.connected);
                        hub.broadcast(PushMessage::Status {
                            exchange: status.exchange.to_string(),
                            connected: status.connected,
                        });
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
        Ok(())
    }

    /// Backfill 1-minute klines for the first few hot symbols so early
    /// subscribers see a populated ring.
    fn warm_hot_klines(self: &Arc<Self>, exchange: &'static str, top: &[String]) {
        let warmup: Vec<String> = top
            .iter()
            .take(self.config.hub.hot_kline_warmup_size)
            .cloned()
            .collect();
        if warmup.is_empty() {
            return;
        }
        let hub = self.clone();
        tokio::spawn(async move {
            let interval = one_minute_token(exchange);
            for symbol in warmup {
                if let Err(e) = hub
                    .get_klines_with_fallback(exchange, &symbol, interval, KLINE_FETCH_LIMIT)
                    .await
                {
                    debug!("{exchange} kline warmup failed for {symbol}: {e}");
                }
            }
        });
    }

    // --- downstream clients ---

    /// Register a client push channel. The first frame is the hello with
    /// hub readiness and the exchange roster.
    pub fn add_client(&self, tx: mpsc::Sender<PushMessage>) -> Uuid {
        let id = Uuid::new_v4();
        let hello = PushMessage::Connected {
            hub_ready: self.ready.load(Ordering::SeqCst),
            exchanges: self.exchange_summaries(),
            ts: now_ms(),
        };
        let _ = tx.try_send(hello);
        self.clients.insert(
            id,
            ClientState {
                tx,
                subs: HashMap::new(),
            },
        );
        debug!("client {id} connected ({} total)", self.clients.len());
        id
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// One downstream JSON frame from a client.
    pub fn handle_client_message(self: &Arc<Self>, client_id: Uuid, text: &str) {
        let request: ClientRequest = match serde_json::from_str(text) {
            Ok(request) => request,
            Err(e) => {
                self.send_to(client_id, PushMessage::Error {
                    message: format!("bad request: {e}"),
                });
                return;
            }
        };
        match request {
            ClientRequest::Subscribe {
                exchange,
                channel,
                symbol,
            } => self.subscribe_client(client_id, &exchange, channel, &symbol),
            ClientRequest::Unsubscribe {
                exchange,
                channel,
                symbol,
            } => self.unsubscribe_client(client_id, &exchange, channel, &symbol),
            ClientRequest::Ping => {
                self.send_to(client_id, PushMessage::Pong { ts: now_ms() });
            }
        }
    }

    fn subscribe_client(self: &Arc<Self>, client_id: Uuid, exchange: &str, channel: Channel, symbol: &str) {
        if !self.adapters.contains_key(exchange) {
            self.send_to(client_id, PushMessage::Error {
                message: format!("unknown exchange {exchange}"),
            });
            return;
        }
        // Klines address the compound "SYM:interval".
        let (base_symbol, interval) = match channel {
            Channel::Klines => match symbol.split_once(':') {
                Some((base, interval)) => (base.to_string(), Some(interval.to_string())),
                None => {
                    self.send_to(client_id, PushMessage::Error {
                        message: "klines symbol must be SYMBOL:interval".to_string(),
                    });
                    return;
                }
            },
            _ => (symbol.to_string(), None),
        };

        let sub_key = format!("{channel}:{exchange}:{symbol}");
        let Some(mut client) = self.clients.get_mut(&client_id) else {
            return;
        };
        if client.subs.contains_key(&sub_key) {
            return; // duplicate subscribe is a no-op
        }

        let cache_id = self
            .cache
            .subscribe(channel, exchange, symbol, client.tx.clone());
        client.subs.insert(
            sub_key,
            SubHandle {
                channel,
                exchange: exchange.to_string(),
                symbol: symbol.to_string(),
                base_symbol: base_symbol.clone(),
                interval: interval.clone(),
                cache_id,
            },
        );
        drop(client);

        self.demand
            .subscribe(exchange, &base_symbol, channel, interval.as_deref());
    }

    fn unsubscribe_client(self: &Arc<Self>, client_id: Uuid, exchange: &str, channel: Channel, symbol: &str) {
        let sub_key = format!("{channel}:{exchange}:{symbol}");
        let Some(mut client) = self.clients.get_mut(&client_id) else {
            return;
        };
        let Some(handle) = client.subs.remove(&sub_key) else {
            return;
        };
        drop(client);
        self.release_subscription(&handle);
    }

    fn release_subscription(self: &Arc<Self>, handle: &SubHandle) {
        self.cache.unsubscribe(
            handle.channel,
            &handle.exchange,
            &handle.symbol,
            handle.cache_id,
        );
        self.demand.unsubscribe(
            &handle.exchange,
            &handle.base_symbol,
            handle.channel,
            handle.interval.as_deref(),
        );
    }

    /// Unwind everything a client holds and forget it.
    pub fn cleanup_client(self: &Arc<Self>, client_id: Uuid) {
        let Some((_, client)) = self.clients.remove(&client_id) else {
            return;
        };
        for handle in client.subs.values() {
            self.release_subscription(handle);
        }
        debug!("client {client_id} cleaned up ({} left)", self.clients.len());
    }

    /// Best-effort send; a closed channel marks the client dead.
    fn send_to(self: &Arc<Self>, client_id: Uuid, msg: PushMessage) {
        let dead = match self.clients.get(&client_id) {
            Some(client) => matches!(
                client.tx.try_send(msg),
                Err(mpsc::error::TrySendError::Closed(_))
            ),
            None => false,
        };
        if dead {
            self.cleanup_client(client_id);
        }
    }

    /// Status/admin fan-out to every client.
    pub fn broadcast(self: &Arc<Self>, msg: PushMessage) {
        let mut dead = Vec::new();
        for client in self.clients.iter() {
            if let Err(mpsc::error::TrySendError::Closed(_)) = client.tx.try_send(msg.clone()) {
                dead.push(*client.key());
            }
        }
        for id in dead {
            self.cleanup_client(id);
        }
    }

    // --- read surface ---

    /// Cached tickers for one exchange; empty-and-ready triggers one
    /// best-effort refresh first.
    pub async fn get_tickers(&self, exchange: &str) -> Value {
        let mut tickers = self.cache.all_tickers(exchange);
        if tickers.is_empty() && self.ready.load(Ordering::SeqCst) {
            if let Err(e) = self.poller.poll_exchange(exchange).await {
                warn!("{exchange} on-demand poll failed: {e:#}");
            }
            tickers = self.cache.all_tickers(exchange);
        }
        let map: serde_json::Map<String, Value> = tickers
            .into_iter()
            .map(|(symbol, ticker, stale)| (symbol, with_stale(&ticker, stale)))
            .collect();
        Value::Object(map)
    }

    pub fn get_ticker(&self, exchange: &str, symbol: &str) -> Option<Value> {
        self.cache
            .get_ticker(exchange, symbol)
            .map(|(ticker, stale)| with_stale(&ticker, stale))
    }

    pub fn get_orderbook(&self, exchange: &str, symbol: &str) -> Option<Value> {
        self.cache
            .get_orderbook(exchange, symbol)
            .map(|(book, stale)| with_stale(&book, stale))
    }

    pub fn get_trades(&self, exchange: &str, symbol: &str, limit: Option<usize>) -> Vec<Trade> {
        self.cache.get_trades(exchange, symbol, limit)
    }

    pub fn get_instruments(&self, exchange: &str) -> Vec<Instrument> {
        self.cache.get_instruments(exchange)
    }

    pub fn get_funding(&self, exchange: &str) -> Value {
        let map: serde_json::Map<String, Value> = self
            .cache
            .all_funding(exchange)
            .into_iter()
            .map(|(symbol, funding, stale)| (symbol, with_stale(&funding, stale)))
            .collect();
        Value::Object(map)
    }

    pub fn get_open_interest(&self, exchange: &str, symbol: &str) -> Option<Value> {
        self.cache
            .get_open_interest(exchange, symbol)
            .map(|(oi, stale)| with_stale(&oi, stale))
    }

    pub fn get_liquidations(
        &self,
        exchange: &str,
        symbol: &str,
        limit: Option<usize>,
    ) -> Vec<Liquidation> {
        self.cache.get_liquidations(exchange, symbol, limit)
    }

    /// Serve klines from cache when the ring is deep enough; otherwise pull
    /// once over REST, deduplicated across concurrent callers.
    pub async fn get_klines_with_fallback(
        &self,
        exchange: &str,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> Result<Vec<Candle>> {
        let cached = self.cache.get_klines(exchange, symbol, interval, Some(limit));
        if cached.len() >= KLINE_FALLBACK_MIN.min(limit) {
            return Ok(cached);
        }
        self.fetch_klines_dedup(exchange, symbol, interval, limit.max(KLINE_FETCH_LIMIT), None)
            .await
    }

    /// Forced historical pull, bypassing the cache-depth check.
    pub async fn fetch_klines_history(
        &self,
        exchange: &str,
        symbol: &str,
        interval: &str,
        before: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Candle>> {
        self.fetch_klines_dedup(exchange, symbol, interval, limit, before)
            .await
    }

    async fn fetch_klines_dedup(
        &self,
        exchange: &str,
        symbol: &str,
        interval: &str,
        limit: usize,
        before: Option<i64>,
    ) -> Result<Vec<Candle>> {
        let key = format!(
            "{exchange}:klines:{symbol}:{interval}:{}",
            before.unwrap_or(0)
        );
        let poller = self.poller.clone();
        let exchange = exchange.to_string();
        let symbol = symbol.to_string();
        let interval = interval.to_string();

        let value = self
            .dedup
            .execute(&key, move || {
                async move {
                    poller
                        .fetch_klines(&exchange, &symbol, &interval, limit, before)
                        .await
                        .map(|batch| serde_json::to_value(batch).unwrap_or_default())
                        .map_err(|e| format!("{e:#}"))
                }
                .boxed()
            })
            .await
            .map_err(anyhow::Error::msg)?;
        Ok(serde_json::from_value(value).unwrap_or_default())
    }

    // --- health ---

    fn connected_count(&self) -> usize {
        self.adapters.values().filter(|a| a.is_connected()).count()
    }

    fn exchange_summaries(&self) -> Vec<ExchangeSummary> {
        let mut summaries: Vec<ExchangeSummary> = self
            .adapters
            .values()
            .map(|adapter| ExchangeSummary {
                name: adapter.name().to_string(),
                connected: adapter.is_connected(),
                symbols: adapter.symbol_count(),
            })
            .collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        summaries
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Shared state cache, for collaborators that write their own feeds
    /// (news/volatility aggregators) and for tests.
    pub fn cache(&self) -> Arc<StateCache> {
        self.cache.clone()
    }

    pub fn health(&self) -> HealthReport {
        let connected = self.connected_count();
        let status = if connected == self.adapters.len() && connected > 0 {
            "healthy"
        } else if connected > 0 {
            "degraded"
        } else {
            "down"
        };
        let exchanges = self
            .adapters
            .iter()
            .map(|(&name, adapter)| {
                (
                    name.to_string(),
                    ExchangeHealth {
                        connected: adapter.is_connected(),
                        symbols: adapter.symbol_count(),
                        last_update: adapter.last_update_ms(),
                        cache: self.cache.ticker_count(name),
                    },
                )
            })
            .collect();
        HealthReport {
            status,
            ready: self.ready.load(Ordering::SeqCst),
            uptime: self.started_at.elapsed().as_secs(),
            exchanges,
            clients: self.clients.len(),
            cache: self.cache.counts(),
            demand_tracker: self.demand.counts(),
            rate_limits: self.limits.snapshot(),
            timestamp: now_ms(),
        }
    }

    /// Tear everything down: periodic tasks, pending timers, sockets,
    /// clients. In-flight REST calls finish on their own and are ignored.
    pub fn stop(&self) {
        info!("hub stopping");
        let _ = self.shutdown.send(());
        self.demand.destroy();
        for adapter in self.adapters.values() {
            adapter.close();
        }
        self.clients.clear();
        self.ready.store(false, Ordering::SeqCst);
    }
}

/// Route one canonical event into the cache.
fn dispatch_event(cache: &StateCache, event: MarketEvent) {
    match event.data {
        EventData::Ticker(ticker) => cache.set_ticker(event.exchange, &event.symbol, &ticker),
        EventData::Orderbook(update) => {
            if update.snapshot {
                cache.set_orderbook(event.exchange, &event.symbol, &update);
            } else {
                cache.update_orderbook(event.exchange, &event.symbol, &update);
            }
        }
        EventData::Trades(trades) => cache.add_trades(event.exchange, &event.symbol, trades),
        EventData::Liquidation(liq) => cache.add_liquidation(event.exchange, &event.symbol, liq),
        EventData::Kline(candle) => {
            if let Some(interval) = event.interval.as_deref() {
                cache.update_kline(event.exchange, &event.symbol, interval, candle);
            }
        }
        EventData::Funding(funding) => cache.set_funding(event.exchange, &event.symbol, funding),
        EventData::OpenInterest(oi) => {
            cache.set_open_interest(event.exchange, &event.symbol, oi)
        }
    }
}

fn with_stale<T: serde::Serialize>(value: &T, stale: bool) -> Value {
    let mut v = serde_json::to_value(value).unwrap_or_default();
    if stale {
        if let Some(obj) = v.as_object_mut() {
            obj.insert("_stale".to_string(), Value::Bool(true));
        }
    }
    v
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HubConfig;
    use crate::models::event::BookUpdate;
    use crate::models::market::Ticker;
    use rust_decimal_macros::dec;

    fn event(channel: Channel, symbol: &str, data: EventData) -> MarketEvent {
        MarketEvent {
            exchange: "bybit",
            channel,
            symbol: symbol.to_string(),
            interval: None,
            data,
        }
    }

    #[test]
    fn test_dispatch_routes_ticker_merge() {
        let cache = StateCache::new(&HubConfig::default());
        dispatch_event(
            &cache,
            event(
                Channel::Tickers,
                "BTCUSDT",
                EventData::Ticker(Ticker {
                    last_price: Some(100.0),
                    ..Default::default()
                }),
            ),
        );
        dispatch_event(
            &cache,
            event(
                Channel::Tickers,
                "BTCUSDT",
                EventData::Ticker(Ticker {
                    funding_rate: Some(0.0001),
                    ..Default::default()
                }),
            ),
        );
        let (ticker, _) = cache.get_ticker("bybit", "BTCUSDT").unwrap();
        assert_eq!(ticker.last_price, Some(100.0));
        assert_eq!(ticker.funding_rate, Some(0.0001));
    }

    #[test]
    fn test_dispatch_orderbook_snapshot_vs_delta() {
        let cache = StateCache::new(&HubConfig::default());
        dispatch_event(
            &cache,
            event(
                Channel::Orderbook,
                "BTCUSDT",
                EventData::Orderbook(BookUpdate {
                    bids: vec![(dec!(99), dec!(1))],
                    asks: vec![(dec!(101), dec!(1))],
                    snapshot: true,
                    update_id: None,
                    cross_seq: None,
                    timestamp: 1,
                }),
            ),
        );
        dispatch_event(
            &cache,
            event(
                Channel::Orderbook,
                "BTCUSDT",
                EventData::Orderbook(BookUpdate {
                    bids: vec![(dec!(98), dec!(2))],
                    asks: vec![],
                    snapshot: false,
                    update_id: None,
                    cross_seq: None,
                    timestamp: 2,
                }),
            ),
        );
        let (book, _) = cache.get_orderbook("bybit", "BTCUSDT").unwrap();
        // the delta merged instead of replacing
        assert_eq!(book.bids.len(), 2);
        assert_eq!(book.asks.len(), 1);
    }

    #[test]
    fn test_dispatch_kline_requires_interval() {
        let cache = StateCache::new(&HubConfig::default());
        let candle = Candle {
            t: 60_000,
            o: 1.0,
            h: 1.0,
            l: 1.0,
            c: 1.0,
            v: 1.0,
            closed: Some(true),
        };
        // no interval: dropped rather than cached under a broken key
        dispatch_event(&cache, event(Channel::Klines, "BTCUSDT", EventData::Kline(candle)));
        assert!(cache.get_klines("bybit", "BTCUSDT", "1", None).is_empty());

        let mut ev = event(Channel::Klines, "BTCUSDT", EventData::Kline(candle));
        ev.interval = Some("1".to_string());
        dispatch_event(&cache, ev);
        assert_eq!(cache.get_klines("bybit", "BTCUSDT", "1", None).len(), 1);
    }

    #[test]
    fn test_with_stale_marker() {
        let ticker = Ticker {
            last_price: Some(1.0),
            ..Default::default()
        };
        let fresh = with_stale(&ticker, false);
        assert!(fresh.get("_stale").is_none());
        let stale = with_stale(&ticker, true);
        assert_eq!(stale["_stale"], Value::Bool(true));
    }
}
