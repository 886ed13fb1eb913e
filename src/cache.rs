use dashmap::DashMap;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::HubConfig;
use crate::models::candle::Candle;
use crate::models::event::{BookUpdate, Channel, PushMessage};
use crate::models::market::{
    Funding, Instrument, Liquidation, OpenInterest, OrderBook, Ticker, Trade,
};

/// Synthetic symbol whose liquidation ring aggregates every symbol's events.
pub const ALL_SYMBOL: &str = "ALL";

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<PushMessage>,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheCounts {
    pub tickers: usize,
    pub orderbooks: usize,
    pub trades: usize,
    pub instruments: usize,
    pub funding: usize,
    pub open_interest: usize,
    pub klines: usize,
    pub liquidations: usize,
}

/// In-memory current state for everything the hub serves.
///
/// Collections are keyed `"{exchange}:{symbol}"` (klines add `:{interval}`).
/// Mutations never fail; missing keys read as `None`/empty. Each mutation
/// stamps `last_update` and pushes an update to the channel's subscribers.
///
/// Subscription contract: the current snapshot is captured and enqueued
/// before the subscriber joins the fan-out set, atomically with respect to
/// notifications for the same key, so a subscriber never observes an update
/// older than its snapshot.
pub struct StateCache {
    tickers: DashMap<String, Ticker>,
    orderbooks: DashMap<String, OrderBook>,
    trades: DashMap<String, VecDeque<Trade>>,
    instruments: DashMap<String, HashMap<String, Instrument>>,
    funding: DashMap<String, Funding>,
    open_interest: DashMap<String, OpenInterest>,
    klines: DashMap<String, Vec<Candle>>,
    liquidations: DashMap<String, VecDeque<Liquidation>>,
    last_update: DashMap<String, i64>,
    subscribers: DashMap<String, Vec<Subscriber>>,
    next_sub_id: AtomicU64,
    trade_ring: usize,
    kline_ring: usize,
    liquidation_ring: usize,
    stale_threshold_ms: i64,
    sweep_ttl_ms: i64,
    sweep_interval_secs: u64,
}

impl StateCache {
    pub fn new(config: &HubConfig) -> Self {
        Self {
            tickers: DashMap::new(),
            orderbooks: DashMap::new(),
            trades: DashMap::new(),
            instruments: DashMap::new(),
            funding: DashMap::new(),
            open_interest: DashMap::new(),
            klines: DashMap::new(),
            liquidations: DashMap::new(),
            last_update: DashMap::new(),
            subscribers: DashMap::new(),
            next_sub_id: AtomicU64::new(1),
            trade_ring: config.trade_ring,
            kline_ring: config.kline_ring,
            liquidation_ring: config.liquidation_ring,
            stale_threshold_ms: (config.stale_threshold_secs * 1000) as i64,
            sweep_ttl_ms: (config.sweep_ttl_secs * 1000) as i64,
            sweep_interval_secs: config.sweep_interval_secs,
        }
    }

    fn key(exchange: &str, symbol: &str) -> String {
        format!("{exchange}:{symbol}")
    }

    fn touch(&self, collection: &str, key: &str) {
        self.last_update
            .insert(format!("{collection}:{key}"), now_ms());
    }

    /// Age check against the stale threshold. Unknown keys are not stale.
    pub fn is_stale(&self, collection: &str, key: &str) -> bool {
        self.last_update
            .get(&format!("{collection}:{key}"))
            .map(|ts| now_ms() - *ts > self.stale_threshold_ms)
            .unwrap_or(false)
    }

    // --- tickers ---

    pub fn set_ticker(&self, exchange: &str, symbol: &str, patch: &Ticker) {
        let key = Self::key(exchange, symbol);
        let merged = {
            let mut entry = self.tickers.entry(key.clone()).or_default();
            entry.merge(patch);
            entry.clone()
        };
        self.touch("tickers", &key);
        self.notify(Channel::Tickers, exchange, symbol, to_payload(&merged));
    }

    pub fn get_ticker(&self, exchange: &str, symbol: &str) -> Option<(Ticker, bool)> {
        let key = Self::key(exchange, symbol);
        let ticker = self.tickers.get(&key)?.clone();
        Some((ticker, self.is_stale("tickers", &key)))
    }

    /// All tickers for one exchange, keyed by symbol.
    pub fn all_tickers(&self, exchange: &str) -> Vec<(String, Ticker, bool)> {
        let prefix = format!("{exchange}:");
        self.tickers
            .iter()
            .filter(|entry| entry.key().starts_with(&prefix))
            .map(|entry| {
                let symbol = entry.key()[prefix.len()..].to_string();
                let stale = self.is_stale("tickers", entry.key());
                (symbol, entry.value().clone(), stale)
            })
            .collect()
    }

    pub fn ticker_count(&self, exchange: &str) -> usize {
        let prefix = format!("{exchange}:");
        self.tickers
            .iter()
            .filter(|entry| entry.key().starts_with(&prefix))
            .count()
    }

    // --- orderbooks ---

    /// Full snapshot: replaces both sides.
    pub fn set_orderbook(&self, exchange: &str, symbol: &str, update: &BookUpdate) {
        let key = Self::key(exchange, symbol);
        let book = {
            let mut entry = self
                .orderbooks
                .entry(key.clone())
                .or_insert_with(|| OrderBook::new(update.timestamp));
            entry.replace(&update.bids, &update.asks);
            entry.update_id = update.update_id.or(entry.update_id);
            entry.cross_seq = update.cross_seq.or(entry.cross_seq);
            entry.timestamp = update.timestamp;
            entry.clone()
        };
        self.touch("orderbooks", &key);
        self.notify(Channel::Orderbook, exchange, symbol, to_payload(&book));
    }

    /// Delta merge: size 0 removes a level, anything else upserts it.
    pub fn update_orderbook(&self, exchange: &str, symbol: &str, update: &BookUpdate) {
        let key = Self::key(exchange, symbol);
        let book = {
            let mut entry = self
                .orderbooks
                .entry(key.clone())
                .or_insert_with(|| OrderBook::new(update.timestamp));
            OrderBook::apply_side(&mut entry.bids, &update.bids);
            OrderBook::apply_side(&mut entry.asks, &update.asks);
            entry.update_id = update.update_id.or(entry.update_id);
            entry.cross_seq = update.cross_seq.or(entry.cross_seq);
            entry.timestamp = update.timestamp;
            entry.clone()
        };
        self.touch("orderbooks", &key);
        self.notify(Channel::Orderbook, exchange, symbol, to_payload(&book));
    }

    pub fn get_orderbook(&self, exchange: &str, symbol: &str) -> Option<(OrderBook, bool)> {
        let key = Self::key(exchange, symbol);
        let book = self.orderbooks.get(&key)?.clone();
        Some((book, self.is_stale("orderbooks", &key)))
    }

    // --- trades ---

    /// Insert a batch, newest last, suppressing duplicates against the ring
    /// and within the batch itself.
    pub fn add_trades(&self, exchange: &str, symbol: &str, incoming: Vec<Trade>) {
        let key = Self::key(exchange, symbol);
        let accepted: Vec<Trade> = {
            let mut ring = self.trades.entry(key.clone()).or_default();
            let mut accepted: Vec<Trade> = Vec::with_capacity(incoming.len());
            for trade in incoming {
                let dup = ring.iter().any(|t| t.same_fill(&trade))
                    || accepted.iter().any(|t| t.same_fill(&trade));
                if !dup {
                    accepted.push(trade);
                }
            }
            for trade in &accepted {
                ring.push_front(trade.clone());
            }
            while ring.len() > self.trade_ring {
                ring.pop_back();
            }
            accepted
        };
        if accepted.is_empty() {
            return;
        }
        self.touch("trades", &key);
        self.notify(Channel::Trades, exchange, symbol, to_payload(&accepted));
    }

    /// Newest-first read, truncated to `limit` when given.
    pub fn get_trades(&self, exchange: &str, symbol: &str, limit: Option<usize>) -> Vec<Trade> {
        let key = Self::key(exchange, symbol);
        let Some(ring) = self.trades.get(&key) else {
            return Vec::new();
        };
        let take = limit.unwrap_or(ring.len());
        ring.iter().take(take).cloned().collect()
    }

    // --- liquidations ---

    /// Ring insert for the symbol plus a mirror insert under the `ALL`
    /// pseudo-symbol; both keys are notified.
    pub fn add_liquidation(&self, exchange: &str, symbol: &str, liq: Liquidation) {
        for sym in [symbol, ALL_SYMBOL] {
            let key = Self::key(exchange, sym);
            {
                let mut ring = self.liquidations.entry(key.clone()).or_default();
                ring.push_front(liq.clone());
                while ring.len() > self.liquidation_ring {
                    ring.pop_back();
                }
            }
            self.touch("liquidations", &key);
            self.notify(Channel::Liquidations, exchange, sym, to_payload(&liq));
        }
    }

    pub fn get_liquidations(
        &self,
        exchange: &str,
        symbol: &str,
        limit: Option<usize>,
    ) -> Vec<Liquidation> {
        let key = Self::key(exchange, symbol);
        let Some(ring) = self.liquidations.get(&key) else {
            return Vec::new();
        };
        let take = limit.unwrap_or(ring.len());
        ring.iter().take(take).cloned().collect()
    }

    // --- instruments ---

    /// Wholesale replacement of an exchange's instrument set.
    pub fn set_instruments(&self, exchange: &str, instruments: Vec<Instrument>) {
        let by_symbol: HashMap<String, Instrument> = instruments
            .into_iter()
            .map(|inst| (inst.symbol.clone(), inst))
            .collect();
        self.instruments.insert(exchange.to_string(), by_symbol);
        self.touch("instruments", exchange);
    }

    pub fn get_instruments(&self, exchange: &str) -> Vec<Instrument> {
        self.instruments
            .get(exchange)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get_instrument(&self, exchange: &str, symbol: &str) -> Option<Instrument> {
        self.instruments.get(exchange)?.get(symbol).cloned()
    }

    // --- funding / open interest ---

    pub fn set_funding(&self, exchange: &str, symbol: &str, funding: Funding) {
        let key = Self::key(exchange, symbol);
        self.funding.insert(key.clone(), funding.clone());
        self.touch("funding", &key);
        self.notify(Channel::Funding, exchange, symbol, to_payload(&funding));
    }

    pub fn get_funding(&self, exchange: &str, symbol: &str) -> Option<(Funding, bool)> {
        let key = Self::key(exchange, symbol);
        let funding = self.funding.get(&key)?.clone();
        Some((funding, self.is_stale("funding", &key)))
    }

    pub fn all_funding(&self, exchange: &str) -> Vec<(String, Funding, bool)> {
        let prefix = format!("{exchange}:");
        self.funding
            .iter()
            .filter(|entry| entry.key().starts_with(&prefix))
            .map(|entry| {
                let symbol = entry.key()[prefix.len()..].to_string();
                let stale = self.is_stale("funding", entry.key());
                (symbol, entry.value().clone(), stale)
            })
            .collect()
    }

    pub fn set_open_interest(&self, exchange: &str, symbol: &str, oi: OpenInterest) {
        let key = Self::key(exchange, symbol);
        self.open_interest.insert(key.clone(), oi);
        self.touch("oi", &key);
    }

    pub fn get_open_interest(&self, exchange: &str, symbol: &str) -> Option<(OpenInterest, bool)> {
        let key = Self::key(exchange, symbol);
        let oi = self.open_interest.get(&key)?.clone();
        Some((oi, self.is_stale("oi", &key)))
    }

    // --- klines ---

    fn kline_key(exchange: &str, symbol: &str, interval: &str) -> String {
        format!("{exchange}:{symbol}:{interval}")
    }

    /// Upsert one candle by open time, keeping the ring sorted ascending and
    /// bounded.
    pub fn update_kline(&self, exchange: &str, symbol: &str, interval: &str, candle: Candle) {
        let key = Self::kline_key(exchange, symbol, interval);
        {
            let mut ring = self.klines.entry(key.clone()).or_default();
            match ring.binary_search_by_key(&candle.t, |c| c.t) {
                Ok(i) => ring[i] = candle,
                Err(i) => ring.insert(i, candle),
            }
            if ring.len() > self.kline_ring {
                let excess = ring.len() - self.kline_ring;
                ring.drain(..excess);
            }
        }
        self.touch("klines", &key);
        // Kline subscribers address the compound symbol "SYM:interval".
        let compound = format!("{symbol}:{interval}");
        self.notify(Channel::Klines, exchange, &compound, to_payload(&candle));
    }

    /// Merge a fetched batch into the ring: dedup by open time (batch wins),
    /// sort ascending, truncate oldest beyond the cap.
    pub fn merge_klines(&self, exchange: &str, symbol: &str, interval: &str, batch: &[Candle]) {
        if batch.is_empty() {
            return;
        }
        let key = Self::kline_key(exchange, symbol, interval);
        {
            let mut ring = self.klines.entry(key.clone()).or_default();
            let mut by_time: std::collections::BTreeMap<i64, Candle> =
                ring.iter().map(|c| (c.t, *c)).collect();
            for candle in batch {
                by_time.insert(candle.t, *candle);
            }
            let mut merged: Vec<Candle> = by_time.into_values().collect();
            if merged.len() > self.kline_ring {
                let excess = merged.len() - self.kline_ring;
                merged.drain(..excess);
            }
            *ring = merged;
        }
        self.touch("klines", &key);
    }

    pub fn get_klines(
        &self,
        exchange: &str,
        symbol: &str,
        interval: &str,
        limit: Option<usize>,
    ) -> Vec<Candle> {
        let key = Self::kline_key(exchange, symbol, interval);
        let Some(ring) = self.klines.get(&key) else {
            return Vec::new();
        };
        match limit {
            Some(n) if n < ring.len() => ring[ring.len() - n..].to_vec(),
            _ => ring.clone(),
        }
    }

    // --- subscriptions ---

    /// Register a subscriber for (channel, exchange, symbol).
    ///
    /// Captures and enqueues the current snapshot before the sender joins the
    /// fan-out set; returns an id for `unsubscribe`. Enqueue is `try_send`:
    /// a full client queue drops the message rather than blocking a mutator.
    pub fn subscribe(
        &self,
        channel: Channel,
        exchange: &str,
        symbol: &str,
        tx: mpsc::Sender<PushMessage>,
    ) -> u64 {
        let id = self.next_sub_id.fetch_add(1, Ordering::SeqCst);
        let key = format!("{channel}:{exchange}:{symbol}");
        let mut subs = self.subscribers.entry(key).or_default();
        if let Some(data) = self.snapshot_payload(channel, exchange, symbol) {
            let msg = PushMessage::Snapshot {
                exchange: exchange.to_string(),
                channel,
                symbol: symbol.to_string(),
                data,
            };
            let _ = tx.try_send(msg);
        }
        subs.push(Subscriber { id, tx });
        id
    }

    pub fn unsubscribe(&self, channel: Channel, exchange: &str, symbol: &str, id: u64) {
        let key = format!("{channel}:{exchange}:{symbol}");
        if let Some(mut subs) = self.subscribers.get_mut(&key) {
            subs.retain(|s| s.id != id);
        }
        self.subscribers.remove_if(&key, |_, subs| subs.is_empty());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.iter().map(|entry| entry.value().len()).sum()
    }

    fn snapshot_payload(&self, channel: Channel, exchange: &str, symbol: &str) -> Option<Value> {
        match channel {
            Channel::Tickers => self
                .tickers
                .get(&Self::key(exchange, symbol))
                .map(|t| to_payload(&*t)),
            Channel::Orderbook => self
                .orderbooks
                .get(&Self::key(exchange, symbol))
                .map(|b| to_payload(&*b)),
            Channel::Trades => self
                .trades
                .get(&Self::key(exchange, symbol))
                .filter(|ring| !ring.is_empty())
                .map(|ring| to_payload(&ring.iter().cloned().collect::<Vec<_>>())),
            Channel::Klines => {
                let (sym, interval) = symbol.split_once(':')?;
                self.klines
                    .get(&Self::kline_key(exchange, sym, interval))
                    .filter(|ring| !ring.is_empty())
                    .map(|ring| to_payload(&*ring))
            }
            Channel::Liquidations => self
                .liquidations
                .get(&Self::key(exchange, symbol))
                .filter(|ring| !ring.is_empty())
                .map(|ring| to_payload(&ring.iter().cloned().collect::<Vec<_>>())),
            Channel::Funding => self
                .funding
                .get(&Self::key(exchange, symbol))
                .map(|f| to_payload(&*f)),
        }
    }

    /// Fan an update out to the key's subscribers. Dead receivers are
    /// dropped; full ones lose this message only.
    fn notify(&self, channel: Channel, exchange: &str, symbol: &str, data: Value) {
        let key = format!("{channel}:{exchange}:{symbol}");
        let Some(mut subs) = self.subscribers.get_mut(&key) else {
            return;
        };
        let msg = PushMessage::Update {
            exchange: exchange.to_string(),
            channel,
            symbol: symbol.to_string(),
            data,
        };
        subs.retain(|s| match s.tx.try_send(msg.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("slow subscriber on {key}, update dropped");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        drop(subs);
        self.subscribers.remove_if(&key, |_, subs| subs.is_empty());
    }

    // --- maintenance ---

    pub fn counts(&self) -> CacheCounts {
        CacheCounts {
            tickers: self.tickers.len(),
            orderbooks: self.orderbooks.len(),
            trades: self.trades.len(),
            instruments: self.instruments.iter().map(|e| e.value().len()).sum(),
            funding: self.funding.len(),
            open_interest: self.open_interest.len(),
            klines: self.klines.len(),
            liquidations: self.liquidations.len(),
        }
    }

    /// Drop every collection entry whose last update exceeds the sweep TTL.
    /// Returns the number of entries removed.
    pub fn sweep(&self) -> usize {
        let now = now_ms();
        let expired: Vec<String> = self
            .last_update
            .iter()
            .filter(|entry| now - *entry.value() > self.sweep_ttl_ms)
            .map(|entry| entry.key().clone())
            .collect();

        for full_key in &expired {
            let Some((collection, key)) = full_key.split_once(':') else {
                continue;
            };
            match collection {
                "tickers" => {
                    self.tickers.remove(key);
                }
                "orderbooks" => {
                    self.orderbooks.remove(key);
                }
                "trades" => {
                    self.trades.remove(key);
                }
                "instruments" => {
                    self.instruments.remove(key);
                }
                "funding" => {
                    self.funding.remove(key);
                }
                "oi" => {
                    self.open_interest.remove(key);
                }
                "klines" => {
                    self.klines.remove(key);
                }
                "liquidations" => {
                    self.liquidations.remove(key);
                }
                _ => {}
            }
            self.last_update.remove(full_key);
        }
        if !expired.is_empty() {
            info!("stale sweep removed {} entries", expired.len());
        }
        expired.len()
    }

    /// Spawn the periodic stale sweeper.
    pub fn start_sweeper(self: &Arc<Self>, shutdown: &broadcast::Sender<()>) {
        let cache = self.clone();
        let mut shutdown_rx = shutdown.subscribe();
        let period = tokio::time::Duration::from_secs(self.sweep_interval_secs);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        cache.sweep();
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
    }
}

fn to_payload<T: serde::Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::market::{LiquidationSide, TradeSide};
    use rust_decimal_macros::dec;

    fn test_cache() -> StateCache {
        StateCache::new(&HubConfig::default())
    }

    fn trade(price: f64, size: f64, ts: i64, id: Option<&str>) -> Trade {
        Trade {
            price,
            size,
            side: TradeSide::Buy,
            timestamp: ts,
            trade_id: id.map(String::from),
        }
    }

    fn candle(t: i64, c: f64) -> Candle {
        Candle {
            t,
            o: c,
            h: c,
            l: c,
            c,
            v: 1.0,
            closed: Some(true),
        }
    }

    #[test]
    fn test_trade_ring_bounded_and_newest_first() {
        let cache = test_cache();
        for i in 0..250 {
            cache.add_trades(
                "bybit",
                "BTCUSDT",
                vec![trade(100.0 + i as f64, 1.0, i, Some(&format!("t{i}")))],
            );
        }
        let trades = cache.get_trades("bybit", "BTCUSDT", None);
        assert_eq!(trades.len(), 100);
        assert_eq!(trades[0].trade_id.as_deref(), Some("t249"));
        assert_eq!(trades[99].trade_id.as_deref(), Some("t150"));
    }

    #[test]
    fn test_trade_dedup_by_id_and_composite() {
        let cache = test_cache();
        cache.add_trades(
            "bybit",
            "BTCUSDT",
            vec![
                trade(100.0, 1.0, 1, Some("a")),
                trade(100.0, 1.0, 1, Some("a")), // duplicate inside batch
                trade(100.0, 1.0, 1, None),
            ],
        );
        cache.add_trades(
            "bybit",
            "BTCUSDT",
            vec![
                trade(101.0, 1.0, 1, Some("a")), // replay by id
                trade(100.0, 1.0, 1, None),      // replay by composite
                trade(100.0, 2.0, 1, None),      // distinct size
            ],
        );
        let trades = cache.get_trades("bybit", "BTCUSDT", None);
        assert_eq!(trades.len(), 3);
    }

    #[test]
    fn test_kline_ring_bounded_sorted() {
        let cache = test_cache();
        // Insert out of order, with one replacement
        for t in [5, 1, 3, 2, 4, 3] {
            cache.update_kline("bybit", "BTCUSDT", "1", candle(t, t as f64));
        }
        let ring = cache.get_klines("bybit", "BTCUSDT", "1", None);
        let times: Vec<i64> = ring.iter().map(|c| c.t).collect();
        assert_eq!(times, vec![1, 2, 3, 4, 5]);

        for t in 6..600 {
            cache.update_kline("bybit", "BTCUSDT", "1", candle(t, 0.0));
        }
        let ring = cache.get_klines("bybit", "BTCUSDT", "1", None);
        assert_eq!(ring.len(), 500);
        assert!(ring.windows(2).all(|w| w[0].t < w[1].t));
    }

    #[test]
    fn test_kline_merge_dedups_and_sorts() {
        let cache = test_cache();
        for t in [1, 2, 3] {
            cache.update_kline("bybit", "BTCUSDT", "1", candle(t, t as f64));
        }
        cache.merge_klines(
            "bybit",
            "BTCUSDT",
            "1",
            &[candle(3, 30.0), candle(4, 4.0), candle(5, 5.0)],
        );
        let ring = cache.get_klines("bybit", "BTCUSDT", "1", None);
        let times: Vec<i64> = ring.iter().map(|c| c.t).collect();
        assert_eq!(times, vec![1, 2, 3, 4, 5]);
        // fetched batch wins on collision
        assert_eq!(ring[2].c, 30.0);
    }

    #[test]
    fn test_orderbook_snapshot_then_delta() {
        let cache = test_cache();
        cache.set_orderbook(
            "bybit",
            "BTCUSDT",
            &BookUpdate {
                bids: vec![(dec!(99), dec!(1)), (dec!(98), dec!(2))],
                asks: vec![(dec!(101), dec!(1))],
                snapshot: true,
                update_id: Some(1),
                cross_seq: None,
                timestamp: 1,
            },
        );
        cache.update_orderbook(
            "bybit",
            "BTCUSDT",
            &BookUpdate {
                bids: vec![(dec!(99), dec!(0)), (dec!(97), dec!(5))],
                asks: vec![],
                snapshot: false,
                update_id: Some(2),
                cross_seq: None,
                timestamp: 2,
            },
        );
        let (book, _) = cache.get_orderbook("bybit", "BTCUSDT").unwrap();
        assert_eq!(book.best_bid(), Some((dec!(98), dec!(2))));
        assert_eq!(book.bids.get(&dec!(97)), Some(&dec!(5)));
        assert_eq!(book.update_id, Some(2));
    }

    #[test]
    fn test_liquidation_mirrored_to_all() {
        let cache = test_cache();
        let liq = Liquidation {
            id: "x".into(),
            symbol: "BTCUSDT".into(),
            price: 100.0,
            size: 2.0,
            side: LiquidationSide::Sell,
            timestamp: 7,
        };
        cache.add_liquidation("bybit", "BTCUSDT", liq.clone());
        let per_symbol = cache.get_liquidations("bybit", "BTCUSDT", None);
        let all = cache.get_liquidations("bybit", ALL_SYMBOL, None);
        assert_eq!(per_symbol.len(), 1);
        assert_eq!(all.len(), 1);
        assert_eq!(per_symbol[0], all[0]);
    }

    #[tokio::test]
    async fn test_snapshot_then_update_order() {
        let cache = test_cache();
        cache.set_ticker(
            "bybit",
            "BTCUSDT",
            &Ticker {
                last_price: Some(100.0),
                ..Default::default()
            },
        );

        let (tx, mut rx) = mpsc::channel(16);
        cache.subscribe(Channel::Tickers, "bybit", "BTCUSDT", tx);
        cache.set_ticker(
            "bybit",
            "BTCUSDT",
            &Ticker {
                last_price: Some(101.0),
                ..Default::default()
            },
        );

        let first = rx.recv().await.unwrap();
        match first {
            PushMessage::Snapshot { data, .. } => assert_eq!(data["lastPrice"], 100.0),
            other => panic!("expected snapshot first, got {other:?}"),
        }
        let second = rx.recv().await.unwrap();
        match second {
            PushMessage::Update { data, .. } => assert_eq!(data["lastPrice"], 101.0),
            other => panic!("expected update second, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let cache = test_cache();
        let (tx, mut rx) = mpsc::channel(16);
        let id = cache.subscribe(Channel::Tickers, "bybit", "BTCUSDT", tx);
        cache.unsubscribe(Channel::Tickers, "bybit", "BTCUSDT", id);
        cache.set_ticker(
            "bybit",
            "BTCUSDT",
            &Ticker {
                last_price: Some(1.0),
                ..Default::default()
            },
        );
        assert!(rx.try_recv().is_err());
        assert_eq!(cache.subscriber_count(), 0);
    }

    #[test]
    fn test_sweep_removes_expired_entries() {
        let mut config = HubConfig::default();
        config.sweep_ttl_secs = 0; // everything is instantly expired
        let cache = StateCache::new(&config);
        cache.set_ticker("bybit", "BTCUSDT", &Ticker::default());
        cache.add_trades("bybit", "BTCUSDT", vec![trade(1.0, 1.0, 1, Some("t"))]);
        std::thread::sleep(std::time::Duration::from_millis(5));
        let removed = cache.sweep();
        assert!(removed >= 2);
        assert!(cache.get_ticker("bybit", "BTCUSDT").is_none());
        assert!(cache.get_trades("bybit", "BTCUSDT", None).is_empty());
    }

    #[test]
    fn test_missing_reads_are_empty_not_errors() {
        let cache = test_cache();
        assert!(cache.get_ticker("bybit", "NOPE").is_none());
        assert!(cache.get_trades("bybit", "NOPE", Some(10)).is_empty());
        assert!(cache.get_klines("bybit", "NOPE", "1", None).is_empty());
        assert!(cache.get_instruments("nowhere").is_empty());
    }
}
