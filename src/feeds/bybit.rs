use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::config::ExchangeConfig;
use crate::config::HubConfig;
use crate::feeds::{
    parse_f64, parse_f64_opt, parse_levels, spawn_socket, AdapterShared, ExchangeAdapter,
    WsProtocol,
};
use crate::models::candle::Candle;
use crate::models::event::{BookUpdate, Channel, EventData, MarketEvent, StatusEvent};
use crate::models::market::{Funding, Liquidation, LiquidationSide, Ticker, Trade, TradeSide};

pub const NAME: &str = "bybit";

/// Bybit v5 linear perpetuals.
///
/// Topics: `tickers.SYM`, `orderbook.50.SYM`, `publicTrade.SYM`,
/// `kline.{interval}.SYM`, `allLiquidation.SYM`. Funding rides the ticker
/// topic. Liquidations for the top USDT symbols are subscribed on every open
/// in staggered batches of 10, 100 ms apart.
pub struct BybitAdapter {
    inner: Arc<BybitInner>,
}

struct BybitInner {
    shared: AdapterShared,
    http: reqwest::Client,
    rest_url: String,
    liquidations_cap: usize,
}

impl BybitAdapter {
    pub fn new(
        config: &ExchangeConfig,
        hub: &HubConfig,
        http: reqwest::Client,
        events_tx: mpsc::UnboundedSender<MarketEvent>,
        status_tx: mpsc::UnboundedSender<StatusEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(BybitInner {
                shared: AdapterShared::new(
                    NAME,
                    config.ws_url.clone(),
                    Duration::from_secs(hub.ping_interval_secs),
                    hub.reconnect_cap_ms,
                    events_tx,
                    status_tx,
                ),
                http,
                rest_url: config.rest_url.clone(),
                liquidations_cap: hub.bybit_liquidations_cap,
            }),
        }
    }
}

fn topic_for(channel: Channel, symbol: &str) -> Option<String> {
    match channel {
        Channel::Tickers | Channel::Funding => Some(format!("tickers.{symbol}")),
        Channel::Orderbook => Some(format!("orderbook.50.{symbol}")),
        Channel::Trades => Some(format!("publicTrade.{symbol}")),
        // klines and liquidations go through their dedicated entry points
        Channel::Klines | Channel::Liquidations => None,
    }
}

fn op_frame(op: &str, args: &[String]) -> String {
    serde_json::json!({ "op": op, "args": args }).to_string()
}

impl BybitInner {
    fn send_subscribe(&self, topics: &[String]) {
        for chunk in topics.chunks(10) {
            self.shared.send_frame(op_frame("subscribe", chunk));
        }
    }

    fn send_unsubscribe(&self, topics: &[String]) {
        for chunk in topics.chunks(10) {
            self.shared.send_frame(op_frame("unsubscribe", chunk));
        }
    }

    /// Top USDT symbols whose liquidation streams are always kept open.
    fn liquidation_symbols(&self) -> Vec<String> {
        self.shared
            .symbols
            .read()
            .iter()
            .filter(|s| s.ends_with("USDT"))
            .take(self.liquidations_cap)
            .cloned()
            .collect()
    }
}

impl WsProtocol for BybitInner {
    fn shared(&self) -> &AdapterShared {
        &self.shared
    }

    fn ping_frame(&self) -> Option<Message> {
        Some(Message::Text(r#"{"op":"ping"}"#.to_string()))
    }

    fn is_pong(&self, text: &str) -> bool {
        text.contains(r#""op":"pong""#) || text.contains(r#""ret_msg":"pong""#)
    }

    fn on_open(&self) {
        // Hot symbols: trades + orderbook per batch.
        let hot = self.shared.hot_symbols.read().clone();
        if !hot.is_empty() {
            let topics: Vec<String> = hot
                .iter()
                .flat_map(|s| [format!("publicTrade.{s}"), format!("orderbook.50.{s}")])
                .collect();
            self.send_subscribe(&topics);
        }

        // Demand-driven topics survive reconnects.
        let active: Vec<String> = self
            .shared
            .active_topics
            .iter()
            .map(|e| e.key().clone())
            .collect();
        if !active.is_empty() {
            self.send_subscribe(&active);
        }

        // Liquidations for the top USDT symbols, staggered to stay inside
        // Bybit's per-connection subscribe rate.
        let liq_symbols = self.liquidation_symbols();
        if !liq_symbols.is_empty() {
            let shared_name = self.shared.name;
            let frames: Vec<String> = liq_symbols
                .chunks(10)
                .map(|chunk| {
                    let topics: Vec<String> =
                        chunk.iter().map(|s| format!("allLiquidation.{s}")).collect();
                    op_frame("subscribe", &topics)
                })
                .collect();
            let cmd = self.shared.cmd_sender();
            tokio::spawn(async move {
                for frame in frames {
                    if cmd.send(frame).is_err() {
                        debug!("{shared_name} liquidation batch dropped, writer gone");
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            });
        }
    }

    fn handle_frame(&self, text: &str) {
        let frame: BybitFrame = match serde_json::from_str(text) {
            Ok(f) => f,
            Err(e) => {
                warn!("bybit unparseable frame: {e} [{}]", crate::feeds::truncate_frame(text));
                return;
            }
        };

        // Subscription / command acks
        if let Some(success) = frame.success {
            if !success {
                warn!(
                    "bybit subscribe rejected: {}",
                    frame.ret_msg.as_deref().unwrap_or("unknown")
                );
            }
            return;
        }

        let Some(topic) = frame.topic.as_deref() else {
            return;
        };
        let Some(data) = frame.data else {
            return;
        };
        let ts = frame.ts.unwrap_or_else(|| chrono::Utc::now().timestamp_millis());

        if let Some(symbol) = topic.strip_prefix("tickers.") {
            self.handle_ticker(symbol, data);
        } else if let Some(symbol) = topic.strip_prefix("orderbook.50.") {
            let snapshot = frame.kind.as_deref() == Some("snapshot");
            self.handle_orderbook(symbol, data, snapshot, ts);
        } else if let Some(symbol) = topic.strip_prefix("publicTrade.") {
            self.handle_trades(symbol, data);
        } else if let Some(rest) = topic.strip_prefix("kline.") {
            if let Some((interval, symbol)) = rest.split_once('.') {
                self.handle_kline(symbol, interval, data);
            }
        } else if let Some(symbol) = topic.strip_prefix("allLiquidation.") {
            self.handle_liquidations(symbol, data);
        }
    }
}

impl BybitInner {
    fn handle_ticker(&self, symbol: &str, data: serde_json::Value) {
        let Ok(raw) = serde_json::from_value::<BybitTicker>(data) else {
            return;
        };
        let ticker = Ticker {
            last_price: parse_f64_opt(raw.last_price.as_deref()),
            mark_price: parse_f64_opt(raw.mark_price.as_deref()),
            index_price: parse_f64_opt(raw.index_price.as_deref()),
            bid1_price: parse_f64_opt(raw.bid1_price.as_deref()),
            ask1_price: parse_f64_opt(raw.ask1_price.as_deref()),
            high24h: parse_f64_opt(raw.high_price_24h.as_deref()),
            low24h: parse_f64_opt(raw.low_price_24h.as_deref()),
            open24h: parse_f64_opt(raw.prev_price_24h.as_deref()),
            volume24h: parse_f64_opt(raw.volume_24h.as_deref()),
            turnover24h: parse_f64_opt(raw.turnover_24h.as_deref()),
            // Bybit already reports the 24h change as a fraction.
            price24h_pcnt: parse_f64_opt(raw.price_24h_pcnt.as_deref()),
            funding_rate: parse_f64_opt(raw.funding_rate.as_deref()),
            next_funding_time: raw
                .next_funding_time
                .as_deref()
                .and_then(|s| s.parse().ok()),
            open_interest: parse_f64_opt(raw.open_interest.as_deref()),
        };

        let funding = (ticker.funding_rate.is_some()).then(|| Funding {
            funding_rate: ticker.funding_rate,
            next_funding_time: ticker.next_funding_time,
            funding_time: None,
        });

        self.shared.emit(MarketEvent {
            exchange: NAME,
            channel: Channel::Tickers,
            symbol: symbol.to_string(),
            interval: None,
            data: EventData::Ticker(ticker),
        });
        if let Some(funding) = funding {
            self.shared.emit(MarketEvent {
                exchange: NAME,
                channel: Channel::Funding,
                symbol: symbol.to_string(),
                interval: None,
                data: EventData::Funding(funding),
            });
        }
    }

    fn handle_orderbook(&self, symbol: &str, data: serde_json::Value, snapshot: bool, ts: i64) {
        let Ok(raw) = serde_json::from_value::<BybitOrderbook>(data) else {
            return;
        };
        self.shared.emit(MarketEvent {
            exchange: NAME,
            channel: Channel::Orderbook,
            symbol: symbol.to_string(),
            interval: None,
            data: EventData::Orderbook(BookUpdate {
                bids: parse_levels(&raw.bids),
                asks: parse_levels(&raw.asks),
                snapshot,
                update_id: raw.update_id,
                cross_seq: raw.seq,
                timestamp: ts,
            }),
        });
    }

    fn handle_trades(&self, symbol: &str, data: serde_json::Value) {
        let Ok(raw) = serde_json::from_value::<Vec<BybitTrade>>(data) else {
            return;
        };
        let trades: Vec<Trade> = raw
            .into_iter()
            .filter_map(|t| {
                Some(Trade {
                    price: parse_f64(&t.price)?,
                    size: parse_f64(&t.size)?,
                    side: if t.side == "Buy" {
                        TradeSide::Buy
                    } else {
                        TradeSide::Sell
                    },
                    timestamp: t.timestamp,
                    trade_id: Some(t.trade_id),
                })
            })
            .collect();
        if trades.is_empty() {
            return;
        }
        self.shared.emit(MarketEvent {
            exchange: NAME,
            channel: Channel::Trades,
            symbol: symbol.to_string(),
            interval: None,
            data: EventData::Trades(trades),
        });
    }

    fn handle_kline(&self, symbol: &str, interval: &str, data: serde_json::Value) {
        let Ok(raw) = serde_json::from_value::<Vec<BybitKline>>(data) else {
            return;
        };
        for k in raw {
            let candle = Candle {
                t: k.start,
                o: parse_f64(&k.open).unwrap_or(0.0),
                h: parse_f64(&k.high).unwrap_or(0.0),
                l: parse_f64(&k.low).unwrap_or(0.0),
                c: parse_f64(&k.close).unwrap_or(0.0),
                v: parse_f64(&k.volume).unwrap_or(0.0),
                closed: Some(k.confirm),
            };
            self.shared.emit(MarketEvent {
                exchange: NAME,
                channel: Channel::Klines,
                symbol: symbol.to_string(),
                interval: Some(interval.to_string()),
                data: EventData::Kline(candle),
            });
        }
    }

    fn handle_liquidations(&self, symbol: &str, data: serde_json::Value) {
        let Ok(raw) = serde_json::from_value::<Vec<BybitLiquidation>>(data) else {
            return;
        };
        for l in raw {
            let (Some(price), Some(size)) = (parse_f64(&l.price), parse_f64(&l.size)) else {
                continue;
            };
            self.shared.emit(MarketEvent {
                exchange: NAME,
                channel: Channel::Liquidations,
                symbol: symbol.to_string(),
                interval: None,
                data: EventData::Liquidation(Liquidation {
                    id: format!("{NAME}-{symbol}-{}", l.timestamp),
                    symbol: symbol.to_string(),
                    price,
                    size,
                    side: if l.side == "Buy" {
                        LiquidationSide::Buy
                    } else {
                        LiquidationSide::Sell
                    },
                    timestamp: l.timestamp,
                }),
            });
        }
    }
}

#[async_trait]
impl ExchangeAdapter for BybitAdapter {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn connect(&self) -> Result<()> {
        if !self.inner.shared.begin_connect() {
            return Ok(());
        }
        match self.fetch_symbols().await {
            Ok(symbols) => {
                info!("bybit discovered {} symbols", symbols.len());
                *self.inner.shared.symbols.write() = symbols;
            }
            Err(e) => warn!("bybit symbol discovery failed, using previous list: {e}"),
        }
        spawn_socket(self.inner.clone());
        Ok(())
    }

    fn close(&self) {
        self.inner.shared.close();
    }

    fn is_connected(&self) -> bool {
        self.inner.shared.is_connected()
    }

    fn symbol_count(&self) -> usize {
        self.inner.shared.symbol_count()
    }

    fn last_update_ms(&self) -> i64 {
        self.inner.shared.last_update_ms()
    }

    async fn fetch_symbols(&self) -> Result<Vec<String>> {
        let url = format!(
            "{}/v5/market/instruments-info?category=linear&limit=1000",
            self.inner.rest_url
        );
        let body: serde_json::Value = self
            .inner
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("bybit instruments response")?;
        if body["retCode"].as_i64() != Some(0) {
            bail!("bybit instruments error: {}", body["retMsg"]);
        }
        let list = body["result"]["list"]
            .as_array()
            .context("bybit instruments missing result.list")?;
        Ok(list
            .iter()
            .filter(|item| item["status"].as_str() == Some("Trading"))
            .filter_map(|item| item["symbol"].as_str().map(String::from))
            .collect())
    }

    fn subscribe_hot_symbols(&self, symbols: &[String]) {
        *self.inner.shared.hot_symbols.write() = symbols.to_vec();
        if !self.inner.shared.is_connected() {
            return;
        }
        let topics: Vec<String> = symbols
            .iter()
            .flat_map(|s| [format!("publicTrade.{s}"), format!("orderbook.50.{s}")])
            .collect();
        self.inner.send_subscribe(&topics);
    }

    fn subscribe_symbol(&self, symbol: &str, channels: &[Channel]) -> bool {
        let mut topics = Vec::new();
        for &channel in channels {
            let Some(topic) = topic_for(channel, symbol) else {
                continue;
            };
            if self.inner.shared.track_topic(&topic) {
                topics.push(topic);
            }
        }
        if topics.is_empty() {
            return false;
        }
        self.inner.send_subscribe(&topics);
        true
    }

    fn unsubscribe_symbol(&self, symbol: &str, channels: &[Channel]) {
        let mut topics = Vec::new();
        for &channel in channels {
            let Some(topic) = topic_for(channel, symbol) else {
                continue;
            };
            if self.inner.shared.untrack_topic(&topic) {
                topics.push(topic);
            }
        }
        if !topics.is_empty() {
            self.inner.send_unsubscribe(&topics);
        }
    }

    fn subscribe_kline(&self, symbol: &str, interval: &str) -> bool {
        let topic = format!("kline.{interval}.{symbol}");
        if !self.inner.shared.track_topic(&topic) {
            return false;
        }
        self.inner.send_subscribe(&[topic]);
        true
    }

    fn unsubscribe_kline(&self, symbol: &str, interval: &str) {
        let topic = format!("kline.{interval}.{symbol}");
        if self.inner.shared.untrack_topic(&topic) {
            self.inner.send_unsubscribe(&[topic]);
        }
    }

    fn subscribe_liquidation(&self, symbol: &str) -> bool {
        // The aggregate pseudo-symbol and the top-USDT batch are already
        // covered; only off-list symbols need a frame.
        if symbol == crate::cache::ALL_SYMBOL
            || self.inner.liquidation_symbols().iter().any(|s| s == symbol)
        {
            return true;
        }
        let topic = format!("allLiquidation.{symbol}");
        if self.inner.shared.track_topic(&topic) {
            self.inner.send_subscribe(&[topic]);
        }
        true
    }
}

// --- wire types ---

#[derive(Debug, Deserialize)]
struct BybitFrame {
    topic: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    data: Option<serde_json::Value>,
    ts: Option<i64>,
    success: Option<bool>,
    ret_msg: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BybitTicker {
    last_price: Option<String>,
    mark_price: Option<String>,
    index_price: Option<String>,
    bid1_price: Option<String>,
    ask1_price: Option<String>,
    #[serde(rename = "highPrice24h")]
    high_price_24h: Option<String>,
    #[serde(rename = "lowPrice24h")]
    low_price_24h: Option<String>,
    #[serde(rename = "prevPrice24h")]
    prev_price_24h: Option<String>,
    #[serde(rename = "volume24h")]
    volume_24h: Option<String>,
    #[serde(rename = "turnover24h")]
    turnover_24h: Option<String>,
    #[serde(rename = "price24hPcnt")]
    price_24h_pcnt: Option<String>,
    funding_rate: Option<String>,
    next_funding_time: Option<String>,
    open_interest: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BybitOrderbook {
    #[serde(rename = "b", default)]
    bids: Vec<[String; 2]>,
    #[serde(rename = "a", default)]
    asks: Vec<[String; 2]>,
    #[serde(rename = "u")]
    update_id: Option<u64>,
    seq: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct BybitTrade {
    #[serde(rename = "T")]
    timestamp: i64,
    #[serde(rename = "S")]
    side: String,
    #[serde(rename = "v")]
    size: String,
    #[serde(rename = "p")]
    price: String,
    #[serde(rename = "i")]
    trade_id: String,
}

#[derive(Debug, Deserialize)]
struct BybitKline {
    start: i64,
    open: String,
    high: String,
    low: String,
    close: String,
    volume: String,
    confirm: bool,
}

#[derive(Debug, Deserialize)]
struct BybitLiquidation {
    #[serde(rename = "T")]
    timestamp: i64,
    #[serde(rename = "S")]
    side: String,
    #[serde(rename = "v")]
    size: String,
    #[serde(rename = "p")]
    price: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn test_adapter() -> (BybitAdapter, mpsc::UnboundedReceiver<MarketEvent>) {
        let config = Config::default();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status_tx, _status_rx) = mpsc::unbounded_channel();
        let adapter = BybitAdapter::new(
            &config.bybit,
            &config.hub,
            reqwest::Client::new(),
            events_tx,
            status_tx,
        );
        (adapter, events_rx)
    }

    #[test]
    fn test_ticker_frame_parses_as_fraction() {
        let (adapter, mut rx) = test_adapter();
        let frame = r#"{
            "topic":"tickers.BTCUSDT","type":"snapshot","ts":1700000000000,
            "data":{"symbol":"BTCUSDT","lastPrice":"65000.5","price24hPcnt":"0.0234",
                    "fundingRate":"0.0001","nextFundingTime":"1700003600000",
                    "turnover24h":"1234567.8","openInterest":"999.5"}
        }"#;
        adapter.inner.handle_frame(frame);

        let ev = rx.try_recv().unwrap();
        assert_eq!(ev.channel, Channel::Tickers);
        assert_eq!(ev.symbol, "BTCUSDT");
        let EventData::Ticker(t) = ev.data else {
            panic!("expected ticker")
        };
        assert_eq!(t.last_price, Some(65000.5));
        assert_eq!(t.price24h_pcnt, Some(0.0234));
        assert_eq!(t.next_funding_time, Some(1700003600000));

        // funding piggybacks on the ticker topic
        let ev = rx.try_recv().unwrap();
        assert_eq!(ev.channel, Channel::Funding);
    }

    #[test]
    fn test_orderbook_delta_frame() {
        let (adapter, mut rx) = test_adapter();
        let frame = r#"{
            "topic":"orderbook.50.BTCUSDT","type":"delta","ts":1700000000001,
            "data":{"s":"BTCUSDT","b":[["65000","0"],["64999","2.5"]],"a":[["65001","1"]],
                    "u":42,"seq":1042}
        }"#;
        adapter.inner.handle_frame(frame);
        let ev = rx.try_recv().unwrap();
        let EventData::Orderbook(book) = ev.data else {
            panic!("expected orderbook")
        };
        assert!(!book.snapshot);
        assert_eq!(book.bids.len(), 2);
        assert_eq!(book.update_id, Some(42));
        assert_eq!(book.cross_seq, Some(1042));
    }

    #[test]
    fn test_trade_and_liquidation_frames() {
        let (adapter, mut rx) = test_adapter();
        adapter.inner.handle_frame(
            r#"{"topic":"publicTrade.BTCUSDT","ts":1,"data":[
                {"T":1700000000000,"S":"Sell","v":"0.5","p":"64999.9","i":"trade-1"}]}"#,
        );
        let ev = rx.try_recv().unwrap();
        let EventData::Trades(trades) = ev.data else {
            panic!("expected trades")
        };
        assert_eq!(trades[0].side, TradeSide::Sell);
        assert_eq!(trades[0].trade_id.as_deref(), Some("trade-1"));

        adapter.inner.handle_frame(
            r#"{"topic":"allLiquidation.BTCUSDT","ts":2,"data":[
                {"T":1700000000001,"S":"Buy","v":"1.2","p":"65005"}]}"#,
        );
        let ev = rx.try_recv().unwrap();
        let EventData::Liquidation(liq) = ev.data else {
            panic!("expected liquidation")
        };
        assert_eq!(liq.side, LiquidationSide::Buy);
        assert_eq!(liq.size, 1.2);
    }

    #[test]
    fn test_ack_and_garbage_are_absorbed() {
        let (adapter, mut rx) = test_adapter();
        adapter
            .inner
            .handle_frame(r#"{"success":true,"op":"subscribe","conn_id":"x"}"#);
        adapter.inner.handle_frame("not json at all");
        assert!(rx.try_recv().is_err());
        assert!(adapter.inner.is_pong(r#"{"op":"pong"}"#));
    }

    #[test]
    fn test_subscribe_tracks_topics_once() {
        let (adapter, _rx) = test_adapter();
        assert!(adapter.subscribe_symbol("BTCUSDT", &[Channel::Trades, Channel::Orderbook]));
        assert_eq!(adapter.inner.shared.topic_count(), 2);

        adapter.unsubscribe_symbol("BTCUSDT", &[Channel::Trades]);
        assert_eq!(adapter.inner.shared.topic_count(), 1);
    }

    #[test]
    fn test_ticker_and_funding_share_one_topic() {
        let (adapter, _rx) = test_adapter();
        // both channels ride tickers.SYM upstream
        assert!(adapter.subscribe_symbol("BTCUSDT", &[Channel::Tickers]));
        assert!(!adapter.subscribe_symbol("BTCUSDT", &[Channel::Funding]));
        assert_eq!(adapter.inner.shared.topic_count(), 1);

        // dropping one user keeps the stream for the other
        adapter.unsubscribe_symbol("BTCUSDT", &[Channel::Tickers]);
        assert_eq!(adapter.inner.shared.topic_count(), 1);
        adapter.unsubscribe_symbol("BTCUSDT", &[Channel::Funding]);
        assert_eq!(adapter.inner.shared.topic_count(), 0);
    }
}
