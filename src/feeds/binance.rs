use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};

use crate::config::{ExchangeConfig, HubConfig};
use crate::feeds::{
    parse_f64, parse_f64_opt, parse_levels, spawn_socket, AdapterShared, ExchangeAdapter,
    WsProtocol,
};
use crate::models::candle::Candle;
use crate::models::event::{BookUpdate, Channel, EventData, MarketEvent, StatusEvent};
use crate::models::market::{Funding, Liquidation, LiquidationSide, Ticker, Trade, TradeSide};

pub const NAME: &str = "binance";

const LIQUIDATION_STREAM: &str = "!forceOrder@arr";

/// Binance USD-M futures over the combined stream endpoint.
///
/// Every frame arrives wrapped as `{"stream":"…","data":{…}}`. Subscriptions
/// go through `SUBSCRIBE`/`UNSUBSCRIBE` method calls with incrementing ids.
/// Binance pings at the transport level, so there is no text keep-alive, and
/// `!forceOrder@arr` carries every liquidation globally.
pub struct BinanceAdapter {
    inner: Arc<BinanceInner>,
}

struct BinanceInner {
    shared: AdapterShared,
    http: reqwest::Client,
    rest_url: String,
    next_id: AtomicU64,
}

impl BinanceAdapter {
    pub fn new(
        config: &ExchangeConfig,
        hub: &HubConfig,
        http: reqwest::Client,
        events_tx: mpsc::UnboundedSender<MarketEvent>,
        status_tx: mpsc::UnboundedSender<StatusEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(BinanceInner {
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
                next_id: AtomicU64::new(1),
            }),
        }
    }
}

fn streams_for(channel: Channel, symbol: &str) -> Vec<String> {
    let sym = symbol.to_lowercase();
    match channel {
        Channel::Tickers => vec![format!("{sym}@ticker"), format!("{sym}@markPrice")],
        Channel::Funding => vec![format!("{sym}@markPrice")],
        Channel::Orderbook => vec![format!("{sym}@depth20@100ms")],
        Channel::Trades => vec![format!("{sym}@aggTrade")],
        Channel::Klines | Channel::Liquidations => vec![],
    }
}

impl BinanceInner {
    fn send_method(&self, method: &str, params: &[String]) {
        if params.is_empty() {
            return;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.shared.send_frame(
            serde_json::json!({ "method": method, "params": params, "id": id }).to_string(),
        );
    }
}

impl WsProtocol for BinanceInner {
    fn shared(&self) -> &AdapterShared {
        &self.shared
    }

    /// Binance pings at the transport level; the runner answers those.
    fn ping_frame(&self) -> Option<Message> {
        None
    }

    fn is_pong(&self, _text: &str) -> bool {
        false
    }

    fn on_open(&self) {
        // Global liquidation feed is always on.
        self.send_method("SUBSCRIBE", &[LIQUIDATION_STREAM.to_string()]);

        let hot = self.shared.hot_symbols.read().clone();
        let mut streams: Vec<String> = hot
            .iter()
            .flat_map(|s| {
                let sym = s.to_lowercase();
                [format!("{sym}@aggTrade"), format!("{sym}@depth20@100ms")]
            })
            .collect();
        streams.extend(self.shared.active_topics.iter().map(|e| e.key().clone()));
        for chunk in streams.chunks(50) {
            self.send_method("SUBSCRIBE", chunk);
        }
    }

    fn handle_frame(&self, text: &str) {
        // Method acks look like {"result":null,"id":3}
        let envelope: BinanceEnvelope = match serde_json::from_str(text) {
            Ok(e) => e,
            Err(e) => {
                warn!("binance unparseable frame: {e} [{}]", crate::feeds::truncate_frame(text));
                return;
            }
        };
        let (Some(stream), Some(data)) = (envelope.stream, envelope.data) else {
            return;
        };

        if stream.starts_with("!forceOrder") {
            self.handle_force_order(data);
        } else if stream.ends_with("@ticker") {
            self.handle_ticker(data);
        } else if stream.ends_with("@markPrice") {
            self.handle_mark_price(data);
        } else if stream.contains("@depth") {
            self.handle_depth(data);
        } else if stream.ends_with("@aggTrade") {
            self.handle_agg_trade(data);
        } else if stream.contains("@kline_") {
            self.handle_kline(data);
        }
    }
}

impl BinanceInner {
    fn handle_ticker(&self, data: serde_json::Value) {
        let Ok(raw) = serde_json::from_value::<BinanceTicker>(data) else {
            return;
        };
        self.shared.emit(MarketEvent {
            exchange: NAME,
            channel: Channel::Tickers,
            symbol: raw.symbol.clone(),
            interval: None,
            data: EventData::Ticker(Ticker {
                last_price: parse_f64_opt(raw.last_price.as_deref()),
                high24h: parse_f64_opt(raw.high.as_deref()),
                low24h: parse_f64_opt(raw.low.as_deref()),
                open24h: parse_f64_opt(raw.open.as_deref()),
                volume24h: parse_f64_opt(raw.volume.as_deref()),
                turnover24h: parse_f64_opt(raw.quote_volume.as_deref()),
                // Binance reports percent; downstream wants a fraction.
                price24h_pcnt: parse_f64_opt(raw.price_change_percent.as_deref())
                    .map(|p| p / 100.0),
                ..Default::default()
            }),
        });
    }

    fn handle_mark_price(&self, data: serde_json::Value) {
        let Ok(raw) = serde_json::from_value::<BinanceMarkPrice>(data) else {
            return;
        };
        let funding_rate = parse_f64_opt(raw.funding_rate.as_deref());
        self.shared.emit(MarketEvent {
            exchange: NAME,
            channel: Channel::Tickers,
            symbol: raw.symbol.clone(),
            interval: None,
            data: EventData::Ticker(Ticker {
                mark_price: parse_f64_opt(raw.mark_price.as_deref()),
                index_price: parse_f64_opt(raw.index_price.as_deref()),
                funding_rate,
                next_funding_time: raw.next_funding_time,
                ..Default::default()
            }),
        });
        if funding_rate.is_some() {
            self.shared.emit(MarketEvent {
                exchange: NAME,
                channel: Channel::Funding,
                symbol: raw.symbol,
                interval: None,
                data: EventData::Funding(Funding {
                    funding_rate,
                    next_funding_time: raw.next_funding_time,
                    funding_time: None,
                }),
            });
        }
    }

    fn handle_depth(&self, data: serde_json::Value) {
        let Ok(raw) = serde_json::from_value::<BinanceDepth>(data) else {
            return;
        };
        self.shared.emit(MarketEvent {
            exchange: NAME,
            channel: Channel::Orderbook,
            symbol: raw.symbol,
            interval: None,
            data: EventData::Orderbook(BookUpdate {
                bids: parse_levels(&raw.bids),
                asks: parse_levels(&raw.asks),
                // partial depth carries the full visible book
                snapshot: true,
                update_id: raw.final_update_id,
                cross_seq: None,
                timestamp: raw.event_time.unwrap_or_else(|| {
                    chrono::Utc::now().timestamp_millis()
                }),
            }),
        });
    }

    fn handle_agg_trade(&self, data: serde_json::Value) {
        let Ok(raw) = serde_json::from_value::<BinanceAggTrade>(data) else {
            return;
        };
        let (Some(price), Some(size)) = (parse_f64(&raw.price), parse_f64(&raw.quantity)) else {
            return;
        };
        let trade = Trade {
            price,
            size,
            // buyer-is-maker means the aggressor sold
            side: if raw.buyer_is_maker {
                TradeSide::Sell
            } else {
                TradeSide::Buy
            },
            timestamp: raw.trade_time,
            trade_id: Some(raw.agg_id.to_string()),
        };
        self.shared.emit(MarketEvent {
            exchange: NAME,
            channel: Channel::Trades,
            symbol: raw.symbol,
            interval: None,
            data: EventData::Trades(vec![trade]),
        });
    }

    fn handle_kline(&self, data: serde_json::Value) {
        let Ok(raw) = serde_json::from_value::<BinanceKlineWrapper>(data) else {
            return;
        };
        let k = raw.kline;
        let candle = Candle {
            t: k.open_time,
            o: parse_f64(&k.open).unwrap_or(0.0),
            h: parse_f64(&k.high).unwrap_or(0.0),
            l: parse_f64(&k.low).unwrap_or(0.0),
            c: parse_f64(&k.close).unwrap_or(0.0),
            v: parse_f64(&k.volume).unwrap_or(0.0),
            closed: Some(k.closed),
        };
        self.shared.emit(MarketEvent {
            exchange: NAME,
            channel: Channel::Klines,
            symbol: raw.symbol,
            interval: Some(k.interval),
            data: EventData::Kline(candle),
        });
    }

    fn handle_force_order(&self, data: serde_json::Value) {
        let Ok(raw) = serde_json::from_value::<BinanceForceOrderWrapper>(data) else {
            return;
        };
        let order = raw.order;
        let (Some(price), Some(size)) = (
            parse_f64(&order.price),
            parse_f64(&order.quantity),
        ) else {
            return;
        };
        self.shared.emit(MarketEvent {
            exchange: NAME,
            channel: Channel::Liquidations,
            symbol: order.symbol.clone(),
            interval: None,
            data: EventData::Liquidation(Liquidation {
                id: format!("{NAME}-{}-{}", order.symbol, order.trade_time),
                symbol: order.symbol,
                price,
                size,
                // normalized to the forced counter-trade side: a SELL order
                // closed a long, a BUY closed a short
                side: if order.side == "BUY" {
                    LiquidationSide::Buy
                } else {
                    LiquidationSide::Sell
                },
                timestamp: order.trade_time,
            }),
        });
    }
}

#[async_trait]
impl ExchangeAdapter for BinanceAdapter {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn connect(&self) -> Result<()> {
        if !self.inner.shared.begin_connect() {
            return Ok(());
        }
        match self.fetch_symbols().await {
            Ok(symbols) => {
                info!("binance discovered {} symbols", symbols.len());
                *self.inner.shared.symbols.write() = symbols;
            }
            Err(e) => warn!("binance symbol discovery failed, using previous list: {e}"),
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
        let url = format!("{}/fapi/v1/exchangeInfo", self.inner.rest_url);
        let body: serde_json::Value = self
            .inner
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("binance exchangeInfo response")?;
        let symbols = body["symbols"]
            .as_array()
            .context("binance exchangeInfo missing symbols")?;
        Ok(symbols
            .iter()
            .filter(|item| {
                item["status"].as_str() == Some("TRADING")
                    && item["contractType"].as_str() == Some("PERPETUAL")
            })
            .filter_map(|item| item["symbol"].as_str().map(String::from))
            .collect())
    }

    fn subscribe_hot_symbols(&self, symbols: &[String]) {
        *self.inner.shared.hot_symbols.write() = symbols.to_vec();
        if !self.inner.shared.is_connected() {
            return;
        }
        let streams: Vec<String> = symbols
            .iter()
            .flat_map(|s| {
                let sym = s.to_lowercase();
                [format!("{sym}@aggTrade"), format!("{sym}@depth20@100ms")]
            })
            .collect();
        for chunk in streams.chunks(50) {
            self.inner.send_method("SUBSCRIBE", chunk);
        }
    }

    fn subscribe_symbol(&self, symbol: &str, channels: &[Channel]) -> bool {
        let mut fresh = Vec::new();
        for &channel in channels {
            for stream in streams_for(channel, symbol) {
                if self.inner.shared.track_topic(&stream) {
                    fresh.push(stream);
                }
            }
        }
        if fresh.is_empty() {
            return false;
        }
        self.inner.send_method("SUBSCRIBE", &fresh);
        true
    }

    fn unsubscribe_symbol(&self, symbol: &str, channels: &[Channel]) {
        let mut gone = Vec::new();
        for &channel in channels {
            for stream in streams_for(channel, symbol) {
                if self.inner.shared.untrack_topic(&stream) {
                    gone.push(stream);
                }
            }
        }
        self.inner.send_method("UNSUBSCRIBE", &gone);
    }

    fn subscribe_kline(&self, symbol: &str, interval: &str) -> bool {
        let stream = format!("{}@kline_{interval}", symbol.to_lowercase());
        if !self.inner.shared.track_topic(&stream) {
            return false;
        }
        self.inner.send_method("SUBSCRIBE", &[stream]);
        true
    }

    fn unsubscribe_kline(&self, symbol: &str, interval: &str) {
        let stream = format!("{}@kline_{interval}", symbol.to_lowercase());
        if self.inner.shared.untrack_topic(&stream) {
            self.inner.send_method("UNSUBSCRIBE", &[stream]);
        }
    }

    /// The global `!forceOrder@arr` stream covers every symbol and is never
    /// torn down per symbol.
    fn subscribe_liquidation(&self, _symbol: &str) -> bool {
        true
    }
}

// --- wire types ---

#[derive(Debug, Deserialize)]
struct BinanceEnvelope {
    stream: Option<String>,
    data: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct BinanceTicker {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "c")]
    last_price: Option<String>,
    #[serde(rename = "o")]
    open: Option<String>,
    #[serde(rename = "h")]
    high: Option<String>,
    #[serde(rename = "l")]
    low: Option<String>,
    #[serde(rename = "v")]
    volume: Option<String>,
    #[serde(rename = "q")]
    quote_volume: Option<String>,
    #[serde(rename = "P")]
    price_change_percent: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BinanceMarkPrice {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "p")]
    mark_price: Option<String>,
    #[serde(rename = "i")]
    index_price: Option<String>,
    #[serde(rename = "r")]
    funding_rate: Option<String>,
    #[serde(rename = "T")]
    next_funding_time: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct BinanceDepth {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "E")]
    event_time: Option<i64>,
    #[serde(rename = "u")]
    final_update_id: Option<u64>,
    #[serde(rename = "b", default)]
    bids: Vec<[String; 2]>,
    #[serde(rename = "a", default)]
    asks: Vec<[String; 2]>,
}

#[derive(Debug, Deserialize)]
struct BinanceAggTrade {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "p")]
    price: String,
    #[serde(rename = "q")]
    quantity: String,
    #[serde(rename = "T")]
    trade_time: i64,
    #[serde(rename = "m")]
    buyer_is_maker: bool,
    #[serde(rename = "a")]
    agg_id: u64,
}

#[derive(Debug, Deserialize)]
struct BinanceKlineWrapper {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "k")]
    kline: BinanceKline,
}

#[derive(Debug, Deserialize)]
struct BinanceKline {
    #[serde(rename = "t")]
    open_time: i64,
    #[serde(rename = "i")]
    interval: String,
    #[serde(rename = "o")]
    open: String,
    #[serde(rename = "h")]
    high: String,
    #[serde(rename = "l")]
    low: String,
    #[serde(rename = "c")]
    close: String,
    #[serde(rename = "v")]
    volume: String,
    #[serde(rename = "x")]
    closed: bool,
}

#[derive(Debug, Deserialize)]
struct BinanceForceOrderWrapper {
    #[serde(rename = "o")]
    order: BinanceForceOrder,
}

#[derive(Debug, Deserialize)]
struct BinanceForceOrder {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "S")]
    side: String,
    #[serde(rename = "q")]
    quantity: String,
    #[serde(rename = "p")]
    price: String,
    #[serde(rename = "T")]
    trade_time: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn test_adapter() -> (BinanceAdapter, mpsc::UnboundedReceiver<MarketEvent>) {
        let config = Config::default();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status_tx, _status_rx) = mpsc::unbounded_channel();
        let adapter = BinanceAdapter::new(
            &config.binance,
            &config.hub,
            reqwest::Client::new(),
            events_tx,
            status_tx,
        );
        (adapter, events_rx)
    }

    #[test]
    fn test_percent_converted_to_fraction() {
        let (adapter, mut rx) = test_adapter();
        let frame = r#"{"stream":"btcusdt@ticker","data":{
            "e":"24hrTicker","s":"BTCUSDT","c":"65000","o":"64000","h":"65500","l":"63800",
            "v":"1000","q":"64500000","P":"2.34"}}"#;
        adapter.inner.handle_frame(frame);
        let ev = rx.try_recv().unwrap();
        let EventData::Ticker(t) = ev.data else {
            panic!("expected ticker")
        };
        assert!((t.price24h_pcnt.unwrap() - 0.0234).abs() < 1e-12);
    }

    #[test]
    fn test_force_order_side_normalized() {
        let (adapter, mut rx) = test_adapter();
        // SELL forced order closed a long position
        let frame = r#"{"stream":"!forceOrder@arr","data":{"e":"forceOrder","o":{
            "s":"ETHUSDT","S":"SELL","q":"12.5","p":"3000.5","T":1700000000123}}}"#;
        adapter.inner.handle_frame(frame);
        let ev = rx.try_recv().unwrap();
        let EventData::Liquidation(liq) = ev.data else {
            panic!("expected liquidation")
        };
        assert_eq!(liq.side, LiquidationSide::Sell);
        assert_eq!(liq.symbol, "ETHUSDT");
    }

    #[test]
    fn test_agg_trade_maker_flag_sets_side() {
        let (adapter, mut rx) = test_adapter();
        let frame = r#"{"stream":"btcusdt@aggTrade","data":{
            "e":"aggTrade","s":"BTCUSDT","p":"65000","q":"0.5","T":1700000000000,"m":true,"a":991}}"#;
        adapter.inner.handle_frame(frame);
        let ev = rx.try_recv().unwrap();
        let EventData::Trades(trades) = ev.data else {
            panic!("expected trades")
        };
        assert_eq!(trades[0].side, TradeSide::Sell);
        assert_eq!(trades[0].trade_id.as_deref(), Some("991"));
    }

    #[test]
    fn test_ack_frames_absorbed() {
        let (adapter, mut rx) = test_adapter();
        adapter.inner.handle_frame(r#"{"result":null,"id":3}"#);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_kline_stream_subscribe_tracks_once() {
        let (adapter, _rx) = test_adapter();
        assert!(adapter.subscribe_kline("BTCUSDT", "1m"));
        // second user of the same stream: no new upstream call
        assert!(!adapter.subscribe_kline("BTCUSDT", "1m"));
        adapter.unsubscribe_kline("BTCUSDT", "1m");
        assert_eq!(adapter.inner.shared.topic_count(), 1);
        adapter.unsubscribe_kline("BTCUSDT", "1m");
        assert_eq!(adapter.inner.shared.topic_count(), 0);
    }
}
