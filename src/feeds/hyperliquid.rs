use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};

use crate::config::{ExchangeConfig, HubConfig};
use crate::feeds::{parse_f64, parse_f64_opt, spawn_socket, AdapterShared, ExchangeAdapter, WsProtocol};
use crate::models::candle::Candle;
use crate::models::event::{BookUpdate, Channel, EventData, MarketEvent, StatusEvent};
use crate::models::market::{Funding, OpenInterest, Ticker, Trade, TradeSide};
use rust_decimal::Decimal;
use std::str::FromStr;

pub const NAME: &str = "hyperliquid";

/// Hyperliquid perps over the `/ws` endpoint.
///
/// One subscribe message per topic. Coins, not symbols: `BTCUSDT`/`BTCUSDC`
/// strip their suffix to `BTC` before hitting the wire. `allMids` is
/// subscribed on every open and yields a ticker per coin; `activeAssetCtx`
/// fans out into ticker, funding, and open-interest events.
pub struct HyperliquidAdapter {
    inner: Arc<HyperliquidInner>,
}

struct HyperliquidInner {
    shared: AdapterShared,
    http: reqwest::Client,
    rest_url: String,
}

impl HyperliquidAdapter {
    pub fn new(
        config: &ExchangeConfig,
        hub: &HubConfig,
        http: reqwest::Client,
        events_tx: mpsc::UnboundedSender<MarketEvent>,
        status_tx: mpsc::UnboundedSender<StatusEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(HyperliquidInner {
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
            }),
        }
    }
}

/// `BTCUSDT` → `BTC`; already-bare coins pass through.
pub fn to_coin(symbol: &str) -> String {
    let upper = symbol.to_uppercase();
    for suffix in ["USDT", "USDC"] {
        if let Some(stripped) = upper.strip_suffix(suffix) {
            if !stripped.is_empty() {
                return stripped.to_string();
            }
        }
    }
    upper
}

impl HyperliquidInner {
    fn send_sub(&self, op: &str, subscription: serde_json::Value) {
        self.shared.send_frame(
            serde_json::json!({ "method": op, "subscription": subscription }).to_string(),
        );
    }

    /// Topic keys: "trades:BTC", "l2Book:BTC", "activeAssetCtx:BTC",
    /// "candle:BTC:1m".
    fn subscription_for(topic: &str) -> Option<serde_json::Value> {
        let mut parts = topic.splitn(3, ':');
        let kind = parts.next()?;
        let coin = parts.next()?;
        match kind {
            "candle" => {
                let interval = parts.next()?;
                Some(serde_json::json!({ "type": "candle", "coin": coin, "interval": interval }))
            }
            "trades" | "l2Book" | "activeAssetCtx" => {
                Some(serde_json::json!({ "type": kind, "coin": coin }))
            }
            _ => None,
        }
    }

    fn send_topic(&self, op: &str, topic: &str) {
        if let Some(sub) = Self::subscription_for(topic) {
            self.send_sub(op, sub);
        }
    }
}

impl WsProtocol for HyperliquidInner {
    fn shared(&self) -> &AdapterShared {
        &self.shared
    }

    fn ping_frame(&self) -> Option<Message> {
        Some(Message::Text(r#"{"method":"ping"}"#.to_string()))
    }

    fn is_pong(&self, text: &str) -> bool {
        text.contains(r#""channel":"pong""#)
    }

    fn on_open(&self) {
        // Mandatory: mid prices for every coin.
        self.send_sub("subscribe", serde_json::json!({ "type": "allMids" }));

        let hot = self.shared.hot_symbols.read().clone();
        for symbol in hot {
            let coin = to_coin(&symbol);
            self.send_sub(
                "subscribe",
                serde_json::json!({ "type": "trades", "coin": coin }),
            );
            self.send_sub(
                "subscribe",
                serde_json::json!({ "type": "l2Book", "coin": coin }),
            );
        }

        for entry in self.shared.active_topics.iter() {
            self.send_topic("subscribe", entry.key());
        }
    }

    fn handle_frame(&self, text: &str) {
        let frame: HlFrame = match serde_json::from_str(text) {
            Ok(f) => f,
            Err(e) => {
                warn!("hyperliquid unparseable frame: {e} [{}]", crate::feeds::truncate_frame(text));
                return;
            }
        };
        let Some(data) = frame.data else { return };

        match frame.channel.as_str() {
            "subscriptionResponse" => {}
            "error" => warn!("hyperliquid error frame: {data}"),
            "allMids" => self.handle_all_mids(data),
            "activeAssetCtx" => self.handle_asset_ctx(data),
            "trades" => self.handle_trades(data),
            "l2Book" => self.handle_l2_book(data),
            "candle" => self.handle_candle(data),
            _ => {}
        }
    }
}

impl HyperliquidInner {
    fn handle_all_mids(&self, data: serde_json::Value) {
        let Ok(raw) = serde_json::from_value::<HlAllMids>(data) else {
            return;
        };
        for (coin, mid) in raw.mids {
            let Some(price) = parse_f64(&mid) else { continue };
            self.shared.emit(MarketEvent {
                exchange: NAME,
                channel: Channel::Tickers,
                symbol: coin,
                interval: None,
                data: EventData::Ticker(Ticker {
                    last_price: Some(price),
                    ..Default::default()
                }),
            });
        }
    }

    fn handle_asset_ctx(&self, data: serde_json::Value) {
        let Ok(raw) = serde_json::from_value::<HlAssetCtx>(data) else {
            return;
        };
        let ctx = raw.ctx;
        let mark = parse_f64_opt(ctx.mark_px.as_deref());
        let mid = parse_f64_opt(ctx.mid_px.as_deref());
        let open = parse_f64_opt(ctx.prev_day_px.as_deref());
        let last = mid.or(mark);
        let pcnt = match (last, open) {
            (Some(last), Some(open)) if open > 0.0 => Some((last - open) / open),
            _ => None,
        };
        let funding_rate = parse_f64_opt(ctx.funding.as_deref());
        let open_interest = parse_f64_opt(ctx.open_interest.as_deref());

        self.shared.emit(MarketEvent {
            exchange: NAME,
            channel: Channel::Tickers,
            symbol: raw.coin.clone(),
            interval: None,
            data: EventData::Ticker(Ticker {
                last_price: last,
                mark_price: mark,
                index_price: parse_f64_opt(ctx.oracle_px.as_deref()),
                open24h: open,
                turnover24h: parse_f64_opt(ctx.day_ntl_vlm.as_deref()),
                price24h_pcnt: pcnt,
                funding_rate,
                open_interest,
                ..Default::default()
            }),
        });
        if funding_rate.is_some() {
            self.shared.emit(MarketEvent {
                exchange: NAME,
                channel: Channel::Funding,
                symbol: raw.coin.clone(),
                interval: None,
                data: EventData::Funding(Funding {
                    funding_rate,
                    next_funding_time: None,
                    funding_time: None,
                }),
            });
        }
        if let Some(oi) = open_interest {
            self.shared.emit(MarketEvent {
                exchange: NAME,
                channel: Channel::Tickers,
                symbol: raw.coin,
                interval: None,
                data: EventData::OpenInterest(OpenInterest {
                    open_interest: oi,
                    open_interest_value: None,
                }),
            });
        }
    }

    fn handle_trades(&self, data: serde_json::Value) {
        let Ok(raw) = serde_json::from_value::<Vec<HlTrade>>(data) else {
            return;
        };
        let mut by_coin: std::collections::HashMap<String, Vec<Trade>> = Default::default();
        for t in raw {
            let (Some(price), Some(size)) = (parse_f64(&t.px), parse_f64(&t.sz)) else {
                continue;
            };
            by_coin.entry(t.coin).or_default().push(Trade {
                price,
                size,
                // "B" is the bid (buy) aggressor, "A" the ask side
                side: if t.side == "B" {
                    TradeSide::Buy
                } else {
                    TradeSide::Sell
                },
                timestamp: t.time,
                trade_id: t.tid.map(|id| id.to_string()),
            });
        }
        for (coin, trades) in by_coin {
            self.shared.emit(MarketEvent {
                exchange: NAME,
                channel: Channel::Trades,
                symbol: coin,
                interval: None,
                data: EventData::Trades(trades),
            });
        }
    }

    fn handle_l2_book(&self, data: serde_json::Value) {
        let Ok(raw) = serde_json::from_value::<HlBook>(data) else {
            return;
        };
        if raw.levels.len() < 2 {
            return;
        }
        let parse_side = |levels: &[HlLevel]| -> Vec<(Decimal, Decimal)> {
            levels
                .iter()
                .filter_map(|l| {
                    Some((Decimal::from_str(&l.px).ok()?, Decimal::from_str(&l.sz).ok()?))
                })
                .collect()
        };
        self.shared.emit(MarketEvent {
            exchange: NAME,
            channel: Channel::Orderbook,
            symbol: raw.coin,
            interval: None,
            data: EventData::Orderbook(BookUpdate {
                bids: parse_side(&raw.levels[0]),
                asks: parse_side(&raw.levels[1]),
                snapshot: true,
                update_id: None,
                cross_seq: None,
                timestamp: raw.time,
            }),
        });
    }

    fn handle_candle(&self, data: serde_json::Value) {
        let Ok(raw) = serde_json::from_value::<HlCandle>(data) else {
            return;
        };
        let candle = Candle {
            t: raw.t,
            o: parse_f64_opt(raw.o.as_deref()).unwrap_or(0.0),
            h: parse_f64_opt(raw.h.as_deref()).unwrap_or(0.0),
            l: parse_f64_opt(raw.l.as_deref()).unwrap_or(0.0),
            c: parse_f64_opt(raw.c.as_deref()).unwrap_or(0.0),
            v: parse_f64_opt(raw.v.as_deref()).unwrap_or(0.0),
            closed: None,
        };
        self.shared.emit(MarketEvent {
            exchange: NAME,
            channel: Channel::Klines,
            symbol: raw.s,
            interval: Some(raw.i),
            data: EventData::Kline(candle),
        });
    }
}

#[async_trait]
impl ExchangeAdapter for HyperliquidAdapter {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn connect(&self) -> Result<()> {
        if !self.inner.shared.begin_connect() {
            return Ok(());
        }
        match self.fetch_symbols().await {
            Ok(symbols) => {
                info!("hyperliquid discovered {} coins", symbols.len());
                *self.inner.shared.symbols.write() = symbols;
            }
            Err(e) => warn!("hyperliquid symbol discovery failed, using previous list: {e}"),
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
        let url = format!("{}/info", self.inner.rest_url);
        let body: serde_json::Value = self
            .inner
            .http
            .post(&url)
            .json(&serde_json::json!({ "type": "meta" }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("hyperliquid meta response")?;
        let universe = body["universe"]
            .as_array()
            .context("hyperliquid meta missing universe")?;
        Ok(universe
            .iter()
            .filter_map(|item| item["name"].as_str().map(String::from))
            .collect())
    }

    fn subscribe_hot_symbols(&self, symbols: &[String]) {
        *self.inner.shared.hot_symbols.write() = symbols.to_vec();
        if !self.inner.shared.is_connected() {
            return;
        }
        for symbol in symbols {
            let coin = to_coin(symbol);
            self.inner
                .send_sub("subscribe", serde_json::json!({ "type": "trades", "coin": coin }));
            self.inner
                .send_sub("subscribe", serde_json::json!({ "type": "l2Book", "coin": coin }));
        }
    }

    fn subscribe_symbol(&self, symbol: &str, channels: &[Channel]) -> bool {
        let coin = to_coin(symbol);
        let mut issued = false;
        for &channel in channels {
            let kind = match channel {
                Channel::Tickers | Channel::Funding => "activeAssetCtx",
                Channel::Orderbook => "l2Book",
                Channel::Trades => "trades",
                Channel::Klines | Channel::Liquidations => continue,
            };
            let topic = format!("{kind}:{coin}");
            if self.inner.shared.track_topic(&topic) {
                self.inner.send_topic("subscribe", &topic);
                issued = true;
            }
        }
        issued
    }

    fn unsubscribe_symbol(&self, symbol: &str, channels: &[Channel]) {
        let coin = to_coin(symbol);
        for &channel in channels {
            let kind = match channel {
                Channel::Tickers | Channel::Funding => "activeAssetCtx",
                Channel::Orderbook => "l2Book",
                Channel::Trades => "trades",
                Channel::Klines | Channel::Liquidations => continue,
            };
            let topic = format!("{kind}:{coin}");
            if self.inner.shared.untrack_topic(&topic) {
                self.inner.send_topic("unsubscribe", &topic);
            }
        }
    }

    fn subscribe_kline(&self, symbol: &str, interval: &str) -> bool {
        let topic = format!("candle:{}:{interval}", to_coin(symbol));
        if !self.inner.shared.track_topic(&topic) {
            return false;
        }
        self.inner.send_topic("subscribe", &topic);
        true
    }

    fn unsubscribe_kline(&self, symbol: &str, interval: &str) {
        let topic = format!("candle:{}:{interval}", to_coin(symbol));
        if self.inner.shared.untrack_topic(&topic) {
            self.inner.send_topic("unsubscribe", &topic);
        }
    }
}

// --- wire types ---

#[derive(Debug, Deserialize)]
struct HlFrame {
    channel: String,
    data: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct HlAllMids {
    mids: std::collections::HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct HlAssetCtx {
    coin: String,
    ctx: HlCtx,
}

#[derive(Debug, Deserialize)]
struct HlCtx {
    funding: Option<String>,
    #[serde(rename = "openInterest")]
    open_interest: Option<String>,
    #[serde(rename = "prevDayPx")]
    prev_day_px: Option<String>,
    #[serde(rename = "dayNtlVlm")]
    day_ntl_vlm: Option<String>,
    #[serde(rename = "oraclePx")]
    oracle_px: Option<String>,
    #[serde(rename = "markPx")]
    mark_px: Option<String>,
    #[serde(rename = "midPx")]
    mid_px: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HlTrade {
    coin: String,
    side: String,
    px: String,
    sz: String,
    time: i64,
    tid: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct HlBook {
    coin: String,
    #[serde(default)]
    time: i64,
    levels: Vec<Vec<HlLevel>>,
}

#[derive(Debug, Deserialize)]
struct HlLevel {
    px: String,
    sz: String,
}

#[derive(Debug, Deserialize)]
struct HlCandle {
    t: i64,
    s: String,
    i: String,
    o: Option<String>,
    h: Option<String>,
    l: Option<String>,
    c: Option<String>,
    v: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn test_adapter() -> (HyperliquidAdapter, mpsc::UnboundedReceiver<MarketEvent>) {
        let config = Config::default();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status_tx, _status_rx) = mpsc::unbounded_channel();
        let adapter = HyperliquidAdapter::new(
            &config.hyperliquid,
            &config.hub,
            reqwest::Client::new(),
            events_tx,
            status_tx,
        );
        (adapter, events_rx)
    }

    #[test]
    fn test_symbol_strip_rule() {
        assert_eq!(to_coin("BTCUSDT"), "BTC");
        assert_eq!(to_coin("ethusdc"), "ETH");
        assert_eq!(to_coin("SOL"), "SOL");
        // suffix-only input does not strip to nothing
        assert_eq!(to_coin("USDT"), "USDT");
    }

    #[test]
    fn test_all_mids_yields_ticker_per_coin() {
        let (adapter, mut rx) = test_adapter();
        let frame = r#"{"channel":"allMids","data":{"mids":{"BTC":"65000.5","ETH":"3000.25"}}}"#;
        adapter.inner.handle_frame(frame);

        let mut seen = std::collections::HashMap::new();
        for _ in 0..2 {
            let ev = rx.try_recv().unwrap();
            let EventData::Ticker(t) = ev.data else {
                panic!("expected ticker")
            };
            seen.insert(ev.symbol, t.last_price);
        }
        assert_eq!(seen["BTC"], Some(65000.5));
        assert_eq!(seen["ETH"], Some(3000.25));
    }

    #[test]
    fn test_asset_ctx_fans_out() {
        let (adapter, mut rx) = test_adapter();
        let frame = r#"{"channel":"activeAssetCtx","data":{"coin":"BTC","ctx":{
            "funding":"0.0000125","openInterest":"8123.5","prevDayPx":"64000",
            "dayNtlVlm":"123456789.0","oraclePx":"65001","markPx":"65000.5","midPx":"65000.25"}}}"#;
        adapter.inner.handle_frame(frame);

        let ev = rx.try_recv().unwrap();
        let EventData::Ticker(t) = ev.data else {
            panic!("expected ticker first")
        };
        assert_eq!(t.mark_price, Some(65000.5));
        assert_eq!(t.index_price, Some(65001.0));
        assert_eq!(t.funding_rate, Some(0.0000125));

        let ev = rx.try_recv().unwrap();
        assert!(matches!(ev.data, EventData::Funding(_)));
        let ev = rx.try_recv().unwrap();
        assert!(matches!(ev.data, EventData::OpenInterest(_)));
    }

    #[test]
    fn test_l2_book_snapshot() {
        let (adapter, mut rx) = test_adapter();
        let frame = r#"{"channel":"l2Book","data":{"coin":"BTC","time":1700000000000,
            "levels":[[{"px":"64999","sz":"1.5","n":3}],[{"px":"65001","sz":"0.7","n":2}]]}}"#;
        adapter.inner.handle_frame(frame);
        let ev = rx.try_recv().unwrap();
        let EventData::Orderbook(book) = ev.data else {
            panic!("expected orderbook")
        };
        assert!(book.snapshot);
        assert_eq!(book.bids.len(), 1);
        assert_eq!(book.asks.len(), 1);
    }

    #[test]
    fn test_trade_sides() {
        let (adapter, mut rx) = test_adapter();
        let frame = r#"{"channel":"trades","data":[
            {"coin":"BTC","side":"B","px":"65000","sz":"0.1","time":1,"tid":11},
            {"coin":"BTC","side":"A","px":"65001","sz":"0.2","time":2,"tid":12}]}"#;
        adapter.inner.handle_frame(frame);
        let ev = rx.try_recv().unwrap();
        let EventData::Trades(trades) = ev.data else {
            panic!("expected trades")
        };
        assert_eq!(trades[0].side, TradeSide::Buy);
        assert_eq!(trades[1].side, TradeSide::Sell);
    }
}
