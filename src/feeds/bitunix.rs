use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
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
use crate::models::candle::{align_open_time, Candle};
use crate::models::event::{BookUpdate, Channel, EventData, MarketEvent, StatusEvent};
use crate::models::market::{Ticker, Trade, TradeSide};

pub const NAME: &str = "bitunix";

/// Bitunix futures public channel.
///
/// Topics are `{symbol, ch}` pairs sent in batches of 10, with a hard cap of
/// 300 active topics per socket. Kline channels are `market_kline_{interval}`
/// (`1min` … `1month`) and candle open times are aligned down to the
/// interval boundary because frames carry the event time, not the open.
pub struct BitunixAdapter {
    inner: Arc<BitunixInner>,
}

struct BitunixInner {
    shared: AdapterShared,
    http: reqwest::Client,
    rest_url: String,
    sub_limit: usize,
}

impl BitunixAdapter {
    pub fn new(
        config: &ExchangeConfig,
        hub: &HubConfig,
        http: reqwest::Client,
        events_tx: mpsc::UnboundedSender<MarketEvent>,
        status_tx: mpsc::UnboundedSender<StatusEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(BitunixInner {
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
                sub_limit: hub.bitunix_sub_limit,
            }),
        }
    }
}

fn channel_name(channel: Channel) -> Option<&'static str> {
    match channel {
        Channel::Tickers | Channel::Funding => Some("ticker"),
        Channel::Orderbook => Some("depth_books"),
        Channel::Trades => Some("trade"),
        Channel::Klines | Channel::Liquidations => None,
    }
}

fn topic_key(channel: &str, symbol: &str) -> String {
    format!("{channel}:{symbol}")
}

impl BitunixInner {
    fn send_op(&self, op: &str, topics: &[String]) {
        for chunk in topics.chunks(10) {
            let args: Vec<serde_json::Value> = chunk
                .iter()
                .filter_map(|topic| {
                    let (ch, symbol) = topic.split_once(':')?;
                    Some(serde_json::json!({ "symbol": symbol, "ch": ch }))
                })
                .collect();
            if args.is_empty() {
                continue;
            }
            self.shared
                .send_frame(serde_json::json!({ "op": op, "args": args }).to_string());
        }
    }

    /// Reserve capacity for `want` new topics against the per-socket cap.
    /// Refusal leaves the active set untouched.
    fn within_limit(&self, want: usize) -> bool {
        let active = self.shared.topic_count();
        if active + want > self.sub_limit {
            warn!(
                "bitunix subscription cap reached: {active} active + {want} requested > {}",
                self.sub_limit
            );
            return false;
        }
        true
    }
}

impl WsProtocol for BitunixInner {
    fn shared(&self) -> &AdapterShared {
        &self.shared
    }

    fn ping_frame(&self) -> Option<Message> {
        let frame = serde_json::json!({
            "op": "ping",
            "ping": chrono::Utc::now().timestamp(),
        });
        Some(Message::Text(frame.to_string()))
    }

    fn is_pong(&self, text: &str) -> bool {
        text.contains(r#""op":"pong""#) || text.contains(r#""pong":"#)
    }

    fn on_open(&self) {
        let hot = self.shared.hot_symbols.read().clone();
        let mut topics: Vec<String> = hot
            .iter()
            .flat_map(|s| [topic_key("trade", s), topic_key("depth_books", s)])
            .collect();
        topics.extend(self.shared.active_topics.iter().map(|e| e.key().clone()));
        self.send_op("subscribe", &topics);
    }

    fn handle_frame(&self, text: &str) {
        let frame: BitunixFrame = match serde_json::from_str(text) {
            Ok(f) => f,
            Err(e) => {
                warn!("bitunix unparseable frame: {e} [{}]", crate::feeds::truncate_frame(text));
                return;
            }
        };

        if let Some(op) = frame.op.as_deref() {
            // subscribe/unsubscribe acks; non-zero code is an upstream error
            if frame.code.map(|c| c != 0).unwrap_or(false) {
                warn!("bitunix {op} rejected: {}", frame.msg.as_deref().unwrap_or("?"));
            }
            return;
        }

        let (Some(ch), Some(symbol), Some(data)) = (frame.ch, frame.symbol, frame.data) else {
            return;
        };
        let ts = frame.ts.unwrap_or_else(|| chrono::Utc::now().timestamp_millis());

        match ch.as_str() {
            "ticker" => self.handle_ticker(&symbol, data),
            "depth_books" => self.handle_depth(&symbol, data, ts),
            "trade" => self.handle_trades(&symbol, data),
            _ => {
                if let Some(interval) = ch.strip_prefix("market_kline_") {
                    self.handle_kline(&symbol, interval, data, ts);
                }
            }
        }
    }
}

impl BitunixInner {
    fn handle_ticker(&self, symbol: &str, data: serde_json::Value) {
        let Ok(raw) = serde_json::from_value::<BitunixTicker>(data) else {
            return;
        };
        let last = parse_f64_opt(raw.last_price.as_deref());
        let open = parse_f64_opt(raw.open.as_deref());
        let pcnt = match (last, open) {
            (Some(last), Some(open)) if open > 0.0 => Some((last - open) / open),
            _ => None,
        };
        self.shared.emit(MarketEvent {
            exchange: NAME,
            channel: Channel::Tickers,
            symbol: symbol.to_string(),
            interval: None,
            data: EventData::Ticker(Ticker {
                last_price: last,
                mark_price: parse_f64_opt(raw.mark_price.as_deref()),
                index_price: parse_f64_opt(raw.index_price.as_deref()),
                high24h: parse_f64_opt(raw.high.as_deref()),
                low24h: parse_f64_opt(raw.low.as_deref()),
                open24h: open,
                volume24h: parse_f64_opt(raw.base_vol.as_deref()),
                turnover24h: parse_f64_opt(raw.quote_vol.as_deref()),
                price24h_pcnt: pcnt,
                funding_rate: parse_f64_opt(raw.funding_rate.as_deref()),
                ..Default::default()
            }),
        });
    }

    /// `depth_books` frames carry the full visible book every time.
    fn handle_depth(&self, symbol: &str, data: serde_json::Value, ts: i64) {
        let Ok(raw) = serde_json::from_value::<BitunixDepth>(data) else {
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
                snapshot: true,
                update_id: None,
                cross_seq: None,
                timestamp: ts,
            }),
        });
    }

    fn handle_trades(&self, symbol: &str, data: serde_json::Value) {
        let Ok(raw) = serde_json::from_value::<Vec<BitunixTrade>>(data) else {
            return;
        };
        let trades: Vec<Trade> = raw
            .into_iter()
            .filter_map(|t| {
                Some(Trade {
                    price: parse_f64(&t.price)?,
                    size: parse_f64(&t.volume)?,
                    side: if t.side == "buy" {
                        TradeSide::Buy
                    } else {
                        TradeSide::Sell
                    },
                    timestamp: t.ts,
                    trade_id: None,
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

    fn handle_kline(&self, symbol: &str, interval: &str, data: serde_json::Value, ts: i64) {
        let Ok(raw) = serde_json::from_value::<BitunixKline>(data) else {
            return;
        };
        let candle = Candle {
            // Frames stamp the event time; the ring keys on the open.
            t: align_open_time(ts, interval),
            o: parse_f64_opt(raw.open.as_deref()).unwrap_or(0.0),
            h: parse_f64_opt(raw.high.as_deref()).unwrap_or(0.0),
            l: parse_f64_opt(raw.low.as_deref()).unwrap_or(0.0),
            c: parse_f64_opt(raw.close.as_deref()).unwrap_or(0.0),
            v: parse_f64_opt(raw.base_vol.as_deref()).unwrap_or(0.0),
            closed: None,
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

#[async_trait]
impl ExchangeAdapter for BitunixAdapter {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn connect(&self) -> Result<()> {
        if !self.inner.shared.begin_connect() {
            return Ok(());
        }
        match self.fetch_symbols().await {
            Ok(symbols) => {
                info!("bitunix discovered {} symbols", symbols.len());
                *self.inner.shared.symbols.write() = symbols;
            }
            Err(e) => warn!("bitunix symbol discovery failed, using previous list: {e}"),
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
        let url = format!("{}/api/v1/futures/market/trading_pairs", self.inner.rest_url);
        let body: serde_json::Value = self
            .inner
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("bitunix trading pairs response")?;
        if body["code"].as_i64() != Some(0) {
            bail!("bitunix trading pairs error: {}", body["msg"]);
        }
        let list = body["data"]
            .as_array()
            .context("bitunix trading pairs missing data")?;
        Ok(list
            .iter()
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
            .flat_map(|s| [topic_key("trade", s), topic_key("depth_books", s)])
            .collect();
        self.inner.send_op("subscribe", &topics);
    }

    fn subscribe_symbol(&self, symbol: &str, channels: &[Channel]) -> bool {
        let mut fresh = Vec::new();
        let mut already = Vec::new();
        for &channel in channels {
            let Some(name) = channel_name(channel) else {
                continue;
            };
            let topic = topic_key(name, symbol);
            if self.inner.shared.active_topics.contains_key(&topic) {
                already.push(topic);
            } else {
                fresh.push(topic);
            }
        }
        if fresh.is_empty() {
            for topic in &already {
                self.inner.shared.track_topic(topic);
            }
            return false;
        }
        // Refusal must leave the active set exactly as it was.
        if !self.inner.within_limit(fresh.len()) {
            return false;
        }
        for topic in already.iter().chain(fresh.iter()) {
            self.inner.shared.track_topic(topic);
        }
        self.inner.send_op("subscribe", &fresh);
        true
    }

    fn unsubscribe_symbol(&self, symbol: &str, channels: &[Channel]) {
        let mut topics = Vec::new();
        for &channel in channels {
            let Some(name) = channel_name(channel) else {
                continue;
            };
            let topic = topic_key(name, symbol);
            if self.inner.shared.untrack_topic(&topic) {
                topics.push(topic);
            }
        }
        self.inner.send_op("unsubscribe", &topics);
    }

    fn subscribe_kline(&self, symbol: &str, interval: &str) -> bool {
        let topic = topic_key(&format!("market_kline_{interval}"), symbol);
        if self.inner.shared.active_topics.contains_key(&topic) {
            self.inner.shared.track_topic(&topic);
            return false;
        }
        if !self.inner.within_limit(1) {
            return false;
        }
        self.inner.shared.track_topic(&topic);
        self.inner.send_op("subscribe", &[topic]);
        true
    }

    fn unsubscribe_kline(&self, symbol: &str, interval: &str) {
        let topic = topic_key(&format!("market_kline_{interval}"), symbol);
        if self.inner.shared.untrack_topic(&topic) {
            self.inner.send_op("unsubscribe", &[topic]);
        }
    }
}

// --- wire types ---

#[derive(Debug, Deserialize)]
struct BitunixFrame {
    op: Option<String>,
    code: Option<i64>,
    msg: Option<String>,
    ch: Option<String>,
    symbol: Option<String>,
    ts: Option<i64>,
    data: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct BitunixTicker {
    #[serde(rename = "lastPrice")]
    last_price: Option<String>,
    #[serde(rename = "markPrice")]
    mark_price: Option<String>,
    #[serde(rename = "indexPrice")]
    index_price: Option<String>,
    open: Option<String>,
    high: Option<String>,
    low: Option<String>,
    #[serde(rename = "baseVol")]
    base_vol: Option<String>,
    #[serde(rename = "quoteVol")]
    quote_vol: Option<String>,
    #[serde(rename = "fundingRate")]
    funding_rate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BitunixDepth {
    #[serde(default)]
    bids: Vec<[String; 2]>,
    #[serde(default)]
    asks: Vec<[String; 2]>,
}

#[derive(Debug, Deserialize)]
struct BitunixTrade {
    #[serde(rename = "t")]
    ts: i64,
    #[serde(rename = "p")]
    price: String,
    #[serde(rename = "v")]
    volume: String,
    #[serde(rename = "s")]
    side: String,
}

#[derive(Debug, Deserialize)]
struct BitunixKline {
    #[serde(rename = "o")]
    open: Option<String>,
    #[serde(rename = "h")]
    high: Option<String>,
    #[serde(rename = "l")]
    low: Option<String>,
    #[serde(rename = "c")]
    close: Option<String>,
    #[serde(rename = "b")]
    base_vol: Option<String>,
    #[serde(rename = "q")]
    quote_vol: Option<String>,
}
