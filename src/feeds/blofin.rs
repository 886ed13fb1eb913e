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
use crate::models::candle::Candle;
use crate::models::event::{BookUpdate, Channel, EventData, MarketEvent, StatusEvent};
use crate::models::market::{Funding, Ticker, Trade, TradeSide};

pub const NAME: &str = "blofin";

/// Blofin public channel.
///
/// Subscriptions are `{channel, instId}` pairs; instIds use dashes
/// (`BTC-USDT`). Depth rides `books50`, candles `candle{interval}`, funding
/// `funding-rate`. The keep-alive is the literal string `"ping"` and a
/// `"code":"0"` marks a successful ack.
pub struct BlofinAdapter {
    inner: Arc<BlofinInner>,
}

struct BlofinInner {
    shared: AdapterShared,
    http: reqwest::Client,
    rest_url: String,
}

impl BlofinAdapter {
    pub fn new(
        config: &ExchangeConfig,
        hub: &HubConfig,
        http: reqwest::Client,
        events_tx: mpsc::UnboundedSender<MarketEvent>,
        status_tx: mpsc::UnboundedSender<StatusEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(BlofinInner {
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

fn channel_name(channel: Channel) -> Option<&'static str> {
    match channel {
        Channel::Tickers => Some("tickers"),
        Channel::Orderbook => Some("books50"),
        Channel::Trades => Some("trades"),
        Channel::Funding => Some("funding-rate"),
        Channel::Klines | Channel::Liquidations => None,
    }
}

/// Topic key "channel:instId", rebuilt into args on reconnect.
fn topic_key(channel: &str, inst_id: &str) -> String {
    format!("{channel}:{inst_id}")
}

impl BlofinInner {
    fn send_op(&self, op: &str, topics: &[String]) {
        let args: Vec<serde_json::Value> = topics
            .iter()
            .filter_map(|topic| {
                let (channel, inst_id) = topic.split_once(':')?;
                Some(serde_json::json!({ "channel": channel, "instId": inst_id }))
            })
            .collect();
        if args.is_empty() {
            return;
        }
        self.shared
            .send_frame(serde_json::json!({ "op": op, "args": args }).to_string());
    }
}

impl WsProtocol for BlofinInner {
    fn shared(&self) -> &AdapterShared {
        &self.shared
    }

    fn ping_frame(&self) -> Option<Message> {
        Some(Message::Text("ping".to_string()))
    }

    fn is_pong(&self, text: &str) -> bool {
        text == "pong"
    }

    fn on_open(&self) {
        let hot = self.shared.hot_symbols.read().clone();
        let mut topics: Vec<String> = hot
            .iter()
            .flat_map(|s| [topic_key("trades", s), topic_key("books50", s)])
            .collect();
        topics.extend(self.shared.active_topics.iter().map(|e| e.key().clone()));
        self.send_op("subscribe", &topics);
    }

    fn handle_frame(&self, text: &str) {
        let frame: BlofinFrame = match serde_json::from_str(text) {
            Ok(f) => f,
            Err(e) => {
                warn!("blofin unparseable frame: {e} [{}]", crate::feeds::truncate_frame(text));
                return;
            }
        };

        // Acks carry an `event`; "code":"0" is success.
        if let Some(event) = frame.event.as_deref() {
            let ok = frame.code.as_deref().map(|c| c == "0").unwrap_or(true);
            if !ok || event == "error" {
                warn!(
                    "blofin {event} rejected: code={} msg={}",
                    frame.code.as_deref().unwrap_or("?"),
                    frame.msg.as_deref().unwrap_or("")
                );
            }
            return;
        }

        let Some(arg) = frame.arg else { return };
        let Some(data) = frame.data else { return };
        let inst_id = arg.inst_id;

        match arg.channel.as_str() {
            "tickers" => self.handle_tickers(&inst_id, data),
            "books50" => {
                let snapshot = frame.action.as_deref() != Some("update");
                self.handle_books(&inst_id, data, snapshot);
            }
            "trades" => self.handle_trades(&inst_id, data),
            "funding-rate" => self.handle_funding(&inst_id, data),
            ch if ch.starts_with("candle") => {
                let interval = &ch["candle".len()..];
                self.handle_candles(&inst_id, interval, data);
            }
            _ => {}
        }
    }
}

impl BlofinInner {
    fn handle_tickers(&self, inst_id: &str, data: serde_json::Value) {
        let Ok(raw) = serde_json::from_value::<Vec<BlofinTicker>>(data) else {
            return;
        };
        for t in raw {
            let last = parse_f64_opt(t.last.as_deref());
            let open = parse_f64_opt(t.open24h.as_deref());
            let pcnt = match (last, open) {
                (Some(last), Some(open)) if open > 0.0 => Some((last - open) / open),
                _ => None,
            };
            self.shared.emit(MarketEvent {
                exchange: NAME,
                channel: Channel::Tickers,
                symbol: inst_id.to_string(),
                interval: None,
                data: EventData::Ticker(Ticker {
                    last_price: last,
                    bid1_price: parse_f64_opt(t.bid_price.as_deref()),
                    ask1_price: parse_f64_opt(t.ask_price.as_deref()),
                    high24h: parse_f64_opt(t.high24h.as_deref()),
                    low24h: parse_f64_opt(t.low24h.as_deref()),
                    open24h: open,
                    volume24h: parse_f64_opt(t.vol24h.as_deref()),
                    turnover24h: parse_f64_opt(t.vol_currency24h.as_deref()),
                    price24h_pcnt: pcnt,
                    ..Default::default()
                }),
            });
        }
    }

    fn handle_books(&self, inst_id: &str, data: serde_json::Value, snapshot: bool) {
        let Ok(raw) = serde_json::from_value::<Vec<BlofinBook>>(data) else {
            return;
        };
        for book in raw {
            let ts = book
                .ts
                .as_deref()
                .and_then(|s| s.parse().ok())
                .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());
            self.shared.emit(MarketEvent {
                exchange: NAME,
                channel: Channel::Orderbook,
                symbol: inst_id.to_string(),
                interval: None,
                data: EventData::Orderbook(BookUpdate {
                    bids: parse_levels(&book.bids),
                    asks: parse_levels(&book.asks),
                    snapshot,
                    update_id: book.seq_id.as_deref().and_then(|s| s.parse().ok()),
                    cross_seq: None,
                    timestamp: ts,
                }),
            });
        }
    }

    fn handle_trades(&self, inst_id: &str, data: serde_json::Value) {
        let Ok(raw) = serde_json::from_value::<Vec<BlofinTrade>>(data) else {
            return;
        };
        let trades: Vec<Trade> = raw
            .into_iter()
            .filter_map(|t| {
                Some(Trade {
                    price: parse_f64(&t.price)?,
                    size: parse_f64(&t.size)?,
                    side: if t.side == "buy" {
                        TradeSide::Buy
                    } else {
                        TradeSide::Sell
                    },
                    timestamp: t.ts.parse().ok()?,
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
            symbol: inst_id.to_string(),
            interval: None,
            data: EventData::Trades(trades),
        });
    }

    fn handle_funding(&self, inst_id: &str, data: serde_json::Value) {
        let Ok(raw) = serde_json::from_value::<Vec<BlofinFunding>>(data) else {
            return;
        };
        for f in raw {
            self.shared.emit(MarketEvent {
                exchange: NAME,
                channel: Channel::Funding,
                symbol: inst_id.to_string(),
                interval: None,
                data: EventData::Funding(Funding {
                    funding_rate: parse_f64_opt(f.funding_rate.as_deref()),
                    next_funding_time: None,
                    funding_time: f.funding_time.as_deref().and_then(|s| s.parse().ok()),
                }),
            });
        }
    }

    /// Candle rows are positional string arrays:
    /// `[ts, open, high, low, close, vol, volCurrency, volQuote, confirm]`.
    fn handle_candles(&self, inst_id: &str, interval: &str, data: serde_json::Value) {
        let Ok(rows) = serde_json::from_value::<Vec<Vec<String>>>(data) else {
            return;
        };
        for row in rows {
            if row.len() < 6 {
                continue;
            }
            let Ok(t) = row[0].parse::<i64>() else { continue };
            let candle = Candle {
                t,
                o: parse_f64(&row[1]).unwrap_or(0.0),
                h: parse_f64(&row[2]).unwrap_or(0.0),
                l: parse_f64(&row[3]).unwrap_or(0.0),
                c: parse_f64(&row[4]).unwrap_or(0.0),
                v: parse_f64(&row[5]).unwrap_or(0.0),
                closed: row.get(8).map(|c| c == "1"),
            };
            self.shared.emit(MarketEvent {
                exchange: NAME,
                channel: Channel::Klines,
                symbol: inst_id.to_string(),
                interval: Some(interval.to_string()),
                data: EventData::Kline(candle),
            });
        }
    }
}

#[async_trait]
impl ExchangeAdapter for BlofinAdapter {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn connect(&self) -> Result<()> {
        if !self.inner.shared.begin_connect() {
            return Ok(());
        }
        match self.fetch_symbols().await {
            Ok(symbols) => {
                info!("blofin discovered {} symbols", symbols.len());
                *self.inner.shared.symbols.write() = symbols;
            }
            Err(e) => warn!("blofin symbol discovery failed, using previous list: {e}"),
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
        let url = format!("{}/api/v1/market/instruments", self.inner.rest_url);
        let body: serde_json::Value = self
            .inner
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("blofin instruments response")?;
        if body["code"].as_str() != Some("0") {
            bail!("blofin instruments error: {}", body["msg"]);
        }
        let list = body["data"]
            .as_array()
            .context("blofin instruments missing data")?;
        Ok(list
            .iter()
            .filter(|item| {
                item["state"]
                    .as_str()
                    .map(|s| s == "live")
                    .unwrap_or(true)
            })
            .filter_map(|item| item["instId"].as_str().map(String::from))
            .collect())
    }

    fn subscribe_hot_symbols(&self, symbols: &[String]) {
        *self.inner.shared.hot_symbols.write() = symbols.to_vec();
        if !self.inner.shared.is_connected() {
            return;
        }
        let topics: Vec<String> = symbols
            .iter()
            .flat_map(|s| [topic_key("trades", s), topic_key("books50", s)])
            .collect();
        self.inner.send_op("subscribe", &topics);
    }

    fn subscribe_symbol(&self, symbol: &str, channels: &[Channel]) -> bool {
        let mut topics = Vec::new();
        for &channel in channels {
            let Some(name) = channel_name(channel) else {
                continue;
            };
            let topic = topic_key(name, symbol);
            if self.inner.shared.track_topic(&topic) {
                topics.push(topic);
            }
        }
        if topics.is_empty() {
            return false;
        }
        self.inner.send_op("subscribe", &topics);
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
        let topic = topic_key(&format!("candle{interval}"), symbol);
        if !self.inner.shared.track_topic(&topic) {
            return false;
        }
        self.inner.send_op("subscribe", &[topic]);
        true
    }

    fn unsubscribe_kline(&self, symbol: &str, interval: &str) {
        let topic = topic_key(&format!("candle{interval}"), symbol);
        if self.inner.shared.untrack_topic(&topic) {
            self.inner.send_op("unsubscribe", &[topic]);
        }
    }
}

// --- wire types ---

#[derive(Debug, Deserialize)]
struct BlofinFrame {
    event: Option<String>,
    code: Option<String>,
    msg: Option<String>,
    arg: Option<BlofinArg>,
    action: Option<String>,
    data: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct BlofinArg {
    channel: String,
    #[serde(rename = "instId")]
    inst_id: String,
}

#[derive(Debug, Deserialize)]
struct BlofinTicker {
    last: Option<String>,
    #[serde(rename = "askPrice")]
    ask_price: Option<String>,
    #[serde(rename = "bidPrice")]
    bid_price: Option<String>,
    high24h: Option<String>,
    low24h: Option<String>,
    open24h: Option<String>,
    vol24h: Option<String>,
    #[serde(rename = "volCurrency24h")]
    vol_currency24h: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BlofinBook {
    #[serde(default)]
    bids: Vec<[String; 2]>,
    #[serde(default)]
    asks: Vec<[String; 2]>,
    ts: Option<String>,
    #[serde(rename = "seqId")]
    seq_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BlofinTrade {
    #[serde(rename = "tradeId")]
    trade_id: String,
    price: String,
    size: String,
    side: String,
    ts: String,
}

#[derive(Debug, Deserialize)]
struct BlofinFunding {
    #[serde(rename = "fundingRate")]
    funding_rate: Option<String>,
    #[serde(rename = "fundingTime")]
    funding_time: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn test_adapter() -> (BlofinAdapter, mpsc::UnboundedReceiver<MarketEvent>) {
        let config = Config::default();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status_tx, _status_rx) = mpsc::unbounded_channel();
        let adapter = BlofinAdapter::new(
            &config.blofin,
            &config.hub,
            reqwest::Client::new(),
            events_tx,
            status_tx,
        );
        (adapter, events_rx)
    }

    #[test]
    fn test_literal_ping_pong() {
        let (adapter, _rx) = test_adapter();
        assert!(adapter.inner.is_pong("pong"));
        assert!(!adapter.inner.is_pong(r#"{"op":"pong"}"#));
        match adapter.inner.ping_frame() {
            Some(Message::Text(t)) => assert_eq!(t, "ping"),
            other => panic!("expected text ping, got {other:?}"),
        }
    }

    #[test]
    fn test_books50_update_frame() {
        let (adapter, mut rx) = test_adapter();
        let frame = r#"{
            "arg":{"channel":"books50","instId":"BTC-USDT"},
            "action":"update",
            "data":[{"bids":[["65000","0"]],"asks":[["65001","2"]],"ts":"1700000000000","seqId":"99"}]
        }"#;
        adapter.inner.handle_frame(frame);
        let ev = rx.try_recv().unwrap();
        assert_eq!(ev.symbol, "BTC-USDT");
        let EventData::Orderbook(book) = ev.data else {
            panic!("expected orderbook")
        };
        assert!(!book.snapshot);
        assert_eq!(book.update_id, Some(99));
    }

    #[test]
    fn test_candle_positional_rows() {
        let (adapter, mut rx) = test_adapter();
        let frame = r#"{
            "arg":{"channel":"candle1m","instId":"ETH-USDT"},
            "data":[["1700000000000","3000","3010","2995","3005","12.5","37500","37500","0"]]
        }"#;
        adapter.inner.handle_frame(frame);
        let ev = rx.try_recv().unwrap();
        assert_eq!(ev.interval.as_deref(), Some("1m"));
        let EventData::Kline(candle) = ev.data else {
            panic!("expected kline")
        };
        assert_eq!(candle.t, 1700000000000);
        assert_eq!(candle.c, 3005.0);
        assert_eq!(candle.closed, Some(false));
    }

    #[test]
    fn test_error_ack_absorbed() {
        let (adapter, mut rx) = test_adapter();
        adapter.inner.handle_frame(
            r#"{"event":"error","code":"60012","msg":"invalid request"}"#,
        );
        adapter.inner.handle_frame(
            r#"{"event":"subscribe","arg":{"channel":"trades","instId":"BTC-USDT"},"code":"0"}"#,
        );
        assert!(rx.try_recv().is_err());
    }
}
