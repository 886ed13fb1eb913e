use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::candle::Candle;
use crate::models::market::{Funding, Liquidation, OpenInterest, Ticker, Trade};

/// Downstream subscription channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Tickers,
    Orderbook,
    Trades,
    Klines,
    Liquidations,
    Funding,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Tickers => "tickers",
            Channel::Orderbook => "orderbook",
            Channel::Trades => "trades",
            Channel::Klines => "klines",
            Channel::Liquidations => "liquidations",
            Channel::Funding => "funding",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One parsed orderbook frame. `snapshot` distinguishes full replacement from
/// a delta to merge.
#[derive(Debug, Clone)]
pub struct BookUpdate {
    pub bids: Vec<(Decimal, Decimal)>,
    pub asks: Vec<(Decimal, Decimal)>,
    pub snapshot: bool,
    pub update_id: Option<u64>,
    pub cross_seq: Option<u64>,
    pub timestamp: i64,
}

/// Canonical event every adapter normalizes its wire format into.
#[derive(Debug, Clone)]
pub struct MarketEvent {
    pub exchange: &'static str,
    pub channel: Channel,
    pub symbol: String,
    pub interval: Option<String>,
    pub data: EventData,
}

#[derive(Debug, Clone)]
pub enum EventData {
    Ticker(Ticker),
    Orderbook(BookUpdate),
    Trades(Vec<Trade>),
    Liquidation(Liquidation),
    Kline(Candle),
    Funding(Funding),
    OpenInterest(OpenInterest),
}

/// Adapter connectivity transitions, broadcast to every client.
#[derive(Debug, Clone, Copy)]
pub struct StatusEvent {
    pub exchange: &'static str,
    pub connected: bool,
}

/// Server → client frames on the downstream push channel.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PushMessage {
    Connected {
        #[serde(rename = "hubReady")]
        hub_ready: bool,
        exchanges: Vec<ExchangeSummary>,
        ts: i64,
    },
    Snapshot {
        exchange: String,
        channel: Channel,
        symbol: String,
        data: Value,
    },
    Update {
        exchange: String,
        channel: Channel,
        symbol: String,
        data: Value,
    },
    Status {
        exchange: String,
        connected: bool,
    },
    Pong {
        ts: i64,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct ExchangeSummary {
    pub name: String,
    pub connected: bool,
    pub symbols: usize,
}

/// Client → server frames.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ClientRequest {
    Subscribe {
        exchange: String,
        channel: Channel,
        /// For klines this is the compound `"<SYMBOL>:<interval>"`.
        symbol: String,
    },
    Unsubscribe {
        exchange: String,
        channel: Channel,
        symbol: String,
    },
    Ping,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_request_parses() {
        let msg = r#"{"action":"subscribe","exchange":"bybit","channel":"klines","symbol":"BTCUSDT:1"}"#;
        let req: ClientRequest = serde_json::from_str(msg).unwrap();
        match req {
            ClientRequest::Subscribe { exchange, channel, symbol } => {
                assert_eq!(exchange, "bybit");
                assert_eq!(channel, Channel::Klines);
                assert_eq!(symbol, "BTCUSDT:1");
            }
            _ => panic!("expected subscribe"),
        }

        let ping: ClientRequest = serde_json::from_str(r#"{"action":"ping"}"#).unwrap();
        assert!(matches!(ping, ClientRequest::Ping));
    }

    #[test]
    fn test_push_message_wire_shape() {
        let msg = PushMessage::Pong { ts: 123 };
        let wire = serde_json::to_value(&msg).unwrap();
        assert_eq!(wire["type"], "pong");
        assert_eq!(wire["ts"], 123);

        let status = PushMessage::Status {
            exchange: "bybit".into(),
            connected: true,
        };
        let wire = serde_json::to_value(&status).unwrap();
        assert_eq!(wire["type"], "status");
        assert_eq!(wire["connected"], true);
    }
}
