//! End-to-end scenarios through the hub: client subscribe fan-out,
//! demand-driven upstream subscriptions with delayed cleanup, and the
//! snapshot-then-update delivery contract.

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use tickerhub::config::Config;
use tickerhub::feeds::ExchangeAdapter;
use tickerhub::hub::Hub;
use tickerhub::models::event::{Channel, PushMessage};
use tickerhub::models::market::Ticker;

/// Adapter double that records upstream calls instead of opening sockets.
#[derive(Default)]
struct RecordingAdapter {
    calls: Mutex<Vec<String>>,
}

impl RecordingAdapter {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl ExchangeAdapter for RecordingAdapter {
    fn name(&self) -> &'static str {
        "bybit"
    }
    async fn connect(&self) -> Result<()> {
        Ok(())
    }
    fn close(&self) {}
    fn is_connected(&self) -> bool {
        true
    }
    fn symbol_count(&self) -> usize {
        3
    }
    fn last_update_ms(&self) -> i64 {
        0
    }
    async fn fetch_symbols(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
    fn subscribe_hot_symbols(&self, symbols: &[String]) {
        self.calls.lock().push(format!("hot:{}", symbols.join(",")));
    }
    fn subscribe_symbol(&self, symbol: &str, channels: &[Channel]) -> bool {
        self.calls.lock().push(format!("sub:{symbol}:{channels:?}"));
        true
    }
    fn unsubscribe_symbol(&self, symbol: &str, channels: &[Channel]) {
        self.calls
            .lock()
            .push(format!("unsub:{symbol}:{channels:?}"));
    }
    fn subscribe_kline(&self, symbol: &str, interval: &str) -> bool {
        self.calls.lock().push(format!("subk:{symbol}:{interval}"));
        true
    }
    fn unsubscribe_kline(&self, symbol: &str, interval: &str) {
        self.calls.lock().push(format!("unsubk:{symbol}:{interval}"));
    }
    fn subscribe_liquidation(&self, symbol: &str) -> bool {
        self.calls.lock().push(format!("subliq:{symbol}"));
        true
    }
}

fn test_hub(cleanup_delay_secs: u64) -> (Arc<Hub>, Arc<RecordingAdapter>) {
    let mut config = Config::default();
    config.hub.cleanup_delay_secs = cleanup_delay_secs;

    let adapter = Arc::new(RecordingAdapter::default());
    let mut adapters: HashMap<&'static str, Arc<dyn ExchangeAdapter>> = HashMap::new();
    adapters.insert("bybit", adapter.clone());

    let (_events_tx, events_rx) = mpsc::unbounded_channel();
    let (_status_tx, status_rx) = mpsc::unbounded_channel();
    let hub = Hub::with_adapters(config, adapters, events_rx, status_rx);
    (hub, adapter)
}

fn subscribe_msg(channel: &str, symbol: &str) -> String {
    format!(r#"{{"action":"subscribe","exchange":"bybit","channel":"{channel}","symbol":"{symbol}"}}"#)
}

fn unsubscribe_msg(channel: &str, symbol: &str) -> String {
    format!(r#"{{"action":"unsubscribe","exchange":"bybit","channel":"{channel}","symbol":"{symbol}"}}"#)
}

#[tokio::test]
async fn test_hello_then_snapshot_then_update() {
    let (hub, _adapter) = test_hub(60);

    // Seed the cache before the client arrives.
    hub.cache().set_ticker(
        "bybit",
        "BTCUSDT",
        &Ticker {
            last_price: Some(100.0),
            ..Default::default()
        },
    );

    let (tx, mut rx) = mpsc::channel(32);
    let client = hub.add_client(tx);
    hub.handle_client_message(client, &subscribe_msg("tickers", "BTCUSDT"));

    // Publish immediately after the subscribe.
    hub.cache().set_ticker(
        "bybit",
        "BTCUSDT",
        &Ticker {
            last_price: Some(101.0),
            ..Default::default()
        },
    );

    match rx.recv().await.unwrap() {
        PushMessage::Connected { hub_ready, exchanges, .. } => {
            assert!(!hub_ready); // start() never ran
            assert_eq!(exchanges.len(), 1);
            assert_eq!(exchanges[0].name, "bybit");
        }
        other => panic!("expected connected hello, got {other:?}"),
    }
    match rx.recv().await.unwrap() {
        PushMessage::Snapshot { data, symbol, .. } => {
            assert_eq!(symbol, "BTCUSDT");
            assert_eq!(data["lastPrice"], 100.0);
        }
        other => panic!("expected snapshot, got {other:?}"),
    }
    match rx.recv().await.unwrap() {
        PushMessage::Update { data, .. } => {
            assert_eq!(data["lastPrice"], 101.0);
        }
        other => panic!("expected update, got {other:?}"),
    }
}

#[tokio::test]
async fn test_demand_fan_in_single_upstream_call() {
    let (hub, adapter) = test_hub(1);

    let mut clients = Vec::new();
    for _ in 0..3 {
        let (tx, rx) = mpsc::channel(32);
        let id = hub.add_client(tx);
        hub.handle_client_message(id, &subscribe_msg("trades", "BTCUSDT"));
        clients.push((id, rx));
    }
    // three subscribers, exactly one upstream subscribe
    assert_eq!(
        adapter
            .calls()
            .iter()
            .filter(|c| c.starts_with("sub:BTCUSDT"))
            .count(),
        1
    );

    // first two leave: nothing upstream, even after the delay
    for (id, _) in clients.drain(..2) {
        hub.handle_client_message(id, &unsubscribe_msg("trades", "BTCUSDT"));
    }
    tokio::time::sleep(Duration::from_millis(1300)).await;
    assert!(!adapter.calls().iter().any(|c| c.starts_with("unsub:")));

    // last one leaves: exactly one upstream unsubscribe after the delay
    let (id, _) = clients.pop().unwrap();
    hub.handle_client_message(id, &unsubscribe_msg("trades", "BTCUSDT"));
    assert!(!adapter.calls().iter().any(|c| c.starts_with("unsub:")));
    tokio::time::sleep(Duration::from_millis(1300)).await;
    assert_eq!(
        adapter
            .calls()
            .iter()
            .filter(|c| c.starts_with("unsub:BTCUSDT"))
            .count(),
        1
    );
}

#[tokio::test]
async fn test_kline_subscribe_uses_compound_symbol() {
    let (hub, adapter) = test_hub(60);
    let (tx, mut rx) = mpsc::channel(32);
    let client = hub.add_client(tx);
    let _ = rx.recv().await; // hello

    hub.handle_client_message(client, &subscribe_msg("klines", "BTCUSDT:1"));
    assert!(adapter.calls().iter().any(|c| c == "subk:BTCUSDT:1"));

    // updates are addressed to the compound symbol
    hub.cache().update_kline(
        "bybit",
        "BTCUSDT",
        "1",
        tickerhub::models::candle::Candle {
            t: 60_000,
            o: 1.0,
            h: 2.0,
            l: 0.5,
            c: 1.5,
            v: 10.0,
            closed: Some(true),
        },
    );
    match rx.recv().await.unwrap() {
        PushMessage::Update { symbol, channel, .. } => {
            assert_eq!(symbol, "BTCUSDT:1");
            assert_eq!(channel, Channel::Klines);
        }
        other => panic!("expected kline update, got {other:?}"),
    }

    // malformed compound is an error reply, not a panic
    hub.handle_client_message(client, &subscribe_msg("klines", "BTCUSDT"));
    match rx.recv().await.unwrap() {
        PushMessage::Error { message } => assert!(message.contains("SYMBOL:interval")),
        other => panic!("expected error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_duplicate_subscribe_is_noop() {
    let (hub, adapter) = test_hub(60);
    let (tx, mut rx) = mpsc::channel(32);
    let client = hub.add_client(tx);
    let _ = rx.recv().await; // hello

    hub.handle_client_message(client, &subscribe_msg("trades", "BTCUSDT"));
    hub.handle_client_message(client, &subscribe_msg("trades", "BTCUSDT"));
    assert_eq!(
        adapter
            .calls()
            .iter()
            .filter(|c| c.starts_with("sub:"))
            .count(),
        1
    );

    // a single update arrives exactly once
    hub.cache().add_trades(
        "bybit",
        "BTCUSDT",
        vec![tickerhub::models::market::Trade {
            price: 100.0,
            size: 1.0,
            side: tickerhub::models::market::TradeSide::Buy,
            timestamp: 1,
            trade_id: Some("t1".into()),
        }],
    );
    assert!(matches!(rx.recv().await.unwrap(), PushMessage::Update { .. }));
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_ping_pong_and_bad_request() {
    let (hub, _adapter) = test_hub(60);
    let (tx, mut rx) = mpsc::channel(32);
    let client = hub.add_client(tx);
    let _ = rx.recv().await; // hello

    hub.handle_client_message(client, r#"{"action":"ping"}"#);
    assert!(matches!(rx.recv().await.unwrap(), PushMessage::Pong { .. }));

    hub.handle_client_message(client, "{not json");
    assert!(matches!(rx.recv().await.unwrap(), PushMessage::Error { .. }));

    hub.handle_client_message(
        client,
        r#"{"action":"subscribe","exchange":"okx","channel":"trades","symbol":"BTCUSDT"}"#,
    );
    match rx.recv().await.unwrap() {
        PushMessage::Error { message } => assert!(message.contains("unknown exchange")),
        other => panic!("expected error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_cleanup_client_releases_subscriptions() {
    let (hub, adapter) = test_hub(1);
    let (tx, mut rx) = mpsc::channel(32);
    let client = hub.add_client(tx);
    let _ = rx.recv().await; // hello

    hub.handle_client_message(client, &subscribe_msg("trades", "BTCUSDT"));
    hub.handle_client_message(client, &subscribe_msg("orderbook", "BTCUSDT"));
    assert_eq!(hub.client_count(), 1);

    hub.cleanup_client(client);
    assert_eq!(hub.client_count(), 0);

    // cache callbacks are gone: no delivery into the dropped channel
    hub.cache().set_ticker("bybit", "BTCUSDT", &Ticker::default());

    // demand refcounts dropped to zero and cleaned upstream after the delay
    tokio::time::sleep(Duration::from_millis(1300)).await;
    let unsubs: Vec<String> = adapter
        .calls()
        .iter()
        .filter(|c| c.starts_with("unsub:"))
        .cloned()
        .collect();
    assert_eq!(unsubs.len(), 2);

    let health = hub.health();
    assert_eq!(health.demand_tracker.total_subscriptions, 0);
    assert_eq!(health.demand_tracker.pending_cleanups, 0);
}

#[tokio::test]
async fn test_slow_client_loses_updates_not_connection() {
    let (hub, _adapter) = test_hub(60);
    // tiny outbound buffer: hello + one more frame
    let (tx, mut rx) = mpsc::channel(2);
    let client = hub.add_client(tx);
    hub.handle_client_message(client, &subscribe_msg("tickers", "BTCUSDT"));

    for i in 0..10 {
        hub.cache().set_ticker(
            "bybit",
            "BTCUSDT",
            &Ticker {
                last_price: Some(100.0 + i as f64),
                ..Default::default()
            },
        );
    }

    // the queue capped at 2 frames; the overflow was dropped silently
    let mut received = 0;
    while rx.try_recv().is_ok() {
        received += 1;
    }
    assert_eq!(received, 2);
    // client is still registered, not killed
    assert_eq!(hub.client_count(), 1);
}

#[tokio::test]
async fn test_health_reports_degraded_shape() {
    let (hub, _adapter) = test_hub(60);
    let health = hub.health();
    // single adapter, reported connected: fully healthy
    assert_eq!(health.status, "healthy");
    assert!(!health.ready);
    assert!(health.exchanges.contains_key("bybit"));
    assert_eq!(health.exchanges["bybit"].symbols, 3);

    let wire = serde_json::to_value(&health).unwrap();
    assert!(wire["demandTracker"]["totalSubscriptions"].is_number());
    assert!(wire["cache"]["tickers"].is_number());
}

#[tokio::test]
async fn test_liquidations_all_pseudo_symbol_via_hub() {
    let (hub, _adapter) = test_hub(60);
    let (tx, mut rx) = mpsc::channel(32);
    let client = hub.add_client(tx);
    let _ = rx.recv().await; // hello

    // subscribe to the aggregate ring only
    hub.handle_client_message(client, &subscribe_msg("liquidations", "ALL"));

    hub.cache().add_liquidation(
        "bybit",
        "ETHUSDT",
        tickerhub::models::market::Liquidation {
            id: "x".into(),
            symbol: "ETHUSDT".into(),
            price: 3000.0,
            size: 5.0,
            side: tickerhub::models::market::LiquidationSide::Sell,
            timestamp: 7,
        },
    );

    match rx.recv().await.unwrap() {
        PushMessage::Update { symbol, data, .. } => {
            assert_eq!(symbol, "ALL");
            assert_eq!(data["symbol"], "ETHUSDT");
        }
        other => panic!("expected mirrored liquidation, got {other:?}"),
    }
}
