pub mod binance;
pub mod bitunix;
pub mod blofin;
pub mod bybit;
pub mod hyperliquid;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::models::event::{Channel, MarketEvent, StatusEvent};

/// Uniform surface every exchange connector exposes to the hub and the
/// demand tracker. Subscribe calls return whether an upstream request was
/// actually issued (already-active topics are not re-sent).
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Discover tradable symbols, open the socket, start ping/reconnect.
    /// Idempotent while already connecting or connected.
    async fn connect(&self) -> Result<()>;

    /// Tear the connection down without scheduling a reconnect.
    fn close(&self);

    fn is_connected(&self) -> bool;
    fn symbol_count(&self) -> usize;
    fn last_update_ms(&self) -> i64;

    async fn fetch_symbols(&self) -> Result<Vec<String>>;

    /// Pin a batch of symbols: trades + orderbook streams, re-sent on every
    /// reconnect.
    fn subscribe_hot_symbols(&self, symbols: &[String]);

    fn subscribe_symbol(&self, symbol: &str, channels: &[Channel]) -> bool;
    fn unsubscribe_symbol(&self, symbol: &str, channels: &[Channel]);

    fn subscribe_kline(&self, symbol: &str, interval: &str) -> bool;
    fn unsubscribe_kline(&self, symbol: &str, interval: &str);

    /// Liquidation streams are global on the exchanges that have them; the
    /// per-symbol signature mirrors the other subscribe calls but there is
    /// nothing to undo per symbol.
    fn subscribe_liquidation(&self, _symbol: &str) -> bool {
        false
    }
    fn unsubscribe_liquidation(&self, _symbol: &str) {}
}

/// Variant-specific half of an adapter: ping dialect, open hook, frame
/// parsing. The generic socket loop in [`run_socket`] drives it.
pub(crate) trait WsProtocol: Send + Sync + 'static {
    fn shared(&self) -> &AdapterShared;

    /// Keep-alive frame, or `None` when the exchange pings us instead.
    fn ping_frame(&self) -> Option<Message>;

    /// True when the frame is a pong in this exchange's dialect.
    fn is_pong(&self, text: &str) -> bool;

    /// Called on every successful open: replay hot symbols, active topics,
    /// and mandatory streams.
    fn on_open(&self);

    /// Parse one text frame: absorb acks, emit canonical events.
    fn handle_frame(&self, text: &str);
}

/// Connection state and plumbing common to every adapter.
pub(crate) struct AdapterShared {
    pub name: &'static str,
    pub ws_url: String,
    pub ping_interval: Duration,
    pub reconnect_cap_ms: u64,
    pub symbols: RwLock<Vec<String>>,
    pub hot_symbols: RwLock<Vec<String>>,
    /// Adapter-encoded topic keys currently subscribed on demand, with a
    /// refcount: distinct channels can ride one upstream topic (ticker and
    /// funding often share a stream) and must not tear each other down.
    pub active_topics: DashMap<String, u32>,
    connected: AtomicBool,
    running: AtomicBool,
    reconnect_attempts: AtomicU32,
    last_update_ms: AtomicI64,
    cmd_tx: mpsc::UnboundedSender<String>,
    cmd_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    events_tx: mpsc::UnboundedSender<MarketEvent>,
    status_tx: mpsc::UnboundedSender<StatusEvent>,
    pub shutdown: broadcast::Sender<()>,
}

impl AdapterShared {
    pub fn new(
        name: &'static str,
        ws_url: String,
        ping_interval: Duration,
        reconnect_cap_ms: u64,
        events_tx: mpsc::UnboundedSender<MarketEvent>,
        status_tx: mpsc::UnboundedSender<StatusEvent>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = broadcast::channel(1);
        Self {
            name,
            ws_url,
            ping_interval,
            reconnect_cap_ms,
            symbols: RwLock::new(Vec::new()),
            hot_symbols: RwLock::new(Vec::new()),
            active_topics: DashMap::new(),
            connected: AtomicBool::new(false),
            running: AtomicBool::new(false),
            reconnect_attempts: AtomicU32::new(0),
            last_update_ms: AtomicI64::new(0),
            cmd_tx,
            cmd_rx: Mutex::new(Some(cmd_rx)),
            events_tx,
            status_tx,
            shutdown,
        }
    }

    /// Queue a raw text frame for the socket writer.
    pub fn send_frame(&self, frame: String) {
        if self.cmd_tx.send(frame).is_err() {
            debug!("{} frame dropped, writer gone", self.name);
        }
    }

    /// Clone of the writer queue, for spawned staggered-send tasks.
    pub fn cmd_sender(&self) -> mpsc::UnboundedSender<String> {
        self.cmd_tx.clone()
    }

    pub fn emit(&self, event: MarketEvent) {
        self.last_update_ms
            .store(chrono::Utc::now().timestamp_millis(), Ordering::Relaxed);
        let _ = self.events_tx.send(event);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn last_update_ms(&self) -> i64 {
        self.last_update_ms.load(Ordering::Relaxed)
    }

    pub fn symbol_count(&self) -> usize {
        self.symbols.read().len()
    }

    /// Returns false when already connecting/connected, true when the caller
    /// owns this connect attempt.
    pub fn begin_connect(&self) -> bool {
        !self.running.swap(true, Ordering::SeqCst)
    }

    pub fn close(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.shutdown.send(());
        self.set_connected(false);
    }

    fn set_connected(&self, connected: bool) {
        if self.connected.swap(connected, Ordering::SeqCst) != connected {
            let _ = self.status_tx.send(StatusEvent {
                exchange: self.name,
                connected,
            });
        }
    }

    fn take_cmd_rx(&self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.cmd_rx.lock().take()
    }

    fn restore_cmd_rx(&self, rx: mpsc::UnboundedReceiver<String>) {
        *self.cmd_rx.lock() = Some(rx);
    }

    pub fn topic_count(&self) -> usize {
        self.active_topics.len()
    }

    /// Count a user of `topic`. True on the 0→1 edge: the subscribe frame
    /// must actually be sent.
    pub fn track_topic(&self, topic: &str) -> bool {
        let mut count = self.active_topics.entry(topic.to_string()).or_insert(0);
        *count += 1;
        *count == 1
    }

    /// Drop a user of `topic`. True on the 1→0 edge: the unsubscribe frame
    /// must actually be sent.
    pub fn untrack_topic(&self, topic: &str) -> bool {
        let zero = {
            let Some(mut count) = self.active_topics.get_mut(topic) else {
                return false;
            };
            if *count > 0 {
                *count -= 1;
            }
            *count == 0
        };
        if zero {
            self.active_topics.remove_if(topic, |_, &count| count == 0);
        }
        zero
    }
}

/// Spawn the reconnecting socket task for an adapter.
pub(crate) fn spawn_socket(proto: Arc<dyn WsProtocol>) {
    tokio::spawn(run_socket(proto));
}

async fn run_socket(proto: Arc<dyn WsProtocol>) {
    let shared = proto.shared();
    let mut shutdown_rx = shared.shutdown.subscribe();
    let Some(mut cmd_rx) = shared.take_cmd_rx() else {
        warn!("{} socket task already running", shared.name);
        return;
    };

    loop {
        info!("{} connecting to {}", shared.name, shared.ws_url);

        let conn = tokio::select! {
            result = connect_async(shared.ws_url.as_str()) => result,
            _ = shutdown_rx.recv() => {
                shared.restore_cmd_rx(cmd_rx);
                return;
            }
        };

        match conn {
            Ok((ws_stream, _)) => {
                info!("{} connected", shared.name);
                shared.reconnect_attempts.store(0, Ordering::SeqCst);
                // Frames queued while disconnected are stale; on_open replays
                // the live subscription state instead.
                while cmd_rx.try_recv().is_ok() {}
                shared.set_connected(true);
                proto.on_open();

                let (mut write, mut read) = ws_stream.split();
                let mut ping = tokio::time::interval(shared.ping_interval);
                ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

                loop {
                    tokio::select! {
                        msg = read.next() => match msg {
                            Some(Ok(Message::Text(text))) => {
                                if proto.is_pong(&text) {
                                    continue;
                                }
                                proto.handle_frame(&text);
                            }
                            Some(Ok(Message::Ping(data))) => {
                                let _ = write.send(Message::Pong(data)).await;
                            }
                            Some(Ok(Message::Close(_))) => {
                                warn!("{} close frame received", shared.name);
                                break;
                            }
                            Some(Ok(_)) => {} // Binary, Pong, Frame
                            Some(Err(e)) => {
                                warn!("{} socket error: {e}", shared.name);
                                break;
                            }
                            None => {
                                warn!("{} stream ended", shared.name);
                                break;
                            }
                        },
                        Some(frame) = cmd_rx.recv() => {
                            if let Err(e) = write.send(Message::Text(frame)).await {
                                warn!("{} write failed: {e}", shared.name);
                                break;
                            }
                        },
                        _ = ping.tick() => {
                            if let Some(frame) = proto.ping_frame() {
                                if let Err(e) = write.send(frame).await {
                                    warn!("{} ping failed: {e}", shared.name);
                                    break;
                                }
                            }
                        },
                        _ = shutdown_rx.recv() => {
                            let _ = write.send(Message::Close(None)).await;
                            shared.set_connected(false);
                            shared.restore_cmd_rx(cmd_rx);
                            return;
                        }
                    }
                }
                shared.set_connected(false);
            }
            Err(e) => {
                error!("{} connect failed: {e}", shared.name);
            }
        }

        let attempts = shared.reconnect_attempts.fetch_add(1, Ordering::SeqCst);
        let delay_ms = 1000u64
            .saturating_mul(1u64 << attempts.min(5))
            .min(shared.reconnect_cap_ms);
        warn!("{} reconnecting in {delay_ms}ms", shared.name);
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
            _ = shutdown_rx.recv() => {
                shared.restore_cmd_rx(cmd_rx);
                return;
            }
        }
    }
}

/// Parse `[["price","size"], …]` wire levels, skipping malformed entries.
pub(crate) fn parse_levels(levels: &[[String; 2]]) -> Vec<(Decimal, Decimal)> {
    levels
        .iter()
        .filter_map(|level| {
            let price = Decimal::from_str(&level[0]).ok()?;
            let size = Decimal::from_str(&level[1]).ok()?;
            Some((price, size))
        })
        .collect()
}

/// Parse an exchange number string into a finite f64.
pub(crate) fn parse_f64(s: &str) -> Option<f64> {
    s.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Truncated payload excerpt for unparseable-frame logs.
pub(crate) fn truncate_frame(s: &str) -> &str {
    s.get(..200).unwrap_or(s)
}

pub(crate) fn parse_f64_opt(s: Option<&str>) -> Option<f64> {
    s.and_then(parse_f64)
}
