use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::{debug, info};

use crate::feeds::ExchangeAdapter;
use crate::models::event::Channel;

/// Liquidation streams exist only on these exchanges.
const LIQUIDATION_EXCHANGES: [&str; 2] = ["bybit", "binance"];

#[derive(Debug, Default)]
struct SubEntry {
    channels: HashMap<Channel, u32>,
    is_hot: bool,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DemandCounts {
    pub total_subscriptions: usize,
    pub pending_cleanups: usize,
    pub per_exchange: BTreeMap<String, usize>,
}

/// Reference-counts per-(exchange,symbol,channel) demand across all clients
/// and turns edge transitions into upstream subscribe/unsubscribe calls.
///
/// The 0→1 edge subscribes immediately; the 1→0 edge arms a delayed cleanup
/// timer that re-checks the count when it fires, so churny clients don't
/// flap upstream subscriptions. Hot symbols stay pinned for every channel
/// except klines.
pub struct DemandTracker {
    adapters: HashMap<&'static str, Arc<dyn ExchangeAdapter>>,
    subscriptions: DashMap<String, SubEntry>,
    hot_symbols: DashMap<String, HashSet<String>>,
    cleanup_timers: DashMap<String, AbortHandle>,
    cleanup_delay: Duration,
}

impl DemandTracker {
    pub fn new(
        adapters: HashMap<&'static str, Arc<dyn ExchangeAdapter>>,
        cleanup_delay: Duration,
    ) -> Self {
        Self {
            adapters,
            subscriptions: DashMap::new(),
            hot_symbols: DashMap::new(),
            cleanup_timers: DashMap::new(),
            cleanup_delay,
        }
    }

    fn sub_key(exchange: &str, symbol: &str, interval: Option<&str>) -> String {
        match interval {
            Some(interval) => format!("{exchange}:{symbol}:{interval}"),
            None => format!("{exchange}:{symbol}"),
        }
    }

    fn timer_key(key: &str, channel: Channel) -> String {
        format!("{key}|{channel}")
    }

    fn is_hot(&self, exchange: &str, symbol: &str) -> bool {
        self.hot_symbols
            .get(exchange)
            .map(|set| set.contains(symbol))
            .unwrap_or(false)
    }

    /// Record one client's interest. Returns whether an upstream subscribe
    /// was issued (the 0→1 edge).
    pub fn subscribe(
        &self,
        exchange: &str,
        symbol: &str,
        channel: Channel,
        interval: Option<&str>,
    ) -> bool {
        if channel == Channel::Liquidations && !LIQUIDATION_EXCHANGES.contains(&exchange) {
            return false;
        }
        let Some(adapter) = self.adapters.get(exchange) else {
            return false;
        };

        let key = Self::sub_key(exchange, symbol, interval);

        // A pending cleanup means the upstream subscription is still live;
        // cancelling it keeps the stream without a new upstream call.
        if let Some((_, timer)) = self.cleanup_timers.remove(&Self::timer_key(&key, channel)) {
            timer.abort();
        }

        let mut entry = self.subscriptions.entry(key).or_default();
        entry.is_hot = entry.is_hot || self.is_hot(exchange, symbol);
        let count = entry.channels.entry(channel).or_insert(0);
        *count += 1;
        if *count > 1 {
            return false;
        }
        drop(entry);

        match channel {
            Channel::Klines => match interval {
                Some(interval) => adapter.subscribe_kline(symbol, interval),
                None => false,
            },
            Channel::Liquidations => adapter.subscribe_liquidation(symbol),
            _ => adapter.subscribe_symbol(symbol, &[channel]),
        }
    }

    /// Drop one client's interest. The 1→0 edge arms the delayed cleanup,
    /// except for hot symbols on non-kline channels, which stay pinned.
    pub fn unsubscribe(
        self: &Arc<Self>,
        exchange: &str,
        symbol: &str,
        channel: Channel,
        interval: Option<&str>,
    ) {
        let key = Self::sub_key(exchange, symbol, interval);
        let now_zero = {
            let Some(mut entry) = self.subscriptions.get_mut(&key) else {
                return;
            };
            match entry.channels.get_mut(&channel) {
                Some(count) if *count > 0 => {
                    *count -= 1;
                    *count == 0
                }
                _ => false,
            }
        };
        if !now_zero {
            return;
        }

        if channel != Channel::Klines && self.is_hot(exchange, symbol) {
            // Pinned: drop the tracking entry but leave upstream alone.
            debug!("{exchange}:{symbol} {channel} refcount 0 but hot, keeping upstream");
            if let Some(mut entry) = self.subscriptions.get_mut(&key) {
                entry.channels.remove(&channel);
            }
            self.subscriptions
                .remove_if(&key, |_, entry| entry.channels.is_empty());
            return;
        }

        self.schedule_cleanup(exchange, symbol, channel, interval, &key);
    }

    fn schedule_cleanup(
        self: &Arc<Self>,
        exchange: &str,
        symbol: &str,
        channel: Channel,
        interval: Option<&str>,
        key: &str,
    ) {
        let timer_key = Self::timer_key(key, channel);
        let tracker = self.clone();
        let exchange = exchange.to_string();
        let symbol = symbol.to_string();
        let interval = interval.map(String::from);
        let key = key.to_string();
        let delay = self.cleanup_delay;

        let handle = tokio::spawn({
            let timer_key = timer_key.clone();
            async move {
                tokio::time::sleep(delay).await;
                tracker.cleanup_timers.remove(&timer_key);
                tracker.perform_cleanup(&exchange, &symbol, channel, interval.as_deref(), &key);
            }
        });

        // Replace any previous timer for this (key, channel).
        if let Some(old) = self
            .cleanup_timers
            .insert(timer_key, handle.abort_handle())
        {
            old.abort();
        }
    }

    /// Fired by the cleanup timer: the count may have bounced back up in the
    /// meantime, so re-check before touching upstream.
    fn perform_cleanup(
        &self,
        exchange: &str,
        symbol: &str,
        channel: Channel,
        interval: Option<&str>,
        key: &str,
    ) {
        let still_zero = {
            let Some(mut entry) = self.subscriptions.get_mut(key) else {
                return;
            };
            match entry.channels.get(&channel) {
                Some(&0) => {
                    entry.channels.remove(&channel);
                    true
                }
                _ => false,
            }
        };
        if !still_zero {
            return;
        }
        self.subscriptions
            .remove_if(key, |_, entry| entry.channels.is_empty());

        let Some(adapter) = self.adapters.get(exchange) else {
            return;
        };
        debug!("{exchange}:{symbol} {channel} idle past cleanup delay, unsubscribing upstream");
        match channel {
            Channel::Klines => {
                if let Some(interval) = interval {
                    adapter.unsubscribe_kline(symbol, interval);
                }
            }
            Channel::Liquidations => adapter.unsubscribe_liquidation(symbol),
            _ => adapter.unsubscribe_symbol(symbol, &[channel]),
        }
    }

    /// Replace an exchange's hot set: batch-subscribe upstream and mark any
    /// tracked subscriptions accordingly.
    pub fn set_hot_symbols(&self, exchange: &str, symbols: Vec<String>) {
        if let Some(adapter) = self.adapters.get(exchange) {
            adapter.subscribe_hot_symbols(&symbols);
        }
        let set: HashSet<String> = symbols.into_iter().collect();
        info!("{exchange} hot set: {} symbols", set.len());

        let prefix = format!("{exchange}:");
        for mut entry in self.subscriptions.iter_mut() {
            let Some(rest) = entry.key().strip_prefix(&prefix) else {
                continue;
            };
            let symbol = rest.split(':').next().unwrap_or(rest);
            entry.value_mut().is_hot = set.contains(symbol);
        }
        self.hot_symbols.insert(exchange.to_string(), set);
    }

    pub fn counts(&self) -> DemandCounts {
        let mut per_exchange: BTreeMap<String, usize> = BTreeMap::new();
        let mut total = 0usize;
        for entry in self.subscriptions.iter() {
            let active: usize = entry
                .value()
                .channels
                .values()
                .filter(|&&c| c > 0)
                .count();
            total += active;
            if let Some((exchange, _)) = entry.key().split_once(':') {
                *per_exchange.entry(exchange.to_string()).or_default() += active;
            }
        }
        DemandCounts {
            total_subscriptions: total,
            pending_cleanups: self.cleanup_timers.len(),
            per_exchange,
        }
    }

    /// Cancel every pending timer and clear all state.
    pub fn destroy(&self) {
        for entry in self.cleanup_timers.iter() {
            entry.value().abort();
        }
        self.cleanup_timers.clear();
        self.subscriptions.clear();
        self.hot_symbols.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Records upstream calls instead of touching a socket.
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
            0
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
            self.calls
                .lock()
                .push(format!("sub:{symbol}:{:?}", channels));
            true
        }
        fn unsubscribe_symbol(&self, symbol: &str, channels: &[Channel]) {
            self.calls
                .lock()
                .push(format!("unsub:{symbol}:{:?}", channels));
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

    fn tracker_with(delay: Duration) -> (Arc<DemandTracker>, Arc<RecordingAdapter>) {
        let adapter = Arc::new(RecordingAdapter::default());
        let mut adapters: HashMap<&'static str, Arc<dyn ExchangeAdapter>> = HashMap::new();
        adapters.insert("bybit", adapter.clone());
        (Arc::new(DemandTracker::new(adapters, delay)), adapter)
    }

    #[tokio::test]
    async fn test_refcount_single_upstream_subscribe() {
        let (tracker, adapter) = tracker_with(Duration::from_millis(40));

        // three clients fan in
        assert!(tracker.subscribe("bybit", "BTCUSDT", Channel::Trades, None));
        assert!(!tracker.subscribe("bybit", "BTCUSDT", Channel::Trades, None));
        assert!(!tracker.subscribe("bybit", "BTCUSDT", Channel::Trades, None));
        assert_eq!(adapter.calls().len(), 1);

        // two leave: no upstream call
        tracker.unsubscribe("bybit", "BTCUSDT", Channel::Trades, None);
        tracker.unsubscribe("bybit", "BTCUSDT", Channel::Trades, None);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(adapter.calls().len(), 1);

        // last one leaves: upstream unsubscribe after the delay
        tracker.unsubscribe("bybit", "BTCUSDT", Channel::Trades, None);
        tokio::time::sleep(Duration::from_millis(80)).await;
        let calls = adapter.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[1].starts_with("unsub:BTCUSDT"));
        assert_eq!(tracker.counts().total_subscriptions, 0);
    }

    #[tokio::test]
    async fn test_resubscribe_cancels_cleanup() {
        let (tracker, adapter) = tracker_with(Duration::from_millis(50));

        tracker.subscribe("bybit", "BTCUSDT", Channel::Trades, None);
        tracker.unsubscribe("bybit", "BTCUSDT", Channel::Trades, None);
        // resubscribe inside the pending window: the timer dies, the
        // upstream subscription was never dropped, no second subscribe
        assert!(!tracker.subscribe("bybit", "BTCUSDT", Channel::Trades, None));
        tokio::time::sleep(Duration::from_millis(100)).await;

        let calls = adapter.calls();
        assert_eq!(calls, vec!["sub:BTCUSDT:[Trades]".to_string()]);
        assert_eq!(tracker.counts().pending_cleanups, 0);
    }

    #[tokio::test]
    async fn test_hot_symbols_pinned_except_klines() {
        let (tracker, adapter) = tracker_with(Duration::from_millis(30));
        tracker.set_hot_symbols("bybit", vec!["BTCUSDT".to_string()]);

        tracker.subscribe("bybit", "BTCUSDT", Channel::Trades, None);
        tracker.unsubscribe("bybit", "BTCUSDT", Channel::Trades, None);
        tokio::time::sleep(Duration::from_millis(70)).await;
        // pinned: no unsubscribe ever issued
        assert!(!adapter.calls().iter().any(|c| c.starts_with("unsub:")));

        // klines are never pinned
        tracker.subscribe("bybit", "BTCUSDT", Channel::Klines, Some("1"));
        tracker.unsubscribe("bybit", "BTCUSDT", Channel::Klines, Some("1"));
        tokio::time::sleep(Duration::from_millis(70)).await;
        assert!(adapter
            .calls()
            .iter()
            .any(|c| c == "unsubk:BTCUSDT:1"));
    }

    #[tokio::test]
    async fn test_liquidations_only_on_supported_exchanges() {
        let (tracker, adapter) = tracker_with(Duration::from_millis(30));
        assert!(tracker.subscribe("bybit", "BTCUSDT", Channel::Liquidations, None));
        // unsupported exchange: refused without effect
        assert!(!tracker.subscribe("blofin", "BTC-USDT", Channel::Liquidations, None));
        assert_eq!(
            adapter
                .calls()
                .iter()
                .filter(|c| c.starts_with("subliq"))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_destroy_cancels_timers() {
        let (tracker, adapter) = tracker_with(Duration::from_millis(40));
        tracker.subscribe("bybit", "BTCUSDT", Channel::Trades, None);
        tracker.unsubscribe("bybit", "BTCUSDT", Channel::Trades, None);
        assert_eq!(tracker.counts().pending_cleanups, 1);

        tracker.destroy();
        tokio::time::sleep(Duration::from_millis(80)).await;
        // the armed cleanup never fired
        assert!(!adapter.calls().iter().any(|c| c.starts_with("unsub:")));
        assert_eq!(tracker.counts().pending_cleanups, 0);
    }
}
