use dashmap::DashMap;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Windowed request accounting per exchange with explicit backoff on 429.
///
/// The coordinator never delays anything itself; callers ask `can_request`
/// before hitting the wire and skip the call during backoff.
pub struct RateLimitCoordinator {
    windows: DashMap<String, WindowState>,
    window: Duration,
    default_backoff: Duration,
}

#[derive(Debug, Clone, Copy)]
struct WindowState {
    request_count: u64,
    window_start: Instant,
    backoff_until: Option<Instant>,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitSnapshot {
    pub requests_in_window: u64,
    pub in_backoff: bool,
}

impl RateLimitCoordinator {
    pub fn new(window: Duration, default_backoff: Duration) -> Self {
        Self {
            windows: DashMap::new(),
            window,
            default_backoff,
        }
    }

    pub fn can_request(&self, exchange: &str) -> bool {
        let now = Instant::now();
        let mut state = self.windows.entry(exchange.to_string()).or_insert(WindowState {
            request_count: 0,
            window_start: now,
            backoff_until: None,
        });

        if let Some(until) = state.backoff_until {
            if now < until {
                return false;
            }
            state.backoff_until = None;
        }

        if now.duration_since(state.window_start) > self.window {
            state.request_count = 0;
            state.window_start = now;
        }
        true
    }

    pub fn record_request(&self, exchange: &str) {
        let now = Instant::now();
        self.windows
            .entry(exchange.to_string())
            .and_modify(|state| state.request_count += 1)
            .or_insert(WindowState {
                request_count: 1,
                window_start: now,
                backoff_until: None,
            });
    }

    /// Enter backoff for an exchange, honoring an upstream Retry-After when
    /// one was given.
    pub fn report_rate_limit(&self, exchange: &str, retry_after: Option<Duration>) {
        let backoff = retry_after.unwrap_or(self.default_backoff);
        let until = Instant::now() + backoff;
        warn!("{exchange} rate limited, backing off {:?}", backoff);
        self.windows
            .entry(exchange.to_string())
            .and_modify(|state| state.backoff_until = Some(until))
            .or_insert(WindowState {
                request_count: 0,
                window_start: Instant::now(),
                backoff_until: Some(until),
            });
    }

    pub fn snapshot(&self) -> HashMap<String, RateLimitSnapshot> {
        let now = Instant::now();
        self.windows
            .iter()
            .map(|entry| {
                let state = entry.value();
                (
                    entry.key().clone(),
                    RateLimitSnapshot {
                        requests_in_window: state.request_count,
                        in_backoff: state.backoff_until.is_some_and(|u| now < u),
                    },
                )
            })
            .collect()
    }
}

type SharedFetch = Shared<BoxFuture<'static, Result<Value, String>>>;

/// Collapses identical in-flight REST pulls to one shared result.
///
/// Keys are caller-chosen strings such as `"bybit:klines:BTCUSDT:1:0"`. Every
/// concurrent caller for a key joins the same future and observes the same
/// outcome, success or failure.
#[derive(Default)]
pub struct RequestDeduplicator {
    pending: Mutex<HashMap<String, SharedFetch>>,
}

impl RequestDeduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn execute<F>(&self, key: &str, make: F) -> Result<Value, String>
    where
        F: FnOnce() -> BoxFuture<'static, Result<Value, String>>,
    {
        let (fut, created) = {
            let mut pending = self.pending.lock();
            match pending.get(key) {
                Some(existing) => {
                    debug!("joining in-flight request {key}");
                    (existing.clone(), false)
                }
                None => {
                    let fut = make().shared();
                    pending.insert(key.to_string(), fut.clone());
                    (fut, true)
                }
            }
        };

        let out = fut.await;

        if created {
            self.pending.lock().remove(key);
        }
        out
    }

    pub fn in_flight(&self) -> usize {
        self.pending.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_backoff_blocks_requests() {
        let limits = RateLimitCoordinator::new(
            Duration::from_secs(60),
            Duration::from_millis(80),
        );
        assert!(limits.can_request("bybit"));
        limits.record_request("bybit");

        limits.report_rate_limit("bybit", None);
        assert!(!limits.can_request("bybit"));

        std::thread::sleep(Duration::from_millis(100));
        assert!(limits.can_request("bybit"));
    }

    #[test]
    fn test_window_resets_count() {
        let limits = RateLimitCoordinator::new(
            Duration::from_millis(40),
            Duration::from_secs(30),
        );
        limits.record_request("blofin");
        limits.record_request("blofin");
        assert_eq!(limits.snapshot()["blofin"].requests_in_window, 2);

        std::thread::sleep(Duration::from_millis(60));
        assert!(limits.can_request("blofin"));
        assert_eq!(limits.snapshot()["blofin"].requests_in_window, 0);
    }

    #[test]
    fn test_backoff_is_per_exchange() {
        let limits = RateLimitCoordinator::new(
            Duration::from_secs(60),
            Duration::from_secs(30),
        );
        limits.report_rate_limit("bybit", None);
        assert!(!limits.can_request("bybit"));
        assert!(limits.can_request("binance"));
    }

    #[tokio::test]
    async fn test_dedup_single_invocation() {
        let dedup = Arc::new(RequestDeduplicator::new());
        let calls = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let dedup = dedup.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                dedup
                    .execute("k", move || {
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(30)).await;
                            Ok(serde_json::json!({"n": 7}))
                        }
                        .boxed()
                    })
                    .await
            }));
        }

        for handle in handles {
            let out = handle.await.unwrap().unwrap();
            assert_eq!(out["n"], 7);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(dedup.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_dedup_failure_reaches_all_joiners() {
        let dedup = Arc::new(RequestDeduplicator::new());

        let a = {
            let dedup = dedup.clone();
            tokio::spawn(async move {
                dedup
                    .execute("bad", || {
                        async {
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Err("upstream 500".to_string())
                        }
                        .boxed()
                    })
                    .await
            })
        };
        let b = {
            let dedup = dedup.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                dedup
                    .execute("bad", || async { panic!("joiner must not run fn") }.boxed())
                    .await
            })
        };

        assert_eq!(a.await.unwrap().unwrap_err(), "upstream 500");
        assert_eq!(b.await.unwrap().unwrap_err(), "upstream 500");
    }

    #[tokio::test]
    async fn test_dedup_key_reusable_after_settle() {
        let dedup = RequestDeduplicator::new();
        let first = dedup
            .execute("k", || async { Ok(serde_json::json!(1)) }.boxed())
            .await
            .unwrap();
        let second = dedup
            .execute("k", || async { Ok(serde_json::json!(2)) }.boxed())
            .await
            .unwrap();
        assert_eq!(first, serde_json::json!(1));
        assert_eq!(second, serde_json::json!(2));
    }
}
