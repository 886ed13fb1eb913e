use anyhow::{bail, Context, Result};
use rand::Rng;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::cache::StateCache;
use crate::config::{Config, EXCHANGES};
use crate::feeds::hyperliquid::to_coin;
use crate::limits::RateLimitCoordinator;
use crate::models::candle::{interval_ms, Candle};
use crate::models::market::{Funding, Instrument, OpenInterest, Ticker};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("bad envelope: {0}")]
    Envelope(String),
}

/// Periodic REST refresh of slow-moving data plus on-demand historical
/// kline pulls.
///
/// Every poll cycle fetches instruments, tickers, funding, and open interest
/// per exchange with independent results; one failing exchange never blocks
/// another. All HTTP goes through `fetch_json`/`fetch_json_post`, the only
/// wire entry points, which account requests and translate 429 into
/// rate-limit backoff and a `None` result.
pub struct RestPoller {
    http: reqwest::Client,
    cache: Arc<StateCache>,
    limits: Arc<RateLimitCoordinator>,
    config: Config,
}

impl RestPoller {
    pub fn new(
        config: Config,
        http: reqwest::Client,
        cache: Arc<StateCache>,
        limits: Arc<RateLimitCoordinator>,
    ) -> Self {
        Self {
            http,
            cache,
            limits,
            config,
        }
    }

    /// Spawn the periodic poll loop. The startup poll is the hub's job; the
    /// first periodic tick fires one full interval in.
    pub fn start(self: &Arc<Self>, shutdown: &broadcast::Sender<()>) {
        let poller = self.clone();
        let mut shutdown_rx = shutdown.subscribe();
        let period = Duration::from_secs(self.config.hub.poll_interval_secs);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        // Spread poll starts so restarts don't synchronize
                        // request spikes across processes.
                        let jitter = rand::thread_rng().gen_range(0..2000u64);
                        tokio::time::sleep(Duration::from_millis(jitter)).await;
                        poller.poll_all().await;
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
    }

    /// One refresh pass over every exchange, concurrently, results
    /// independent.
    pub async fn poll_all(&self) {
        let polls = EXCHANGES.map(|exchange| async move {
            if let Err(e) = self.poll_exchange(exchange).await {
                warn!("{exchange} poll failed: {e:#}");
            }
        });
        futures_util::future::join_all(polls).await;
    }

    pub async fn poll_exchange(&self, exchange: &str) -> Result<()> {
        match exchange {
            "bybit" => self.poll_bybit().await,
            "blofin" => self.poll_blofin().await,
            "bitunix" => self.poll_bitunix().await,
            "hyperliquid" => self.poll_hyperliquid().await,
            "binance" => self.poll_binance().await,
            other => bail!("unknown exchange {other}"),
        }
    }

    // --- shared HTTP entry points ---

    /// GET + JSON with rate-limit accounting. `None` means the request was
    /// skipped (backoff) or answered 429; both clear on their own.
    pub async fn fetch_json(&self, exchange: &str, url: &str) -> Result<Option<Value>, FetchError> {
        if !self.limits.can_request(exchange) {
            debug!("{exchange} request skipped, in backoff: {url}");
            return Ok(None);
        }
        self.limits.record_request(exchange);
        let resp = self.http.get(url).send().await?;
        self.decode(exchange, resp).await
    }

    async fn fetch_json_post(
        &self,
        exchange: &str,
        url: &str,
        body: &Value,
    ) -> Result<Option<Value>, FetchError> {
        if !self.limits.can_request(exchange) {
            debug!("{exchange} request skipped, in backoff: {url}");
            return Ok(None);
        }
        self.limits.record_request(exchange);
        let resp = self.http.post(url).json(body).send().await?;
        self.decode(exchange, resp).await
    }

    async fn decode(
        &self,
        exchange: &str,
        resp: reqwest::Response,
    ) -> Result<Option<Value>, FetchError> {
        if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            self.limits.report_rate_limit(exchange, retry_after);
            return Ok(None);
        }
        let resp = resp.error_for_status()?;
        Ok(Some(resp.json().await?))
    }

    fn rest_url(&self, exchange: &str) -> &str {
        self.config
            .exchange(exchange)
            .map(|e| e.rest_url.as_str())
            .unwrap_or_default()
    }

    // --- per-exchange refresh ---

    async fn poll_bybit(&self) -> Result<()> {
        let base = self.rest_url("bybit");

        let url = format!("{base}/v5/market/instruments-info?category=linear&limit=1000");
        if let Some(body) = self.fetch_json("bybit", &url).await? {
            let list = bybit_list(&body)?;
            let instruments: Vec<Instrument> = list
                .iter()
                .filter_map(|item| {
                    Some(Instrument {
                        symbol: item["symbol"].as_str()?.to_string(),
                        base_coin: str_field(item, "baseCoin"),
                        quote_coin: str_field(item, "quoteCoin"),
                        status: str_field(item, "status"),
                        tick_size: num_str(&item["priceFilter"]["tickSize"]),
                        lot_size: num_str(&item["lotSizeFilter"]["qtyStep"]),
                        min_order_qty: num_str(&item["lotSizeFilter"]["minOrderQty"]),
                        max_order_qty: num_str(&item["lotSizeFilter"]["maxOrderQty"]),
                        min_leverage: num_str(&item["leverageFilter"]["minLeverage"]),
                        max_leverage: num_str(&item["leverageFilter"]["maxLeverage"]),
                        contract_value: None,
                        asset_index: None,
                    })
                })
                .collect();
            info!("bybit instruments refreshed: {}", instruments.len());
            self.cache.set_instruments("bybit", instruments);
        }

        let url = format!("{base}/v5/market/tickers?category=linear");
        if let Some(body) = self.fetch_json("bybit", &url).await? {
            let list = bybit_list(&body)?;
            for item in list {
                let Some(symbol) = item["symbol"].as_str() else {
                    continue;
                };
                let ticker = Ticker {
                    last_price: num_str(&item["lastPrice"]),
                    mark_price: num_str(&item["markPrice"]),
                    index_price: num_str(&item["indexPrice"]),
                    bid1_price: num_str(&item["bid1Price"]),
                    ask1_price: num_str(&item["ask1Price"]),
                    high24h: num_str(&item["highPrice24h"]),
                    low24h: num_str(&item["lowPrice24h"]),
                    open24h: num_str(&item["prevPrice24h"]),
                    volume24h: num_str(&item["volume24h"]),
                    turnover24h: num_str(&item["turnover24h"]),
                    price24h_pcnt: num_str(&item["price24hPcnt"]),
                    funding_rate: num_str(&item["fundingRate"]),
                    next_funding_time: int_str(&item["nextFundingTime"]),
                    open_interest: num_str(&item["openInterest"]),
                };
                if let Some(rate) = ticker.funding_rate {
                    self.cache.set_funding(
                        "bybit",
                        symbol,
                        Funding {
                            funding_rate: Some(rate),
                            next_funding_time: ticker.next_funding_time,
                            funding_time: None,
                        },
                    );
                }
                if let Some(oi) = ticker.open_interest {
                    self.cache.set_open_interest(
                        "bybit",
                        symbol,
                        OpenInterest {
                            open_interest: oi,
                            open_interest_value: num_str(&item["openInterestValue"]),
                        },
                    );
                }
                self.cache.set_ticker("bybit", symbol, &ticker);
            }
        }
        Ok(())
    }

    async fn poll_blofin(&self) -> Result<()> {
        let base = self.rest_url("blofin");

        let url = format!("{base}/api/v1/market/instruments");
        if let Some(body) = self.fetch_json("blofin", &url).await? {
            let list = blofin_data(&body)?;
            let instruments: Vec<Instrument> = list
                .iter()
                .filter_map(|item| {
                    Some(Instrument {
                        symbol: item["instId"].as_str()?.to_string(),
                        base_coin: str_field(item, "baseCurrency"),
                        quote_coin: str_field(item, "quoteCurrency"),
                        status: str_field(item, "state"),
                        tick_size: num_str(&item["tickSize"]),
                        lot_size: num_str(&item["lotSize"]),
                        min_order_qty: num_str(&item["minSize"]),
                        max_order_qty: None,
                        min_leverage: None,
                        max_leverage: num_str(&item["maxLeverage"]),
                        contract_value: num_str(&item["contractValue"]),
                        asset_index: None,
                    })
                })
                .collect();
            info!("blofin instruments refreshed: {}", instruments.len());
            self.cache.set_instruments("blofin", instruments);
        }

        let url = format!("{base}/api/v1/market/tickers");
        if let Some(body) = self.fetch_json("blofin", &url).await? {
            for item in blofin_data(&body)? {
                let Some(symbol) = item["instId"].as_str() else {
                    continue;
                };
                let last = num_str(&item["last"]);
                let open = num_str(&item["open24h"]);
                let pcnt = match (last, open) {
                    (Some(last), Some(open)) if open > 0.0 => Some((last - open) / open),
                    _ => None,
                };
                self.cache.set_ticker(
                    "blofin",
                    symbol,
                    &Ticker {
                        last_price: last,
                        bid1_price: num_str(&item["bidPrice"]),
                        ask1_price: num_str(&item["askPrice"]),
                        high24h: num_str(&item["high24h"]),
                        low24h: num_str(&item["low24h"]),
                        open24h: open,
                        volume24h: num_str(&item["vol24h"]),
                        turnover24h: num_str(&item["volCurrency24h"]),
                        price24h_pcnt: pcnt,
                        ..Default::default()
                    },
                );
            }
        }

        let url = format!("{base}/api/v1/market/funding-rate");
        if let Some(body) = self.fetch_json("blofin", &url).await? {
            for item in blofin_data(&body)? {
                let Some(symbol) = item["instId"].as_str() else {
                    continue;
                };
                self.cache.set_funding(
                    "blofin",
                    symbol,
                    Funding {
                        funding_rate: num_str(&item["fundingRate"]),
                        next_funding_time: int_str(&item["nextFundingTime"]),
                        funding_time: int_str(&item["fundingTime"]),
                    },
                );
            }
        }
        Ok(())
    }

    async fn poll_bitunix(&self) -> Result<()> {
        let base = self.rest_url("bitunix");

        let url = format!("{base}/api/v1/futures/market/trading_pairs");
        if let Some(body) = self.fetch_json("bitunix", &url).await? {
            let list = bitunix_data(&body)?;
            let instruments: Vec<Instrument> = list
                .iter()
                .filter_map(|item| {
                    Some(Instrument {
                        symbol: item["symbol"].as_str()?.to_string(),
                        base_coin: str_field(item, "base"),
                        quote_coin: str_field(item, "quote"),
                        status: str_field(item, "symbolStatus"),
                        tick_size: num_str(&item["tickSize"]),
                        lot_size: num_str(&item["lotSize"]),
                        min_order_qty: num_str(&item["minTradeVolume"]),
                        max_order_qty: None,
                        min_leverage: num_str(&item["minLeverage"]),
                        max_leverage: num_str(&item["maxLeverage"]),
                        contract_value: None,
                        asset_index: None,
                    })
                })
                .collect();
            info!("bitunix instruments refreshed: {}", instruments.len());
            self.cache.set_instruments("bitunix", instruments);
        }

        let url = format!("{base}/api/v1/futures/market/tickers");
        if let Some(body) = self.fetch_json("bitunix", &url).await? {
            for item in bitunix_data(&body)? {
                let Some(symbol) = item["symbol"].as_str() else {
                    continue;
                };
                let last = num_str(&item["lastPrice"]);
                let open = num_str(&item["open"]);
                let pcnt = match (last, open) {
                    (Some(last), Some(open)) if open > 0.0 => Some((last - open) / open),
                    _ => None,
                };
                let funding_rate = num_str(&item["fundingRate"]);
                self.cache.set_ticker(
                    "bitunix",
                    symbol,
                    &Ticker {
                        last_price: last,
                        mark_price: num_str(&item["markPrice"]),
                        index_price: num_str(&item["indexPrice"]),
                        high24h: num_str(&item["high"]),
                        low24h: num_str(&item["low"]),
                        open24h: open,
                        volume24h: num_str(&item["baseVol"]),
                        turnover24h: num_str(&item["quoteVol"]),
                        price24h_pcnt: pcnt,
                        funding_rate,
                        ..Default::default()
                    },
                );
                if let Some(rate) = funding_rate {
                    self.cache.set_funding(
                        "bitunix",
                        symbol,
                        Funding {
                            funding_rate: Some(rate),
                            next_funding_time: None,
                            funding_time: None,
                        },
                    );
                }
            }
        }
        Ok(())
    }

    async fn poll_hyperliquid(&self) -> Result<()> {
        let base = self.rest_url("hyperliquid");
        let url = format!("{base}/info");

        let Some(body) = self
            .fetch_json_post(
                "hyperliquid",
                &url,
                &serde_json::json!({ "type": "metaAndAssetCtxs" }),
            )
            .await?
        else {
            return Ok(());
        };

        // Response is a pair: [ {universe:[…]}, [ctx per asset, same order] ]
        let pair = body
            .as_array()
            .filter(|a| a.len() >= 2)
            .context("hyperliquid metaAndAssetCtxs: expected [meta, ctxs]")?;
        let universe = pair[0]["universe"]
            .as_array()
            .context("hyperliquid meta missing universe")?;
        let ctxs = pair[1]
            .as_array()
            .context("hyperliquid ctxs not an array")?;

        let mut instruments = Vec::with_capacity(universe.len());
        for (idx, asset) in universe.iter().enumerate() {
            let Some(coin) = asset["name"].as_str() else {
                continue;
            };
            instruments.push(Instrument {
                symbol: coin.to_string(),
                base_coin: Some(coin.to_string()),
                quote_coin: Some("USDC".to_string()),
                status: None,
                tick_size: None,
                lot_size: asset["szDecimals"]
                    .as_u64()
                    .map(|d| 10f64.powi(-(d as i32))),
                min_order_qty: None,
                max_order_qty: None,
                min_leverage: None,
                max_leverage: asset["maxLeverage"].as_f64(),
                contract_value: None,
                asset_index: Some(idx as u32),
            });

            let Some(ctx) = ctxs.get(idx) else { continue };
            let mark = num_str(&ctx["markPx"]);
            let mid = num_str(&ctx["midPx"]);
            let open = num_str(&ctx["prevDayPx"]);
            let last = mid.or(mark);
            let pcnt = match (last, open) {
                (Some(last), Some(open)) if open > 0.0 => Some((last - open) / open),
                _ => None,
            };
            let funding_rate = num_str(&ctx["funding"]);
            let open_interest = num_str(&ctx["openInterest"]);
            self.cache.set_ticker(
                "hyperliquid",
                coin,
                &Ticker {
                    last_price: last,
                    mark_price: mark,
                    index_price: num_str(&ctx["oraclePx"]),
                    open24h: open,
                    turnover24h: num_str(&ctx["dayNtlVlm"]),
                    price24h_pcnt: pcnt,
                    funding_rate,
                    open_interest,
                    ..Default::default()
                },
            );
            if funding_rate.is_some() {
                self.cache.set_funding(
                    "hyperliquid",
                    coin,
                    Funding {
                        funding_rate,
                        next_funding_time: None,
                        funding_time: None,
                    },
                );
            }
            if let Some(oi) = open_interest {
                self.cache.set_open_interest(
                    "hyperliquid",
                    coin,
                    OpenInterest {
                        open_interest: oi,
                        open_interest_value: None,
                    },
                );
            }
        }
        info!("hyperliquid universe refreshed: {}", instruments.len());
        self.cache.set_instruments("hyperliquid", instruments);
        Ok(())
    }

    async fn poll_binance(&self) -> Result<()> {
        let base = self.rest_url("binance");

        let url = format!("{base}/fapi/v1/exchangeInfo");
        if let Some(body) = self.fetch_json("binance", &url).await? {
            let symbols = body["symbols"]
                .as_array()
                .context("binance exchangeInfo missing symbols")?;
            let instruments: Vec<Instrument> = symbols
                .iter()
                .filter(|item| item["contractType"].as_str() == Some("PERPETUAL"))
                .filter_map(|item| {
                    let filters = item["filters"].as_array();
                    let filter = |kind: &str, field: &str| -> Option<f64> {
                        filters?
                            .iter()
                            .find(|f| f["filterType"].as_str() == Some(kind))
                            .and_then(|f| num_str(&f[field]))
                    };
                    Some(Instrument {
                        symbol: item["symbol"].as_str()?.to_string(),
                        base_coin: str_field(item, "baseAsset"),
                        quote_coin: str_field(item, "quoteAsset"),
                        status: str_field(item, "status"),
                        tick_size: filter("PRICE_FILTER", "tickSize"),
                        lot_size: filter("LOT_SIZE", "stepSize"),
                        min_order_qty: filter("LOT_SIZE", "minQty"),
                        max_order_qty: filter("LOT_SIZE", "maxQty"),
                        min_leverage: None,
                        max_leverage: None,
                        contract_value: None,
                        asset_index: None,
                    })
                })
                .collect();
            info!("binance instruments refreshed: {}", instruments.len());
            self.cache.set_instruments("binance", instruments);
        }

        let url = format!("{base}/fapi/v1/ticker/24hr");
        if let Some(body) = self.fetch_json("binance", &url).await? {
            let list = body.as_array().context("binance 24hr not an array")?;
            for item in list {
                let Some(symbol) = item["symbol"].as_str() else {
                    continue;
                };
                self.cache.set_ticker(
                    "binance",
                    symbol,
                    &Ticker {
                        last_price: num_str(&item["lastPrice"]),
                        high24h: num_str(&item["highPrice"]),
                        low24h: num_str(&item["lowPrice"]),
                        open24h: num_str(&item["openPrice"]),
                        volume24h: num_str(&item["volume"]),
                        turnover24h: num_str(&item["quoteVolume"]),
                        price24h_pcnt: num_str(&item["priceChangePercent"]).map(|p| p / 100.0),
                        ..Default::default()
                    },
                );
            }
        }

        let url = format!("{base}/fapi/v1/premiumIndex");
        if let Some(body) = self.fetch_json("binance", &url).await? {
            let list = body.as_array().context("binance premiumIndex not an array")?;
            for item in list {
                let Some(symbol) = item["symbol"].as_str() else {
                    continue;
                };
                let funding = Funding {
                    funding_rate: num_str(&item["lastFundingRate"]),
                    next_funding_time: item["nextFundingTime"].as_i64(),
                    funding_time: None,
                };
                self.cache.set_ticker(
                    "binance",
                    symbol,
                    &Ticker {
                        mark_price: num_str(&item["markPrice"]),
                        index_price: num_str(&item["indexPrice"]),
                        funding_rate: funding.funding_rate,
                        next_funding_time: funding.next_funding_time,
                        ..Default::default()
                    },
                );
                self.cache.set_funding("binance", symbol, funding);
            }
        }

        // Open interest is a per-symbol endpoint; bound the fan-out to the
        // symbols anyone actually looks at.
        for symbol in self.top_symbols_by_volume("binance", self.config.hub.hot_set_size) {
            let url = format!("{base}/fapi/v1/openInterest?symbol={symbol}");
            match self.fetch_json("binance", &url).await {
                Ok(Some(body)) => {
                    if let Some(oi) = num_str(&body["openInterest"]) {
                        self.cache.set_open_interest(
                            "binance",
                            &symbol,
                            OpenInterest {
                                open_interest: oi,
                                open_interest_value: None,
                            },
                        );
                    }
                }
                Ok(None) => break, // backoff engaged, stop hammering
                Err(e) => {
                    debug!("binance open interest fetch failed for {symbol}: {e}");
                }
            }
        }
        Ok(())
    }

    // --- derived reads ---

    /// Symbols with positive 24 h turnover, highest first.
    pub fn top_symbols_by_volume(&self, exchange: &str, n: usize) -> Vec<String> {
        let mut tickers: Vec<(String, f64)> = self
            .cache
            .all_tickers(exchange)
            .into_iter()
            .filter_map(|(symbol, ticker, _)| {
                let turnover = ticker.turnover24h?;
                (turnover > 0.0).then_some((symbol, turnover))
            })
            .collect();
        tickers.sort_by(|a, b| b.1.total_cmp(&a.1));
        tickers.truncate(n);
        tickers.into_iter().map(|(symbol, _)| symbol).collect()
    }

    // --- historical klines ---

    /// Single REST pull of historical candles, merged into the cache ring
    /// and returned ascending. Rate-limit backoff yields an empty batch.
    pub async fn fetch_klines(
        &self,
        exchange: &str,
        symbol: &str,
        interval: &str,
        limit: usize,
        before: Option<i64>,
    ) -> Result<Vec<Candle>> {
        let batch = match exchange {
            "bybit" => self.fetch_bybit_klines(symbol, interval, limit, before).await?,
            "blofin" => self.fetch_blofin_klines(symbol, interval, limit, before).await?,
            "bitunix" => self.fetch_bitunix_klines(symbol, interval, limit, before).await?,
            "hyperliquid" => {
                self.fetch_hyperliquid_klines(symbol, interval, limit, before)
                    .await?
            }
            "binance" => self.fetch_binance_klines(symbol, interval, limit, before).await?,
            other => bail!("unknown exchange {other}"),
        };
        let mut batch = batch;
        batch.sort_by_key(|c| c.t);
        batch.dedup_by_key(|c| c.t);
        self.cache.merge_klines(exchange, symbol, interval, &batch);
        Ok(batch)
    }

    async fn fetch_bybit_klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
        before: Option<i64>,
    ) -> Result<Vec<Candle>> {
        let base = self.rest_url("bybit");
        let mut url = format!(
            "{base}/v5/market/kline?category=linear&symbol={symbol}&interval={interval}&limit={limit}"
        );
        if let Some(before) = before {
            url.push_str(&format!("&end={before}"));
        }
        let Some(body) = self.fetch_json("bybit", &url).await? else {
            return Ok(Vec::new());
        };
        let list = bybit_list(&body)?;
        // Rows are [start, open, high, low, close, volume, turnover], newest first.
        Ok(list
            .iter()
            .filter_map(|row| {
                let row = row.as_array()?;
                Some(Candle {
                    t: row.first()?.as_str()?.parse().ok()?,
                    o: num_str(row.get(1)?)?,
                    h: num_str(row.get(2)?)?,
                    l: num_str(row.get(3)?)?,
                    c: num_str(row.get(4)?)?,
                    v: num_str(row.get(5)?)?,
                    closed: Some(true),
                })
            })
            .collect())
    }

    async fn fetch_blofin_klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
        before: Option<i64>,
    ) -> Result<Vec<Candle>> {
        let base = self.rest_url("blofin");
        let mut url =
            format!("{base}/api/v1/market/candles?instId={symbol}&bar={interval}&limit={limit}");
        if let Some(before) = before {
            url.push_str(&format!("&after={before}"));
        }
        let Some(body) = self.fetch_json("blofin", &url).await? else {
            return Ok(Vec::new());
        };
        Ok(blofin_data(&body)?
            .iter()
            .filter_map(|row| {
                let row = row.as_array()?;
                Some(Candle {
                    t: row.first()?.as_str()?.parse().ok()?,
                    o: num_str(row.get(1)?)?,
                    h: num_str(row.get(2)?)?,
                    l: num_str(row.get(3)?)?,
                    c: num_str(row.get(4)?)?,
                    v: num_str(row.get(5)?)?,
                    closed: row.get(8).and_then(|c| c.as_str()).map(|c| c == "1"),
                })
            })
            .collect())
    }

    async fn fetch_bitunix_klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
        before: Option<i64>,
    ) -> Result<Vec<Candle>> {
        let base = self.rest_url("bitunix");
        let mut url = format!(
            "{base}/api/v1/futures/market/kline?symbol={symbol}&interval={interval}&limit={limit}"
        );
        if let Some(before) = before {
            url.push_str(&format!("&endTime={before}"));
        }
        let Some(body) = self.fetch_json("bitunix", &url).await? else {
            return Ok(Vec::new());
        };
        Ok(bitunix_data(&body)?
            .iter()
            .filter_map(|row| {
                Some(Candle {
                    t: row["time"].as_i64()?,
                    o: num_str(&row["open"])?,
                    h: num_str(&row["high"])?,
                    l: num_str(&row["low"])?,
                    c: num_str(&row["close"])?,
                    v: num_str(&row["baseVol"])?,
                    closed: Some(true),
                })
            })
            .collect())
    }

    async fn fetch_hyperliquid_klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
        before: Option<i64>,
    ) -> Result<Vec<Candle>> {
        let base = self.rest_url("hyperliquid");
        let url = format!("{base}/info");
        let step = interval_ms(interval)
            .with_context(|| format!("unknown interval token {interval}"))?;
        let end = before.unwrap_or_else(|| chrono::Utc::now().timestamp_millis());
        let start = end - step * limit as i64;
        let body = serde_json::json!({
            "type": "candleSnapshot",
            "req": {
                "coin": to_coin(symbol),
                "interval": interval,
                "startTime": start,
                "endTime": end,
            }
        });
        let Some(resp) = self.fetch_json_post("hyperliquid", &url, &body).await? else {
            return Ok(Vec::new());
        };
        let rows = resp
            .as_array()
            .context("hyperliquid candleSnapshot not an array")?;
        Ok(rows
            .iter()
            .filter_map(|row| {
                Some(Candle {
                    t: row["t"].as_i64()?,
                    o: num_str(&row["o"])?,
                    h: num_str(&row["h"])?,
                    l: num_str(&row["l"])?,
                    c: num_str(&row["c"])?,
                    v: num_str(&row["v"])?,
                    closed: None,
                })
            })
            .collect())
    }

    async fn fetch_binance_klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
        before: Option<i64>,
    ) -> Result<Vec<Candle>> {
        let base = self.rest_url("binance");
        let mut url =
            format!("{base}/fapi/v1/klines?symbol={symbol}&interval={interval}&limit={limit}");
        if let Some(before) = before {
            url.push_str(&format!("&endTime={before}"));
        }
        let Some(body) = self.fetch_json("binance", &url).await? else {
            return Ok(Vec::new());
        };
        let rows = body.as_array().context("binance klines not an array")?;
        // Rows: [openTime, open, high, low, close, volume, closeTime, …]
        Ok(rows
            .iter()
            .filter_map(|row| {
                let row = row.as_array()?;
                Some(Candle {
                    t: row.first()?.as_i64()?,
                    o: num_str(row.get(1)?)?,
                    h: num_str(row.get(2)?)?,
                    l: num_str(row.get(3)?)?,
                    c: num_str(row.get(4)?)?,
                    v: num_str(row.get(5)?)?,
                    closed: Some(true),
                })
            })
            .collect())
    }
}

// --- envelope helpers ---

fn bybit_list(body: &Value) -> Result<&Vec<Value>, FetchError> {
    if body["retCode"].as_i64() != Some(0) {
        return Err(FetchError::Envelope(format!(
            "bybit retCode {} ({})",
            body["retCode"], body["retMsg"]
        )));
    }
    body["result"]["list"]
        .as_array()
        .ok_or_else(|| FetchError::Envelope("bybit missing result.list".into()))
}

fn blofin_data(body: &Value) -> Result<&Vec<Value>, FetchError> {
    if body["code"].as_str() != Some("0") {
        return Err(FetchError::Envelope(format!(
            "blofin code {} ({})",
            body["code"], body["msg"]
        )));
    }
    body["data"]
        .as_array()
        .ok_or_else(|| FetchError::Envelope("blofin missing data".into()))
}

fn bitunix_data(body: &Value) -> Result<&Vec<Value>, FetchError> {
    if body["code"].as_i64() != Some(0) {
        return Err(FetchError::Envelope(format!(
            "bitunix code {} ({})",
            body["code"], body["msg"]
        )));
    }
    body["data"]
        .as_array()
        .ok_or_else(|| FetchError::Envelope("bitunix missing data".into()))
}

/// Number that may arrive as a JSON string or number.
fn num_str(value: &Value) -> Option<f64> {
    match value {
        Value::String(s) => s.parse::<f64>().ok().filter(|v| v.is_finite()),
        Value::Number(n) => n.as_f64().filter(|v| v.is_finite()),
        _ => None,
    }
}

fn int_str(value: &Value) -> Option<i64> {
    match value {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_i64(),
        _ => None,
    }
}

fn str_field(item: &Value, field: &str) -> Option<String> {
    item[field].as_str().map(String::from)
}
