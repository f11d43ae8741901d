//! Exchange REST client for historical pulls.
//!
//! Requests pass through the token-bucket rate limiter, then the retry
//! policy. A 429 is handled specially: sleep for `Retry-After` and repeat
//! the request once without consuming the retry budget.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::backfill::MarketDataSource;
use crate::config::{ExchangeConfig, RetryConfig};
use crate::models::{now_ms, DepthSnapshot, Kline, Source, Trade};
use crate::util::{retry_async, RateLimiter, RetryPolicy};

const AGG_TRADES_PATH: &str = "/api/v3/aggTrades";
const TRADES_PATH: &str = "/api/v3/historicalTrades";
const KLINES_PATH: &str = "/api/v3/klines";
const DEPTH_PATH: &str = "/api/v3/depth";

pub const MAX_LIMIT: usize = 1_000;

/// Wire shape of an aggregated trade. The endpoint omits the symbol, so
/// normalization falls back to the requested one.
#[derive(Debug, Clone, Deserialize)]
pub struct RawAggTrade {
    #[serde(rename = "a")]
    pub agg_trade_id: i64,
    #[serde(rename = "p")]
    pub price: String,
    #[serde(rename = "q")]
    pub qty: String,
    #[serde(rename = "T")]
    pub event_time: i64,
    #[serde(rename = "m")]
    pub is_buyer_maker: bool,
    #[serde(rename = "s", default)]
    pub symbol: Option<String>,
}

/// Kline rows arrive as 12-element heterogeneous arrays.
#[derive(Debug, Clone, Deserialize)]
pub struct RawKline(
    pub i64,              // open time
    pub String,           // open
    pub String,           // high
    pub String,           // low
    pub String,           // close
    pub String,           // volume
    pub i64,              // close time
    pub String,           // quote volume
    pub i64,              // trade count
    pub String,           // taker buy base volume
    pub String,           // taker buy quote volume
    pub serde_json::Value, // unused
);

#[derive(Debug, Clone, Deserialize)]
pub struct RawDepth {
    #[serde(rename = "lastUpdateId")]
    pub last_update_id: i64,
    pub bids: Vec<[String; 2]>,
    pub asks: Vec<[String; 2]>,
}

pub struct BinanceRestClient {
    http: reqwest::Client,
    base_url: String,
    rate_limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
}

impl BinanceRestClient {
    pub fn new(exchange: &ExchangeConfig, retry: &RetryConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(exchange.request_timeout_seconds))
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            http,
            base_url: exchange.rest_base_url.trim_end_matches('/').to_string(),
            rate_limiter: Arc::new(RateLimiter::new(exchange.rate_limit_requests_per_minute)),
            retry: RetryPolicy::from(retry),
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        params: Vec<(String, String)>,
    ) -> Result<T> {
        self.rate_limiter.acquire().await;

        let url = format!("{}{}", self.base_url, path);
        retry_async(&self.retry, || self.fetch_once(&url, &params)).await
    }

    async fn fetch_once<T: DeserializeOwned>(
        &self,
        url: &str,
        params: &[(String, String)],
    ) -> Result<T> {
        let mut rate_limited_once = false;
        loop {
            let response = self
                .http
                .get(url)
                .query(params)
                .send()
                .await
                .with_context(|| format!("request to {url} failed"))?;

            if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
                let retry_after = response
                    .headers()
                    .get("Retry-After")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(60);
                warn!(retry_after_secs = retry_after, "rate_limited_by_exchange");
                tokio::time::sleep(Duration::from_secs(retry_after)).await;
                if !rate_limited_once {
                    rate_limited_once = true;
                    continue;
                }
                anyhow::bail!("still rate limited after Retry-After wait");
            }

            let response = response
                .error_for_status()
                .with_context(|| format!("{url} returned error status"))?;
            return response
                .json::<T>()
                .await
                .with_context(|| format!("invalid JSON from {url}"));
        }
    }

    pub async fn get_agg_trades(
        &self,
        symbol: &str,
        start_time: Option<i64>,
        end_time: Option<i64>,
        from_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<RawAggTrade>> {
        let mut params = vec![
            ("symbol".to_string(), symbol.to_string()),
            ("limit".to_string(), limit.min(MAX_LIMIT).to_string()),
        ];
        if let Some(start) = start_time {
            params.push(("startTime".to_string(), start.to_string()));
        }
        if let Some(end) = end_time {
            params.push(("endTime".to_string(), end.to_string()));
        }
        if let Some(id) = from_id {
            params.push(("fromId".to_string(), id.to_string()));
        }

        let trades: Vec<RawAggTrade> = self.get_json(AGG_TRADES_PATH, params).await?;
        debug!(symbol, count = trades.len(), "agg_trades_fetched");
        Ok(trades)
    }

    pub async fn get_historical_trades(
        &self,
        symbol: &str,
        from_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<serde_json::Value>> {
        let mut params = vec![
            ("symbol".to_string(), symbol.to_string()),
            ("limit".to_string(), limit.min(MAX_LIMIT).to_string()),
        ];
        if let Some(id) = from_id {
            params.push(("fromId".to_string(), id.to_string()));
        }
        self.get_json(TRADES_PATH, params).await
    }

    pub async fn get_klines(
        &self,
        symbol: &str,
        interval: &str,
        start_time: Option<i64>,
        end_time: Option<i64>,
        limit: usize,
    ) -> Result<Vec<RawKline>> {
        let mut params = vec![
            ("symbol".to_string(), symbol.to_string()),
            ("interval".to_string(), interval.to_string()),
            ("limit".to_string(), limit.min(MAX_LIMIT).to_string()),
        ];
        if let Some(start) = start_time {
            params.push(("startTime".to_string(), start.to_string()));
        }
        if let Some(end) = end_time {
            params.push(("endTime".to_string(), end.to_string()));
        }

        let klines: Vec<RawKline> = self.get_json(KLINES_PATH, params).await?;
        info!(symbol, interval, count = klines.len(), "klines_fetched");
        Ok(klines)
    }

    pub async fn get_depth(&self, symbol: &str, limit: usize) -> Result<RawDepth> {
        let params = vec![
            ("symbol".to_string(), symbol.to_string()),
            ("limit".to_string(), limit.to_string()),
        ];
        let depth: RawDepth = self.get_json(DEPTH_PATH, params).await?;
        debug!(
            symbol,
            bids = depth.bids.len(),
            asks = depth.asks.len(),
            "depth_snapshot_fetched"
        );
        Ok(depth)
    }
}

#[async_trait]
impl MarketDataSource for BinanceRestClient {
    async fn agg_trades(
        &self,
        symbol: &str,
        start_time: Option<i64>,
        end_time: Option<i64>,
        limit: usize,
    ) -> Result<Vec<RawAggTrade>> {
        self.get_agg_trades(symbol, start_time, end_time, None, limit)
            .await
    }

    async fn klines(
        &self,
        symbol: &str,
        interval: &str,
        start_time: Option<i64>,
        end_time: Option<i64>,
        limit: usize,
    ) -> Result<Vec<RawKline>> {
        self.get_klines(symbol, interval, start_time, end_time, limit)
            .await
    }

    async fn depth(&self, symbol: &str, limit: usize) -> Result<RawDepth> {
        self.get_depth(symbol, limit).await
    }
}

// =============================================================================
// NORMALIZATION
// =============================================================================

/// Map the exchange's short field names onto the domain shape.
pub fn normalize_agg_trade(raw: &RawAggTrade, fallback_symbol: &str) -> Result<Trade> {
    Ok(Trade {
        symbol: raw
            .symbol
            .clone()
            .unwrap_or_else(|| fallback_symbol.to_string())
            .to_uppercase(),
        event_ts: raw.event_time,
        ingest_ts: now_ms(),
        trade_id: raw.agg_trade_id,
        price: Decimal::from_str(&raw.price)
            .with_context(|| format!("bad price {:?}", raw.price))?,
        qty: Decimal::from_str(&raw.qty).with_context(|| format!("bad qty {:?}", raw.qty))?,
        is_buyer_maker: raw.is_buyer_maker,
        source: Source::Rest,
    })
}

pub fn normalize_kline(raw: &RawKline, symbol: &str, interval: &str) -> Result<Kline> {
    let decimal = |s: &str, field: &str| {
        Decimal::from_str(s).with_context(|| format!("bad {field} {s:?} in kline"))
    };
    Ok(Kline {
        symbol: symbol.to_uppercase(),
        interval: interval.to_string(),
        open_time: raw.0,
        close_time: raw.6,
        open_price: decimal(&raw.1, "open")?,
        high_price: decimal(&raw.2, "high")?,
        low_price: decimal(&raw.3, "low")?,
        close_price: decimal(&raw.4, "close")?,
        volume: decimal(&raw.5, "volume")?,
        quote_volume: decimal(&raw.7, "quote_volume")?,
        trade_count: raw.8,
        taker_buy_base_volume: decimal(&raw.9, "taker_buy_base_volume")?,
        taker_buy_quote_volume: decimal(&raw.10, "taker_buy_quote_volume")?,
        ingest_ts: now_ms(),
    })
}

pub fn normalize_depth(raw: RawDepth, symbol: &str) -> DepthSnapshot {
    let ts = now_ms();
    DepthSnapshot {
        symbol: symbol.to_uppercase(),
        event_ts: ts,
        ingest_ts: ts,
        bids: raw.bids,
        asks: raw.asks,
        last_update_id: Some(raw.last_update_id),
        source: Source::Rest,
    }
}
