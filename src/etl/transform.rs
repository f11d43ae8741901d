//! Typed transformation of bronze records into warehouse rows.
//!
//! Numeric fields convert through `Decimal` (the values were transported
//! as strings, so they arrive exact). Records missing required fields,
//! with unparseable decimals, or with timestamps outside the valid window
//! are dropped and counted.

use std::str::FromStr;

use chrono::{Datelike, TimeZone, Timelike, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde_json::Value;
use tracing::{debug, warn};

use super::reader::DiscoveredFile;
use crate::models::{MAX_VALID_TS, MIN_VALID_TS};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MarketRow {
    pub symbol: String,
    pub timestamp: i64,
    pub price: Decimal,
    pub volume: Decimal,
    pub trade_id: Option<i64>,
    pub is_buyer_maker: Option<bool>,
    pub source: String,
    pub data_type: String,
    pub ingest_timestamp: Option<i64>,

    // Kline columns
    pub open_price: Option<Decimal>,
    pub high_price: Option<Decimal>,
    pub low_price: Option<Decimal>,
    pub close_price: Option<Decimal>,
    pub quote_volume: Option<Decimal>,
    pub vwap: Option<Decimal>,
    pub trade_count: Option<i64>,
    pub interval: Option<String>,

    // Depth columns
    pub best_bid_price: Option<Decimal>,
    pub best_bid_size: Option<Decimal>,
    pub best_ask_price: Option<Decimal>,
    pub best_ask_size: Option<Decimal>,
    pub spread: Option<Decimal>,
    pub mid_price: Option<Decimal>,
    pub last_update_id: Option<i64>,

    // Derived features
    pub price_change: Option<Decimal>,
    pub price_change_pct: Option<Decimal>,
    pub hour_of_day: Option<i32>,
    pub day_of_week: Option<i32>,
}

#[derive(Debug, Default, Clone)]
pub struct TransformStats {
    pub records_transformed: u64,
    pub records_skipped: u64,
    pub validation_errors: u64,
}

#[derive(Default)]
pub struct DataTransformer {
    stats: Mutex<TransformStats>,
}

fn field_decimal(record: &Value, field: &str) -> Option<Decimal> {
    match record.get(field)? {
        Value::String(s) if !s.trim().is_empty() => Decimal::from_str(s).ok(),
        Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
        _ => None,
    }
}

fn field_i64(record: &Value, field: &str) -> Option<i64> {
    record.get(field)?.as_i64()
}

fn valid_timestamp(ts: i64) -> bool {
    (MIN_VALID_TS..=MAX_VALID_TS).contains(&ts)
}

fn level_decimal(level: &Value, idx: usize) -> Option<Decimal> {
    match level.get(idx)? {
        Value::String(s) => Decimal::from_str(s).ok(),
        Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
        _ => None,
    }
}

impl DataTransformer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transform one file's parsed records, routed by the file's data
    /// type. Unusable records are dropped and counted, never fatal.
    pub fn transform(&self, records: &[Value], file: &DiscoveredFile) -> Vec<MarketRow> {
        let data_type = file.data_type.as_deref().unwrap_or("unknown");
        let fallback_symbol = file.symbol.as_deref().unwrap_or("UNKNOWN");

        let mut rows = Vec::with_capacity(records.len());
        for record in records {
            let row = match data_type {
                "aggTrades" | "trades" => self.transform_agg_trade(record),
                t if t.starts_with("klines") => self.transform_kline(record, fallback_symbol),
                "depth_snapshots" => self.transform_depth_snapshot(record, fallback_symbol),
                other => {
                    debug!(data_type = other, "unknown_data_type");
                    self.stats.lock().records_skipped += 1;
                    continue;
                }
            };

            match row {
                Some(row) => {
                    self.stats.lock().records_transformed += 1;
                    rows.push(row);
                }
                None => self.stats.lock().validation_errors += 1,
            }
        }
        rows
    }

    fn transform_agg_trade(&self, record: &Value) -> Option<MarketRow> {
        let symbol = record.get("symbol")?.as_str()?.to_string();
        let timestamp = field_i64(record, "event_ts")?;
        if !valid_timestamp(timestamp) {
            warn!(symbol, timestamp, "timestamp_out_of_range");
            return None;
        }
        let price = field_decimal(record, "price")?;
        let volume = field_decimal(record, "qty")?;
        let trade_id = field_i64(record, "trade_id")?;
        let is_buyer_maker = record.get("is_buyer_maker")?.as_bool()?;

        Some(MarketRow {
            symbol,
            timestamp,
            price,
            volume,
            trade_id: Some(trade_id),
            is_buyer_maker: Some(is_buyer_maker),
            source: record
                .get("source")
                .and_then(|v| v.as_str())
                .unwrap_or("rest")
                .to_string(),
            data_type: "aggTrade".to_string(),
            ingest_timestamp: field_i64(record, "ingest_ts"),
            ..Default::default()
        })
    }

    fn transform_kline(&self, record: &Value, fallback_symbol: &str) -> Option<MarketRow> {
        let symbol = record
            .get("symbol")
            .and_then(|v| v.as_str())
            .unwrap_or(fallback_symbol)
            .to_string();
        let open_time = field_i64(record, "open_time")?;
        if !valid_timestamp(open_time) {
            warn!(symbol, open_time, "timestamp_out_of_range");
            return None;
        }
        let open_price = field_decimal(record, "open_price")?;
        let high_price = field_decimal(record, "high_price")?;
        let low_price = field_decimal(record, "low_price")?;
        let close_price = field_decimal(record, "close_price")?;
        let volume = field_decimal(record, "volume")?;
        let quote_volume = field_decimal(record, "quote_volume")?;
        let trade_count = field_i64(record, "trade_count")?;

        // Quote volume over volume is the kline-level VWAP; an empty
        // candle degrades to its close.
        let vwap = if volume > Decimal::ZERO {
            quote_volume
                .checked_div(volume)
                .unwrap_or(close_price)
        } else {
            close_price
        };

        Some(MarketRow {
            symbol,
            timestamp: open_time,
            price: close_price,
            volume,
            source: "rest".to_string(),
            data_type: "kline".to_string(),
            ingest_timestamp: field_i64(record, "ingest_ts"),
            open_price: Some(open_price),
            high_price: Some(high_price),
            low_price: Some(low_price),
            close_price: Some(close_price),
            quote_volume: Some(quote_volume),
            vwap: Some(vwap),
            trade_count: Some(trade_count),
            interval: Some(
                record
                    .get("interval")
                    .and_then(|v| v.as_str())
                    .unwrap_or("1m")
                    .to_string(),
            ),
            ..Default::default()
        })
    }

    fn transform_depth_snapshot(&self, record: &Value, fallback_symbol: &str) -> Option<MarketRow> {
        let symbol = record
            .get("symbol")
            .and_then(|v| v.as_str())
            .unwrap_or(fallback_symbol)
            .to_string();
        let timestamp = field_i64(record, "event_ts").or_else(|| field_i64(record, "timestamp"))?;
        if !valid_timestamp(timestamp) {
            warn!(symbol, timestamp, "timestamp_out_of_range");
            return None;
        }

        let bids = record.get("bids")?.as_array()?;
        let asks = record.get("asks")?.as_array()?;
        if bids.is_empty() || asks.is_empty() {
            warn!(symbol, "empty_depth_sides");
            return None;
        }

        let best_bid_price = level_decimal(&bids[0], 0)?;
        let best_bid_size = level_decimal(&bids[0], 1)?;
        let best_ask_price = level_decimal(&asks[0], 0)?;
        let best_ask_size = level_decimal(&asks[0], 1)?;

        let spread = best_ask_price - best_bid_price;
        let mid_price = (best_bid_price + best_ask_price) / Decimal::TWO;

        Some(MarketRow {
            symbol,
            timestamp,
            price: mid_price,
            volume: best_bid_size + best_ask_size,
            source: record
                .get("source")
                .and_then(|v| v.as_str())
                .unwrap_or("rest")
                .to_string(),
            data_type: "depth".to_string(),
            ingest_timestamp: field_i64(record, "ingest_ts"),
            best_bid_price: Some(best_bid_price),
            best_bid_size: Some(best_bid_size),
            best_ask_price: Some(best_ask_price),
            best_ask_size: Some(best_ask_size),
            spread: Some(spread),
            mid_price: Some(mid_price),
            last_update_id: field_i64(record, "last_update_id"),
            ..Default::default()
        })
    }

    /// Per-symbol price deltas plus calendar features, in timestamp order.
    pub fn add_derived_features(&self, rows: &mut [MarketRow]) {
        rows.sort_by_key(|r| r.timestamp);

        let mut last_price: std::collections::HashMap<String, Decimal> =
            std::collections::HashMap::new();
        for row in rows.iter_mut() {
            if let Some(prev) = last_price.get(&row.symbol) {
                let change = row.price - prev;
                row.price_change = Some(change);
                if !prev.is_zero() {
                    row.price_change_pct = change
                        .checked_div(*prev)
                        .map(|r| r * Decimal::ONE_HUNDRED);
                }
            }
            last_price.insert(row.symbol.clone(), row.price);

            if let Some(dt) = Utc.timestamp_millis_opt(row.timestamp).single() {
                row.hour_of_day = Some(dt.hour() as i32);
                row.day_of_week = Some(dt.weekday().num_days_from_monday() as i32);
            }
        }
    }

    pub fn stats(&self) -> TransformStats {
        self.stats.lock().clone()
    }
}
