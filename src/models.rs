//! Domain records shared by every service in the pipeline.
//!
//! Prices and quantities are `rust_decimal::Decimal` and serialize as
//! strings, so a record that entered as `"50000.10"` leaves as
//! `"50000.10"` no matter how many hops it takes.

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Valid event-timestamp window: [2020-01-01, 2030-01-01) in unix millis.
pub const MIN_VALID_TS: i64 = 1_577_836_800_000;
pub const MAX_VALID_TS: i64 = 1_893_456_000_000;

/// Current wall clock in unix milliseconds.
#[inline]
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Where a record entered the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Rest,
    Sbe,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Rest => "rest",
            Source::Sbe => "sbe",
        }
    }
}

/// An aggregated trade, normalized from either the REST or SBE feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub symbol: String,
    pub event_ts: i64,
    pub ingest_ts: i64,
    pub trade_id: i64,
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub qty: Decimal,
    pub is_buyer_maker: bool,
    pub source: Source,
}

/// Top-of-book quote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestBidAsk {
    pub symbol: String,
    pub event_ts: i64,
    pub ingest_ts: i64,
    #[serde(with = "rust_decimal::serde::str")]
    pub bid_px: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub bid_sz: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub ask_px: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub ask_sz: Decimal,
    pub source: Source,
}

/// Order-book depth (delta or full snapshot).
///
/// Levels are `[price, qty]` string pairs: bids sorted descending, asks
/// ascending, formatted compactly so they round-trip byte-for-byte.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepthSnapshot {
    pub symbol: String,
    pub event_ts: i64,
    pub ingest_ts: i64,
    pub bids: Vec<[String; 2]>,
    pub asks: Vec<[String; 2]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_update_id: Option<i64>,
    pub source: Source,
}

/// One candlestick from the klines endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kline {
    pub symbol: String,
    pub interval: String,
    pub open_time: i64,
    pub close_time: i64,
    #[serde(with = "rust_decimal::serde::str")]
    pub open_price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub high_price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub low_price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub close_price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub volume: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub quote_volume: Decimal,
    pub trade_count: i64,
    #[serde(with = "rust_decimal::serde::str")]
    pub taker_buy_base_volume: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub taker_buy_quote_volume: Decimal,
    pub ingest_ts: i64,
}

/// Message kinds carried by the streaming feed and the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    Trade,
    BestBidAsk,
    Depth,
}

impl MessageType {
    /// Stream tag as it appears in subscription paths and bus stream routing.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Trade => "trade",
            MessageType::BestBidAsk => "bestBidAsk",
            MessageType::Depth => "depth",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "trade" => Some(MessageType::Trade),
            "bestBidAsk" | "bookTicker" => Some(MessageType::BestBidAsk),
            "depth" | "depthDiff" | "depth@100ms" => Some(MessageType::Depth),
            _ => None,
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A normalized record tagged with its message type, as handed from the
/// streaming client to downstream publishers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MarketMessage {
    #[serde(rename = "trade")]
    Trade(Trade),
    #[serde(rename = "bestBidAsk")]
    BestBidAsk(BestBidAsk),
    #[serde(rename = "depth")]
    Depth(DepthSnapshot),
}

impl MarketMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            MarketMessage::Trade(_) => MessageType::Trade,
            MarketMessage::BestBidAsk(_) => MessageType::BestBidAsk,
            MarketMessage::Depth(_) => MessageType::Depth,
        }
    }

    pub fn symbol(&self) -> &str {
        match self {
            MarketMessage::Trade(t) => &t.symbol,
            MarketMessage::BestBidAsk(b) => &b.symbol,
            MarketMessage::Depth(d) => &d.symbol,
        }
    }

    pub fn event_ts(&self) -> i64 {
        match self {
            MarketMessage::Trade(t) => t.event_ts,
            MarketMessage::BestBidAsk(b) => b.event_ts,
            MarketMessage::Depth(d) => d.event_ts,
        }
    }

    /// Natural identity used for deduplication: trade_id for trades,
    /// last_update_id (falling back to event_ts) for depth, event_ts for
    /// quotes.
    pub fn natural_id(&self) -> String {
        match self {
            MarketMessage::Trade(t) => t.trade_id.to_string(),
            MarketMessage::BestBidAsk(b) => b.event_ts.to_string(),
            MarketMessage::Depth(d) => d
                .last_update_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| d.event_ts.to_string()),
        }
    }
}

/// Compact `%.16g`-style rendering for depth levels so decimal strings
/// round-trip without trailing-zero drift.
pub fn format_level(value: Decimal) -> String {
    value.normalize().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn trade_serializes_decimals_as_strings() {
        let trade = Trade {
            symbol: "BTCUSDT".into(),
            event_ts: 1_700_000_000_000,
            ingest_ts: 1_700_000_000_100,
            trade_id: 42,
            price: dec!(50000.10),
            qty: dec!(0.00150000),
            is_buyer_maker: false,
            source: Source::Rest,
        };

        let json = serde_json::to_value(&trade).unwrap();
        assert_eq!(json["price"], "50000.10");
        assert_eq!(json["qty"], "0.00150000");
        assert_eq!(json["source"], "rest");

        let back: Trade = serde_json::from_value(json).unwrap();
        assert_eq!(back, trade);
    }

    #[test]
    fn market_message_tags_by_type() {
        let msg = MarketMessage::Depth(DepthSnapshot {
            symbol: "BTCUSDT".into(),
            event_ts: 1_700_000_000_000,
            ingest_ts: 1_700_000_000_001,
            bids: vec![["50000.1".into(), "1.5".into()]],
            asks: vec![["50000.2".into(), "2".into()]],
            last_update_id: Some(987),
            source: Source::Sbe,
        });

        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "depth");
        assert_eq!(msg.natural_id(), "987");
        assert_eq!(msg.message_type().as_str(), "depth");
    }

    #[test]
    fn depth_without_update_id_falls_back_to_event_ts() {
        let msg = MarketMessage::Depth(DepthSnapshot {
            symbol: "ETHUSDT".into(),
            event_ts: 1_700_000_111_000,
            ingest_ts: 1_700_000_111_001,
            bids: vec![],
            asks: vec![],
            last_update_id: None,
            source: Source::Sbe,
        });
        assert_eq!(msg.natural_id(), "1700000111000");
    }

    #[test]
    fn level_formatting_is_compact() {
        assert_eq!(format_level(dec!(50000.1000)), "50000.1");
        assert_eq!(format_level(dec!(2.000)), "2");
    }
}
