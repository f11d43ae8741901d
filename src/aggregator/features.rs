//! Per-window feature derivation.
//!
//! Window math runs in f64 (the decimal discipline applies to the storage
//! path, not to derived statistics); every emitted field is guaranteed
//! finite, and divisions guard their denominators.

use rust_decimal::prelude::ToPrimitive;
use serde_json::{json, Map, Value};
use tracing::warn;

use crate::models::{BestBidAsk, DepthSnapshot, MarketMessage, MessageType, Trade};

pub const FEATURE_VERSION: &str = "1.0";

#[derive(Debug, Default, Clone)]
pub struct BuilderStats {
    pub features_built: u64,
    pub messages_processed: u64,
    pub computation_errors: u64,
}

#[derive(Default)]
pub struct FeatureBuilder {
    stats: parking_lot::Mutex<BuilderStats>,
}

fn finite(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample standard deviation; zero for fewer than two points.
fn stdev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    var.sqrt()
}

impl FeatureBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the feature map for one drained window. Messages must already
    /// be sorted by `event_ts`. Returns `None` when the window has no
    /// usable records.
    pub fn build(
        &self,
        symbol: &str,
        messages: &[MarketMessage],
        message_type: MessageType,
        now_sec: i64,
    ) -> Option<Value> {
        if messages.is_empty() {
            return None;
        }

        let features = match message_type {
            MessageType::Trade => self.trade_features(messages),
            MessageType::BestBidAsk => self.order_book_features(messages),
            MessageType::Depth => self.depth_features(messages),
        }?;

        let mut map = features;
        map.insert("symbol".into(), json!(symbol));
        map.insert("timestamp".into(), json!(now_sec));
        map.insert("message_count".into(), json!(messages.len()));
        map.insert("message_type".into(), json!(message_type.as_str()));
        map.insert("feature_version".into(), json!(FEATURE_VERSION));

        let mut stats = self.stats.lock();
        stats.features_built += 1;
        stats.messages_processed += messages.len() as u64;

        Some(Value::Object(map))
    }

    fn trade_features(&self, messages: &[MarketMessage]) -> Option<Map<String, Value>> {
        let trades: Vec<&Trade> = messages
            .iter()
            .filter_map(|m| match m {
                MarketMessage::Trade(t) => Some(t),
                _ => None,
            })
            .collect();

        let mut prices = Vec::with_capacity(trades.len());
        let mut volumes = Vec::with_capacity(trades.len());
        let mut timestamps = Vec::with_capacity(trades.len());
        let mut buy_volume = 0.0;
        let mut sell_volume = 0.0;

        for trade in &trades {
            let (Some(price), Some(qty)) = (trade.price.to_f64(), trade.qty.to_f64()) else {
                warn!(symbol = %trade.symbol, "unrepresentable_trade_skipped");
                continue;
            };
            if price <= 0.0 || qty <= 0.0 {
                continue;
            }
            prices.push(price);
            volumes.push(qty);
            timestamps.push(trade.event_ts);
            // The maker side tells us the aggressor: a buyer-maker trade
            // was driven by a sell.
            if trade.is_buyer_maker {
                sell_volume += qty;
            } else {
                buy_volume += qty;
            }
        }

        if prices.is_empty() {
            return None;
        }

        let latest_price = *prices.last().expect("non-empty");
        let first_price = prices[0];
        let total_volume: f64 = volumes.iter().sum();
        let trade_count = prices.len();
        let avg_price = mean(&prices);

        let total_value: f64 = prices.iter().zip(&volumes).map(|(p, v)| p * v).sum();
        let vwap = if total_volume > 0.0 {
            total_value / total_volume
        } else {
            avg_price
        };

        let time_span = if timestamps.len() > 1 {
            (timestamps[timestamps.len() - 1] - timestamps[0]) as f64 / 1000.0
        } else {
            1.0
        };
        let trades_per_second = trade_count as f64 / time_span.max(1.0);

        let price_change = if prices.len() > 1 {
            latest_price - first_price
        } else {
            0.0
        };
        let price_change_pct = if first_price > 0.0 {
            price_change / first_price * 100.0
        } else {
            0.0
        };

        let volume_imbalance = (buy_volume - sell_volume) / total_volume.max(1.0);

        let mut map = Map::new();
        let mut put = |key: &str, value: f64| {
            map.insert(key.to_string(), json!(finite(value)));
        };
        put("price", latest_price);
        put("volume", total_volume);
        put("vwap", vwap);
        put("price_change", price_change);
        put("price_change_pct", price_change_pct);
        put("min_price", prices.iter().cloned().fold(f64::INFINITY, f64::min));
        put("max_price", prices.iter().cloned().fold(f64::NEG_INFINITY, f64::max));
        put("avg_price", avg_price);
        put("price_volatility", stdev(&prices));
        put("trades_per_second", trades_per_second);
        put("buy_volume", buy_volume);
        put("sell_volume", sell_volume);
        put("volume_imbalance", volume_imbalance);
        put("avg_trade_size", total_volume / trade_count as f64);
        put("time_span_seconds", time_span);
        map.insert("trade_count".into(), json!(trade_count));
        Some(map)
    }

    fn order_book_features(&self, messages: &[MarketMessage]) -> Option<Map<String, Value>> {
        let updates: Vec<&BestBidAsk> = messages
            .iter()
            .filter_map(|m| match m {
                MarketMessage::BestBidAsk(b) => Some(b),
                _ => None,
            })
            .collect();

        let mut bid_prices = Vec::new();
        let mut ask_prices = Vec::new();
        let mut bid_sizes = Vec::new();
        let mut ask_sizes = Vec::new();
        let mut spreads = Vec::new();
        let mut mid_prices = Vec::new();

        for update in &updates {
            let (Some(bid), Some(ask), Some(bid_size), Some(ask_size)) = (
                update.bid_px.to_f64(),
                update.ask_px.to_f64(),
                update.bid_sz.to_f64(),
                update.ask_sz.to_f64(),
            ) else {
                continue;
            };
            if bid <= 0.0 || ask <= 0.0 {
                continue;
            }
            bid_prices.push(bid);
            ask_prices.push(ask);
            bid_sizes.push(bid_size);
            ask_sizes.push(ask_size);
            spreads.push(ask - bid);
            mid_prices.push((bid + ask) / 2.0);
        }

        if bid_prices.is_empty() {
            return None;
        }

        let latest_bid = *bid_prices.last().expect("non-empty");
        let latest_ask = *ask_prices.last().expect("non-empty");
        let latest_spread = *spreads.last().expect("non-empty");
        let latest_mid = *mid_prices.last().expect("non-empty");

        let total_bid_size: f64 = bid_sizes.iter().sum();
        let total_ask_size: f64 = ask_sizes.iter().sum();
        let mid_change = if mid_prices.len() > 1 {
            latest_mid - mid_prices[0]
        } else {
            0.0
        };

        let mut map = Map::new();
        let mut put = |key: &str, value: f64| {
            map.insert(key.to_string(), json!(finite(value)));
        };
        put("price", latest_mid);
        put("bid_price", latest_bid);
        put("ask_price", latest_ask);
        put("spread", latest_spread);
        put(
            "spread_pct",
            if latest_mid > 0.0 {
                latest_spread / latest_mid * 100.0
            } else {
                0.0
            },
        );
        put("mid_price", latest_mid);
        put("avg_bid", mean(&bid_prices));
        put("avg_ask", mean(&ask_prices));
        put("avg_spread", mean(&spreads));
        put("avg_mid", mean(&mid_prices));
        put("min_spread", spreads.iter().cloned().fold(f64::INFINITY, f64::min));
        put(
            "max_spread",
            spreads.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
        );
        put("spread_volatility", stdev(&spreads));
        put("bid_size", *bid_sizes.last().expect("non-empty"));
        put("ask_size", *ask_sizes.last().expect("non-empty"));
        put("avg_bid_size", mean(&bid_sizes));
        put("avg_ask_size", mean(&ask_sizes));
        put("total_bid_size", total_bid_size);
        put("total_ask_size", total_ask_size);
        put(
            "size_imbalance",
            (total_bid_size - total_ask_size) / (total_bid_size + total_ask_size).max(1.0),
        );
        put("mid_change", mid_change);
        put(
            "mid_change_pct",
            if mid_prices[0] > 0.0 {
                mid_change / mid_prices[0] * 100.0
            } else {
                0.0
            },
        );
        map.insert("update_count".into(), json!(updates.len()));
        Some(map)
    }

    fn depth_features(&self, messages: &[MarketMessage]) -> Option<Map<String, Value>> {
        // The latest snapshot in the window is the book state.
        let latest = messages.iter().rev().find_map(|m| match m {
            MarketMessage::Depth(d) => Some(d),
            _ => None,
        })?;
        self.depth_snapshot_features(latest)
    }

    fn depth_snapshot_features(&self, depth: &DepthSnapshot) -> Option<Map<String, Value>> {
        let parse = |level: &[String; 2]| -> Option<(f64, f64)> {
            let price: f64 = level[0].parse().ok()?;
            let qty: f64 = level[1].parse().ok()?;
            Some((price, qty))
        };

        let bids: Vec<(f64, f64)> = depth.bids.iter().filter_map(parse).collect();
        let asks: Vec<(f64, f64)> = depth.asks.iter().filter_map(parse).collect();
        if bids.is_empty() || asks.is_empty() {
            return None;
        }

        let (best_bid_price, best_bid_size) = bids[0];
        let (best_ask_price, best_ask_size) = asks[0];
        let spread = best_ask_price - best_bid_price;
        let mid_price = (best_bid_price + best_ask_price) / 2.0;

        let bid_depth: f64 = bids.iter().take(5).map(|(_, q)| q).sum();
        let ask_depth: f64 = asks.iter().take(5).map(|(_, q)| q).sum();
        let bid_weighted: f64 =
            bids.iter().take(5).map(|(p, q)| p * q).sum::<f64>() / bid_depth.max(1.0);
        let ask_weighted: f64 =
            asks.iter().take(5).map(|(p, q)| p * q).sum::<f64>() / ask_depth.max(1.0);

        let mut map = Map::new();
        let mut put = |key: &str, value: f64| {
            map.insert(key.to_string(), json!(finite(value)));
        };
        put("price", mid_price);
        put("bid_price", best_bid_price);
        put("ask_price", best_ask_price);
        put("spread", spread);
        put(
            "spread_pct",
            if mid_price > 0.0 {
                spread / mid_price * 100.0
            } else {
                0.0
            },
        );
        put("mid_price", mid_price);
        put("bid_size", best_bid_size);
        put("ask_size", best_ask_size);
        put("bid_depth_5", bid_depth);
        put("ask_depth_5", ask_depth);
        put(
            "depth_imbalance",
            (bid_depth - ask_depth) / (bid_depth + ask_depth).max(1.0),
        );
        put("bid_weighted_price", bid_weighted);
        put("ask_weighted_price", ask_weighted);
        map.insert(
            "total_levels".into(),
            json!(depth.bids.len() + depth.asks.len()),
        );
        Some(map)
    }

    pub fn record_error(&self) {
        self.stats.lock().computation_errors += 1;
    }

    pub fn stats(&self) -> BuilderStats {
        self.stats.lock().clone()
    }
}
