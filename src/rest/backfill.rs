//! Resumable historical backfill.
//!
//! The cursor walks `[start, end)` in batches of up to 24 hours / 1000
//! records, resuming from an existing checkpoint. The checkpoint is
//! rewritten after every successfully delivered batch, so `last_timestamp`
//! only ever moves forward.

use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};

use super::checkpoint::{Checkpoint, CheckpointStore};
use super::client::{
    normalize_agg_trade, normalize_depth, normalize_kline, RawAggTrade, RawDepth, RawKline,
};
use crate::models::{DepthSnapshot, Kline, Trade};

const BATCH_SPAN_MS: i64 = 24 * 60 * 60 * 1_000;
const BATCH_LIMIT: usize = 1_000;
const POLITENESS_DELAY: Duration = Duration::from_millis(100);

pub const AGG_TRADES: &str = "aggTrades";
pub const KLINES: &str = "klines";

/// The slice of the exchange REST surface the backfiller drives. Split out
/// so tests can substitute a scripted exchange.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    async fn agg_trades(
        &self,
        symbol: &str,
        start_time: Option<i64>,
        end_time: Option<i64>,
        limit: usize,
    ) -> Result<Vec<RawAggTrade>>;

    async fn klines(
        &self,
        symbol: &str,
        interval: &str,
        start_time: Option<i64>,
        end_time: Option<i64>,
        limit: usize,
    ) -> Result<Vec<RawKline>>;

    async fn depth(&self, symbol: &str, limit: usize) -> Result<RawDepth>;
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BackfillReport {
    pub records: u64,
    pub batches: u64,
    pub last_timestamp: i64,
}

pub struct Backfiller<'a> {
    source: &'a dyn MarketDataSource,
    checkpoints: &'a dyn CheckpointStore,
}

impl<'a> Backfiller<'a> {
    pub fn new(source: &'a dyn MarketDataSource, checkpoints: &'a dyn CheckpointStore) -> Self {
        Self {
            source,
            checkpoints,
        }
    }

    /// Pull aggregated trades for `[start_ms, end_ms)`, yielding normalized
    /// batches to `on_batch`. Resumes from the stored checkpoint when one
    /// exists.
    pub async fn backfill_agg_trades<F, Fut>(
        &self,
        symbol: &str,
        start_ms: i64,
        end_ms: i64,
        mut on_batch: F,
    ) -> Result<BackfillReport>
    where
        F: FnMut(Vec<Trade>) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let existing = self.checkpoints.load(symbol, AGG_TRADES).await?;
        let mut cursor = existing
            .as_ref()
            .map(|c| c.last_timestamp)
            .unwrap_or(start_ms);
        let mut total_records = existing.as_ref().map(|c| c.total_records).unwrap_or(0);
        let mut last_trade_id = existing.as_ref().and_then(|c| c.last_trade_id);
        let mut batches = 0u64;

        info!(symbol, cursor, end_ms, resumed = existing.is_some(), "backfill_started");

        while cursor < end_ms {
            let batch_end = (cursor + BATCH_SPAN_MS).min(end_ms);

            let raws = self
                .source
                .agg_trades(symbol, Some(cursor), Some(batch_end), BATCH_LIMIT)
                .await
                .with_context(|| format!("agg trades fetch for {symbol} at {cursor}"))?;

            if raws.is_empty() {
                cursor = batch_end + 1;
                continue;
            }

            let mut trades = Vec::with_capacity(raws.len());
            for raw in &raws {
                let trade = normalize_agg_trade(raw, symbol)?;
                cursor = cursor.max(trade.event_ts + 1);
                trades.push(trade);
            }
            last_trade_id = trades.last().map(|t| t.trade_id);
            total_records += trades.len() as u64;
            batches += 1;

            debug!(symbol, batch = trades.len(), next_cursor = cursor, "backfill_batch");
            on_batch(trades).await?;

            let checkpoint = Checkpoint {
                symbol: symbol.to_string(),
                last_timestamp: cursor,
                last_trade_id,
                total_records,
                last_collection_time: Utc::now().to_rfc3339(),
                collection_stats: serde_json::Map::from_iter([(
                    "batches".to_string(),
                    serde_json::json!(batches),
                )]),
            };
            self.checkpoints.save(AGG_TRADES, &checkpoint).await?;

            tokio::time::sleep(POLITENESS_DELAY).await;
        }

        info!(symbol, total_records, batches, "backfill_completed");
        Ok(BackfillReport {
            records: total_records,
            batches,
            last_timestamp: cursor,
        })
    }

    /// Ranged kline pull; the checkpoint cursor advances on `open_time`.
    pub async fn collect_klines<F, Fut>(
        &self,
        symbol: &str,
        interval: &str,
        start_ms: i64,
        end_ms: i64,
        mut on_batch: F,
    ) -> Result<BackfillReport>
    where
        F: FnMut(Vec<Kline>) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let existing = self.checkpoints.load(symbol, KLINES).await?;
        let mut cursor = existing
            .as_ref()
            .map(|c| c.last_timestamp)
            .unwrap_or(start_ms);
        let mut total_records = existing.as_ref().map(|c| c.total_records).unwrap_or(0);
        let mut batches = 0u64;

        while cursor < end_ms {
            let batch_end = (cursor + BATCH_SPAN_MS).min(end_ms);
            let raws = self
                .source
                .klines(symbol, interval, Some(cursor), Some(batch_end), BATCH_LIMIT)
                .await?;

            if raws.is_empty() {
                cursor = batch_end + 1;
                continue;
            }

            let mut klines = Vec::with_capacity(raws.len());
            for raw in &raws {
                let kline = normalize_kline(raw, symbol, interval)?;
                cursor = cursor.max(kline.open_time + 1);
                klines.push(kline);
            }
            total_records += klines.len() as u64;
            batches += 1;

            on_batch(klines).await?;

            let checkpoint = Checkpoint {
                symbol: symbol.to_string(),
                last_timestamp: cursor,
                last_trade_id: None,
                total_records,
                last_collection_time: Utc::now().to_rfc3339(),
                collection_stats: serde_json::Map::new(),
            };
            self.checkpoints.save(KLINES, &checkpoint).await?;

            tokio::time::sleep(POLITENESS_DELAY).await;
        }

        Ok(BackfillReport {
            records: total_records,
            batches,
            last_timestamp: cursor,
        })
    }

    /// One point-in-time depth snapshot.
    pub async fn collect_depth_snapshot(&self, symbol: &str, limit: usize) -> Result<DepthSnapshot> {
        let raw = self.source.depth(symbol, limit).await?;
        Ok(normalize_depth(raw, symbol))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rest::checkpoint::FsCheckpointStore;
    use parking_lot::Mutex;

    /// Scripted exchange: each call pops the next page.
    struct ScriptedSource {
        pages: Mutex<Vec<Vec<RawAggTrade>>>,
        calls: Mutex<Vec<(i64, i64)>>,
    }

    impl ScriptedSource {
        fn new(pages: Vec<Vec<RawAggTrade>>) -> Self {
            Self {
                pages: Mutex::new(pages),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl MarketDataSource for ScriptedSource {
        async fn agg_trades(
            &self,
            _symbol: &str,
            start_time: Option<i64>,
            end_time: Option<i64>,
            _limit: usize,
        ) -> Result<Vec<RawAggTrade>> {
            self.calls
                .lock()
                .push((start_time.unwrap_or(0), end_time.unwrap_or(0)));
            let mut pages = self.pages.lock();
            if pages.is_empty() {
                Ok(Vec::new())
            } else {
                Ok(pages.remove(0))
            }
        }

        async fn klines(
            &self,
            _symbol: &str,
            _interval: &str,
            _start: Option<i64>,
            _end: Option<i64>,
            _limit: usize,
        ) -> Result<Vec<RawKline>> {
            Ok(Vec::new())
        }

        async fn depth(&self, _symbol: &str, _limit: usize) -> Result<RawDepth> {
            anyhow::bail!("not scripted")
        }
    }

    fn raw_trade(id: i64, event_time: i64) -> RawAggTrade {
        RawAggTrade {
            agg_trade_id: id,
            price: "50000.10".into(),
            qty: "0.5".into(),
            event_time,
            is_buyer_maker: false,
            symbol: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn three_pages_yield_three_records_and_final_checkpoint() {
        let source = ScriptedSource::new(vec![
            vec![raw_trade(1, 1_700_000_010_000)],
            vec![raw_trade(2, 1_700_000_030_000)],
            vec![raw_trade(3, 1_700_000_050_000)],
        ]);
        let dir = tempfile::tempdir().unwrap();
        let checkpoints = FsCheckpointStore::new(dir.path());
        let backfiller = Backfiller::new(&source, &checkpoints);

        let yielded = Mutex::new(Vec::new());
        let report = backfiller
            .backfill_agg_trades("BTCUSDT", 1_700_000_000_000, 1_700_000_060_000, |batch| {
                yielded.lock().extend(batch);
                async { Ok(()) }
            })
            .await
            .unwrap();

        assert_eq!(yielded.lock().len(), 3);
        assert_eq!(report.records, 3);

        let checkpoint = checkpoints
            .load("BTCUSDT", AGG_TRADES)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(checkpoint.last_timestamp, 1_700_000_050_001);
        assert_eq!(checkpoint.total_records, 3);
        assert_eq!(checkpoint.last_trade_id, Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_window_advances_past_batch_end() {
        let source = ScriptedSource::new(vec![]);
        let dir = tempfile::tempdir().unwrap();
        let checkpoints = FsCheckpointStore::new(dir.path());
        let backfiller = Backfiller::new(&source, &checkpoints);

        // Two days: both windows come back empty, exactly two fetches.
        let start = 1_700_000_000_000;
        let end = start + 2 * BATCH_SPAN_MS;
        let report = backfiller
            .backfill_agg_trades("BTCUSDT", start, end, |_| async { Ok(()) })
            .await
            .unwrap();

        assert_eq!(report.records, 0);
        assert_eq!(source.calls.lock().len(), 2);
        // No batch succeeded, so no checkpoint was created.
        assert!(checkpoints
            .load("BTCUSDT", AGG_TRADES)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn resume_starts_at_checkpoint_and_timestamps_are_monotone() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoints = FsCheckpointStore::new(dir.path());

        let mut prior = Checkpoint::new("BTCUSDT", 1_700_000_030_001);
        prior.total_records = 2;
        checkpoints.save(AGG_TRADES, &prior).await.unwrap();

        let source = ScriptedSource::new(vec![vec![raw_trade(3, 1_700_000_050_000)]]);
        let backfiller = Backfiller::new(&source, &checkpoints);

        let report = backfiller
            .backfill_agg_trades("BTCUSDT", 1_700_000_000_000, 1_700_000_060_000, |_| async {
                Ok(())
            })
            .await
            .unwrap();

        // The first fetch starts at the checkpointed cursor, not `start`.
        assert_eq!(source.calls.lock()[0].0, 1_700_000_030_001);
        // Accumulated count includes the resumed-from records.
        assert_eq!(report.records, 3);

        let checkpoint = checkpoints
            .load("BTCUSDT", AGG_TRADES)
            .await
            .unwrap()
            .unwrap();
        assert!(checkpoint.last_timestamp >= prior.last_timestamp);
        assert_eq!(checkpoint.last_timestamp, 1_700_000_050_001);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_batch_delivery_stops_without_checkpoint_advance() {
        let source = ScriptedSource::new(vec![vec![raw_trade(1, 1_700_000_010_000)]]);
        let dir = tempfile::tempdir().unwrap();
        let checkpoints = FsCheckpointStore::new(dir.path());
        let backfiller = Backfiller::new(&source, &checkpoints);

        let result = backfiller
            .backfill_agg_trades("BTCUSDT", 1_700_000_000_000, 1_700_000_060_000, |_| async {
                anyhow::bail!("sink failed")
            })
            .await;

        assert!(result.is_err());
        assert!(checkpoints
            .load("BTCUSDT", AGG_TRADES)
            .await
            .unwrap()
            .is_none());
    }
}
