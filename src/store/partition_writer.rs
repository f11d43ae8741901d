//! Time-partitioned JSONL writer for the bronze layer.
//!
//! Object keys follow the layout consumed by the ETL side:
//! `<prefix>/<SYMBOL>/<data_type>/yyyy=YYYY/mm=MM/dd=DD/hh=HH/<data_type>_<YYYYMMDD>_<HHMMSS>.jsonl[.gz]`
//!
//! Records are deduplicated on their natural identity before writing and
//! zero-record objects are never emitted.

use std::collections::HashMap;
use std::io::Write as _;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{DedupConfig, StorageConfig};
use crate::health::HealthReport;
use crate::models::{now_ms, DepthSnapshot, Kline, Trade};
use crate::store::object::{ObjectStore, PutOptions};
use crate::util::{retry_async, RecordDeduplicator, RetryPolicy};

#[derive(Debug, Clone)]
pub struct PartitionWriterConfig {
    pub bucket: String,
    pub bronze_prefix: String,
    pub compression: bool,
    pub buffer_max_records: usize,
    pub buffer_timeout: Duration,
}

impl From<&StorageConfig> for PartitionWriterConfig {
    fn from(storage: &StorageConfig) -> Self {
        Self {
            bucket: storage.bucket.clone(),
            bronze_prefix: storage.bronze_prefix.clone(),
            compression: storage.compression,
            buffer_max_records: storage.buffer_max_records,
            buffer_timeout: Duration::from_secs(storage.buffer_timeout_seconds),
        }
    }
}

#[derive(Debug, Default)]
pub struct WriterStats {
    pub files_written: AtomicU64,
    pub records_written: AtomicU64,
    pub bytes_written: AtomicU64,
    pub errors: AtomicU64,
    pub last_write_ms: AtomicI64,
}

struct Buffer {
    records: Vec<serde_json::Value>,
    opened_at: Instant,
}

pub struct PartitionWriter {
    store: Arc<dyn ObjectStore>,
    config: PartitionWriterConfig,
    dedup: RecordDeduplicator,
    retry: RetryPolicy,
    buffers: Mutex<HashMap<(String, String), Buffer>>,
    pub stats: WriterStats,
}

impl PartitionWriter {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        config: PartitionWriterConfig,
        dedup: &DedupConfig,
    ) -> Self {
        Self {
            store,
            config,
            dedup: RecordDeduplicator::new(dedup),
            // Transport puts get three attempts with 1-10s backoff.
            retry: RetryPolicy {
                max_attempts: 3,
                initial_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(10),
                multiplier: 2.0,
                jitter: true,
            },
            buffers: Mutex::new(HashMap::new()),
            stats: WriterStats::default(),
        }
    }

    /// Object key for a partition, derived from the record timestamp.
    pub fn build_key(&self, data_type: &str, symbol: &str, ts_ms: i64) -> String {
        let dt = Utc
            .timestamp_millis_opt(ts_ms)
            .single()
            .unwrap_or_else(Utc::now);
        let suffix = if self.config.compression { ".gz" } else { "" };
        format!(
            "{prefix}/{symbol}/{data_type}/yyyy={y}/mm={m}/dd={d}/hh={h}/{data_type}_{stamp}.jsonl{suffix}",
            prefix = self.config.bronze_prefix,
            y = dt.format("%Y"),
            m = dt.format("%m"),
            d = dt.format("%d"),
            h = dt.format("%H"),
            stamp = dt.format("%Y%m%d_%H%M%S"),
        )
    }

    pub async fn write_agg_trades(&self, symbol: &str, trades: &[Trade], ts_ms: i64) -> anyhow::Result<usize> {
        let unique: Vec<serde_json::Value> = trades
            .iter()
            .filter(|t| self.dedup.is_unique(&t.trade_id.to_string(), symbol))
            .filter_map(|t| serde_json::to_value(t).ok())
            .collect();
        if unique.is_empty() {
            debug!(symbol, "no_unique_trades");
            return Ok(0);
        }
        let key = self.build_key("aggTrades", symbol, ts_ms);
        self.put_jsonl(&key, &unique).await?;
        Ok(unique.len())
    }

    pub async fn write_klines(&self, symbol: &str, klines: &[Kline], ts_ms: i64) -> anyhow::Result<usize> {
        let unique: Vec<serde_json::Value> = klines
            .iter()
            .filter(|k| {
                self.dedup
                    .is_unique(&format!("{}_{}", k.interval, k.open_time), symbol)
            })
            .filter_map(|k| serde_json::to_value(k).ok())
            .collect();
        if unique.is_empty() {
            debug!(symbol, "no_unique_klines");
            return Ok(0);
        }
        let key = self.build_key("klines", symbol, ts_ms);
        self.put_jsonl(&key, &unique).await?;
        Ok(unique.len())
    }

    pub async fn write_depth_snapshot(&self, snapshot: &DepthSnapshot) -> anyhow::Result<usize> {
        let natural_id = snapshot
            .last_update_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| snapshot.event_ts.to_string());
        if !self.dedup.is_unique(&natural_id, &snapshot.symbol) {
            debug!(symbol = %snapshot.symbol, "duplicate_depth_snapshot");
            return Ok(0);
        }

        let key = self.build_key("depth_snapshots", &snapshot.symbol, snapshot.event_ts);
        let value = serde_json::to_value(snapshot)?;
        self.put_jsonl(&key, std::slice::from_ref(&value)).await?;
        Ok(1)
    }

    /// Buffer a record for `(symbol, data_type)`, flushing when the buffer
    /// reaches the size bound or has been open past the idle timeout.
    pub async fn write_buffered(
        &self,
        symbol: &str,
        data_type: &str,
        record: serde_json::Value,
    ) -> anyhow::Result<()> {
        let flush: Option<Vec<serde_json::Value>> = {
            let mut buffers = self.buffers.lock();
            let buffer = buffers
                .entry((symbol.to_string(), data_type.to_string()))
                .or_insert_with(|| Buffer {
                    records: Vec::new(),
                    opened_at: Instant::now(),
                });
            buffer.records.push(record);

            let should_flush = buffer.records.len() >= self.config.buffer_max_records
                || buffer.opened_at.elapsed() >= self.config.buffer_timeout;
            if should_flush {
                buffer.opened_at = Instant::now();
                Some(std::mem::take(&mut buffer.records))
            } else {
                None
            }
        };

        if let Some(records) = flush {
            let key = self.build_key(data_type, symbol, now_ms());
            self.put_jsonl(&key, &records).await?;
        }
        Ok(())
    }

    /// Flush every non-empty buffer (shutdown drain).
    pub async fn flush_all_buffers(&self) -> anyhow::Result<()> {
        let drained: Vec<((String, String), Vec<serde_json::Value>)> = {
            let mut buffers = self.buffers.lock();
            buffers
                .iter_mut()
                .filter(|(_, b)| !b.records.is_empty())
                .map(|(k, b)| (k.clone(), std::mem::take(&mut b.records)))
                .collect()
        };

        if !drained.is_empty() {
            info!(buffers = drained.len(), "flushing_partition_buffers");
        }
        for ((symbol, data_type), records) in drained {
            let key = self.build_key(&data_type, &symbol, now_ms());
            self.put_jsonl(&key, &records).await?;
        }
        Ok(())
    }

    async fn put_jsonl(&self, key: &str, records: &[serde_json::Value]) -> anyhow::Result<()> {
        let mut jsonl = String::new();
        for record in records {
            jsonl.push_str(&serde_json::to_string(record)?);
            jsonl.push('\n');
        }

        let (body, content_type, content_encoding) = if self.config.compression {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(jsonl.as_bytes())?;
            (encoder.finish()?, "application/gzip", Some("gzip"))
        } else {
            (jsonl.into_bytes(), "application/json", None)
        };

        let mut opts = PutOptions {
            content_type: Some(content_type.to_string()),
            content_encoding: content_encoding.map(str::to_string),
            ..Default::default()
        };
        opts.metadata
            .insert("record_count".into(), records.len().to_string());
        opts.metadata
            .insert("ingest_timestamp".into(), (now_ms() / 1000).to_string());
        opts.metadata.insert(
            "compression".into(),
            if self.config.compression { "gzip" } else { "none" }.to_string(),
        );

        let body_len = body.len();
        let result = retry_async(&self.retry, || {
            let body = body.clone();
            let opts = opts.clone();
            async move {
                self.store
                    .put_object(&self.config.bucket, key, body, opts)
                    .await
            }
        })
        .await;

        match result {
            Ok(()) => {
                self.stats.files_written.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .records_written
                    .fetch_add(records.len() as u64, Ordering::Relaxed);
                self.stats
                    .bytes_written
                    .fetch_add(body_len as u64, Ordering::Relaxed);
                self.stats.last_write_ms.store(now_ms(), Ordering::Relaxed);
                info!(key, records = records.len(), bytes = body_len, "bronze_object_written");
                Ok(())
            }
            Err(e) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                warn!(key, error = %e, "bronze_write_failed");
                Err(anyhow::anyhow!("object put failed for {key}: {e}"))
            }
        }
    }

    pub fn stats_json(&self) -> serde_json::Value {
        let buffers = self.buffers.lock();
        serde_json::json!({
            "files_written": self.stats.files_written.load(Ordering::Relaxed),
            "records_written": self.stats.records_written.load(Ordering::Relaxed),
            "bytes_written": self.stats.bytes_written.load(Ordering::Relaxed),
            "errors": self.stats.errors.load(Ordering::Relaxed),
            "buffered_records": buffers.values().map(|b| b.records.len()).sum::<usize>(),
            "dedup_duplicates": self.dedup.stats().duplicates_found,
        })
    }

    pub fn health_check(&self) -> HealthReport {
        let mut issues = Vec::new();
        let files = self.stats.files_written.load(Ordering::Relaxed);
        let errors = self.stats.errors.load(Ordering::Relaxed);
        if files > 0 {
            let error_rate = errors as f64 / files as f64;
            if error_rate > 0.05 {
                issues.push(format!("high write error rate: {:.1}%", error_rate * 100.0));
            }
        }
        let buffered: usize = self.buffers.lock().values().map(|b| b.records.len()).sum();
        if buffered > 10_000 {
            issues.push(format!("large buffer backlog: {buffered} records"));
        }

        if issues.is_empty() {
            HealthReport::healthy(self.stats_json())
        } else {
            HealthReport::unhealthy(issues, self.stats_json())
        }
    }
}
