//! Bronze-layer discovery and reading.
//!
//! Discovery lists objects under the bronze prefix whose last-modified is
//! past the watermark, skipping keys already consumed this process (the
//! warehouse unique index remains the cross-restart authority). Reads
//! gunzip when the key says so and drop malformed JSONL lines with a
//! count.

use std::collections::HashSet;
use std::io::Read;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::health::HealthReport;
use crate::store::ObjectStore;

const DATA_SUFFIXES: [&str; 4] = [".jsonl", ".jsonl.gz", ".json", ".json.gz"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredFile {
    pub key: String,
    pub last_modified: i64,
    pub size: u64,
    pub symbol: Option<String>,
    pub data_type: Option<String>,
}

#[derive(Debug, Default)]
pub struct ReaderStats {
    pub files_read: AtomicU64,
    pub records_read: AtomicU64,
    pub malformed_lines: AtomicU64,
}

pub struct BronzeReader {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    bronze_prefix: String,
    processed: Mutex<HashSet<String>>,
    watermark: Mutex<Option<i64>>,
    pub stats: ReaderStats,
}

impl BronzeReader {
    pub fn new(store: Arc<dyn ObjectStore>, bucket: impl Into<String>, bronze_prefix: impl Into<String>) -> Self {
        Self {
            store,
            bucket: bucket.into(),
            bronze_prefix: bronze_prefix.into(),
            processed: Mutex::new(HashSet::new()),
            watermark: Mutex::new(None),
            stats: ReaderStats::default(),
        }
    }

    fn is_data_file(key: &str) -> bool {
        DATA_SUFFIXES.iter().any(|suffix| key.ends_with(suffix))
    }

    /// `(symbol, data_type)` from `<prefix>/<SYMBOL>/<data_type>/...`.
    fn parse_key(&self, key: &str) -> (Option<String>, Option<String>) {
        let parts: Vec<&str> = key.split('/').collect();
        if parts.first() != Some(&self.bronze_prefix.as_str()) {
            return (None, None);
        }
        (
            parts.get(1).map(|s| s.to_string()),
            parts.get(2).map(|s| s.to_string()),
        )
    }

    /// New data objects past the watermark, ascending by last-modified.
    pub async fn discover_new_files(&self) -> Result<Vec<DiscoveredFile>> {
        let prefix = format!("{}/", self.bronze_prefix);
        let objects = self
            .store
            .list_objects(&self.bucket, &prefix)
            .await
            .map_err(|e| anyhow::anyhow!("bronze listing failed: {e}"))?;

        let watermark = *self.watermark.lock();
        let processed = self.processed.lock();

        let mut files: Vec<DiscoveredFile> = objects
            .into_iter()
            .filter(|o| Self::is_data_file(&o.key))
            .filter(|o| watermark.map_or(true, |w| o.last_modified > w))
            .filter(|o| !processed.contains(&o.key))
            .map(|o| {
                let (symbol, data_type) = self.parse_key(&o.key);
                DiscoveredFile {
                    key: o.key,
                    last_modified: o.last_modified,
                    size: o.size,
                    symbol,
                    data_type,
                }
            })
            .collect();
        files.sort_by_key(|f| f.last_modified);

        if !files.is_empty() {
            info!(count = files.len(), "bronze_files_discovered");
        }
        Ok(files)
    }

    /// Fetch, decompress, and parse one object into JSON records.
    pub async fn read_file(&self, file: &DiscoveredFile) -> Result<Vec<serde_json::Value>> {
        let body = self
            .store
            .get_object(&self.bucket, &file.key)
            .await
            .map_err(|e| anyhow::anyhow!("bronze get failed for {}: {e}", file.key))?;

        let text = if file.key.ends_with(".gz") {
            let mut decoder = GzDecoder::new(body.as_slice());
            let mut out = String::new();
            decoder
                .read_to_string(&mut out)
                .with_context(|| format!("gunzip failed for {}", file.key))?;
            out
        } else {
            String::from_utf8(body).with_context(|| format!("non-UTF8 body in {}", file.key))?
        };

        let mut records = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(value) => records.push(value),
                Err(e) => {
                    self.stats.malformed_lines.fetch_add(1, Ordering::Relaxed);
                    warn!(key = %file.key, error = %e, "malformed_jsonl_line");
                }
            }
        }

        self.processed.lock().insert(file.key.clone());
        self.stats.files_read.fetch_add(1, Ordering::Relaxed);
        self.stats
            .records_read
            .fetch_add(records.len() as u64, Ordering::Relaxed);
        debug!(key = %file.key, records = records.len(), "bronze_file_read");
        Ok(records)
    }

    pub fn advance_watermark(&self, last_modified: i64) {
        let mut watermark = self.watermark.lock();
        if watermark.map_or(true, |w| last_modified > w) {
            *watermark = Some(last_modified);
        }
    }

    pub fn watermark(&self) -> Option<i64> {
        *self.watermark.lock()
    }

    pub fn processed_count(&self) -> usize {
        self.processed.lock().len()
    }

    pub fn stats_json(&self) -> serde_json::Value {
        serde_json::json!({
            "files_read": self.stats.files_read.load(Ordering::Relaxed),
            "records_read": self.stats.records_read.load(Ordering::Relaxed),
            "malformed_lines": self.stats.malformed_lines.load(Ordering::Relaxed),
            "processed_files": self.processed_count(),
            "watermark": self.watermark(),
        })
    }

    pub async fn health_check(&self) -> HealthReport {
        match self.store.head_bucket(&self.bucket).await {
            Ok(()) => HealthReport::healthy(self.stats_json()),
            Err(e) => HealthReport::unhealthy(
                vec![format!("bucket check failed: {e}")],
                self.stats_json(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{FsObjectStore, PutOptions};
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    async fn store_with_object(key: &str, body: Vec<u8>) -> (tempfile::TempDir, Arc<dyn ObjectStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(dir.path()));
        store
            .put_object("market-data", key, body, PutOptions::default())
            .await
            .unwrap();
        (dir, store)
    }

    fn gz(text: &str) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(text.as_bytes()).unwrap();
        encoder.finish().unwrap()
    }

    #[tokio::test]
    async fn discovery_parses_symbol_and_type_from_key() {
        let key = "bronze/BTCUSDT/aggTrades/yyyy=2023/mm=11/dd=14/hh=22/aggTrades_20231114_221320.jsonl.gz";
        let (_dir, store) = store_with_object(key, gz("{\"a\":1}\n")).await;
        let reader = BronzeReader::new(store, "market-data", "bronze");

        let files = reader.discover_new_files().await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].symbol.as_deref(), Some("BTCUSDT"));
        assert_eq!(files[0].data_type.as_deref(), Some("aggTrades"));
    }

    #[tokio::test]
    async fn discovery_skips_non_data_and_processed_files() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(dir.path()));
        for key in ["bronze/BTCUSDT/aggTrades/x.jsonl", "bronze/BTCUSDT/aggTrades/readme.txt"] {
            store
                .put_object("market-data", key, b"{}\n".to_vec(), PutOptions::default())
                .await
                .unwrap();
        }
        let reader = BronzeReader::new(store, "market-data", "bronze");

        let files = reader.discover_new_files().await.unwrap();
        assert_eq!(files.len(), 1);

        reader.read_file(&files[0]).await.unwrap();
        assert!(reader.discover_new_files().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn watermark_filters_older_objects() {
        let key = "bronze/BTCUSDT/aggTrades/x.jsonl";
        let (_dir, store) = store_with_object(key, b"{}\n".to_vec()).await;
        let reader = BronzeReader::new(store, "market-data", "bronze");

        let files = reader.discover_new_files().await.unwrap();
        assert_eq!(files.len(), 1);

        reader.advance_watermark(files[0].last_modified);
        assert!(reader.discover_new_files().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn gzipped_body_is_decompressed_and_parsed() {
        let key = "bronze/BTCUSDT/aggTrades/x.jsonl.gz";
        let body = gz("{\"price\":\"50000.10\"}\n{\"price\":\"50000.20\"}\n");
        let (_dir, store) = store_with_object(key, body).await;
        let reader = BronzeReader::new(store, "market-data", "bronze");

        let files = reader.discover_new_files().await.unwrap();
        let records = reader.read_file(&files[0]).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["price"], "50000.10");
    }

    #[tokio::test]
    async fn malformed_lines_are_dropped_and_counted() {
        let key = "bronze/BTCUSDT/aggTrades/x.jsonl";
        let body = b"{\"good\":1}\nnot json at all\n{\"also\":2}\n".to_vec();
        let (_dir, store) = store_with_object(key, body).await;
        let reader = BronzeReader::new(store, "market-data", "bronze");

        let files = reader.discover_new_files().await.unwrap();
        let records = reader.read_file(&files[0]).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(reader.stats.malformed_lines.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn watermark_never_moves_backwards() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(dir.path()));
        let reader = BronzeReader::new(store, "market-data", "bronze");

        reader.advance_watermark(100);
        reader.advance_watermark(50);
        assert_eq!(reader.watermark(), Some(100));
    }
}
