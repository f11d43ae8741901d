//! Feature write-out to the hot store.
//!
//! Every window lands under `features:<SYMBOL>:<unix_seconds>` and also
//! overwrites `features:<SYMBOL>:latest`; both carry the same TTL, so
//! stale state expires on its own.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::config::HotStoreConfig;
use crate::health::HealthReport;
use crate::models::now_ms;
use crate::store::HotStore;

#[derive(Debug, Default)]
pub struct WriterStats {
    pub features_written: AtomicU64,
    pub write_errors: AtomicU64,
    pub last_write_ms: AtomicI64,
}

pub struct FeatureWriter {
    hot: Arc<dyn HotStore>,
    key_prefix: String,
    ttl: Duration,
    pub stats: WriterStats,
}

impl FeatureWriter {
    pub fn new(hot: Arc<dyn HotStore>, config: &HotStoreConfig) -> Self {
        Self {
            hot,
            key_prefix: config.key_prefix.clone(),
            ttl: Duration::from_secs(config.ttl_seconds),
            stats: WriterStats::default(),
        }
    }

    /// Startup connectivity check; a dead hot store is fatal.
    pub async fn verify_connection(&self) -> Result<()> {
        self.hot
            .ping()
            .await
            .map_err(|e| anyhow::anyhow!("hot store ping failed: {e}"))
    }

    fn timestamped_key(&self, symbol: &str, timestamp: i64) -> String {
        format!("{}:{symbol}:{timestamp}", self.key_prefix)
    }

    fn latest_key(&self, symbol: &str) -> String {
        format!("{}:{symbol}:latest", self.key_prefix)
    }

    pub async fn write_features(&self, symbol: &str, features: &serde_json::Value) -> Result<()> {
        let timestamp = features
            .get("timestamp")
            .and_then(|v| v.as_i64())
            .unwrap_or_else(|| now_ms() / 1000);
        let body = serde_json::to_string(features).context("serializing features")?;

        let write = async {
            self.hot
                .set_ex(&self.timestamped_key(symbol, timestamp), self.ttl, body.clone())
                .await?;
            self.hot
                .set_ex(&self.latest_key(symbol), self.ttl, body.clone())
                .await
        };

        match write.await {
            Ok(()) => {
                self.stats.features_written.fetch_add(1, Ordering::Relaxed);
                self.stats.last_write_ms.store(now_ms(), Ordering::Relaxed);
                debug!(symbol, timestamp, "features_written");
                Ok(())
            }
            Err(e) => {
                self.stats.write_errors.fetch_add(1, Ordering::Relaxed);
                warn!(symbol, error = %e, "feature_write_failed");
                Err(anyhow::anyhow!("feature write failed: {e}"))
            }
        }
    }

    pub async fn latest_features(&self, symbol: &str) -> Result<Option<serde_json::Value>> {
        let raw = self
            .hot
            .get(&self.latest_key(symbol))
            .await
            .map_err(|e| anyhow::anyhow!("hot store get failed: {e}"))?;
        Ok(raw.and_then(|s| serde_json::from_str(&s).ok()))
    }

    pub async fn features_at(&self, symbol: &str, timestamp: i64) -> Result<Option<serde_json::Value>> {
        let raw = self
            .hot
            .get(&self.timestamped_key(symbol, timestamp))
            .await
            .map_err(|e| anyhow::anyhow!("hot store get failed: {e}"))?;
        Ok(raw.and_then(|s| serde_json::from_str(&s).ok()))
    }

    /// Most recent windows for a symbol, newest first, scanning the
    /// timestamped keys and skipping the latest pointer.
    pub async fn recent_features(&self, symbol: &str, limit: usize) -> Result<Vec<serde_json::Value>> {
        let pattern = format!("{}:{symbol}:*", self.key_prefix);
        let keys = self
            .hot
            .keys(&pattern)
            .await
            .map_err(|e| anyhow::anyhow!("hot store keys failed: {e}"))?;

        let mut timestamped: Vec<(i64, String)> = keys
            .into_iter()
            .filter(|k| !k.ends_with(":latest"))
            .filter_map(|k| {
                let ts: i64 = k.rsplit(':').next()?.parse().ok()?;
                Some((ts, k))
            })
            .collect();
        timestamped.sort_by(|a, b| b.0.cmp(&a.0));

        let mut out = Vec::new();
        for (_, key) in timestamped.into_iter().take(limit) {
            if let Some(raw) = self
                .hot
                .get(&key)
                .await
                .map_err(|e| anyhow::anyhow!("hot store get failed: {e}"))?
            {
                if let Ok(value) = serde_json::from_str(&raw) {
                    out.push(value);
                }
            }
        }
        Ok(out)
    }

    pub fn stats_json(&self) -> serde_json::Value {
        serde_json::json!({
            "features_written": self.stats.features_written.load(Ordering::Relaxed),
            "write_errors": self.stats.write_errors.load(Ordering::Relaxed),
        })
    }

    pub async fn health_check(&self) -> HealthReport {
        if self.hot.ping().await.is_err() {
            return HealthReport::unhealthy(
                vec!["hot store unreachable".to_string()],
                self.stats_json(),
            );
        }

        let written = self.stats.features_written.load(Ordering::Relaxed);
        let errors = self.stats.write_errors.load(Ordering::Relaxed);
        let total = written + errors;
        if total > 0 && errors as f64 / total as f64 > 0.05 {
            return HealthReport::degraded(
                vec![format!(
                    "high write error rate: {:.1}%",
                    errors as f64 / total as f64 * 100.0
                )],
                self.stats_json(),
            );
        }
        HealthReport::healthy(self.stats_json())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryHotStore;

    fn writer(store: Arc<MemoryHotStore>) -> FeatureWriter {
        FeatureWriter::new(
            store,
            &HotStoreConfig {
                key_prefix: "features".into(),
                ttl_seconds: 300,
            },
        )
    }

    #[tokio::test]
    async fn write_lands_timestamped_and_latest_with_same_value() {
        let store = Arc::new(MemoryHotStore::new());
        let w = writer(Arc::clone(&store));

        let features = serde_json::json!({"timestamp": 1_700_000_000, "price": 101.0});
        w.write_features("BTCUSDT", &features).await.unwrap();

        let at = w.features_at("BTCUSDT", 1_700_000_000).await.unwrap().unwrap();
        let latest = w.latest_features("BTCUSDT").await.unwrap().unwrap();
        assert_eq!(at, features);
        assert_eq!(latest, features);
    }

    #[tokio::test(start_paused = true)]
    async fn both_keys_share_the_ttl() {
        let store = Arc::new(MemoryHotStore::new());
        let w = writer(Arc::clone(&store));

        let features = serde_json::json!({"timestamp": 42, "price": 1.0});
        w.write_features("BTCUSDT", &features).await.unwrap();

        tokio::time::advance(Duration::from_secs(301)).await;
        assert!(w.features_at("BTCUSDT", 42).await.unwrap().is_none());
        assert!(w.latest_features("BTCUSDT").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn recent_features_newest_first_excluding_latest() {
        let store = Arc::new(MemoryHotStore::new());
        let w = writer(Arc::clone(&store));

        for ts in [100, 300, 200] {
            let features = serde_json::json!({"timestamp": ts});
            w.write_features("BTCUSDT", &features).await.unwrap();
        }

        let recent = w.recent_features("BTCUSDT", 2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0]["timestamp"], 300);
        assert_eq!(recent[1]["timestamp"], 200);
    }

    #[tokio::test]
    async fn healthy_store_reports_healthy() {
        let store = Arc::new(MemoryHotStore::new());
        let w = writer(store);
        assert!(w.health_check().await.is_healthy());
    }
}
