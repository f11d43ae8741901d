//! Backfill checkpoints.
//!
//! One checkpoint per `(symbol, data_type)`, single writer, read at
//! backfill start and rewritten after each successful batch. The
//! filesystem backend swaps a freshly written file into place; the
//! object-store backend keeps the same layout under a checkpoint prefix.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::store::{ObjectStore, PutOptions, StoreError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub symbol: String,
    pub last_timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_trade_id: Option<i64>,
    pub total_records: u64,
    /// RFC 3339 wall time of the last write.
    pub last_collection_time: String,
    #[serde(default)]
    pub collection_stats: serde_json::Map<String, serde_json::Value>,
}

impl Checkpoint {
    pub fn new(symbol: impl Into<String>, last_timestamp: i64) -> Self {
        Self {
            symbol: symbol.into(),
            last_timestamp,
            last_trade_id: None,
            total_records: 0,
            last_collection_time: Utc::now().to_rfc3339(),
            collection_stats: serde_json::Map::new(),
        }
    }
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, symbol: &str, data_type: &str) -> Result<Option<Checkpoint>>;

    async fn save(&self, data_type: &str, checkpoint: &Checkpoint) -> Result<()>;

    /// All stored checkpoints as `(symbol, data_type, checkpoint)`.
    async fn list(&self) -> Result<Vec<(String, String, Checkpoint)>>;

    async fn delete(&self, symbol: &str, data_type: &str) -> Result<()>;

    /// Operator-triggered sweep: drop checkpoints whose last collection is
    /// older than `days_old` days. Returns the number removed.
    async fn cleanup_older_than(&self, days_old: i64) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::days(days_old);
        let mut removed = 0;
        for (symbol, data_type, checkpoint) in self.list().await? {
            let Ok(written) =
                chrono::DateTime::parse_from_rfc3339(&checkpoint.last_collection_time)
            else {
                continue;
            };
            if written.with_timezone(&Utc) < cutoff {
                info!(symbol, data_type, "removing_stale_checkpoint");
                self.delete(&symbol, &data_type).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

// =============================================================================
// FILESYSTEM BACKEND
// =============================================================================

pub struct FsCheckpointStore {
    dir: PathBuf,
}

impl FsCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, symbol: &str, data_type: &str) -> PathBuf {
        self.dir.join(format!("{symbol}_{data_type}_checkpoint.json"))
    }
}

#[async_trait]
impl CheckpointStore for FsCheckpointStore {
    async fn load(&self, symbol: &str, data_type: &str) -> Result<Option<Checkpoint>> {
        let path = self.path_for(symbol, data_type);
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let checkpoint = serde_json::from_slice(&bytes)
                    .with_context(|| format!("corrupt checkpoint {}", path.display()))?;
                Ok(Some(checkpoint))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(symbol, data_type, "no_existing_checkpoint");
                Ok(None)
            }
            Err(e) => Err(e).with_context(|| format!("reading checkpoint {}", path.display())),
        }
    }

    async fn save(&self, data_type: &str, checkpoint: &Checkpoint) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(&checkpoint.symbol, data_type);

        // Write-new-then-swap: a crash mid-write leaves the old file intact.
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(checkpoint)?;
        tokio::fs::write(&tmp, &body).await?;
        tokio::fs::rename(&tmp, &path).await?;

        debug!(
            symbol = %checkpoint.symbol,
            data_type,
            last_timestamp = checkpoint.last_timestamp,
            total_records = checkpoint.total_records,
            "checkpoint_saved"
        );
        Ok(())
    }

    async fn list(&self) -> Result<Vec<(String, String, Checkpoint)>> {
        let mut out = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(stem) = name.strip_suffix("_checkpoint.json") else {
                continue;
            };
            let Some((symbol, data_type)) = stem.split_once('_') else {
                continue;
            };
            match self.load(symbol, data_type).await {
                Ok(Some(checkpoint)) => {
                    out.push((symbol.to_string(), data_type.to_string(), checkpoint))
                }
                Ok(None) => {}
                Err(e) => warn!(file = %name, error = %e, "unreadable_checkpoint"),
            }
        }
        Ok(out)
    }

    async fn delete(&self, symbol: &str, data_type: &str) -> Result<()> {
        let path = self.path_for(symbol, data_type);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// =============================================================================
// OBJECT-STORE BACKEND
// =============================================================================

pub struct ObjectCheckpointStore {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    prefix: String,
}

impl ObjectCheckpointStore {
    pub fn new(store: Arc<dyn ObjectStore>, bucket: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            bucket: bucket.into(),
            prefix: prefix.into(),
        }
    }

    fn key_for(&self, symbol: &str, data_type: &str) -> String {
        format!("{}/{symbol}/{data_type}/checkpoint.json", self.prefix)
    }
}

#[async_trait]
impl CheckpointStore for ObjectCheckpointStore {
    async fn load(&self, symbol: &str, data_type: &str) -> Result<Option<Checkpoint>> {
        match self
            .store
            .get_object(&self.bucket, &self.key_for(symbol, data_type))
            .await
        {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(anyhow::anyhow!("checkpoint read failed: {e}")),
        }
    }

    async fn save(&self, data_type: &str, checkpoint: &Checkpoint) -> Result<()> {
        let body = serde_json::to_vec_pretty(checkpoint)?;
        let opts = PutOptions {
            content_type: Some("application/json".into()),
            ..Default::default()
        };
        self.store
            .put_object(
                &self.bucket,
                &self.key_for(&checkpoint.symbol, data_type),
                body,
                opts,
            )
            .await
            .map_err(|e| anyhow::anyhow!("checkpoint write failed: {e}"))
    }

    async fn list(&self) -> Result<Vec<(String, String, Checkpoint)>> {
        let objects = self
            .store
            .list_objects(&self.bucket, &format!("{}/", self.prefix))
            .await
            .map_err(|e| anyhow::anyhow!("checkpoint list failed: {e}"))?;

        let mut out = Vec::new();
        for object in objects {
            if !object.key.ends_with("/checkpoint.json") {
                continue;
            }
            let trimmed = object
                .key
                .strip_prefix(&format!("{}/", self.prefix))
                .unwrap_or(&object.key);
            let parts: Vec<&str> = trimmed.split('/').collect();
            if parts.len() != 3 {
                continue;
            }
            if let Some(checkpoint) = self.load(parts[0], parts[1]).await? {
                out.push((parts[0].to_string(), parts[1].to_string(), checkpoint));
            }
        }
        Ok(out)
    }

    async fn delete(&self, symbol: &str, data_type: &str) -> Result<()> {
        match self
            .store
            .delete_object(&self.bucket, &self.key_for(symbol, data_type))
            .await
        {
            Ok(()) | Err(StoreError::NotFound(_)) => Ok(()),
            Err(e) => Err(anyhow::anyhow!("checkpoint delete failed: {e}")),
        }
    }
}
