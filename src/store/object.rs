//! Object-store seam for the bronze layer.
//!
//! The trait mirrors the bucket/object API the pipeline depends on
//! (put/get/list/head). `FsObjectStore` is the bundled directory-backed
//! implementation; a cloud adapter implements the same trait.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("bucket not found: {0}")]
    NoSuchBucket(String),
    #[error("transport error: {0}")]
    Transport(String),
}

/// Listing entry: key, last-modified (unix millis), size in bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub key: String,
    pub last_modified: i64,
    pub size: u64,
}

#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        opts: PutOptions,
    ) -> Result<(), StoreError>;

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StoreError>;

    /// List all objects under `prefix`, paginating internally.
    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectMeta>, StoreError>;

    async fn head_bucket(&self, bucket: &str) -> Result<(), StoreError>;

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), StoreError>;
}

// =============================================================================
// FILESYSTEM IMPLEMENTATION
// =============================================================================

const META_SUFFIX: &str = ".objmeta.json";

/// Directory-backed object store: `<root>/<bucket>/<key>` with object
/// metadata in a sidecar file excluded from listings.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, bucket: &str, key: &str) -> PathBuf {
        let mut path = self.root.join(bucket);
        for part in key.split('/') {
            path.push(part);
        }
        path
    }

    fn relative_key(bucket_root: &Path, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(bucket_root).ok()?;
        let parts: Vec<String> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Some(parts.join("/"))
    }

    fn walk(dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                Self::walk(&path, out)?;
            } else {
                out.push(path);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        opts: PutOptions,
    ) -> Result<(), StoreError> {
        let path = self.object_path(bucket, key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::Transport(e.to_string()))?;
        }

        // Write-new-then-rename so readers never observe partial bodies.
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &body)
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;

        if opts.content_type.is_some() || opts.content_encoding.is_some() || !opts.metadata.is_empty()
        {
            let meta = serde_json::json!({
                "content_type": opts.content_type,
                "content_encoding": opts.content_encoding,
                "metadata": opts.metadata,
            });
            let meta_path = PathBuf::from(format!("{}{}", path.display(), META_SUFFIX));
            tokio::fs::write(&meta_path, serde_json::to_vec(&meta).unwrap_or_default())
                .await
                .map_err(|e| StoreError::Transport(e.to_string()))?;
        }

        debug!(bucket, key, bytes = body.len(), "object_put");
        Ok(())
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.object_path(bucket, key);
        match tokio::fs::read(&path).await {
            Ok(body) => Ok(body),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(key.to_string()))
            }
            Err(e) => Err(StoreError::Transport(e.to_string())),
        }
    }

    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectMeta>, StoreError> {
        let bucket_root = self.root.join(bucket);
        if !bucket_root.exists() {
            return Ok(Vec::new());
        }

        let bucket_root_clone = bucket_root.clone();
        let files = tokio::task::spawn_blocking(move || {
            let mut files = Vec::new();
            FsObjectStore::walk(&bucket_root_clone, &mut files).map(|_| files)
        })
        .await
        .map_err(|e| StoreError::Transport(e.to_string()))?
        .map_err(|e| StoreError::Transport(e.to_string()))?;

        let mut out = Vec::new();
        for path in files {
            let Some(key) = Self::relative_key(&bucket_root, &path) else {
                continue;
            };
            if key.ends_with(META_SUFFIX) || key.ends_with(".tmp") {
                continue;
            }
            if !key.starts_with(prefix) {
                continue;
            }
            let meta = tokio::fs::metadata(&path)
                .await
                .map_err(|e| StoreError::Transport(e.to_string()))?;
            let last_modified = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as i64)
                .unwrap_or(0);
            out.push(ObjectMeta {
                key,
                last_modified,
                size: meta.len(),
            });
        }
        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }

    async fn head_bucket(&self, bucket: &str) -> Result<(), StoreError> {
        let path = self.root.join(bucket);
        if path.is_dir() {
            Ok(())
        } else {
            Err(StoreError::NoSuchBucket(bucket.to_string()))
        }
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), StoreError> {
        let path = self.object_path(bucket, key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(key.to_string()))
            }
            Err(e) => Err(StoreError::Transport(e.to_string())),
        }
    }
}
