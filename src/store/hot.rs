//! Hot key-value store seam for aggregated features.
//!
//! The trait covers the operations the aggregator depends on (`SETEX`,
//! `GET`, `KEYS`, `DEL`, `PING`, `INFO`). `MemoryHotStore` is the bundled
//! implementation with real TTL expiry; a redis adapter implements the
//! same trait.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::object::StoreError;

#[async_trait]
pub trait HotStore: Send + Sync {
    /// `SETEX key ttl value`.
    async fn set_ex(&self, key: &str, ttl: Duration, value: String) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// `KEYS pattern` with `*` wildcards.
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError>;

    async fn del(&self, keys: &[String]) -> Result<u64, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;

    async fn info(&self) -> Result<serde_json::Value, StoreError>;
}

// =============================================================================
// IN-MEMORY IMPLEMENTATION
// =============================================================================

#[derive(Default)]
pub struct MemoryHotStore {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryHotStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn sweep(entries: &mut HashMap<String, (String, Instant)>) {
        let now = Instant::now();
        entries.retain(|_, (_, expires)| *expires > now);
    }

    pub fn len(&self) -> usize {
        let mut entries = self.entries.lock();
        Self::sweep(&mut entries);
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Glob match supporting `*` only, as used by feature-key scans.
fn glob_match(pattern: &str, value: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == value;
    }

    let mut rest = value;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            match rest.strip_prefix(part) {
                Some(r) => rest = r,
                None => return false,
            }
        } else if i == parts.len() - 1 {
            return rest.ends_with(part);
        } else {
            match rest.find(part) {
                Some(pos) => rest = &rest[pos + part.len()..],
                None => return false,
            }
        }
    }
    // Pattern ends with '*'.
    true
}

#[async_trait]
impl HotStore for MemoryHotStore {
    async fn set_ex(&self, key: &str, ttl: Duration, value: String) -> Result<(), StoreError> {
        let mut entries = self.entries.lock();
        entries.insert(key.to_string(), (value, Instant::now() + ttl));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some((value, expires)) if *expires > Instant::now() => Ok(Some(value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let mut entries = self.entries.lock();
        Self::sweep(&mut entries);
        let mut keys: Vec<String> = entries
            .keys()
            .filter(|k| glob_match(pattern, k))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn del(&self, keys: &[String]) -> Result<u64, StoreError> {
        let mut entries = self.entries.lock();
        let mut removed = 0;
        for key in keys {
            if entries.remove(key).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn info(&self) -> Result<serde_json::Value, StoreError> {
        let mut entries = self.entries.lock();
        Self::sweep(&mut entries);
        Ok(serde_json::json!({
            "backend": "memory",
            "keys": entries.len(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn setex_expires_on_its_own() {
        let store = MemoryHotStore::new();
        store
            .set_ex("features:BTCUSDT:1", Duration::from_secs(300), "{}".into())
            .await
            .unwrap();
        assert!(store.get("features:BTCUSDT:1").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(301)).await;
        assert!(store.get("features:BTCUSDT:1").await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn keys_glob_matching() {
        let store = MemoryHotStore::new();
        for key in [
            "features:BTCUSDT:100",
            "features:BTCUSDT:latest",
            "features:ETHUSDT:100",
        ] {
            store
                .set_ex(key, Duration::from_secs(60), "{}".into())
                .await
                .unwrap();
        }

        let keys = store.keys("features:BTCUSDT:*").await.unwrap();
        assert_eq!(
            keys,
            vec!["features:BTCUSDT:100", "features:BTCUSDT:latest"]
        );
        assert_eq!(store.keys("features:*").await.unwrap().len(), 3);
        assert!(store.keys("other:*").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn del_returns_removed_count() {
        let store = MemoryHotStore::new();
        store
            .set_ex("a", Duration::from_secs(60), "1".into())
            .await
            .unwrap();
        let removed = store.del(&["a".into(), "b".into()]).await.unwrap();
        assert_eq!(removed, 1);
    }

    #[test]
    fn glob_edge_cases() {
        assert!(glob_match("features:*", "features:BTCUSDT:1"));
        assert!(glob_match("*latest", "features:BTCUSDT:latest"));
        assert!(glob_match("exact", "exact"));
        assert!(!glob_match("exact", "exact2"));
        assert!(glob_match("a*b*c", "aXXbYYc"));
        assert!(!glob_match("a*b*c", "aXXcYYb"));
    }
}
