//! Time-windowed record deduplication with LRU trimming.
//!
//! Advisory only: it guards against double-writes on the hot path, while
//! checkpoints and the warehouse unique index remain the final authority.
//! State is not persisted across restarts.

use std::collections::{HashMap, VecDeque};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tracing::debug;

use crate::config::DedupConfig;

#[derive(Debug, Default, Clone)]
pub struct DedupStats {
    pub total_checks: u64,
    pub duplicates_found: u64,
    pub unique_records: u64,
    pub cleanup_runs: u64,
    pub records_cleaned: u64,
}

struct DedupState {
    /// symbol -> record_id -> first-seen wall time (seconds).
    seen: HashMap<String, HashMap<String, f64>>,
    /// symbol -> insertion order for LRU trimming.
    order: HashMap<String, VecDeque<(String, f64)>>,
    last_cleanup: f64,
    stats: DedupStats,
}

pub struct RecordDeduplicator {
    window_seconds: f64,
    max_records_per_symbol: usize,
    cleanup_interval_seconds: f64,
    state: Mutex<DedupState>,
}

fn wall_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

impl RecordDeduplicator {
    pub fn new(config: &DedupConfig) -> Self {
        Self {
            window_seconds: config.window_seconds as f64,
            max_records_per_symbol: config.max_records_per_symbol,
            cleanup_interval_seconds: config.cleanup_interval_seconds as f64,
            state: Mutex::new(DedupState {
                seen: HashMap::new(),
                order: HashMap::new(),
                last_cleanup: 0.0,
                stats: DedupStats::default(),
            }),
        }
    }

    /// True if `(symbol, record_id)` has not been seen within the window.
    pub fn is_unique(&self, record_id: &str, symbol: &str) -> bool {
        self.is_unique_at(record_id, symbol, wall_secs())
    }

    fn is_unique_at(&self, record_id: &str, symbol: &str, now: f64) -> bool {
        let mut guard = self.state.lock();
        guard.stats.total_checks += 1;

        if now - guard.last_cleanup > self.cleanup_interval_seconds {
            self.cleanup(&mut guard, now);
        }

        let state = &mut *guard;
        let seen = state.seen.entry(symbol.to_string()).or_default();
        let queue = state.order.entry(symbol.to_string()).or_default();

        if let Some(&first_seen) = seen.get(record_id) {
            if now - first_seen < self.window_seconds {
                state.stats.duplicates_found += 1;
                return false;
            }
            // Outside the window: refresh the timestamp and requeue.
            seen.insert(record_id.to_string(), now);
            queue.retain(|(id, _)| id != record_id);
            queue.push_back((record_id.to_string(), now));
            state.stats.unique_records += 1;
            return true;
        }

        seen.insert(record_id.to_string(), now);
        queue.push_back((record_id.to_string(), now));

        // Per-symbol cap: evict from the queue front until within bound.
        let excess = seen.len().saturating_sub(self.max_records_per_symbol);
        if excess > 0 {
            let mut removed = 0u64;
            while removed < excess as u64 {
                let Some((old_id, _)) = queue.pop_front() else {
                    break;
                };
                if seen.remove(&old_id).is_some() {
                    removed += 1;
                }
            }
            state.stats.records_cleaned += removed;
            debug!(symbol, removed, "dedup_trimmed");
        }

        state.stats.unique_records += 1;
        true
    }

    fn cleanup(&self, state: &mut DedupState, now: f64) {
        let cutoff = now - self.window_seconds;
        let mut cleaned = 0u64;

        let symbols: Vec<String> = state.seen.keys().cloned().collect();
        for symbol in symbols {
            if let Some(seen) = state.seen.get_mut(&symbol) {
                let before = seen.len();
                seen.retain(|_, &mut first_seen| first_seen >= cutoff);
                cleaned += (before - seen.len()) as u64;
            }
            if let Some(queue) = state.order.get_mut(&symbol) {
                queue.retain(|(_, ts)| *ts >= cutoff);
            }
            if state.seen.get(&symbol).is_some_and(|m| m.is_empty()) {
                state.seen.remove(&symbol);
                state.order.remove(&symbol);
            }
        }

        state.last_cleanup = now;
        state.stats.cleanup_runs += 1;
        state.stats.records_cleaned += cleaned;
        if cleaned > 0 {
            debug!(cleaned, "dedup_sweep");
        }
    }

    /// Drop state outside the window immediately.
    pub fn force_cleanup(&self) {
        let mut state = self.state.lock();
        let now = wall_secs();
        self.cleanup(&mut state, now);
    }

    pub fn tracked_records(&self) -> usize {
        self.state.lock().seen.values().map(|m| m.len()).sum()
    }

    pub fn stats(&self) -> DedupStats {
        self.state.lock().stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dedup(window: u64, max_per_symbol: usize) -> RecordDeduplicator {
        RecordDeduplicator::new(&DedupConfig {
            window_seconds: window,
            max_records_per_symbol: max_per_symbol,
            cleanup_interval_seconds: 1_000_000,
        })
    }

    #[test]
    fn duplicate_within_window_rejected() {
        let d = dedup(3600, 1000);
        assert!(d.is_unique_at("42", "BTCUSDT", 100.0));
        assert!(!d.is_unique_at("42", "BTCUSDT", 101.0));
        assert_eq!(d.stats().duplicates_found, 1);
    }

    #[test]
    fn same_id_different_symbol_is_unique() {
        let d = dedup(3600, 1000);
        assert!(d.is_unique_at("42", "BTCUSDT", 100.0));
        assert!(d.is_unique_at("42", "ETHUSDT", 100.0));
    }

    #[test]
    fn record_outside_window_is_unique_again() {
        let d = dedup(60, 1000);
        assert!(d.is_unique_at("42", "BTCUSDT", 100.0));
        assert!(d.is_unique_at("42", "BTCUSDT", 161.0));
        // ... and the refreshed entry guards the new window.
        assert!(!d.is_unique_at("42", "BTCUSDT", 162.0));
    }

    #[test]
    fn cap_evicts_oldest_keeps_newest() {
        let d = dedup(3600, 3);
        for (i, id) in ["a", "b", "c", "d"].iter().enumerate() {
            assert!(d.is_unique_at(id, "BTCUSDT", 100.0 + i as f64));
        }

        assert_eq!(d.tracked_records(), 3);
        // Oldest ("a") was evicted, so it reads as unique again.
        assert!(d.is_unique_at("a", "BTCUSDT", 200.0));
        // Newest ("d") is still tracked.
        assert!(!d.is_unique_at("d", "BTCUSDT", 200.0));
    }

    #[test]
    fn periodic_sweep_drops_expired_entries() {
        let d = RecordDeduplicator::new(&DedupConfig {
            window_seconds: 60,
            max_records_per_symbol: 1000,
            cleanup_interval_seconds: 10,
        });
        assert!(d.is_unique_at("1", "BTCUSDT", 100.0));
        assert!(d.is_unique_at("2", "BTCUSDT", 100.5));

        // A check after the cleanup interval sweeps state older than the
        // window across all symbols.
        assert!(d.is_unique_at("3", "BTCUSDT", 200.0));
        assert_eq!(d.tracked_records(), 1);
        assert!(d.stats().cleanup_runs >= 1);
        assert_eq!(d.stats().records_cleaned, 2);
    }
}
