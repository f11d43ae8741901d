//! Batching bus producer.
//!
//! One producer per process multiplexes across the per-message-type
//! streams. Records queue per stream and flush on size or time; partial
//! failures re-queue at the head of the stream's queue so order within a
//! partition key is preserved. Each stream gets its own circuit breaker.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{BusClient, BusRecord};
use crate::config::BusConfig;
use crate::health::HealthReport;
use crate::models::MarketMessage;
use crate::util::{CircuitBreaker, CircuitState};

// When a re-queue would grow a stream's queue past this bound, records are
// dropped and counted instead.
const HIGH_WATER_MARK: usize = 1_000;

const BREAKER_THRESHOLD: u32 = 5;
const BREAKER_RECOVERY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct BusProducerConfig {
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub op_timeout: Duration,
}

impl From<&BusConfig> for BusProducerConfig {
    fn from(bus: &BusConfig) -> Self {
        Self {
            batch_size: bus.batch_size,
            flush_interval: Duration::from_millis(bus.flush_interval_ms),
            op_timeout: Duration::from_secs(bus.op_timeout_seconds),
        }
    }
}

#[derive(Debug, Default)]
pub struct ProducerStats {
    pub total_records: AtomicU64,
    pub total_bytes: AtomicU64,
    pub failed_records: AtomicU64,
    pub batches_sent: AtomicU64,
    pub errors: AtomicU64,
    pub dropped_records: AtomicU64,
}

struct InFlightGuard<'a> {
    producer: &'a BusProducer,
    stream: &'a str,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.producer.release_in_flight(self.stream);
    }
}

pub struct BusProducer {
    client: Arc<dyn BusClient>,
    config: BusProducerConfig,
    queues: Mutex<HashMap<String, VecDeque<BusRecord>>>,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    // Streams with a flush in progress; flushes within a stream are serial.
    in_flight: Mutex<HashSet<String>>,
    running: AtomicBool,
    flush_task: Mutex<Option<JoinHandle<()>>>,
    pub stats: ProducerStats,
}

impl BusProducer {
    pub fn new(client: Arc<dyn BusClient>, config: BusProducerConfig) -> Arc<Self> {
        Arc::new(Self {
            client,
            config,
            queues: Mutex::new(HashMap::new()),
            breakers: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
            running: AtomicBool::new(false),
            flush_task: Mutex::new(None),
            stats: ProducerStats::default(),
        })
    }

    /// Start the background flush loop that enforces the time bound.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("producer already running");
            return;
        }

        let producer = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(producer.config.flush_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !producer.running.load(Ordering::SeqCst) {
                    break;
                }
                producer.flush_all().await;
            }
        });
        *self.flush_task.lock() = Some(handle);
        info!(
            batch_size = self.config.batch_size,
            flush_interval_ms = self.config.flush_interval.as_millis() as u64,
            "bus_producer_started"
        );
    }

    /// Stop the flush loop, then drain every non-empty queue once.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.flush_task.lock().take() {
            handle.abort();
        }
        self.flush_all().await;
        info!(
            total = self.stats.total_records.load(Ordering::Relaxed),
            failed = self.stats.failed_records.load(Ordering::Relaxed),
            dropped = self.stats.dropped_records.load(Ordering::Relaxed),
            "bus_producer_stopped"
        );
    }

    /// Partition key: the symbol when the payload has one, else the first
    /// 16 hex chars of the payload hash.
    pub fn partition_key(symbol: Option<&str>, data: &[u8]) -> String {
        match symbol {
            Some(s) if !s.is_empty() => s.to_string(),
            _ => hex::encode(Sha256::digest(data))[..16].to_string(),
        }
    }

    /// Queue a normalized market message for its stream.
    pub async fn publish(&self, stream: &str, message: &MarketMessage) -> anyhow::Result<()> {
        let data = serde_json::to_vec(message)?;
        let key = Self::partition_key(Some(message.symbol()), &data);
        self.publish_raw(stream, key, data).await;
        Ok(())
    }

    /// Queue an opaque payload.
    pub async fn publish_raw(&self, stream: &str, partition_key: String, data: Vec<u8>) {
        let should_flush = {
            let mut queues = self.queues.lock();
            let queue = queues.entry(stream.to_string()).or_default();
            queue.push_back(BusRecord {
                partition_key,
                data,
            });
            queue.len() >= self.config.batch_size
        };

        if should_flush {
            self.flush_stream(stream).await;
        }
    }

    /// Flush every stream with queued records. Streams flush in parallel;
    /// a stream with a flush already in flight is skipped.
    pub async fn flush_all(&self) {
        let streams: Vec<String> = {
            let queues = self.queues.lock();
            queues
                .iter()
                .filter(|(_, q)| !q.is_empty())
                .map(|(name, _)| name.clone())
                .collect()
        };

        let flushes: Vec<_> = streams
            .into_iter()
            .map(|stream| self.flush_stream(stream))
            .collect();
        futures_util::future::join_all(flushes).await;
    }

    fn breaker_for(&self, stream: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock();
        Arc::clone(breakers.entry(stream.to_string()).or_insert_with(|| {
            Arc::new(CircuitBreaker::new(
                stream.to_string(),
                BREAKER_THRESHOLD,
                BREAKER_RECOVERY,
            ))
        }))
    }

    async fn flush_stream(&self, stream: impl AsRef<str>) {
        let stream = stream.as_ref();

        if !self.in_flight.lock().insert(stream.to_string()) {
            return;
        }
        // Guard so a cancelled flush (aborted loop) still releases the
        // single-flight slot.
        let _guard = InFlightGuard {
            producer: self,
            stream,
        };
        self.flush_stream_inner(stream).await;
    }

    async fn flush_stream_inner(&self, stream: &str) {
        let batch: Vec<BusRecord> = {
            let mut queues = self.queues.lock();
            let Some(queue) = queues.get_mut(stream) else {
                return;
            };
            let take = queue.len().min(self.config.batch_size);
            queue.drain(..take).collect()
        };
        if batch.is_empty() {
            return;
        }

        let breaker = self.breaker_for(stream);
        if breaker.try_acquire().is_err() {
            // Fail fast: leave the records queued for a later cycle.
            debug!(stream, records = batch.len(), "flush_short_circuited");
            self.requeue_at_head(stream, batch);
            return;
        }

        let batch_bytes: u64 = batch.iter().map(|r| r.data.len() as u64).sum();
        let call = self.client.put_records(stream, batch.clone());
        let result = tokio::time::timeout(self.config.op_timeout, call).await;

        match result {
            Ok(Ok(output)) => {
                let mut failed = Vec::new();
                for (record, outcome) in batch.into_iter().zip(output.records.iter()) {
                    if outcome.is_failed() {
                        warn!(
                            stream,
                            error_code = outcome.error_code.as_deref().unwrap_or("?"),
                            error_message = outcome.error_message.as_deref().unwrap_or(""),
                            "record_failed"
                        );
                        failed.push(record);
                    }
                }

                let succeeded = output.records.len() - failed.len();
                self.stats
                    .total_records
                    .fetch_add(succeeded as u64, Ordering::Relaxed);
                self.stats
                    .total_bytes
                    .fetch_add(batch_bytes, Ordering::Relaxed);
                self.stats.batches_sent.fetch_add(1, Ordering::Relaxed);

                if failed.is_empty() {
                    breaker.record_success();
                } else {
                    self.stats
                        .failed_records
                        .fetch_add(failed.len() as u64, Ordering::Relaxed);
                    breaker.record_failure();
                    self.requeue_at_head(stream, failed);
                }
            }
            Ok(Err(e)) => {
                warn!(stream, error = %e, "flush_failed");
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                breaker.record_failure();
                self.requeue_at_head(stream, batch);
            }
            Err(_) => {
                warn!(stream, timeout_ms = self.config.op_timeout.as_millis() as u64, "flush_timeout");
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                breaker.record_failure();
                self.requeue_at_head(stream, batch);
            }
        }
    }

    fn release_in_flight(&self, stream: &str) {
        self.in_flight.lock().remove(stream);
    }

    fn requeue_at_head(&self, stream: &str, records: Vec<BusRecord>) {
        let mut queues = self.queues.lock();
        let queue = queues.entry(stream.to_string()).or_default();

        if queue.len() >= HIGH_WATER_MARK {
            self.stats
                .dropped_records
                .fetch_add(records.len() as u64, Ordering::Relaxed);
            warn!(
                stream,
                dropped = records.len(),
                queued = queue.len(),
                "queue_overflow_dropping"
            );
            return;
        }
        for record in records.into_iter().rev() {
            queue.push_front(record);
        }
    }

    pub fn queue_len(&self, stream: &str) -> usize {
        self.queues.lock().get(stream).map_or(0, |q| q.len())
    }

    pub fn breaker_state(&self, stream: &str) -> Option<CircuitState> {
        self.breakers.lock().get(stream).map(|b| b.state())
    }

    pub fn stats_json(&self) -> serde_json::Value {
        let queues = self.queues.lock();
        let queue_sizes: serde_json::Map<String, serde_json::Value> = queues
            .iter()
            .map(|(name, q)| (name.clone(), serde_json::json!(q.len())))
            .collect();
        let breakers = self.breakers.lock();
        let breaker_states: serde_json::Map<String, serde_json::Value> = breakers
            .iter()
            .map(|(name, b)| (name.clone(), serde_json::json!(b.state().to_string())))
            .collect();

        serde_json::json!({
            "total_records": self.stats.total_records.load(Ordering::Relaxed),
            "total_bytes": self.stats.total_bytes.load(Ordering::Relaxed),
            "failed_records": self.stats.failed_records.load(Ordering::Relaxed),
            "batches_sent": self.stats.batches_sent.load(Ordering::Relaxed),
            "errors": self.stats.errors.load(Ordering::Relaxed),
            "dropped_records": self.stats.dropped_records.load(Ordering::Relaxed),
            "queue_sizes": queue_sizes,
            "circuit_breakers": breaker_states,
        })
    }

    pub fn health_check(&self) -> HealthReport {
        let mut issues = Vec::new();

        if !self.running.load(Ordering::SeqCst) {
            issues.push("producer not running".to_string());
        }
        {
            let breakers = self.breakers.lock();
            for (stream, breaker) in breakers.iter() {
                if breaker.state() == CircuitState::Open {
                    issues.push(format!("circuit breaker open for {stream}"));
                }
            }
        }
        {
            let queues = self.queues.lock();
            for (stream, queue) in queues.iter() {
                if queue.len() >= HIGH_WATER_MARK {
                    issues.push(format!("large queue for {stream}: {}", queue.len()));
                }
            }
        }
        let total = self.stats.total_records.load(Ordering::Relaxed);
        let failed = self.stats.failed_records.load(Ordering::Relaxed);
        if total > 0 && failed as f64 / total as f64 > 0.05 {
            issues.push(format!(
                "high failure rate: {:.1}%",
                failed as f64 / total as f64 * 100.0
            ));
        }

        if issues.is_empty() {
            HealthReport::healthy(self.stats_json())
        } else {
            HealthReport::unhealthy(issues, self.stats_json())
        }
    }
}
