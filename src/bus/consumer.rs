//! Multi-shard bus consumer.
//!
//! Opens one iterator per shard starting at LATEST, remembers the last
//! sequence number seen per shard, and re-issues expired iterators from
//! AFTER_SEQUENCE_NUMBER so no record is skipped across an expiry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{BusClient, BusError, IteratorType};
use crate::config::BusConfig;
use crate::health::HealthReport;
use crate::models::now_ms;

const THROTTLE_BACKOFF: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct BusConsumerConfig {
    pub streams: Vec<String>,
    pub polling_interval: Duration,
    pub max_records_per_request: usize,
}

impl From<&BusConfig> for BusConsumerConfig {
    fn from(bus: &BusConfig) -> Self {
        Self {
            streams: bus.streams(),
            polling_interval: Duration::from_millis(bus.polling_interval_ms),
            max_records_per_request: bus.max_records_per_request,
        }
    }
}

/// A decoded record handed to the aggregation layer.
#[derive(Debug, Clone)]
pub struct ConsumedMessage {
    pub stream_name: String,
    pub partition_key: String,
    pub sequence_number: String,
    pub data: serde_json::Value,
    pub arrival_ts: i64,
    pub received_at_ms: i64,
}

struct ShardCursor {
    stream: String,
    shard_id: String,
    iterator: Option<String>,
    last_sequence: Option<String>,
}

#[derive(Debug, Default)]
pub struct ConsumerStats {
    pub records_consumed: AtomicU64,
    pub decode_errors: AtomicU64,
    pub connection_errors: AtomicU64,
    pub iterator_refreshes: AtomicU64,
    pub last_record_ms: AtomicI64,
}

pub struct BusConsumer {
    client: Arc<dyn BusClient>,
    config: BusConsumerConfig,
    cursors: Mutex<Vec<ShardCursor>>,
    pub stats: ConsumerStats,
}

impl BusConsumer {
    pub fn new(client: Arc<dyn BusClient>, config: BusConsumerConfig) -> Self {
        Self {
            client,
            config,
            cursors: Mutex::new(Vec::new()),
            stats: ConsumerStats::default(),
        }
    }

    /// Discover shards for every configured stream and open LATEST
    /// iterators.
    pub async fn start(&self) -> Result<(), BusError> {
        let mut cursors = Vec::new();

        for stream in &self.config.streams {
            let shards = self.client.describe_stream(stream).await?;
            info!(stream, shards = shards.len(), "stream_shards_discovered");
            for shard in shards {
                let iterator = self
                    .client
                    .get_shard_iterator(stream, &shard.shard_id, IteratorType::Latest)
                    .await?;
                cursors.push(ShardCursor {
                    stream: stream.clone(),
                    shard_id: shard.shard_id,
                    iterator: Some(iterator),
                    last_sequence: None,
                });
            }
        }

        let mut state = self.cursors.lock();
        *state = cursors;
        info!(shard_cursors = state.len(), "bus_consumer_started");
        Ok(())
    }

    pub fn polling_interval(&self) -> Duration {
        self.config.polling_interval
    }

    pub fn active_cursors(&self) -> usize {
        self.cursors
            .lock()
            .iter()
            .filter(|c| c.iterator.is_some())
            .count()
    }

    /// One pass over every shard cursor. Returns the decoded records, in
    /// per-shard order.
    pub async fn poll_once(&self) -> Vec<ConsumedMessage> {
        let cursor_count = self.cursors.lock().len();
        let mut out = Vec::new();

        for idx in 0..cursor_count {
            let (stream, iterator) = {
                let cursors = self.cursors.lock();
                let Some(cursor) = cursors.get(idx) else {
                    break;
                };
                match &cursor.iterator {
                    Some(it) => (cursor.stream.clone(), it.clone()),
                    None => continue,
                }
            };

            match self
                .client
                .get_records(&iterator, self.config.max_records_per_request)
                .await
            {
                Ok(output) => {
                    let received_at_ms = now_ms();
                    let mut last_sequence = None;

                    for record in output.records {
                        match serde_json::from_slice::<serde_json::Value>(&record.data) {
                            Ok(data) => {
                                self.stats.records_consumed.fetch_add(1, Ordering::Relaxed);
                                self.stats
                                    .last_record_ms
                                    .store(received_at_ms, Ordering::Relaxed);
                                last_sequence = Some(record.sequence_number.clone());
                                out.push(ConsumedMessage {
                                    stream_name: stream.clone(),
                                    partition_key: record.partition_key,
                                    sequence_number: record.sequence_number,
                                    data,
                                    arrival_ts: record.arrival_ts,
                                    received_at_ms,
                                });
                            }
                            Err(e) => {
                                self.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
                                warn!(stream, error = %e, "invalid_json_record");
                            }
                        }
                    }

                    let mut cursors = self.cursors.lock();
                    if let Some(cursor) = cursors.get_mut(idx) {
                        cursor.iterator = output.next_iterator;
                        if last_sequence.is_some() {
                            cursor.last_sequence = last_sequence;
                        }
                    }
                }
                Err(BusError::ExpiredIterator) => {
                    debug!(stream, "iterator_expired");
                    self.refresh_cursor(idx).await;
                }
                Err(BusError::ProvisionedThroughputExceeded) => {
                    warn!(stream, "throughput_exceeded_backing_off");
                    tokio::time::sleep(THROTTLE_BACKOFF).await;
                }
                Err(e) => {
                    warn!(stream, error = %e, "get_records_failed");
                    self.stats.connection_errors.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        out
    }

    /// Re-issue an iterator after expiry, resuming after the last sequence
    /// number when one is known.
    async fn refresh_cursor(&self, idx: usize) {
        let (stream, shard_id, last_sequence) = {
            let cursors = self.cursors.lock();
            let Some(cursor) = cursors.get(idx) else {
                return;
            };
            (
                cursor.stream.clone(),
                cursor.shard_id.clone(),
                cursor.last_sequence.clone(),
            )
        };

        let iterator_type = match last_sequence {
            Some(seq) => IteratorType::AfterSequenceNumber(seq),
            None => IteratorType::Latest,
        };

        match self
            .client
            .get_shard_iterator(&stream, &shard_id, iterator_type)
            .await
        {
            Ok(iterator) => {
                self.stats.iterator_refreshes.fetch_add(1, Ordering::Relaxed);
                let mut cursors = self.cursors.lock();
                if let Some(cursor) = cursors.get_mut(idx) {
                    cursor.iterator = Some(iterator);
                }
                info!(stream, shard_id, "iterator_refreshed");
            }
            Err(e) => {
                warn!(stream, shard_id, error = %e, "iterator_refresh_failed");
                self.stats.connection_errors.fetch_add(1, Ordering::Relaxed);
                let mut cursors = self.cursors.lock();
                if let Some(cursor) = cursors.get_mut(idx) {
                    cursor.iterator = None;
                }
            }
        }
    }

    pub fn stats_json(&self) -> serde_json::Value {
        serde_json::json!({
            "records_consumed": self.stats.records_consumed.load(Ordering::Relaxed),
            "decode_errors": self.stats.decode_errors.load(Ordering::Relaxed),
            "connection_errors": self.stats.connection_errors.load(Ordering::Relaxed),
            "iterator_refreshes": self.stats.iterator_refreshes.load(Ordering::Relaxed),
            "active_cursors": self.active_cursors(),
            "streams_configured": self.config.streams.len(),
        })
    }

    pub fn health_check(&self) -> HealthReport {
        let mut issues = Vec::new();
        let active = self.active_cursors();
        if active == 0 {
            issues.push("no active shard iterators".to_string());
            return HealthReport::unhealthy(issues, self.stats_json());
        }

        let last = self.stats.last_record_ms.load(Ordering::Relaxed);
        if last > 0 && now_ms() - last > 300_000 {
            issues.push(format!("no records for {}s", (now_ms() - last) / 1000));
        }
        let consumed = self.stats.records_consumed.load(Ordering::Relaxed);
        let errors = self.stats.connection_errors.load(Ordering::Relaxed);
        if consumed > 0 && errors as f64 / consumed as f64 > 0.1 {
            issues.push("high connection error rate".to_string());
        }

        if issues.is_empty() {
            HealthReport::healthy(self.stats_json())
        } else {
            HealthReport::degraded(issues, self.stats_json())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusRecord, MemoryBus};

    fn json_record(key: &str, body: serde_json::Value) -> BusRecord {
        BusRecord {
            partition_key: key.to_string(),
            data: serde_json::to_vec(&body).unwrap(),
        }
    }

    async fn consumer_over(bus: Arc<MemoryBus>, streams: &[&str]) -> BusConsumer {
        let consumer = BusConsumer::new(
            bus,
            BusConsumerConfig {
                streams: streams.iter().map(|s| s.to_string()).collect(),
                polling_interval: Duration::from_millis(10),
                max_records_per_request: 100,
            },
        );
        consumer.start().await.unwrap();
        consumer
    }

    #[tokio::test]
    async fn consumes_records_published_after_start() {
        let bus = Arc::new(MemoryBus::with_streams(&["s".to_string()], 2));
        let consumer = consumer_over(Arc::clone(&bus), &["s"]).await;

        bus.put_records(
            "s",
            vec![json_record("BTCUSDT", serde_json::json!({"n": 1}))],
        )
        .await
        .unwrap();

        let messages = consumer.poll_once().await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].data["n"], 1);
        assert_eq!(messages[0].partition_key, "BTCUSDT");
        assert!(messages[0].arrival_ts > 0);
    }

    #[tokio::test]
    async fn invalid_json_is_counted_and_skipped() {
        let bus = Arc::new(MemoryBus::with_streams(&["s".to_string()], 1));
        let consumer = consumer_over(Arc::clone(&bus), &["s"]).await;

        bus.put_records(
            "s",
            vec![BusRecord {
                partition_key: "k".into(),
                data: b"not json".to_vec(),
            }],
        )
        .await
        .unwrap();

        let messages = consumer.poll_once().await;
        assert!(messages.is_empty());
        assert_eq!(consumer.stats.decode_errors.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn expired_iterator_resumes_without_skipping() {
        let bus = Arc::new(MemoryBus::with_streams(&["s".to_string()], 1));
        let consumer = consumer_over(Arc::clone(&bus), &["s"]).await;

        bus.put_records("s", vec![json_record("k", serde_json::json!({"n": 1}))])
            .await
            .unwrap();
        assert_eq!(consumer.poll_once().await.len(), 1);

        bus.put_records("s", vec![json_record("k", serde_json::json!({"n": 2}))])
            .await
            .unwrap();
        bus.expire_all_iterators();

        // First poll hits the expiry and refreshes; the follow-up poll
        // resumes after the last consumed sequence number.
        assert!(consumer.poll_once().await.is_empty());
        let messages = consumer.poll_once().await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].data["n"], 2);
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_backs_off_two_seconds() {
        let bus = Arc::new(MemoryBus::with_streams(&["s".to_string()], 1));
        let consumer = consumer_over(Arc::clone(&bus), &["s"]).await;
        bus.throttle_next_gets(1);

        let start = tokio::time::Instant::now();
        consumer.poll_once().await;
        assert!(start.elapsed() >= THROTTLE_BACKOFF);
    }

    #[tokio::test]
    async fn per_shard_order_is_preserved() {
        let bus = Arc::new(MemoryBus::with_streams(&["s".to_string()], 4));
        let consumer = consumer_over(Arc::clone(&bus), &["s"]).await;

        let records: Vec<BusRecord> = (0..10)
            .map(|i| json_record("BTCUSDT", serde_json::json!({"n": i})))
            .collect();
        bus.put_records("s", records).await.unwrap();

        let messages = consumer.poll_once().await;
        let ns: Vec<i64> = messages
            .iter()
            .filter(|m| m.partition_key == "BTCUSDT")
            .map(|m| m.data["n"].as_i64().unwrap())
            .collect();
        assert_eq!(ns, (0..10).collect::<Vec<i64>>());
    }
}
