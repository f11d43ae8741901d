//! The aggregation loop: bus consumption, per-key windows, trigger logic.
//!
//! Messages route into per-`(symbol, message_type)` ring buffers. A window
//! fires when it holds `min_messages` or has not been aggregated for
//! `max_interval`; on trigger the buffer is drained, sorted by event time,
//! and the derived features are written to the hot store.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::features::FeatureBuilder;
use super::writer::FeatureWriter;
use crate::bus::{BusConsumer, ConsumedMessage};
use crate::config::AggregationConfig;
use crate::health::HealthReport;
use crate::models::{now_ms, MarketMessage, MessageType};

type BufferKey = (String, MessageType);

struct WindowBuffer {
    messages: VecDeque<MarketMessage>,
    last_aggregated: Instant,
}

#[derive(Debug, Default)]
pub struct AggregatorStats {
    pub messages_consumed: AtomicU64,
    pub invalid_messages: AtomicU64,
    pub features_computed: AtomicU64,
    pub features_written: AtomicU64,
    pub errors: AtomicU64,
    pub last_message_ms: AtomicI64,
}

pub struct StreamAggregator {
    consumer: BusConsumer,
    builder: FeatureBuilder,
    writer: FeatureWriter,
    config: AggregationConfig,
    buffers: Mutex<HashMap<BufferKey, WindowBuffer>>,
    running: AtomicBool,
    pub stats: AggregatorStats,
}

impl StreamAggregator {
    pub fn new(consumer: BusConsumer, writer: FeatureWriter, config: AggregationConfig) -> Arc<Self> {
        Arc::new(Self {
            consumer,
            builder: FeatureBuilder::new(),
            writer,
            config,
            buffers: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
            stats: AggregatorStats::default(),
        })
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Consume, buffer, and aggregate until stopped; drains all buffers on
    /// the way out.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        self.writer.verify_connection().await?;
        self.consumer
            .start()
            .await
            .map_err(|e| anyhow::anyhow!("consumer start failed: {e}"))?;

        info!(
            min_messages = self.config.min_messages,
            max_interval_s = self.config.max_interval_seconds,
            "stream_aggregator_started"
        );

        let mut poll_tick = tokio::time::interval(self.consumer.polling_interval());
        let mut check_tick =
            tokio::time::interval(Duration::from_secs(self.config.check_interval_seconds.max(1)));
        poll_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        check_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        while self.running.load(Ordering::SeqCst) {
            tokio::select! {
                _ = poll_tick.tick() => {
                    for message in self.consumer.poll_once().await {
                        self.ingest(message);
                    }
                }
                _ = check_tick.tick() => {
                    self.aggregate_ready().await;
                }
            }
        }

        self.drain_all().await;
        info!(
            features_written = self.stats.features_written.load(Ordering::Relaxed),
            "stream_aggregator_stopped"
        );
        Ok(())
    }

    /// Route one consumed record into its window buffer (ring semantics:
    /// the oldest message gives way when the buffer is full).
    pub fn ingest(&self, message: ConsumedMessage) {
        let parsed: MarketMessage = match serde_json::from_value(message.data) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.stats.invalid_messages.fetch_add(1, Ordering::Relaxed);
                warn!(stream = %message.stream_name, error = %e, "unroutable_message");
                return;
            }
        };

        let key = (parsed.symbol().to_string(), parsed.message_type());
        let mut buffers = self.buffers.lock();
        let buffer = buffers.entry(key).or_insert_with(|| WindowBuffer {
            messages: VecDeque::with_capacity(self.config.buffer_capacity),
            last_aggregated: Instant::now(),
        });
        if buffer.messages.len() >= self.config.buffer_capacity {
            buffer.messages.pop_front();
        }
        buffer.messages.push_back(parsed);

        self.stats.messages_consumed.fetch_add(1, Ordering::Relaxed);
        self.stats.last_message_ms.store(now_ms(), Ordering::Relaxed);
    }

    /// Fire every buffer that meets a trigger condition.
    pub async fn aggregate_ready(&self) {
        let max_interval = Duration::from_secs(self.config.max_interval_seconds);
        let due: Vec<(BufferKey, Vec<MarketMessage>)> = {
            let mut buffers = self.buffers.lock();
            buffers
                .iter_mut()
                .filter(|(_, buffer)| {
                    !buffer.messages.is_empty()
                        && (buffer.messages.len() >= self.config.min_messages
                            || buffer.last_aggregated.elapsed() >= max_interval)
                })
                .map(|(key, buffer)| {
                    buffer.last_aggregated = Instant::now();
                    (key.clone(), buffer.messages.drain(..).collect())
                })
                .collect()
        };

        for ((symbol, message_type), messages) in due {
            self.aggregate_window(&symbol, message_type, messages).await;
        }
    }

    async fn aggregate_window(
        &self,
        symbol: &str,
        message_type: MessageType,
        mut messages: Vec<MarketMessage>,
    ) {
        messages.sort_by_key(|m| m.event_ts());
        debug!(symbol, message_type = %message_type, window = messages.len(), "aggregating_window");

        let Some(features) = self
            .builder
            .build(symbol, &messages, message_type, now_ms() / 1000)
        else {
            self.builder.record_error();
            return;
        };
        self.stats.features_computed.fetch_add(1, Ordering::Relaxed);

        match self.writer.write_features(symbol, &features).await {
            Ok(()) => {
                self.stats.features_written.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                error!(symbol, error = %e, "feature_write_failed");
            }
        }
    }

    /// Shutdown drain: aggregate whatever is buffered regardless of
    /// trigger conditions.
    pub async fn drain_all(&self) {
        let remaining: Vec<(BufferKey, Vec<MarketMessage>)> = {
            let mut buffers = self.buffers.lock();
            buffers
                .iter_mut()
                .filter(|(_, buffer)| !buffer.messages.is_empty())
                .map(|(key, buffer)| (key.clone(), buffer.messages.drain(..).collect()))
                .collect()
        };
        if !remaining.is_empty() {
            info!(buffers = remaining.len(), "draining_window_buffers");
        }
        for ((symbol, message_type), messages) in remaining {
            self.aggregate_window(&symbol, message_type, messages).await;
        }
    }

    pub fn buffered_messages(&self) -> usize {
        self.buffers.lock().values().map(|b| b.messages.len()).sum()
    }

    pub fn stats_json(&self) -> serde_json::Value {
        let buffers = self.buffers.lock();
        let detail: serde_json::Map<String, serde_json::Value> = buffers
            .iter()
            .map(|((symbol, mt), buffer)| {
                (format!("{symbol}_{mt}"), serde_json::json!(buffer.messages.len()))
            })
            .collect();
        serde_json::json!({
            "messages_consumed": self.stats.messages_consumed.load(Ordering::Relaxed),
            "invalid_messages": self.stats.invalid_messages.load(Ordering::Relaxed),
            "features_computed": self.stats.features_computed.load(Ordering::Relaxed),
            "features_written": self.stats.features_written.load(Ordering::Relaxed),
            "errors": self.stats.errors.load(Ordering::Relaxed),
            "buffer_stats": {
                "total_buffered_messages": buffers.values().map(|b| b.messages.len()).sum::<usize>(),
                "active_buffers": buffers.len(),
                "buffer_details": detail,
            },
        })
    }

    pub async fn health_check(&self) -> HealthReport {
        let mut components = std::collections::BTreeMap::new();
        components.insert("consumer".to_string(), self.consumer.health_check());
        components.insert("writer".to_string(), self.writer.health_check().await);
        let mut report = HealthReport::aggregate(components);

        let buffered = self.buffered_messages();
        if buffered > 5_000 {
            report.issues.push(format!("large buffer size: {buffered} messages"));
            if report.is_healthy() {
                report.status = crate::health::HealthStatus::Degraded;
            }
        }

        let consumed = self.stats.messages_consumed.load(Ordering::Relaxed);
        let errors = self.stats.errors.load(Ordering::Relaxed)
            + self.stats.invalid_messages.load(Ordering::Relaxed);
        if consumed > 0 && errors as f64 / consumed as f64 > 0.05 {
            report
                .issues
                .push("high aggregation error rate".to_string());
            if report.is_healthy() {
                report.status = crate::health::HealthStatus::Degraded;
            }
        }

        report.stats = serde_json::json!({
            "aggregator": self.stats_json(),
            "components": report.stats.get("components").cloned().unwrap_or_default(),
        });
        report
    }
}
