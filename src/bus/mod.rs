//! Log-based message bus seam.
//!
//! The trait mirrors the stream/shard/record API the pipeline depends on:
//! batch put with per-record results, stream description, shard iterators
//! that expire, and bounded record reads. `MemoryBus` is the bundled
//! in-process implementation used by local runs and tests.

pub mod consumer;
pub mod memory;
pub mod producer;

use async_trait::async_trait;

pub use consumer::{BusConsumer, BusConsumerConfig, ConsumedMessage};
pub use memory::MemoryBus;
pub use producer::{BusProducer, BusProducerConfig};

/// A record headed for the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusRecord {
    pub partition_key: String,
    pub data: Vec<u8>,
}

/// Per-record outcome of a batch put: either a sequence number + shard, or
/// an error code + message.
#[derive(Debug, Clone, Default)]
pub struct PutRecordResult {
    pub sequence_number: Option<String>,
    pub shard_id: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

impl PutRecordResult {
    pub fn is_failed(&self) -> bool {
        self.error_code.is_some()
    }
}

#[derive(Debug, Clone, Default)]
pub struct PutRecordsOutput {
    pub failed_record_count: usize,
    pub records: Vec<PutRecordResult>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardInfo {
    pub shard_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IteratorType {
    Latest,
    TrimHorizon,
    AfterSequenceNumber(String),
}

/// A record read back from a shard.
#[derive(Debug, Clone)]
pub struct BusRecordOut {
    pub partition_key: String,
    pub sequence_number: String,
    pub data: Vec<u8>,
    /// Arrival timestamp assigned by the bus (unix millis).
    pub arrival_ts: i64,
}

#[derive(Debug, Clone, Default)]
pub struct GetRecordsOutput {
    pub records: Vec<BusRecordOut>,
    pub next_iterator: Option<String>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum BusError {
    #[error("shard iterator expired")]
    ExpiredIterator,
    #[error("provisioned throughput exceeded")]
    ProvisionedThroughputExceeded,
    #[error("stream not found: {0}")]
    StreamNotFound(String),
    #[error("bus transport error: {0}")]
    Transport(String),
}

#[async_trait]
pub trait BusClient: Send + Sync {
    /// Batch publish. Partial failures are reported per record, not as an
    /// error.
    async fn put_records(
        &self,
        stream: &str,
        records: Vec<BusRecord>,
    ) -> Result<PutRecordsOutput, BusError>;

    async fn describe_stream(&self, stream: &str) -> Result<Vec<ShardInfo>, BusError>;

    async fn get_shard_iterator(
        &self,
        stream: &str,
        shard_id: &str,
        iterator_type: IteratorType,
    ) -> Result<String, BusError>;

    async fn get_records(
        &self,
        iterator: &str,
        limit: usize,
    ) -> Result<GetRecordsOutput, BusError>;
}
