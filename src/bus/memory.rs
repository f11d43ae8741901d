//! In-process bus implementation.
//!
//! Shard routing hashes the partition key, so records sharing a key always
//! land on the same shard in publication order. Iterators can be expired
//! and puts can be failed on demand, letting tests drive the same error
//! paths a managed bus produces.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use super::{
    BusClient, BusError, BusRecord, BusRecordOut, GetRecordsOutput, IteratorType, PutRecordResult,
    PutRecordsOutput, ShardInfo,
};
use crate::models::now_ms;

struct StoredRecord {
    partition_key: String,
    data: Vec<u8>,
    sequence_number: u64,
    arrival_ts: i64,
}

struct ShardState {
    records: Vec<StoredRecord>,
    next_sequence: u64,
}

struct StreamState {
    shards: Vec<ShardState>,
}

struct IteratorState {
    stream: String,
    shard_idx: usize,
    offset: usize,
    expired: bool,
}

#[derive(Default)]
struct Faults {
    /// Record indices to fail on the next put to each stream.
    fail_record_indices: HashMap<String, Vec<usize>>,
    /// Whole-call errors to return on upcoming puts to each stream.
    fail_calls: HashMap<String, Vec<BusError>>,
    /// Throttle the next N get_records calls.
    throttle_gets: u32,
}

pub struct MemoryBus {
    streams: Mutex<HashMap<String, StreamState>>,
    iterators: Mutex<HashMap<String, IteratorState>>,
    next_iterator_id: Mutex<u64>,
    faults: Mutex<Faults>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
            iterators: Mutex::new(HashMap::new()),
            next_iterator_id: Mutex::new(0),
            faults: Mutex::new(Faults::default()),
        }
    }

    pub fn with_streams(stream_names: &[String], shards_per_stream: usize) -> Self {
        let bus = Self::new();
        for name in stream_names {
            bus.create_stream(name, shards_per_stream);
        }
        bus
    }

    pub fn create_stream(&self, name: &str, shard_count: usize) {
        let mut streams = self.streams.lock();
        streams.entry(name.to_string()).or_insert_with(|| StreamState {
            shards: (0..shard_count.max(1))
                .map(|_| ShardState {
                    records: Vec::new(),
                    next_sequence: 1,
                })
                .collect(),
        });
    }

    fn shard_for_key(partition_key: &str, shard_count: usize) -> usize {
        let digest = Sha256::digest(partition_key.as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        (u64::from_be_bytes(prefix) % shard_count as u64) as usize
    }

    fn mint_iterator(&self, stream: &str, shard_idx: usize, offset: usize) -> String {
        let mut next_id = self.next_iterator_id.lock();
        *next_id += 1;
        let token = format!("it-{:08}", *next_id);
        self.iterators.lock().insert(
            token.clone(),
            IteratorState {
                stream: stream.to_string(),
                shard_idx,
                offset,
                expired: false,
            },
        );
        token
    }

    /// Shard count for a stream (test observability).
    pub fn shard_count(&self, stream: &str) -> usize {
        self.streams
            .lock()
            .get(stream)
            .map(|s| s.shards.len())
            .unwrap_or(0)
    }

    /// Total records stored on a stream across shards.
    pub fn stream_len(&self, stream: &str) -> usize {
        self.streams
            .lock()
            .get(stream)
            .map(|s| s.shards.iter().map(|sh| sh.records.len()).sum())
            .unwrap_or(0)
    }

    // -------------------------------------------------------------------------
    // Fault injection (tests / local chaos runs)
    // -------------------------------------------------------------------------

    /// Fail the given record indices on the next put to `stream`.
    pub fn fail_next_put_records(&self, stream: &str, indices: Vec<usize>) {
        self.faults
            .lock()
            .fail_record_indices
            .insert(stream.to_string(), indices);
    }

    /// Queue whole-call put errors for `stream`, consumed one per call.
    pub fn fail_next_put_calls(&self, stream: &str, errors: Vec<BusError>) {
        self.faults
            .lock()
            .fail_calls
            .entry(stream.to_string())
            .or_default()
            .extend(errors);
    }

    /// Expire every outstanding iterator.
    pub fn expire_all_iterators(&self) {
        for state in self.iterators.lock().values_mut() {
            state.expired = true;
        }
    }

    /// Throttle the next `n` get_records calls.
    pub fn throttle_next_gets(&self, n: u32) {
        self.faults.lock().throttle_gets = n;
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BusClient for MemoryBus {
    async fn put_records(
        &self,
        stream: &str,
        records: Vec<BusRecord>,
    ) -> Result<PutRecordsOutput, BusError> {
        if let Some(err) = self
            .faults
            .lock()
            .fail_calls
            .get_mut(stream)
            .and_then(|q| (!q.is_empty()).then(|| q.remove(0)))
        {
            return Err(err);
        }
        let failed_indices = self
            .faults
            .lock()
            .fail_record_indices
            .remove(stream)
            .unwrap_or_default();

        let mut streams = self.streams.lock();
        let state = streams
            .get_mut(stream)
            .ok_or_else(|| BusError::StreamNotFound(stream.to_string()))?;
        let shard_count = state.shards.len();

        let mut results = Vec::with_capacity(records.len());
        let mut failed_record_count = 0;

        for (i, record) in records.into_iter().enumerate() {
            if failed_indices.contains(&i) {
                failed_record_count += 1;
                results.push(PutRecordResult {
                    error_code: Some("InternalFailure".to_string()),
                    error_message: Some("injected failure".to_string()),
                    ..Default::default()
                });
                continue;
            }

            let shard_idx = Self::shard_for_key(&record.partition_key, shard_count);
            let shard = &mut state.shards[shard_idx];
            let sequence_number = shard.next_sequence;
            shard.next_sequence += 1;
            shard.records.push(StoredRecord {
                partition_key: record.partition_key,
                data: record.data,
                sequence_number,
                arrival_ts: now_ms(),
            });
            results.push(PutRecordResult {
                sequence_number: Some(format!("{sequence_number:020}")),
                shard_id: Some(format!("shardId-{shard_idx:012}")),
                ..Default::default()
            });
        }

        Ok(PutRecordsOutput {
            failed_record_count,
            records: results,
        })
    }

    async fn describe_stream(&self, stream: &str) -> Result<Vec<ShardInfo>, BusError> {
        let streams = self.streams.lock();
        let state = streams
            .get(stream)
            .ok_or_else(|| BusError::StreamNotFound(stream.to_string()))?;
        Ok((0..state.shards.len())
            .map(|i| ShardInfo {
                shard_id: format!("shardId-{i:012}"),
            })
            .collect())
    }

    async fn get_shard_iterator(
        &self,
        stream: &str,
        shard_id: &str,
        iterator_type: IteratorType,
    ) -> Result<String, BusError> {
        let shard_idx: usize = shard_id
            .rsplit('-')
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| BusError::Transport(format!("bad shard id {shard_id}")))?;

        let offset = {
            let streams = self.streams.lock();
            let state = streams
                .get(stream)
                .ok_or_else(|| BusError::StreamNotFound(stream.to_string()))?;
            let shard = state
                .shards
                .get(shard_idx)
                .ok_or_else(|| BusError::Transport(format!("no shard {shard_id}")))?;

            match iterator_type {
                IteratorType::Latest => shard.records.len(),
                IteratorType::TrimHorizon => 0,
                IteratorType::AfterSequenceNumber(seq) => {
                    let seq: u64 = seq
                        .parse()
                        .map_err(|_| BusError::Transport(format!("bad sequence {seq}")))?;
                    shard
                        .records
                        .iter()
                        .position(|r| r.sequence_number > seq)
                        .unwrap_or(shard.records.len())
                }
            }
        };

        Ok(self.mint_iterator(stream, shard_idx, offset))
    }

    async fn get_records(
        &self,
        iterator: &str,
        limit: usize,
    ) -> Result<GetRecordsOutput, BusError> {
        {
            let mut faults = self.faults.lock();
            if faults.throttle_gets > 0 {
                faults.throttle_gets -= 1;
                return Err(BusError::ProvisionedThroughputExceeded);
            }
        }

        let (stream, shard_idx, offset) = {
            let iterators = self.iterators.lock();
            let state = iterators.get(iterator).ok_or(BusError::ExpiredIterator)?;
            if state.expired {
                return Err(BusError::ExpiredIterator);
            }
            (state.stream.clone(), state.shard_idx, state.offset)
        };

        let (records, new_offset) = {
            let streams = self.streams.lock();
            let state = streams
                .get(&stream)
                .ok_or_else(|| BusError::StreamNotFound(stream.clone()))?;
            let shard = &state.shards[shard_idx];
            let end = (offset + limit).min(shard.records.len());
            let records: Vec<BusRecordOut> = shard.records[offset..end]
                .iter()
                .map(|r| BusRecordOut {
                    partition_key: r.partition_key.clone(),
                    sequence_number: format!("{:020}", r.sequence_number),
                    data: r.data.clone(),
                    arrival_ts: r.arrival_ts,
                })
                .collect();
            (records, end)
        };

        Ok(GetRecordsOutput {
            records,
            next_iterator: Some(self.mint_iterator(&stream, shard_idx, new_offset)),
        })
    }
}
