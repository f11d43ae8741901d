//! Historical ingestion: the exchange REST client, resumable backfill, and
//! checkpoint persistence.

pub mod backfill;
pub mod checkpoint;
pub mod client;

pub use backfill::{Backfiller, BackfillReport, MarketDataSource};
pub use checkpoint::{Checkpoint, CheckpointStore, FsCheckpointStore, ObjectCheckpointStore};
pub use client::{BinanceRestClient, RawAggTrade, RawDepth, RawKline};
