//! Bronze-to-warehouse ETL: partition discovery, decompression and
//! parsing, typed transforms, idempotent batch insertion.

pub mod db;
pub mod orchestrator;
pub mod reader;
pub mod transform;

pub use db::{BatchOutcome, MarketDb};
pub use orchestrator::EtlOrchestrator;
pub use reader::{BronzeReader, DiscoveredFile};
pub use transform::{DataTransformer, MarketRow};
