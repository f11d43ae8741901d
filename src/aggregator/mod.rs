//! Stream aggregation: windowed buffers, feature derivation, hot-store
//! write-out.

pub mod features;
pub mod stream;
pub mod writer;

pub use features::FeatureBuilder;
pub use stream::StreamAggregator;
pub use writer::FeatureWriter;
