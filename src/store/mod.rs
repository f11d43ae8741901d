//! Storage seams: the object store (bronze layer), the hot key-value
//! store, and the partitioned bronze writer.

pub mod hot;
pub mod object;
pub mod partition_writer;

pub use hot::{HotStore, MemoryHotStore};
pub use object::{FsObjectStore, ObjectMeta, ObjectStore, PutOptions, StoreError};
pub use partition_writer::{PartitionWriter, PartitionWriterConfig};
