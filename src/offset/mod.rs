pub use offset_block::OffsetBlock;
pub use partition_tracker::{PartitionOffsetTracker, PERSIST_ATTEMPTS};

mod offset_block;
mod partition_tracker;
