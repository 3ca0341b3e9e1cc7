pub use consumer_record::{ConsumerRecord, TaggedRecord};
pub use topic_partition::TopicPartition;

mod consumer_record;
mod topic_partition;
