pub mod broker;
mod consumer;
pub mod message;
pub mod offset;
pub mod service;
pub mod session;
pub mod store;
pub mod utils;

pub use broker::{ClientFactory, ConsumerGroupClient, ConsumerGroupHandler, GroupSession, MemoryBroker};
pub use consumer::Consumer;
pub use message::{ConsumerRecord, TaggedRecord, TopicPartition};
pub use offset::{OffsetBlock, PartitionOffsetTracker};
pub use service::{
    setup_local_tracing, setup_tracing, AppError, AppResult, CommitModeKind, CommitPolicy,
    ConsumerConfig, ConsumerProperties, GroupConfig, InitialOffset, Shutdown, TracingGuard,
};
pub use session::{FnHandler, HandlerRegistry, MessageHandler, SessionCoordinator, SessionState};
pub use store::{FileOffsetStore, MemoryOffsetStore, OffsetStore};
