pub use app_error::{AppError, AppResult};
pub use config::{
    CommitModeKind, CommitPolicy, ConsumerConfig, ConsumerProperties, GeneralConfig,
    GroupConfig, InitialOffset, DEFAULT_BLOCK_CAPACITY, MAX_BLOCK_CAPACITY,
};
pub use shutdown::Shutdown;
pub use tracing_config::{setup_local_tracing, setup_tracing, TracingGuard};

mod app_error;
mod config;
mod shutdown;
mod tracing_config;
