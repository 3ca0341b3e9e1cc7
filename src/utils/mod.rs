pub use rate_limiter::IntakeRateLimiter;
pub use worker_pool::{PoolTask, WorkerPool, WorkerPoolConfig};

mod rate_limiter;
mod worker_pool;
