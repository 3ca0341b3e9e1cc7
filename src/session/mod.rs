pub use commit::PeriodicCommitter;
pub use coordinator::{SessionCoordinator, SessionState, CLAIM_RETRY_BACKOFF};
pub use handler::{handle_with_retry, FnHandler, HandleOutcome, HandlerRegistry, MessageHandler};

mod commit;
mod coordinator;
mod handler;
