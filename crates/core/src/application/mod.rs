// Application Layer - dispatch pipeline

pub mod constants;
pub mod execution_log;
pub mod limiter;
pub mod listener;
pub mod listener_pool;
pub mod pacing;
pub mod pending;
pub mod route;
pub mod shutdown;

// Re-exports
pub use execution_log::{ExecutionLog, ExecutionRecord, LogStatus};
pub use limiter::{ConcurrencyLimiter, LimiterPermit};
pub use listener::{DeliveryMode, ListenerSettings, QueueListener};
pub use listener_pool::ListenerPool;
pub use pacing::PaceGate;
pub use pending::{DoneOutcome, PendingTracker};
pub use route::{Delivery, DeliveryError, Route};
pub use shutdown::{shutdown_channel, ShutdownSender, ShutdownToken};
