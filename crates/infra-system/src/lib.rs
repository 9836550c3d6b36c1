// Reactor Infrastructure - System Adapters
// Implements: CommandExecutor, QueueTransport, LogSink

pub mod log_sinks;
pub mod spool_queue;
pub mod subprocess_executor;
#[cfg(unix)]
pub mod user;

pub use log_sinks::{FileRotation, FileSink, StdoutSink};
pub use spool_queue::SpoolQueue;
pub use subprocess_executor::{RunningProcess, SubprocessExecutor};
