// Port Layer - Interfaces for external dependencies

pub mod command_executor;
pub mod log_sink;
pub mod queue_transport;
pub mod time_provider;

// Re-exports
pub use command_executor::{CommandExecutor, ExecutionError};
pub use log_sink::LogSink;
pub use queue_transport::{QueueTransport, ReceiveRequest, ReceivedMessage, TransportError};
pub use time_provider::TimeProvider;
