// Reactor Core - dispatch pipeline, domain model and ports
// No infrastructure dependencies: transports, sinks and executors plug in via ports

pub mod application;
pub mod domain;
pub mod error;
pub mod port;

pub use error::{AppError, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
