// Queue Reactor Daemon - composition root
// Config loading, adapter registry and the route supervisor

pub mod config;
pub mod registry;
pub mod supervisor;

pub use config::{Config, LogStreamConfig, RouteConfig};
pub use supervisor::Supervisor;
