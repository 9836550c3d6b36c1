// Domain Layer - messages, routes and templates

pub mod error;
pub mod json_path;
pub mod message;
pub mod route;
pub mod template;

// Re-exports
pub use error::DomainError;
pub use json_path::JsonPath;
pub use message::{AckToken, QueueMessage, SENT_TIMESTAMP_ATTRIBUTE};
pub use route::{
    parse_duration, CommandSpec, CompiledCommand, Filter, FilterCondition, RouteId, RouteSettings,
};
pub use template::{resolve_args, ArgTemplate, TemplateContext, TextTemplate};
