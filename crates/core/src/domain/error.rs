// Domain Error Types

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("Invalid JSON path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("Invalid condition pattern for '{path}': {reason}")]
    InvalidPattern { path: String, reason: String },

    #[error("Invalid duration '{value}': {reason}")]
    InvalidDuration { value: String, reason: String },

    #[error("Validation error: {0}")]
    ValidationError(String),
}

pub type Result<T> = std::result::Result<T, DomainError>;
