//! Error types for the Workcell server
//!
//! This module contains the error types used throughout the server.

use thiserror::Error;
use workcell_core::CoreError;

/// Server error types
#[derive(Error, Debug)]
pub enum ServerError {
    /// Domain or device failure surfaced from the cell
    #[error("{0}")]
    Core(CoreError),

    /// Resource not found
    #[error("{0} not found")]
    NotFound(String),

    /// Validation error
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Internal server error
    #[error("Internal server error: {0}")]
    InternalError(String),
}

/// Result type for server operations
pub type ServerResult<T> = Result<T, ServerError>;

// Implement conversions from other error types
impl From<CoreError> for ServerError {
    fn from(err: CoreError) -> Self {
        ServerError::Core(err)
    }
}

impl From<serde_json::Error> for ServerError {
    fn from(err: serde_json::Error) -> Self {
        ServerError::ValidationError(format!("JSON error: {}", err))
    }
}

impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        ServerError::InternalError(format!("IO error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_errors_keep_their_message() {
        let err = ServerError::from(CoreError::InterlockDenied("door open".to_string()));
        assert_eq!(err.to_string(), "Interlock denied: door open");
    }

    #[test]
    fn test_not_found_formats_the_resource() {
        let err = ServerError::NotFound("task 9f3a".to_string());
        assert_eq!(err.to_string(), "task 9f3a not found");
    }
}
