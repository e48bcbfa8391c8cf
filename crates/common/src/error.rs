//! Common error types for Distillr
//!
//! This module defines all error types used across the Distillr system.
//! Errors carry enough context for the distiller to decide whether a failed
//! generation request is worth another attempt.

use thiserror::Error;

/// Main error type for Distillr
#[derive(Error, Debug)]
pub enum DistillError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Connection errors
    #[error("Connection error: {0}")]
    Connection(String),

    /// HTTP transport errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-success response from an OpenAI-compatible backend
    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    /// Model loading or execution errors
    #[error("Model error: {0}")]
    Model(String),

    /// Tokenizer errors
    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Queue full (backpressure)
    #[error("Queue full: {0}")]
    QueueFull(String),

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// No client can serve the request
    #[error("Client unavailable: {0}")]
    ClientUnavailable(String),

    /// Engine shut down or dropped a request
    #[error("Engine error: {0}")]
    Engine(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_yaml::Error> for DistillError {
    fn from(err: serde_yaml::Error) -> Self {
        DistillError::Config(err.to_string())
    }
}

impl From<config::ConfigError> for DistillError {
    fn from(err: config::ConfigError) -> Self {
        DistillError::Config(err.to_string())
    }
}

impl DistillError {
    /// Whether a request that failed with this error may succeed if tried again
    pub fn is_retryable(&self) -> bool {
        match self {
            DistillError::Connection(_)
            | DistillError::Http(_)
            | DistillError::Timeout(_)
            | DistillError::QueueFull(_) => true,
            DistillError::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        DistillError::Config(msg.into())
    }

    /// Create a connection error
    pub fn connection(msg: impl Into<String>) -> Self {
        DistillError::Connection(msg.into())
    }

    /// Create an API error
    pub fn api(status: u16, msg: impl Into<String>) -> Self {
        DistillError::Api {
            status,
            message: msg.into(),
        }
    }

    /// Create a model error
    pub fn model(msg: impl Into<String>) -> Self {
        DistillError::Model(msg.into())
    }

    /// Create a tokenizer error
    pub fn tokenizer(msg: impl Into<String>) -> Self {
        DistillError::Tokenizer(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        DistillError::InvalidInput(msg.into())
    }

    /// Create a queue full error
    pub fn queue_full(msg: impl Into<String>) -> Self {
        DistillError::QueueFull(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        DistillError::Timeout(msg.into())
    }

    /// Create a client unavailable error
    pub fn client_unavailable(msg: impl Into<String>) -> Self {
        DistillError::ClientUnavailable(msg.into())
    }

    /// Create an engine error
    pub fn engine(msg: impl Into<String>) -> Self {
        DistillError::Engine(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        DistillError::Internal(msg.into())
    }
}

/// Result type alias for Distillr operations
pub type Result<T> = std::result::Result<T, DistillError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(DistillError::timeout("slow").is_retryable());
        assert!(DistillError::queue_full("busy").is_retryable());
        assert!(DistillError::api(503, "overloaded").is_retryable());
        assert!(DistillError::api(429, "rate limited").is_retryable());

        assert!(!DistillError::api(400, "bad request").is_retryable());
        assert!(!DistillError::config("bad").is_retryable());
        assert!(!DistillError::invalid_input("empty").is_retryable());
        assert!(!DistillError::client_unavailable("no client serves m").is_retryable());
    }

    #[test]
    fn test_api_error_display() {
        let err = DistillError::api(404, "model not found");
        assert_eq!(err.to_string(), "API error (status 404): model not found");
    }
}
