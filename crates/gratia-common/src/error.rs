//! Error types for the Gratia accounting client

use thiserror::Error;

/// Result type alias for Gratia operations
pub type Result<T> = std::result::Result<T, GratiaError>;

/// Main error type for Gratia
#[derive(Error, Debug)]
pub enum GratiaError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    /// A record field is present but does not hold a number
    #[error("Invalid numeric value for '{key}': '{value}'")]
    Format { key: String, value: String },

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Queue error: {0}")]
    Queue(String),

    /// The collector answered but did not acknowledge the request
    #[error("Collector rejected request: {0}")]
    Collector(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl GratiaError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a queue error
    pub fn queue(msg: impl Into<String>) -> Self {
        Self::Queue(msg.into())
    }

    /// Create a numeric format error for `key`
    pub fn format(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Format {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Whether this error came from a malformed record rather than the environment
    pub fn is_record_error(&self) -> bool {
        matches!(self, Self::Format { .. } | Self::MissingField(_))
    }
}
