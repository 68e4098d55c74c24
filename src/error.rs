//! Error types for a3s-converse

use thiserror::Error;

/// Errors that can occur in the conversation engine
#[derive(Debug, Error)]
pub enum ConverseError {
    /// Network-level failure talking to a provider (connect, reset, timeout)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Provider answered with a non-success status
    #[error("Provider error ({status}): {message}")]
    Provider { status: u16, message: String },

    /// Malformed frame or payload that could not be recovered
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Session persistence failure
    #[error("Store error: {0}")]
    Store(String),

    /// Session or record not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation was cancelled by the caller
    #[error("Operation cancelled")]
    Cancelled,
}

impl ConverseError {
    /// Whether this error represents caller-initiated cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<reqwest::Error> for ConverseError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, ConverseError>;
