//! Error types for ordo-core

use thiserror::Error;

/// Result type alias using ordo-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in ordo-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Local store IO failure
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Entity not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Network failure, 5xx or timeout; retryable with backoff
    #[error("Transport error: {0}")]
    Transport(String),

    /// Malformed server response (missing result, unknown entity type)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Server rejected an operation with a permanent business error
    #[error("Business error: {0}")]
    Business(String),
}

impl From<reqwest::Error> for Error {
    fn from(error: reqwest::Error) -> Self {
        if error.is_decode() {
            Self::Protocol(error.to_string())
        } else {
            Self::Transport(error.to_string())
        }
    }
}

impl Error {
    /// Whether the error should be retried with backoff rather than
    /// surfaced as terminal.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Protocol(_))
    }
}
