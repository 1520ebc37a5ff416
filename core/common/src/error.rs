//! Common error types for EdgeSync.

use thiserror::Error;

/// Top-level error type for EdgeSync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Network-level failure (DNS, refused connection, reset).
    #[error("Network error: {0}")]
    Network(String),

    /// Server answered with a non-success status.
    #[error("Server error: HTTP {status}")]
    Server { status: u16 },

    /// Payload failed integrity verification (checksum or version ordering).
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// Durable storage could not be written or read.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Configuration is missing or inconsistent.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Another process owns the state directory.
    #[error("State directory {0} is in use by another process")]
    StateLocked(String),

    /// A background component has been shut down.
    #[error("{0} is not running")]
    NotRunning(&'static str),
}

impl Error {
    /// Whether the failure is expected to clear up on its own
    /// (and should simply be retried on the next cycle).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Network(_) | Error::Server { .. } | Error::Io(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
