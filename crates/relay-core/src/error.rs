//! Error types for the relay driver

use thiserror::Error;

/// Result type for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

/// Relay driver error types
#[derive(Debug, Error)]
pub enum RelayError {
    /// Listener or dialer could not be created
    #[error("Setup failed: {0}")]
    Setup(String),

    /// Underlying transport reported a failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Operation on a connection that is already closed
    #[error("Connection closed: {0}")]
    ConnectionClosed(u32),

    /// Peer sent something we could not understand
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration could not be loaded
    #[error("Config error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::Serialization(err.to_string())
    }
}
