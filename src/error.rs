//! Error types for the relay server

use thiserror::Error;

/// Result type for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

/// Errors surfaced by the relay server
#[derive(Error, Debug)]
pub enum RelayError {
    /// I/O related errors (socket bind, send, receive)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Transport-level errors (KCP input/output, dead links)
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// Session bookkeeping errors
    #[error("Session error: {message}")]
    Session { message: String },

    /// Registry index inconsistencies
    #[error("Registry error: {message}")]
    Registry { message: String },

    /// Session identifier space exhausted
    #[error("Session id space exhausted")]
    UidExhausted,

    /// Internal errors that shouldn't normally occur
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl RelayError {
    /// Create a config error
    pub fn config(message: impl Into<String>) -> Self {
        RelayError::Config {
            message: message.into(),
        }
    }

    /// Create a transport error
    pub fn transport(message: impl Into<String>) -> Self {
        RelayError::Transport {
            message: message.into(),
        }
    }

    /// Create a session error
    pub fn session(message: impl Into<String>) -> Self {
        RelayError::Session {
            message: message.into(),
        }
    }

    /// Create a registry error
    pub fn registry(message: impl Into<String>) -> Self {
        RelayError::Registry {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        RelayError::Internal {
            message: message.into(),
        }
    }

    /// Check if this error means a registry invariant was broken
    pub fn is_registry_error(&self) -> bool {
        matches!(self, RelayError::Registry { .. })
    }
}
