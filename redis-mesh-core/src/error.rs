//! Error types for cache and cluster operations

use std::io;
use thiserror::Error;

/// Result type for cache operations
pub type RedisResult<T> = Result<T, RedisError>;

/// Error type shared by every layer of the cluster backend
#[derive(Error, Debug)]
pub enum RedisError {
    /// IO error during network operations
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Protocol parsing error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Server returned an error reply (malformed script, wrong type, ...)
    #[error("Server error: {0}")]
    Server(String),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Timeout error; the outcome of the operation is unknown
    #[error("Operation timed out")]
    Timeout,

    /// Type conversion error
    #[error("Type conversion error: {0}")]
    Type(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Authentication error
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Maximum retry attempts exceeded
    #[error("Maximum retry attempts ({0}) exceeded")]
    MaxRetriesExceeded(usize),

    /// Unexpected response from server
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    /// Operation the backend representation cannot serve
    #[error("Unsupported operation: {0}")]
    Unsupported(&'static str),

    /// Endpoint is marked unhealthy and excluded from routing
    #[error("Endpoint unavailable: {0}")]
    Unavailable(String),

    /// Component was shut down
    #[error("Shut down: {0}")]
    Shutdown(String),
}

impl Clone for RedisError {
    /// IO errors are rebuilt from their kind and message
    fn clone(&self) -> Self {
        match self {
            Self::Io(e) => Self::Io(io::Error::new(e.kind(), e.to_string())),
            Self::Protocol(s) => Self::Protocol(s.clone()),
            Self::Server(s) => Self::Server(s.clone()),
            Self::Connection(s) => Self::Connection(s.clone()),
            Self::Timeout => Self::Timeout,
            Self::Type(s) => Self::Type(s.clone()),
            Self::Config(s) => Self::Config(s.clone()),
            Self::Auth(s) => Self::Auth(s.clone()),
            Self::MaxRetriesExceeded(n) => Self::MaxRetriesExceeded(*n),
            Self::UnexpectedResponse(s) => Self::UnexpectedResponse(s.clone()),
            Self::Unsupported(s) => Self::Unsupported(s),
            Self::Unavailable(s) => Self::Unavailable(s.clone()),
            Self::Shutdown(s) => Self::Shutdown(s.clone()),
        }
    }
}

impl RedisError {
    /// Whether this error came from the transport rather than the server
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::Connection(_) | Self::Timeout | Self::Protocol(_)
        )
    }

    /// Whether the server rejected a script or command
    #[must_use]
    pub const fn is_script_error(&self) -> bool {
        matches!(self, Self::Server(_))
    }

    /// Whether the server reported that a script SHA is not cached
    #[must_use]
    pub fn is_noscript(&self) -> bool {
        matches!(self, Self::Server(msg) if msg.starts_with("NOSCRIPT"))
    }
}
