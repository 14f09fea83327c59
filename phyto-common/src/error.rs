//! Common error types for phyto

use thiserror::Error;

/// Common result type for phyto operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types shared by the phyto crates
#[derive(Error, Debug)]
pub enum Error {
    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid user input or request parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Shared backend (cache, lock or state store) failed
    #[error("Backend error: {0}")]
    Backend(String),

    /// JSON encoding or decoding failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}
