//! Persistence error types.

use thiserror::Error;

/// Errors that can occur during persistence operations.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Serialization error
    #[error("serialization error: {0}")]
    Serialize(String),
    /// Deserialization error
    #[error("deserialization error: {0}")]
    Deserialize(String),
    /// Storage backend error
    #[error("storage error: {0}")]
    Storage(String),
    /// A unique constraint would be violated; nothing was written
    #[error("conflict: {0}")]
    Conflict(String),
    /// Data corruption detected
    #[error("data corruption: {0}")]
    Corruption(String),
}

impl From<fjall::Error> for PersistenceError {
    fn from(err: fjall::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<bincode::error::EncodeError> for PersistenceError {
    fn from(err: bincode::error::EncodeError) -> Self {
        Self::Serialize(err.to_string())
    }
}

impl From<bincode::error::DecodeError> for PersistenceError {
    fn from(err: bincode::error::DecodeError) -> Self {
        Self::Deserialize(err.to_string())
    }
}

/// Result type for persistence operations.
pub type Result<T> = std::result::Result<T, PersistenceError>;
