//! Errors surfaced by the relay's control surface.

use thiserror::Error;

use crate::persistence::PersistenceError;
use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum RelayError {
    /// A subscription with the same topic filter already exists
    #[error("conflict: {0}")]
    Conflict(String),
    /// No subscription or message with this id
    #[error("not found: {0}")]
    NotFound(u64),
    /// Publish attempted without a live broker session
    #[error("not connected to broker")]
    NotConnected,
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("storage error: {0}")]
    Store(PersistenceError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl From<PersistenceError> for RelayError {
    fn from(err: PersistenceError) -> Self {
        match err {
            PersistenceError::Conflict(msg) => Self::Conflict(msg),
            other => Self::Store(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
