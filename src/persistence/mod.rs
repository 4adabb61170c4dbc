//! Persistence module for RelayMQ.
//!
//! Provides durable storage for:
//! - The desired subscription set
//! - The inbound message log
//!
//! Uses a trait-based design allowing different backends:
//! - `FjallBackend` (default) - Local LSM-tree storage
//! - `MemoryBackend` - Volatile, for tests and throwaway runs

mod backend;
mod error;
mod fjall;
mod memory;
mod models;

pub use backend::{MessageStore, StorageBackend, SubscriptionStore};
pub use error::{PersistenceError, Result};
pub use fjall::FjallBackend;
pub use memory::MemoryBackend;
pub use models::{
    InboundMessage, MessageQuery, NewMessage, NewSubscription, StoredMessage, StoredSubscription,
    Subscription, SubscriptionChange, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE,
};

use std::sync::Arc;

use tracing::info;

use crate::config::{BackendType, PersistenceConfig};

/// An opened backend, split into the stores the relay consumes
#[derive(Clone)]
pub struct Storage {
    pub subscriptions: Arc<dyn SubscriptionStore>,
    pub messages: Arc<dyn MessageStore>,
    backend: Arc<dyn StorageBackend>,
}

impl Storage {
    /// Open the backend selected by the configuration
    pub fn open(config: &PersistenceConfig) -> Result<Self> {
        match config.backend {
            BackendType::Fjall => {
                std::fs::create_dir_all(&config.path)?;
                let backend = FjallBackend::open(&config.path)?;
                info!("Opened fjall storage at {}", config.path.display());
                Ok(Self::from_backend(Arc::new(backend)))
            }
            BackendType::Memory => {
                info!("Using in-memory storage; nothing will survive a restart");
                Ok(Self::from_backend(Arc::new(MemoryBackend::new())))
            }
        }
    }

    pub fn from_backend<B: StorageBackend + 'static>(backend: Arc<B>) -> Self {
        Self {
            subscriptions: backend.clone(),
            messages: backend.clone(),
            backend,
        }
    }

    pub async fn flush(&self) -> Result<()> {
        self.backend.flush().await
    }

    pub async fn close(&self) -> Result<()> {
        self.backend.close().await
    }
}
