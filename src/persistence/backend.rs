//! Storage traits for persistence.
//!
//! The relay only talks to these capability traits, so any backend that
//! honours their atomicity guarantees (fjall, memory, or something external)
//! can sit behind it.

use async_trait::async_trait;

use super::error::Result;
use super::models::{
    InboundMessage, MessageQuery, NewMessage, NewSubscription, Subscription, SubscriptionChange,
};
use crate::protocol::QoS;

/// Persisted table of desired subscriptions.
///
/// Every method is atomic with respect to the others: concurrent inserts of
/// the same topic filter succeed exactly once.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Insert a new, active subscription.
    ///
    /// Returns `PersistenceError::Conflict` without writing anything if the
    /// topic filter already exists.
    async fn insert_subscription(&self, new: NewSubscription) -> Result<Subscription>;

    /// Get a subscription by id
    async fn get_subscription(&self, id: u64) -> Result<Option<Subscription>>;

    /// List all subscriptions ordered by id
    async fn list_subscriptions(&self) -> Result<Vec<Subscription>>;

    /// List subscriptions with `active = true`, ordered by id
    async fn list_active_subscriptions(&self) -> Result<Vec<Subscription>>;

    /// Replace qos and description; `None` if the id is unknown
    async fn update_subscription(
        &self,
        id: u64,
        qos: QoS,
        description: Option<String>,
    ) -> Result<Option<SubscriptionChange>>;

    /// Set the active flag; `None` if the id is unknown
    async fn set_subscription_active(
        &self,
        id: u64,
        active: bool,
    ) -> Result<Option<SubscriptionChange>>;

    /// Remove a subscription permanently, returning the removed row
    async fn delete_subscription(&self, id: u64) -> Result<Option<Subscription>>;
}

/// Append-only log of inbound messages
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Append a message, assigning its id and receive time
    async fn append_message(&self, new: NewMessage) -> Result<InboundMessage>;

    /// Get a message by id
    async fn get_message(&self, id: u64) -> Result<Option<InboundMessage>>;

    /// Browse messages newest first
    async fn search_messages(&self, query: &MessageQuery) -> Result<Vec<InboundMessage>>;

    /// All topics that have at least one stored message, sorted
    async fn distinct_topics(&self) -> Result<Vec<String>>;

    /// Number of stored messages
    async fn message_count(&self) -> Result<u64>;
}

/// A backend that provides both stores plus lifecycle control
#[async_trait]
pub trait StorageBackend: SubscriptionStore + MessageStore {
    /// Flush all pending writes to durable storage
    async fn flush(&self) -> Result<()>;

    /// Close the backend (flush and release resources)
    async fn close(&self) -> Result<()>;
}
