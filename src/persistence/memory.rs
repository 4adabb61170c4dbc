//! In-memory storage backend.
//!
//! Same guarantees as the fjall backend, nothing survives a restart.
//! Used by tests and by `backend = "memory"` deployments.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::SystemTime;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::backend::{MessageStore, StorageBackend, SubscriptionStore};
use super::error::{PersistenceError, Result};
use super::models::{
    InboundMessage, MessageQuery, NewMessage, NewSubscription, Subscription, SubscriptionChange,
};
use crate::protocol::QoS;

#[derive(Default)]
struct MemoryState {
    subscriptions: BTreeMap<u64, Subscription>,
    filters: HashMap<String, u64>,
    last_subscription_id: u64,
    /// Append-only, ordered by id
    messages: Vec<InboundMessage>,
    topics: BTreeSet<String>,
}

/// In-memory storage backend
#[derive(Default)]
pub struct MemoryBackend {
    state: RwLock<MemoryState>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn modify_subscription<F>(&self, id: u64, mutate: F) -> Option<SubscriptionChange>
    where
        F: FnOnce(&mut Subscription),
    {
        let mut state = self.state.write();
        let sub = state.subscriptions.get_mut(&id)?;
        let before = sub.clone();
        mutate(sub);
        Some(SubscriptionChange {
            before,
            after: sub.clone(),
        })
    }
}

#[async_trait]
impl SubscriptionStore for MemoryBackend {
    async fn insert_subscription(&self, new: NewSubscription) -> Result<Subscription> {
        let mut state = self.state.write();

        if state.filters.contains_key(&new.topic_filter) {
            return Err(PersistenceError::Conflict(format!(
                "subscription already exists for topic: {}",
                new.topic_filter
            )));
        }

        state.last_subscription_id += 1;
        let id = state.last_subscription_id;
        let subscription = Subscription {
            id,
            topic_filter: new.topic_filter,
            qos: new.qos,
            active: true,
            description: new.description,
            created_at: SystemTime::now(),
        };

        state
            .filters
            .insert(subscription.topic_filter.clone(), id);
        state.subscriptions.insert(id, subscription.clone());
        Ok(subscription)
    }

    async fn get_subscription(&self, id: u64) -> Result<Option<Subscription>> {
        Ok(self.state.read().subscriptions.get(&id).cloned())
    }

    async fn list_subscriptions(&self) -> Result<Vec<Subscription>> {
        Ok(self.state.read().subscriptions.values().cloned().collect())
    }

    async fn list_active_subscriptions(&self) -> Result<Vec<Subscription>> {
        Ok(self
            .state
            .read()
            .subscriptions
            .values()
            .filter(|sub| sub.active)
            .cloned()
            .collect())
    }

    async fn update_subscription(
        &self,
        id: u64,
        qos: QoS,
        description: Option<String>,
    ) -> Result<Option<SubscriptionChange>> {
        Ok(self.modify_subscription(id, |sub| {
            sub.qos = qos;
            sub.description = description;
        }))
    }

    async fn set_subscription_active(
        &self,
        id: u64,
        active: bool,
    ) -> Result<Option<SubscriptionChange>> {
        Ok(self.modify_subscription(id, |sub| sub.active = active))
    }

    async fn delete_subscription(&self, id: u64) -> Result<Option<Subscription>> {
        let mut state = self.state.write();
        let removed = state.subscriptions.remove(&id);
        if let Some(sub) = &removed {
            state.filters.remove(&sub.topic_filter);
        }
        Ok(removed)
    }
}

#[async_trait]
impl MessageStore for MemoryBackend {
    async fn append_message(&self, new: NewMessage) -> Result<InboundMessage> {
        let mut state = self.state.write();
        let id = state.messages.last().map(|m| m.id).unwrap_or(0) + 1;
        let message = InboundMessage {
            id,
            topic: new.topic,
            payload: new.payload,
            qos: new.qos,
            retained: new.retained,
            received_at: SystemTime::now(),
        };
        state.topics.insert(message.topic.clone());
        state.messages.push(message.clone());
        Ok(message)
    }

    async fn get_message(&self, id: u64) -> Result<Option<InboundMessage>> {
        let state = self.state.read();
        Ok(state
            .messages
            .binary_search_by_key(&id, |m| m.id)
            .ok()
            .map(|idx| state.messages[idx].clone()))
    }

    async fn search_messages(&self, query: &MessageQuery) -> Result<Vec<InboundMessage>> {
        let state = self.state.read();
        let mut matching: Vec<&InboundMessage> =
            state.messages.iter().filter(|m| query.matches(m)).collect();
        // newest first; ids break ties between equal timestamps
        matching.sort_by(|a, b| b.received_at.cmp(&a.received_at).then(b.id.cmp(&a.id)));

        Ok(matching
            .into_iter()
            .skip(query.offset)
            .take(query.effective_limit())
            .cloned()
            .collect())
    }

    async fn distinct_topics(&self) -> Result<Vec<String>> {
        Ok(self.state.read().topics.iter().cloned().collect())
    }

    async fn message_count(&self) -> Result<u64> {
        Ok(self.state.read().messages.len() as u64)
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
