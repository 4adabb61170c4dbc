//! Subscription reconciler.
//!
//! The subscription store is the source of truth. Mutations are written to
//! the store first and then mirrored to the broker when a session is up;
//! every (re)connect replays all active rows. Broker failures here are
//! logged and left for the next full resubscribe.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::error::{RelayError, Result};
use super::supervisor::ConnectionSupervisor;
use crate::persistence::{NewSubscription, Subscription, SubscriptionStore};
use crate::protocol::QoS;
use crate::topic::{validate_description, validate_topic_filter};

pub struct SubscriptionReconciler {
    store: Arc<dyn SubscriptionStore>,
    supervisor: Arc<ConnectionSupervisor>,
}

impl SubscriptionReconciler {
    pub fn new(store: Arc<dyn SubscriptionStore>, supervisor: Arc<ConnectionSupervisor>) -> Self {
        Self { store, supervisor }
    }

    /// Subscribe to every active row. Returns how many subscribes the
    /// transport accepted.
    pub async fn resubscribe_all(&self) -> usize {
        let active = match self.store.list_active_subscriptions().await {
            Ok(active) => active,
            Err(e) => {
                warn!("Cannot load active subscriptions for resubscribe: {}", e);
                return 0;
            }
        };

        let mut accepted = 0;
        for sub in &active {
            match self.supervisor.subscribe(&sub.topic_filter, sub.qos).await {
                Ok(()) => accepted += 1,
                Err(e) => warn!("Resubscribe to {} failed: {}", sub.topic_filter, e),
            }
        }

        info!(
            "Resubscribed to {}/{} active subscriptions",
            accepted,
            active.len()
        );
        accepted
    }

    pub async fn create(
        &self,
        topic_filter: String,
        qos: QoS,
        description: Option<String>,
    ) -> Result<Subscription> {
        validate_topic_filter(&topic_filter).map_err(RelayError::Validation)?;
        validate_description(description.as_deref()).map_err(RelayError::Validation)?;

        let created = self
            .store
            .insert_subscription(NewSubscription {
                topic_filter,
                qos,
                description,
            })
            .await?;
        info!(
            "Created subscription {} for {} (qos {})",
            created.id, created.topic_filter, created.qos
        );

        if self.supervisor.is_connected() {
            self.mirror_subscribe(&created).await;
        } else {
            debug!(
                "Not connected, {} will be subscribed on next connect",
                created.topic_filter
            );
        }
        Ok(created)
    }

    pub async fn update(
        &self,
        id: u64,
        qos: QoS,
        description: Option<String>,
    ) -> Result<Subscription> {
        validate_description(description.as_deref()).map_err(RelayError::Validation)?;

        let change = self
            .store
            .update_subscription(id, qos, description)
            .await?
            .ok_or(RelayError::NotFound(id))?;
        let updated = change.after;

        // Unsubscribe then subscribe: the filter is briefly not subscribed
        // and messages published in between are not delivered.
        if updated.active && change.before.qos != updated.qos && self.supervisor.is_connected() {
            debug!(
                "QoS of {} changed {} -> {}, resubscribing",
                updated.topic_filter, change.before.qos, updated.qos
            );
            self.mirror_unsubscribe(&updated.topic_filter).await;
            self.mirror_subscribe(&updated).await;
        }
        Ok(updated)
    }

    pub async fn toggle(&self, id: u64, active: bool) -> Result<Subscription> {
        let change = self
            .store
            .set_subscription_active(id, active)
            .await?
            .ok_or(RelayError::NotFound(id))?;
        let toggled = change.after;
        info!(
            "Subscription {} ({}) is now {}",
            toggled.id,
            toggled.topic_filter,
            if toggled.active { "active" } else { "inactive" }
        );

        if self.supervisor.is_connected() {
            if toggled.active {
                self.mirror_subscribe(&toggled).await;
            } else {
                self.mirror_unsubscribe(&toggled.topic_filter).await;
            }
        }
        Ok(toggled)
    }

    pub async fn delete(&self, id: u64) -> Result<()> {
        let existing = self
            .store
            .get_subscription(id)
            .await?
            .ok_or(RelayError::NotFound(id))?;

        if self.supervisor.is_connected() {
            self.mirror_unsubscribe(&existing.topic_filter).await;
        }

        self.store
            .delete_subscription(id)
            .await?
            .ok_or(RelayError::NotFound(id))?;
        info!("Deleted subscription {} ({})", id, existing.topic_filter);
        Ok(())
    }

    async fn mirror_subscribe(&self, sub: &Subscription) {
        if let Err(e) = self.supervisor.subscribe(&sub.topic_filter, sub.qos).await {
            warn!("Subscribe to {} failed: {}", sub.topic_filter, e);
        }
    }

    async fn mirror_unsubscribe(&self, filter: &str) {
        if let Err(e) = self.supervisor.unsubscribe(filter).await {
            warn!("Unsubscribe from {} failed: {}", filter, e);
        }
    }
}
