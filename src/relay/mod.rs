//! Relay core
//!
//! Wires the broker session to the stores:
//!
//! - [`ConnectionSupervisor`] owns the session and its state machine
//! - [`SubscriptionReconciler`] mirrors subscription changes to the broker
//!   and replays active rows after every (re)connect
//! - [`MessageIngestor`] appends every delivery to the message log
//! - [`PublishGateway`] forwards outbound publishes
//!
//! [`Relay`] is the control surface built on top of them.

mod error;
mod gateway;
mod ingestor;
mod reconciler;
mod supervisor;

#[cfg(test)]
mod tests;

pub use error::{RelayError, Result};
pub use gateway::PublishGateway;
pub use ingestor::MessageIngestor;
pub use reconciler::SubscriptionReconciler;
pub use supervisor::{ConnectionState, ConnectionSupervisor, SessionHandler};

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::watch;

use crate::config::BrokerConfig;
use crate::persistence::{
    InboundMessage, MessageQuery, MessageStore, Subscription, SubscriptionStore,
};
use crate::protocol::QoS;
use crate::transport::{ConnectOptions, Connector, Delivery};

/// Connection status as reported to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub state: ConnectionState,
}

/// Routes session callbacks to the reconciler and the ingestor.
///
/// Runs on the supervisor's callback task. The reconciler holds the
/// supervisor, so it is only referenced weakly from here; dropping the
/// [`Relay`] drops the supervisor, which stops the task and the session.
struct SessionCallbacks {
    reconciler: Weak<SubscriptionReconciler>,
    ingestor: Arc<MessageIngestor>,
}

#[async_trait]
impl SessionHandler for SessionCallbacks {
    async fn on_connect(&self, _reconnect: bool) {
        if let Some(reconciler) = self.reconciler.upgrade() {
            reconciler.resubscribe_all().await;
        }
    }

    async fn on_message(&self, delivery: Delivery) {
        self.ingestor.ingest(delivery).await;
    }
}

pub struct Relay {
    supervisor: Arc<ConnectionSupervisor>,
    reconciler: Arc<SubscriptionReconciler>,
    ingestor: Arc<MessageIngestor>,
    gateway: PublishGateway,
    subscriptions: Arc<dyn SubscriptionStore>,
    messages: Arc<dyn MessageStore>,
    default_qos: QoS,
}

impl Relay {
    /// Build the relay without touching the broker
    pub fn new(
        config: &BrokerConfig,
        connector: Arc<dyn Connector>,
        subscriptions: Arc<dyn SubscriptionStore>,
        messages: Arc<dyn MessageStore>,
    ) -> Result<Self> {
        let options = ConnectOptions::from_config(config)?;
        let supervisor = Arc::new(ConnectionSupervisor::new(connector, options));
        let reconciler = Arc::new(SubscriptionReconciler::new(
            subscriptions.clone(),
            supervisor.clone(),
        ));
        let ingestor = Arc::new(MessageIngestor::new(messages.clone()));
        let gateway = PublishGateway::new(supervisor.clone());

        Ok(Self {
            supervisor,
            reconciler,
            ingestor,
            gateway,
            subscriptions,
            messages,
            default_qos: config.default_qos(),
        })
    }

    /// Build the relay and connect. An unreachable broker is not an error.
    pub async fn start(
        config: &BrokerConfig,
        connector: Arc<dyn Connector>,
        subscriptions: Arc<dyn SubscriptionStore>,
        messages: Arc<dyn MessageStore>,
    ) -> Result<Self> {
        let relay = Self::new(config, connector, subscriptions, messages)?;
        relay.connect().await;
        Ok(relay)
    }

    /// (Re)connect to the broker; see [`ConnectionSupervisor::connect`]
    pub async fn connect(&self) -> bool {
        let handler = Arc::new(SessionCallbacks {
            reconciler: Arc::downgrade(&self.reconciler),
            ingestor: self.ingestor.clone(),
        });
        self.supervisor.connect(handler).await
    }

    pub async fn create_subscription(
        &self,
        topic_filter: impl Into<String>,
        qos: Option<QoS>,
        description: Option<String>,
    ) -> Result<Subscription> {
        self.reconciler
            .create(
                topic_filter.into(),
                qos.unwrap_or(self.default_qos),
                description,
            )
            .await
    }

    pub async fn update_subscription(
        &self,
        id: u64,
        qos: QoS,
        description: Option<String>,
    ) -> Result<Subscription> {
        self.reconciler.update(id, qos, description).await
    }

    pub async fn toggle_subscription(&self, id: u64, active: bool) -> Result<Subscription> {
        self.reconciler.toggle(id, active).await
    }

    pub async fn delete_subscription(&self, id: u64) -> Result<()> {
        self.reconciler.delete(id).await
    }

    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: Option<QoS>,
        retained: bool,
    ) -> Result<()> {
        self.gateway
            .publish(
                topic,
                payload.into(),
                qos.unwrap_or(self.default_qos),
                retained,
            )
            .await
    }

    pub fn get_status(&self) -> ConnectionStatus {
        ConnectionStatus {
            connected: self.supervisor.is_connected(),
            state: self.supervisor.state(),
        }
    }

    /// Follow connection state transitions
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.supervisor.watch_state()
    }

    pub async fn list_subscriptions(&self) -> Result<Vec<Subscription>> {
        Ok(self.subscriptions.list_subscriptions().await?)
    }

    pub async fn get_subscription(&self, id: u64) -> Result<Subscription> {
        self.subscriptions
            .get_subscription(id)
            .await?
            .ok_or(RelayError::NotFound(id))
    }

    pub async fn get_message(&self, id: u64) -> Result<InboundMessage> {
        self.messages
            .get_message(id)
            .await?
            .ok_or(RelayError::NotFound(id))
    }

    pub async fn search_messages(&self, query: &MessageQuery) -> Result<Vec<InboundMessage>> {
        Ok(self.messages.search_messages(query).await?)
    }

    pub async fn distinct_topics(&self) -> Result<Vec<String>> {
        Ok(self.messages.distinct_topics().await?)
    }

    /// Disconnect gracefully; the relay ends up `Disconnected`
    pub async fn shutdown(&self) {
        self.supervisor.disconnect().await;
    }
}
