//! Publish gateway: outbound publishes, only over a live session.

use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use super::error::{RelayError, Result};
use super::supervisor::ConnectionSupervisor;
use crate::protocol::QoS;
use crate::topic::validate_topic_name;

pub struct PublishGateway {
    supervisor: Arc<ConnectionSupervisor>,
}

impl PublishGateway {
    pub fn new(supervisor: Arc<ConnectionSupervisor>) -> Self {
        Self { supervisor }
    }

    /// Hand a message to the transport. Fails with `NotConnected` right away
    /// when there is no session; nothing is queued or retried.
    pub async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retained: bool,
    ) -> Result<()> {
        if !self.supervisor.is_connected() {
            return Err(RelayError::NotConnected);
        }
        validate_topic_name(topic).map_err(RelayError::Validation)?;

        let size = payload.len();
        self.supervisor.publish(topic, payload, qos, retained).await?;
        debug!(
            "Published {} bytes to {} (qos {}, retain={})",
            size, topic, qos, retained
        );
        Ok(())
    }
}
