//! Message ingestor: every delivery becomes one row in the message log.

use std::sync::Arc;

use tracing::{debug, error};

use crate::persistence::{InboundMessage, MessageStore, NewMessage};
use crate::transport::Delivery;

pub struct MessageIngestor {
    store: Arc<dyn MessageStore>,
}

impl MessageIngestor {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self { store }
    }

    /// Store a delivery as reported by the transport.
    ///
    /// Store failures are logged and the message is dropped; `None` is
    /// returned in that case.
    pub async fn ingest(&self, delivery: Delivery) -> Option<InboundMessage> {
        let topic = delivery.topic.clone();
        let new = NewMessage {
            topic: delivery.topic,
            payload: delivery.payload,
            qos: delivery.qos,
            retained: delivery.retained,
        };

        match self.store.append_message(new).await {
            Ok(stored) => {
                debug!(
                    "Stored message {} on {} ({} bytes, qos {}, retained={})",
                    stored.id,
                    stored.topic,
                    stored.payload.len(),
                    stored.qos,
                    stored.retained
                );
                Some(stored)
            }
            Err(e) => {
                error!("Dropping message on {}: {}", topic, e);
                None
            }
        }
    }
}
