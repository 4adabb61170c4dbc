//! Data models for persistence.
//!
//! The `Subscription` and `InboundMessage` rows are what the stores hand
//! out; the `Stored*` types are their storage-friendly versions that can be
//! serialized with bincode.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bincode::{Decode, Encode};
use bytes::Bytes;

use super::error::PersistenceError;
use crate::protocol::QoS;

/// Largest page a message search returns
pub const MAX_PAGE_SIZE: usize = 200;

/// Page size used when a query does not set one
pub const DEFAULT_PAGE_SIZE: usize = 50;

/// A desired broker subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub id: u64,
    /// Unique across all subscriptions
    pub topic_filter: String,
    pub qos: QoS,
    pub active: bool,
    pub description: Option<String>,
    pub created_at: SystemTime,
}

/// Fields supplied when creating a subscription; new rows start active
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSubscription {
    pub topic_filter: String,
    pub qos: QoS,
    pub description: Option<String>,
}

/// A row as it was before and after a mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionChange {
    pub before: Subscription,
    pub after: Subscription,
}

/// A message received from the broker. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub id: u64,
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retained: bool,
    pub received_at: SystemTime,
}

impl InboundMessage {
    /// Payload rendered as text, replacing invalid UTF-8
    pub fn payload_lossy(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// A delivery about to be appended to the message log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retained: bool,
}

/// Filter for browsing stored messages, newest first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageQuery {
    /// Case-insensitive substring of the topic
    pub topic: Option<String>,
    /// Inclusive lower bound on `received_at`
    pub from: Option<SystemTime>,
    /// Inclusive upper bound on `received_at`
    pub to: Option<SystemTime>,
    /// Page size, capped at `MAX_PAGE_SIZE`
    pub limit: usize,
    pub offset: usize,
}

impl Default for MessageQuery {
    fn default() -> Self {
        Self {
            topic: None,
            from: None,
            to: None,
            limit: DEFAULT_PAGE_SIZE,
            offset: 0,
        }
    }
}

impl MessageQuery {
    pub fn effective_limit(&self) -> usize {
        self.limit.min(MAX_PAGE_SIZE)
    }

    /// Whether a message passes the topic and time filters
    pub fn matches(&self, message: &InboundMessage) -> bool {
        if let Some(from) = self.from {
            if message.received_at < from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if message.received_at > to {
                return false;
            }
        }
        match &self.topic {
            Some(needle) => message
                .topic
                .to_lowercase()
                .contains(&needle.to_lowercase()),
            None => true,
        }
    }
}

/// Stored subscription row
#[derive(Debug, Clone, Encode, Decode)]
pub struct StoredSubscription {
    pub id: u64,
    pub topic_filter: String,
    pub qos: u8,
    pub active: bool,
    pub description: Option<String>,
    /// Unix timestamp in nanoseconds
    pub created_at_nanos: u64,
}

/// Stored inbound message row
#[derive(Debug, Clone, Encode, Decode)]
pub struct StoredMessage {
    pub id: u64,
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retained: bool,
    /// Unix timestamp in nanoseconds
    pub received_at_nanos: u64,
}

// ============================================================================
// Conversion implementations
// ============================================================================

pub(crate) fn to_unix_nanos(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}

pub(crate) fn from_unix_nanos(nanos: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_nanos(nanos)
}

fn decode_qos(qos: u8, what: &str, id: u64) -> Result<QoS, PersistenceError> {
    QoS::from_u8(qos).ok_or_else(|| {
        PersistenceError::Corruption(format!("{} {} has invalid qos {}", what, id, qos))
    })
}

impl From<&Subscription> for StoredSubscription {
    fn from(sub: &Subscription) -> Self {
        Self {
            id: sub.id,
            topic_filter: sub.topic_filter.clone(),
            qos: sub.qos.as_u8(),
            active: sub.active,
            description: sub.description.clone(),
            created_at_nanos: to_unix_nanos(sub.created_at),
        }
    }
}

impl TryFrom<StoredSubscription> for Subscription {
    type Error = PersistenceError;

    fn try_from(stored: StoredSubscription) -> Result<Self, Self::Error> {
        Ok(Self {
            id: stored.id,
            qos: decode_qos(stored.qos, "subscription", stored.id)?,
            topic_filter: stored.topic_filter,
            active: stored.active,
            description: stored.description,
            created_at: from_unix_nanos(stored.created_at_nanos),
        })
    }
}

impl From<&InboundMessage> for StoredMessage {
    fn from(msg: &InboundMessage) -> Self {
        Self {
            id: msg.id,
            topic: msg.topic.clone(),
            payload: msg.payload.to_vec(),
            qos: msg.qos.as_u8(),
            retained: msg.retained,
            received_at_nanos: to_unix_nanos(msg.received_at),
        }
    }
}

impl TryFrom<StoredMessage> for InboundMessage {
    type Error = PersistenceError;

    fn try_from(stored: StoredMessage) -> Result<Self, Self::Error> {
        Ok(Self {
            id: stored.id,
            qos: decode_qos(stored.qos, "message", stored.id)?,
            topic: stored.topic,
            payload: Bytes::from(stored.payload),
            retained: stored.retained,
            received_at: from_unix_nanos(stored.received_at_nanos),
        })
    }
}
