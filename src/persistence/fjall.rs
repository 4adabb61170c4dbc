//! Fjall-based storage backend implementation.
//!
//! Uses fjall (an LSM-tree based embedded database) for local persistence.
//!
//! Layout:
//! - `subscriptions`: id -> `StoredSubscription`
//! - `subscription_filters`: topic filter -> id (unique index)
//! - `messages`: id -> `StoredMessage`
//! - `messages_by_time`: received_at ++ id -> ()
//! - `messages_by_topic`: topic ++ 0x00 ++ id -> ()
//! - `meta`: id sequences
//!
//! Ids and timestamps are encoded big-endian so key order matches numeric
//! order. Each mutation runs under a writer lock and commits as one batch.

use std::path::Path;
use std::time::SystemTime;

use async_trait::async_trait;
use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use parking_lot::Mutex;

use super::backend::{MessageStore, StorageBackend, SubscriptionStore};
use super::error::{PersistenceError, Result};
use super::models::{
    to_unix_nanos, InboundMessage, MessageQuery, NewMessage, NewSubscription, StoredMessage,
    StoredSubscription, Subscription, SubscriptionChange,
};
use crate::protocol::QoS;

const SUBSCRIPTION_SEQ_KEY: &str = "seq:subscriptions";
const MESSAGE_SEQ_KEY: &str = "seq:messages";

fn id_key(id: u64) -> Vec<u8> {
    id.to_be_bytes().to_vec()
}

/// Fjall-based storage backend
pub struct FjallBackend {
    keyspace: Keyspace,
    subscriptions: PartitionHandle,
    subscription_filters: PartitionHandle,
    messages: PartitionHandle,
    messages_by_time: PartitionHandle,
    messages_by_topic: PartitionHandle,
    meta: PartitionHandle,
    /// Last assigned subscription id; also serializes subscription writes
    subscription_writer: Mutex<u64>,
    /// Last assigned message id; also serializes message appends
    message_writer: Mutex<u64>,
}

impl FjallBackend {
    /// Open a fjall backend at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let keyspace = Config::new(path).open()?;

        let subscriptions =
            keyspace.open_partition("subscriptions", PartitionCreateOptions::default())?;
        let subscription_filters =
            keyspace.open_partition("subscription_filters", PartitionCreateOptions::default())?;
        let messages = keyspace.open_partition("messages", PartitionCreateOptions::default())?;
        let messages_by_time =
            keyspace.open_partition("messages_by_time", PartitionCreateOptions::default())?;
        let messages_by_topic =
            keyspace.open_partition("messages_by_topic", PartitionCreateOptions::default())?;
        let meta = keyspace.open_partition("meta", PartitionCreateOptions::default())?;

        let last_subscription_id = Self::read_sequence(&meta, SUBSCRIPTION_SEQ_KEY)?;
        let last_message_id = Self::read_sequence(&meta, MESSAGE_SEQ_KEY)?;

        Ok(Self {
            keyspace,
            subscriptions,
            subscription_filters,
            messages,
            messages_by_time,
            messages_by_topic,
            meta,
            subscription_writer: Mutex::new(last_subscription_id),
            message_writer: Mutex::new(last_message_id),
        })
    }

    /// Serialize a value using bincode
    fn serialize<T: bincode::Encode>(value: &T) -> Result<Vec<u8>> {
        bincode::encode_to_vec(value, bincode::config::standard()).map_err(PersistenceError::from)
    }

    /// Deserialize a value using bincode
    fn deserialize<T: bincode::Decode<()>>(bytes: &[u8]) -> Result<T> {
        bincode::decode_from_slice(bytes, bincode::config::standard())
            .map(|(value, _)| value)
            .map_err(PersistenceError::from)
    }

    fn read_u64(bytes: &[u8]) -> Result<u64> {
        let array: [u8; 8] = bytes
            .try_into()
            .map_err(|_| PersistenceError::Corruption(format!("bad u64 of {} bytes", bytes.len())))?;
        Ok(u64::from_be_bytes(array))
    }

    fn read_sequence(meta: &PartitionHandle, key: &str) -> Result<u64> {
        match meta.get(key)? {
            Some(bytes) => Self::read_u64(&bytes),
            None => Ok(0),
        }
    }

    fn time_key(received_at_nanos: u64, id: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(16);
        key.extend_from_slice(&received_at_nanos.to_be_bytes());
        key.extend_from_slice(&id_key(id));
        key
    }

    fn topic_key(topic: &str, id: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(topic.len() + 9);
        key.extend_from_slice(topic.as_bytes());
        key.push(0);
        key.extend_from_slice(&id_key(id));
        key
    }

    fn load_subscription(&self, id: u64) -> Result<Option<Subscription>> {
        match self.subscriptions.get(id_key(id))? {
            Some(bytes) => {
                let stored: StoredSubscription = Self::deserialize(&bytes)?;
                Ok(Some(Subscription::try_from(stored)?))
            }
            None => Ok(None),
        }
    }

    fn load_message(&self, id: u64) -> Result<Option<InboundMessage>> {
        match self.messages.get(id_key(id))? {
            Some(bytes) => {
                let stored: StoredMessage = Self::deserialize(&bytes)?;
                Ok(Some(InboundMessage::try_from(stored)?))
            }
            None => Ok(None),
        }
    }

    fn scan_subscriptions(&self, only_active: bool) -> Result<Vec<Subscription>> {
        let mut result = Vec::new();
        for item in self.subscriptions.iter() {
            let (_, value) = item?;
            let stored: StoredSubscription = Self::deserialize(&value)?;
            if only_active && !stored.active {
                continue;
            }
            result.push(Subscription::try_from(stored)?);
        }
        Ok(result)
    }

    /// Apply `mutate` to an existing row and write it back
    fn modify_subscription<F>(&self, id: u64, mutate: F) -> Result<Option<SubscriptionChange>>
    where
        F: FnOnce(&mut Subscription),
    {
        let _writer = self.subscription_writer.lock();

        let Some(before) = self.load_subscription(id)? else {
            return Ok(None);
        };
        let mut after = before.clone();
        mutate(&mut after);

        let bytes = Self::serialize(&StoredSubscription::from(&after))?;
        self.subscriptions.insert(id_key(id), bytes)?;

        Ok(Some(SubscriptionChange { before, after }))
    }
}

#[async_trait]
impl SubscriptionStore for FjallBackend {
    async fn insert_subscription(&self, new: NewSubscription) -> Result<Subscription> {
        let mut last_id = self.subscription_writer.lock();

        if self
            .subscription_filters
            .contains_key(new.topic_filter.as_bytes())?
        {
            return Err(PersistenceError::Conflict(format!(
                "subscription already exists for topic: {}",
                new.topic_filter
            )));
        }

        let id = *last_id + 1;
        let subscription = Subscription {
            id,
            topic_filter: new.topic_filter,
            qos: new.qos,
            active: true,
            description: new.description,
            created_at: SystemTime::now(),
        };
        let bytes = Self::serialize(&StoredSubscription::from(&subscription))?;

        let mut batch = self.keyspace.batch();
        batch.insert(&self.subscriptions, id_key(id), bytes);
        batch.insert(
            &self.subscription_filters,
            subscription.topic_filter.as_bytes(),
            id_key(id),
        );
        batch.insert(&self.meta, SUBSCRIPTION_SEQ_KEY, id_key(id));
        batch.commit()?;

        *last_id = id;
        Ok(subscription)
    }

    async fn get_subscription(&self, id: u64) -> Result<Option<Subscription>> {
        self.load_subscription(id)
    }

    async fn list_subscriptions(&self) -> Result<Vec<Subscription>> {
        self.scan_subscriptions(false)
    }

    async fn list_active_subscriptions(&self) -> Result<Vec<Subscription>> {
        self.scan_subscriptions(true)
    }

    async fn update_subscription(
        &self,
        id: u64,
        qos: QoS,
        description: Option<String>,
    ) -> Result<Option<SubscriptionChange>> {
        self.modify_subscription(id, |sub| {
            sub.qos = qos;
            sub.description = description;
        })
    }

    async fn set_subscription_active(
        &self,
        id: u64,
        active: bool,
    ) -> Result<Option<SubscriptionChange>> {
        self.modify_subscription(id, |sub| sub.active = active)
    }

    async fn delete_subscription(&self, id: u64) -> Result<Option<Subscription>> {
        let _writer = self.subscription_writer.lock();

        let Some(existing) = self.load_subscription(id)? else {
            return Ok(None);
        };

        let mut batch = self.keyspace.batch();
        batch.remove(&self.subscriptions, id_key(id));
        batch.remove(
            &self.subscription_filters,
            existing.topic_filter.as_bytes(),
        );
        batch.commit()?;

        Ok(Some(existing))
    }
}

#[async_trait]
impl MessageStore for FjallBackend {
    async fn append_message(&self, new: NewMessage) -> Result<InboundMessage> {
        let mut last_id = self.message_writer.lock();

        let id = *last_id + 1;
        let message = InboundMessage {
            id,
            topic: new.topic,
            payload: new.payload,
            qos: new.qos,
            retained: new.retained,
            received_at: SystemTime::now(),
        };
        let stored = StoredMessage::from(&message);
        let bytes = Self::serialize(&stored)?;

        let mut batch = self.keyspace.batch();
        batch.insert(&self.messages, id_key(id), bytes);
        batch.insert(
            &self.messages_by_time,
            Self::time_key(stored.received_at_nanos, id),
            Vec::new(),
        );
        batch.insert(
            &self.messages_by_topic,
            Self::topic_key(&message.topic, id),
            Vec::new(),
        );
        batch.insert(&self.meta, MESSAGE_SEQ_KEY, id_key(id));
        batch.commit()?;

        *last_id = id;
        Ok(message)
    }

    async fn get_message(&self, id: u64) -> Result<Option<InboundMessage>> {
        self.load_message(id)
    }

    async fn search_messages(&self, query: &MessageQuery) -> Result<Vec<InboundMessage>> {
        let limit = query.effective_limit();
        let mut result = Vec::with_capacity(limit);
        if limit == 0 {
            return Ok(result);
        }

        let start = Self::time_key(query.from.map(to_unix_nanos).unwrap_or(0), 0);
        let end = Self::time_key(query.to.map(to_unix_nanos).unwrap_or(u64::MAX), u64::MAX);

        let mut skipped = 0;
        for item in self.messages_by_time.range(start..=end).rev() {
            let (key, _) = item?;
            if key.len() != 16 {
                return Err(PersistenceError::Corruption(
                    "malformed message time index key".to_string(),
                ));
            }
            let id = Self::read_u64(&key[8..])?;
            let Some(message) = self.load_message(id)? else {
                return Err(PersistenceError::Corruption(format!(
                    "time index references missing message {}",
                    id
                )));
            };

            if !query.matches(&message) {
                continue;
            }
            if skipped < query.offset {
                skipped += 1;
                continue;
            }
            result.push(message);
            if result.len() >= limit {
                break;
            }
        }

        Ok(result)
    }

    async fn distinct_topics(&self) -> Result<Vec<String>> {
        let mut topics: Vec<String> = Vec::new();
        for item in self.messages_by_topic.iter() {
            let (key, _) = item?;
            if key.len() < 9 {
                return Err(PersistenceError::Corruption(
                    "malformed message topic index key".to_string(),
                ));
            }
            let topic = String::from_utf8_lossy(&key[..key.len() - 9]);
            if topics.last().map(String::as_str) != Some(topic.as_ref()) {
                topics.push(topic.into_owned());
            }
        }
        Ok(topics)
    }

    async fn message_count(&self) -> Result<u64> {
        Ok(self.messages.len()? as u64)
    }
}

#[async_trait]
impl StorageBackend for FjallBackend {
    async fn flush(&self) -> Result<()> {
        self.keyspace.persist(PersistMode::SyncAll)?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // Flush before closing
        self.flush().await?;
        // fjall handles cleanup on drop
        Ok(())
    }
}
