//! Relay Module Tests
//!
//! The broker is replaced by a recording fake so every broker call can be
//! asserted in order.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;

use super::*;
use crate::persistence::{
    MemoryBackend, NewMessage, NewSubscription, PersistenceError, StorageBackend,
};
use crate::transport::{EventSender, Transport, TransportError, TransportEvent};

// =============================================================================
// Recording fake broker
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    Subscribe(String, QoS),
    Unsubscribe(String),
    Publish(String, Bytes, QoS, bool),
    Disconnect,
}

fn sub(filter: &str, qos: QoS) -> Call {
    Call::Subscribe(filter.to_string(), qos)
}

fn unsub(filter: &str) -> Call {
    Call::Unsubscribe(filter.to_string())
}

#[derive(Default)]
struct FakeBroker {
    calls: Mutex<Vec<Call>>,
    open: AtomicBool,
    refuse: AtomicBool,
    /// Accept the connection but never answer it
    silent: AtomicBool,
    /// `disconnect` never completes
    stall_disconnect: AtomicBool,
    failing: Mutex<HashSet<String>>,
    events: Mutex<Option<EventSender>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeBroker {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    fn take_calls(&self) -> Vec<Call> {
        std::mem::take(&mut *self.calls.lock())
    }

    fn fail_on(&self, filter: &str) {
        self.failing.lock().insert(filter.to_string());
    }

    fn send(&self, event: TransportEvent) {
        if let Some(events) = self.events.lock().as_ref() {
            let _ = events.send(event);
        }
    }

    fn drop_connection(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.send(TransportEvent::ConnectionLost {
            cause: "connection reset by peer".to_string(),
        });
    }

    fn retry(&self) {
        self.send(TransportEvent::Reconnecting);
    }

    fn reconnect(&self) {
        self.open.store(true, Ordering::SeqCst);
        self.send(TransportEvent::ConnectComplete {
            reconnect: true,
            server_uri: "tcp://fake:1883".to_string(),
        });
    }

    fn deliver(&self, topic: &str, payload: &'static [u8], qos: QoS, retained: bool) {
        self.send(TransportEvent::MessageArrived(Delivery {
            topic: topic.to_string(),
            payload: Bytes::from_static(payload),
            qos,
            retained,
        }));
    }

    async fn record(&self, call: Call) -> std::result::Result<(), TransportError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(1)).await;

        let refused = match &call {
            Call::Subscribe(filter, _) | Call::Unsubscribe(filter) => {
                self.failing.lock().contains(filter)
            }
            _ => false,
        };
        self.calls.lock().push(call);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if refused {
            Err(TransportError::Client("refused by fake".to_string()))
        } else {
            Ok(())
        }
    }
}

struct FakeConnector(Arc<FakeBroker>);

#[async_trait]
impl Connector for FakeConnector {
    async fn open(
        &self,
        options: &ConnectOptions,
        events: EventSender,
    ) -> std::result::Result<Arc<dyn Transport>, TransportError> {
        let broker = self.0.clone();
        *broker.events.lock() = Some(events.clone());

        if broker.silent.load(Ordering::SeqCst) {
            // no outcome ever arrives
        } else if broker.refuse.load(Ordering::SeqCst) {
            let _ = events.send(TransportEvent::ConnectionLost {
                cause: "connection refused".to_string(),
            });
        } else {
            broker.open.store(true, Ordering::SeqCst);
            let _ = events.send(TransportEvent::ConnectComplete {
                reconnect: false,
                server_uri: options.server_uri(),
            });
        }
        Ok(Arc::new(FakeTransport(broker)))
    }
}

struct FakeTransport(Arc<FakeBroker>);

#[async_trait]
impl Transport for FakeTransport {
    async fn subscribe(&self, filter: &str, qos: QoS) -> std::result::Result<(), TransportError> {
        self.0.record(Call::Subscribe(filter.to_string(), qos)).await
    }

    async fn unsubscribe(&self, filter: &str) -> std::result::Result<(), TransportError> {
        self.0.record(Call::Unsubscribe(filter.to_string())).await
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retained: bool,
    ) -> std::result::Result<(), TransportError> {
        self.0
            .record(Call::Publish(topic.to_string(), payload, qos, retained))
            .await
    }

    async fn disconnect(&self) -> std::result::Result<(), TransportError> {
        if self.0.stall_disconnect.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.0.open.store(false, Ordering::SeqCst);
        self.0.record(Call::Disconnect).await
    }

    fn is_session_open(&self) -> bool {
        self.0.open.load(Ordering::SeqCst)
    }
}

/// Message store whose first append fails
#[derive(Default)]
struct FlakyMessages {
    inner: MemoryBackend,
    failed: AtomicBool,
}

#[async_trait]
impl MessageStore for FlakyMessages {
    async fn append_message(
        &self,
        new: NewMessage,
    ) -> std::result::Result<InboundMessage, PersistenceError> {
        if !self.failed.swap(true, Ordering::SeqCst) {
            return Err(PersistenceError::Storage("disk full".to_string()));
        }
        self.inner.append_message(new).await
    }

    async fn get_message(
        &self,
        id: u64,
    ) -> std::result::Result<Option<InboundMessage>, PersistenceError> {
        self.inner.get_message(id).await
    }

    async fn search_messages(
        &self,
        query: &MessageQuery,
    ) -> std::result::Result<Vec<InboundMessage>, PersistenceError> {
        self.inner.search_messages(query).await
    }

    async fn distinct_topics(&self) -> std::result::Result<Vec<String>, PersistenceError> {
        self.inner.distinct_topics().await
    }

    async fn message_count(&self) -> std::result::Result<u64, PersistenceError> {
        self.inner.message_count().await
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn broker_config() -> BrokerConfig {
    BrokerConfig {
        url: "tcp://fake:1883".to_string(),
        client_id: "relaymq-test".to_string(),
        connection_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

fn relay_with(broker: &Arc<FakeBroker>) -> (Relay, Arc<MemoryBackend>) {
    relay_with_config(broker, broker_config())
}

fn relay_with_config(
    broker: &Arc<FakeBroker>,
    config: BrokerConfig,
) -> (Relay, Arc<MemoryBackend>) {
    let store = Arc::new(MemoryBackend::new());
    let relay = Relay::new(
        &config,
        Arc::new(FakeConnector(broker.clone())),
        store.clone(),
        store.clone(),
    )
    .unwrap();
    (relay, store)
}

async fn eventually<F: Fn() -> bool>(condition: F) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

async fn wait_for_messages(store: &dyn StorageBackend, count: u64) {
    for _ in 0..400 {
        if store.message_count().await.unwrap() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("expected {} stored messages", count);
}

async fn seed(store: &MemoryBackend, filter: &str, qos: QoS, active: bool) -> u64 {
    let row = store
        .insert_subscription(NewSubscription {
            topic_filter: filter.to_string(),
            qos,
            description: None,
        })
        .await
        .unwrap();
    if !active {
        store.set_subscription_active(row.id, false).await.unwrap();
    }
    row.id
}

// =============================================================================
// Connection supervisor
// =============================================================================

#[tokio::test]
async fn test_connect_resubscribes_each_active_row_once() {
    let broker = FakeBroker::new();
    let (relay, store) = relay_with(&broker);
    seed(&store, "sensors/+/temp", QoS::AtLeastOnce, true).await;
    seed(&store, "alerts/#", QoS::ExactlyOnce, true).await;
    seed(&store, "debug/#", QoS::AtMostOnce, false).await;

    assert!(relay.connect().await);

    assert_eq!(
        broker.calls(),
        vec![
            sub("sensors/+/temp", QoS::AtLeastOnce),
            sub("alerts/#", QoS::ExactlyOnce),
        ]
    );
    assert_eq!(
        relay.get_status(),
        ConnectionStatus {
            connected: true,
            state: ConnectionState::Connected,
        }
    );
}

#[tokio::test]
async fn test_refused_connect_does_not_fail_startup() {
    let broker = FakeBroker::new();
    broker.refuse.store(true, Ordering::SeqCst);
    let store = Arc::new(MemoryBackend::new());
    seed(&store, "a/b", QoS::AtLeastOnce, true).await;

    let relay = Relay::start(
        &broker_config(),
        Arc::new(FakeConnector(broker.clone())),
        store.clone(),
        store.clone(),
    )
    .await
    .unwrap();

    let status = relay.get_status();
    assert!(!status.connected);
    assert_eq!(status.state, ConnectionState::Disconnected);
    assert!(broker.calls().is_empty());
}

#[tokio::test]
async fn test_reconnect_replays_full_subscription_set() {
    let broker = FakeBroker::new();
    let (relay, store) = relay_with(&broker);
    seed(&store, "a/#", QoS::AtLeastOnce, true).await;
    seed(&store, "b/+", QoS::AtMostOnce, true).await;

    assert!(relay.connect().await);
    broker.take_calls();

    broker.drop_connection();
    eventually(|| relay.get_status().state == ConnectionState::Disconnected).await;
    assert!(!relay.get_status().connected);

    broker.reconnect();
    eventually(|| broker.calls().len() == 2).await;
    assert_eq!(
        broker.calls(),
        vec![sub("a/#", QoS::AtLeastOnce), sub("b/+", QoS::AtMostOnce)]
    );
    assert!(relay.get_status().connected);
}

#[tokio::test]
async fn test_resubscribe_skips_failed_topics() {
    let broker = FakeBroker::new();
    broker.fail_on("bad/topic");
    let (relay, store) = relay_with(&broker);
    seed(&store, "bad/topic", QoS::AtLeastOnce, true).await;
    seed(&store, "good/topic", QoS::AtLeastOnce, true).await;

    assert!(relay.connect().await);

    assert_eq!(
        broker.calls(),
        vec![
            sub("bad/topic", QoS::AtLeastOnce),
            sub("good/topic", QoS::AtLeastOnce),
        ]
    );
}

#[tokio::test]
async fn test_is_connected_requires_open_transport_session() {
    let broker = FakeBroker::new();
    let (relay, _store) = relay_with(&broker);
    assert!(relay.connect().await);

    // session gone without a callback yet
    broker.open.store(false, Ordering::SeqCst);

    let status = relay.get_status();
    assert_eq!(status.state, ConnectionState::Connected);
    assert!(!status.connected);
    assert!(matches!(
        relay.publish("a/b", "x", None, false).await,
        Err(RelayError::NotConnected)
    ));
}

#[tokio::test]
async fn test_shutdown_disconnects_gracefully() {
    let broker = FakeBroker::new();
    let (relay, _store) = relay_with(&broker);
    assert!(relay.connect().await);

    relay.shutdown().await;

    assert_eq!(broker.calls(), vec![Call::Disconnect]);
    assert_eq!(relay.get_status().state, ConnectionState::Disconnected);

    // nothing left to close
    relay.shutdown().await;
    assert_eq!(broker.calls(), vec![Call::Disconnect]);
}

#[tokio::test]
async fn test_shutdown_while_disconnected_makes_no_broker_call() {
    let broker = FakeBroker::new();
    broker.refuse.store(true, Ordering::SeqCst);
    let (relay, _store) = relay_with(&broker);
    assert!(!relay.connect().await);

    relay.shutdown().await;

    assert!(broker.calls().is_empty());
    assert_eq!(relay.get_status().state, ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_watch_state_sees_transitions() {
    let broker = FakeBroker::new();
    let (relay, _store) = relay_with(&broker);
    let mut state = relay.watch_state();
    assert_eq!(*state.borrow(), ConnectionState::Disconnected);

    assert!(relay.connect().await);
    assert_eq!(*state.borrow_and_update(), ConnectionState::Connected);

    broker.drop_connection();
    let lost = state
        .wait_for(|s| *s == ConnectionState::Disconnected)
        .await
        .unwrap();
    assert_eq!(*lost, ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_automatic_reconnect_passes_through_connecting() {
    let broker = FakeBroker::new();
    let (relay, store) = relay_with(&broker);
    seed(&store, "plant/+/status", QoS::AtLeastOnce, true).await;
    assert!(relay.connect().await);
    broker.take_calls();

    let mut state = relay.watch_state();
    let mut seen = Vec::new();

    broker.drop_connection();
    seen.push(*state.wait_for(|s| *s == ConnectionState::Disconnected).await.unwrap());
    broker.retry();
    seen.push(*state.wait_for(|s| *s == ConnectionState::Connecting).await.unwrap());
    broker.reconnect();
    seen.push(*state.wait_for(|s| *s == ConnectionState::Connected).await.unwrap());

    assert_eq!(
        seen,
        vec![
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            ConnectionState::Connected,
        ]
    );
    eventually(|| broker.calls().len() == 1).await;
    assert_eq!(broker.calls(), vec![sub("plant/+/status", QoS::AtLeastOnce)]);
}

#[tokio::test]
async fn test_retry_while_connected_keeps_state() {
    let broker = FakeBroker::new();
    let (relay, store) = relay_with(&broker);
    assert!(relay.connect().await);

    broker.retry();
    // events are applied in order, so the retry was seen once this is stored
    broker.deliver("x/y", b"1", QoS::AtMostOnce, false);
    wait_for_messages(store.as_ref(), 1).await;

    assert_eq!(relay.get_status().state, ConnectionState::Connected);
}

#[tokio::test]
async fn test_dropping_relay_releases_session() {
    let broker = FakeBroker::new();
    let (relay, _store) = relay_with(&broker);
    assert!(relay.connect().await);
    assert!(Arc::strong_count(&broker) > 1);

    drop(relay);

    eventually(|| Arc::strong_count(&broker) == 1).await;
    eventually(|| {
        broker
            .events
            .lock()
            .as_ref()
            .is_some_and(|events| events.is_closed())
    })
    .await;
}

#[tokio::test]
async fn test_connect_gives_up_when_broker_never_answers() {
    let broker = FakeBroker::new();
    broker.silent.store(true, Ordering::SeqCst);
    let (relay, _store) = relay_with_config(
        &broker,
        BrokerConfig {
            connection_timeout: Duration::from_millis(200),
            ..broker_config()
        },
    );

    let started = tokio::time::Instant::now();
    let connected = tokio::time::timeout(Duration::from_secs(2), relay.connect())
        .await
        .expect("connect must return within the connection timeout");

    assert!(!connected);
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert_eq!(
        relay.get_status(),
        ConnectionStatus {
            connected: false,
            state: ConnectionState::Disconnected,
        }
    );
    assert!(broker.calls().is_empty());
}

#[tokio::test]
async fn test_shutdown_returns_when_disconnect_hangs() {
    let broker = FakeBroker::new();
    broker.stall_disconnect.store(true, Ordering::SeqCst);
    let (relay, _store) = relay_with_config(
        &broker,
        BrokerConfig {
            connection_timeout: Duration::from_millis(200),
            ..broker_config()
        },
    );
    assert!(relay.connect().await);

    tokio::time::timeout(Duration::from_secs(2), relay.shutdown())
        .await
        .expect("shutdown must return within the connection timeout");

    assert_eq!(relay.get_status().state, ConnectionState::Disconnected);
    assert!(!relay.get_status().connected);
}

// =============================================================================
// Subscription reconciler
// =============================================================================

#[tokio::test]
async fn test_create_when_connected_subscribes_once() {
    let broker = FakeBroker::new();
    let (relay, _store) = relay_with(&broker);
    assert!(relay.connect().await);

    let created = relay
        .create_subscription(
            "alerts/#",
            Some(QoS::ExactlyOnce),
            Some("critical alerts".to_string()),
        )
        .await
        .unwrap();

    assert!(created.active);
    assert_eq!(created.description.as_deref(), Some("critical alerts"));
    assert_eq!(relay.list_subscriptions().await.unwrap(), vec![created]);
    assert_eq!(broker.calls(), vec![sub("alerts/#", QoS::ExactlyOnce)]);
}

#[tokio::test]
async fn test_create_duplicate_is_conflict_and_store_unchanged() {
    let broker = FakeBroker::new();
    let (relay, _store) = relay_with(&broker);
    assert!(relay.connect().await);

    let first = relay
        .create_subscription("alerts/#", Some(QoS::AtLeastOnce), None)
        .await
        .unwrap();
    broker.take_calls();

    let second = relay
        .create_subscription("alerts/#", Some(QoS::ExactlyOnce), Some("dup".to_string()))
        .await;
    assert!(matches!(second, Err(RelayError::Conflict(_))));

    assert_eq!(relay.list_subscriptions().await.unwrap(), vec![first]);
    assert!(broker.calls().is_empty());
}

#[tokio::test]
async fn test_create_while_disconnected_is_picked_up_on_connect() {
    let broker = FakeBroker::new();
    let (relay, _store) = relay_with(&broker);

    let created = relay
        .create_subscription("late/#", None, None)
        .await
        .unwrap();
    // default_qos from the broker config
    assert_eq!(created.qos, QoS::AtLeastOnce);
    assert!(broker.calls().is_empty());

    assert!(relay.connect().await);
    assert_eq!(broker.calls(), vec![sub("late/#", QoS::AtLeastOnce)]);
}

#[tokio::test]
async fn test_create_rejects_invalid_input_without_writing() {
    let broker = FakeBroker::new();
    let (relay, _store) = relay_with(&broker);

    let bad_filter = relay.create_subscription("a/#/b", None, None).await;
    assert!(matches!(bad_filter, Err(RelayError::Validation(_))));

    let long = "x".repeat(256);
    let bad_description = relay.create_subscription("a/b", None, Some(long)).await;
    assert!(matches!(bad_description, Err(RelayError::Validation(_))));

    assert!(relay.list_subscriptions().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_toggle_off_then_on_orders_broker_calls() {
    let broker = FakeBroker::new();
    let (relay, _store) = relay_with(&broker);
    assert!(relay.connect().await);
    let created = relay
        .create_subscription("sensors/#", Some(QoS::AtLeastOnce), None)
        .await
        .unwrap();
    broker.take_calls();

    let off = relay.toggle_subscription(created.id, false).await.unwrap();
    assert!(!off.active);
    let on = relay.toggle_subscription(created.id, true).await.unwrap();
    assert!(on.active);

    assert_eq!(
        broker.calls(),
        vec![unsub("sensors/#"), sub("sensors/#", QoS::AtLeastOnce)]
    );
}

#[tokio::test]
async fn test_toggle_while_disconnected_only_touches_store() {
    let broker = FakeBroker::new();
    let (relay, store) = relay_with(&broker);
    let id = seed(&store, "a/b", QoS::AtLeastOnce, true).await;

    let toggled = relay.toggle_subscription(id, false).await.unwrap();
    assert!(!toggled.active);
    assert!(broker.calls().is_empty());

    // inactive rows are not replayed
    assert!(relay.connect().await);
    assert!(broker.calls().is_empty());
}

#[tokio::test]
async fn test_toggle_unknown_is_not_found() {
    let broker = FakeBroker::new();
    let (relay, _store) = relay_with(&broker);
    assert!(relay.connect().await);

    let result = relay.toggle_subscription(42, true).await;
    assert!(matches!(result, Err(RelayError::NotFound(42))));
    assert!(broker.calls().is_empty());
}

#[tokio::test]
async fn test_qos_update_unsubscribes_before_subscribe() {
    let broker = FakeBroker::new();
    let (relay, _store) = relay_with(&broker);
    assert!(relay.connect().await);
    let created = relay
        .create_subscription("plant/+/level", Some(QoS::AtMostOnce), None)
        .await
        .unwrap();
    broker.take_calls();

    let updated = relay
        .update_subscription(created.id, QoS::ExactlyOnce, Some("tanks".to_string()))
        .await
        .unwrap();
    assert_eq!(updated.qos, QoS::ExactlyOnce);
    assert_eq!(updated.description.as_deref(), Some("tanks"));

    assert_eq!(
        broker.calls(),
        vec![
            unsub("plant/+/level"),
            sub("plant/+/level", QoS::ExactlyOnce),
        ]
    );
}

#[tokio::test]
async fn test_update_without_qos_change_makes_no_broker_call() {
    let broker = FakeBroker::new();
    let (relay, store) = relay_with(&broker);
    let active = seed(&store, "a/b", QoS::AtLeastOnce, true).await;
    let inactive = seed(&store, "c/d", QoS::AtLeastOnce, false).await;
    assert!(relay.connect().await);
    broker.take_calls();

    relay
        .update_subscription(active, QoS::AtLeastOnce, Some("same qos".to_string()))
        .await
        .unwrap();
    relay
        .update_subscription(inactive, QoS::ExactlyOnce, None)
        .await
        .unwrap();

    assert!(broker.calls().is_empty());
    assert!(matches!(
        relay.update_subscription(999, QoS::AtMostOnce, None).await,
        Err(RelayError::NotFound(999))
    ));
}

#[tokio::test]
async fn test_delete_unsubscribes_then_removes() {
    let broker = FakeBroker::new();
    let (relay, _store) = relay_with(&broker);
    assert!(relay.connect().await);
    let created = relay
        .create_subscription("tmp/#", Some(QoS::AtLeastOnce), None)
        .await
        .unwrap();
    broker.take_calls();

    relay.delete_subscription(created.id).await.unwrap();

    assert_eq!(broker.calls(), vec![unsub("tmp/#")]);
    assert!(matches!(
        relay.get_subscription(created.id).await,
        Err(RelayError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_delete_ignores_unsubscribe_failure() {
    let broker = FakeBroker::new();
    broker.fail_on("stuck/#");
    let (relay, store) = relay_with(&broker);
    let id = seed(&store, "stuck/#", QoS::AtLeastOnce, false).await;
    assert!(relay.connect().await);

    relay.delete_subscription(id).await.unwrap();

    assert_eq!(broker.calls(), vec![unsub("stuck/#")]);
    assert!(relay.list_subscriptions().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_delete_unknown_is_not_found_without_broker_calls() {
    let broker = FakeBroker::new();
    let (relay, _store) = relay_with(&broker);
    assert!(relay.connect().await);

    let result = relay.delete_subscription(999).await;

    assert!(matches!(result, Err(RelayError::NotFound(999))));
    assert!(broker.calls().is_empty());
}

#[tokio::test]
async fn test_concurrent_mutations_never_overlap_broker_calls() {
    let broker = FakeBroker::new();
    let (relay, _store) = relay_with(&broker);
    let relay = Arc::new(relay);
    assert!(relay.connect().await);

    let mut ids = Vec::new();
    for i in 0..4 {
        let created = relay
            .create_subscription(format!("load/{}", i), None, None)
            .await
            .unwrap();
        ids.push(created.id);
    }

    let mut handles = Vec::new();
    for id in ids {
        let relay = relay.clone();
        handles.push(tokio::spawn(async move {
            relay.toggle_subscription(id, false).await.unwrap();
            relay.toggle_subscription(id, true).await.unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(broker.max_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(broker.calls().len(), 4 + 8);
}

#[tokio::test]
async fn test_concurrent_creates_of_same_filter_conflict() {
    let broker = FakeBroker::new();
    let (relay, _store) = relay_with(&broker);
    let relay = Arc::new(relay);

    let mut handles = Vec::new();
    for _ in 0..6 {
        let relay = relay.clone();
        handles.push(tokio::spawn(async move {
            relay.create_subscription("race/#", None, None).await
        }));
    }

    let mut created = 0;
    let mut conflicts = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => created += 1,
            Err(RelayError::Conflict(_)) => conflicts += 1,
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    assert_eq!((created, conflicts), (1, 5));
}

// =============================================================================
// Ingestor and gateway
// =============================================================================

#[tokio::test]
async fn test_message_arrived_is_stored_as_delivered() {
    let broker = FakeBroker::new();
    let (relay, store) = relay_with(&broker);
    assert!(relay.connect().await);

    let before = SystemTime::now();
    broker.deliver("sensors/room1/temp", b"21.5", QoS::AtLeastOnce, false);
    wait_for_messages(store.as_ref(), 1).await;

    let stored = relay.get_message(1).await.unwrap();
    assert_eq!(stored.topic, "sensors/room1/temp");
    assert_eq!(stored.payload, Bytes::from_static(b"21.5"));
    assert_eq!(stored.qos, QoS::AtLeastOnce);
    assert!(!stored.retained);
    assert!(stored.received_at >= before);
    assert_eq!(store.message_count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_duplicate_deliveries_are_not_deduplicated() {
    let broker = FakeBroker::new();
    let (relay, store) = relay_with(&broker);
    assert!(relay.connect().await);

    broker.deliver("status", b"up", QoS::AtMostOnce, true);
    broker.deliver("status", b"up", QoS::AtMostOnce, true);
    wait_for_messages(store.as_ref(), 2).await;

    let all = relay.search_messages(&MessageQuery::default()).await.unwrap();
    assert_eq!(all.len(), 2);
    assert!(all.iter().all(|m| m.retained));
    assert_eq!(relay.distinct_topics().await.unwrap(), vec!["status".to_string()]);
}

#[tokio::test]
async fn test_store_failure_drops_message_and_keeps_session() {
    let broker = FakeBroker::new();
    let subscriptions = Arc::new(MemoryBackend::new());
    let messages = Arc::new(FlakyMessages::default());
    let relay = Relay::new(
        &broker_config(),
        Arc::new(FakeConnector(broker.clone())),
        subscriptions,
        messages.clone(),
    )
    .unwrap();
    assert!(relay.connect().await);

    broker.deliver("a", b"lost", QoS::AtMostOnce, false);
    broker.deliver("b", b"kept", QoS::AtMostOnce, false);
    wait_for_messages(&messages.inner, 1).await;

    let kept = relay.get_message(1).await.unwrap();
    assert_eq!(kept.topic, "b");
    assert!(relay.get_status().connected);
}

#[tokio::test]
async fn test_publish_while_disconnected_never_reaches_transport() {
    let broker = FakeBroker::new();
    let (relay, _store) = relay_with(&broker);

    let result = relay.publish("a/b", "hello", Some(QoS::AtLeastOnce), false).await;
    assert!(matches!(result, Err(RelayError::NotConnected)));

    assert!(relay.connect().await);
    broker.drop_connection();
    eventually(|| relay.get_status().state == ConnectionState::Disconnected).await;

    let result = relay.publish("a/b", "hello", None, false).await;
    assert!(matches!(result, Err(RelayError::NotConnected)));
    assert!(broker.calls().is_empty());
}

#[tokio::test]
async fn test_publish_forwards_when_connected() {
    let broker = FakeBroker::new();
    let (relay, _store) = relay_with(&broker);
    assert!(relay.connect().await);

    relay
        .publish("cmd/pump", Bytes::from_static(b"on"), Some(QoS::ExactlyOnce), true)
        .await
        .unwrap();

    assert_eq!(
        broker.calls(),
        vec![Call::Publish(
            "cmd/pump".to_string(),
            Bytes::from_static(b"on"),
            QoS::ExactlyOnce,
            true
        )]
    );
}

#[tokio::test]
async fn test_publish_rejects_wildcard_topic() {
    let broker = FakeBroker::new();
    let (relay, _store) = relay_with(&broker);
    assert!(relay.connect().await);

    let result = relay.publish("cmd/#", "x", None, false).await;
    assert!(matches!(result, Err(RelayError::Validation(_))));
    assert!(broker.calls().is_empty());
}
