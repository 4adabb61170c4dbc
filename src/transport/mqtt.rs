//! rumqttc-backed transport.
//!
//! The rumqttc `EventLoop` is driven on its own task. Every poll result is
//! translated into a `TransportEvent`; after an error the next poll
//! reconnects, so reconnecting is just "keep polling after a pause" with a
//! `Reconnecting` event in front of each retry.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, ClientError, Event, EventLoop, MqttOptions, NetworkOptions, Outgoing, Packet,
};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    ConnectOptions, Connector, Delivery, EventSender, Transport, TransportError, TransportEvent,
};
use crate::protocol::QoS;

/// Opens rumqttc sessions
#[derive(Debug, Clone, Copy, Default)]
pub struct MqttConnector;

impl MqttConnector {
    pub fn new() -> Self {
        Self
    }

    fn mqtt_options(options: &ConnectOptions) -> MqttOptions {
        let mut mqtt_options =
            MqttOptions::new(options.client_id.clone(), options.host.clone(), options.port);
        mqtt_options
            .set_keep_alive(options.keep_alive)
            .set_clean_session(options.clean_session);
        if let Some((username, password)) = &options.credentials {
            mqtt_options.set_credentials(username.clone(), password.clone());
        }
        mqtt_options
    }
}

#[async_trait]
impl Connector for MqttConnector {
    async fn open(
        &self,
        options: &ConnectOptions,
        events: EventSender,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        if options.channel_capacity == 0 {
            return Err(TransportError::Connect(
                "channel capacity must be positive".to_string(),
            ));
        }

        let (client, mut eventloop) =
            AsyncClient::new(Self::mqtt_options(options), options.channel_capacity);

        let mut network = NetworkOptions::new();
        network.set_connection_timeout(options.connection_timeout.as_secs().max(1));
        eventloop.set_network_options(network);

        let session_open = Arc::new(AtomicBool::new(false));
        let closing = Arc::new(AtomicBool::new(false));

        let driver = Driver {
            eventloop,
            events,
            session_open: session_open.clone(),
            closing: closing.clone(),
            server_uri: options.server_uri(),
            auto_reconnect: options.auto_reconnect,
            reconnect_delay: options.reconnect_delay,
            max_reconnect_delay: options.max_reconnect_delay,
        };

        info!(
            "Connecting to {} as '{}' (clean_session={}, auto_reconnect={})",
            options.server_uri(),
            options.client_id,
            options.clean_session,
            options.auto_reconnect
        );
        let handle = tokio::spawn(driver.run());

        Ok(Arc::new(MqttTransport {
            client,
            session_open,
            closing,
            driver: Mutex::new(Some(handle)),
            request_timeout: options.connection_timeout,
        }))
    }
}

/// Polls the event loop and reports what happens
struct Driver {
    eventloop: EventLoop,
    events: EventSender,
    session_open: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
    server_uri: String,
    auto_reconnect: bool,
    reconnect_delay: Duration,
    max_reconnect_delay: Duration,
}

impl Driver {
    async fn run(mut self) {
        let mut acknowledged = false;
        let mut retry_interval = self.reconnect_delay;

        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    debug!(
                        "CONNACK from {} (session_present={})",
                        self.server_uri, ack.session_present
                    );
                    self.session_open.store(true, Ordering::SeqCst);
                    retry_interval = self.reconnect_delay;
                    let event = TransportEvent::ConnectComplete {
                        reconnect: acknowledged,
                        server_uri: self.server_uri.clone(),
                    };
                    acknowledged = true;
                    if !self.emit(event) {
                        break;
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let delivery = Delivery {
                        topic: topic_text(&publish.topic),
                        payload: publish.payload,
                        qos: QoS::from(publish.qos),
                        retained: publish.retain,
                    };
                    if !self.emit(TransportEvent::MessageArrived(delivery)) {
                        break;
                    }
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    self.session_open.store(false, Ordering::SeqCst);
                    debug!("Sent DISCONNECT to {}", self.server_uri);
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    self.session_open.store(false, Ordering::SeqCst);
                    if self.closing.load(Ordering::SeqCst) {
                        break;
                    }
                    if !self.emit(TransportEvent::ConnectionLost {
                        cause: e.to_string(),
                    }) {
                        break;
                    }
                    if !self.auto_reconnect {
                        info!("Auto-reconnect disabled, giving up on {}", self.server_uri);
                        break;
                    }

                    debug!("Reconnecting to {} in {:?}", self.server_uri, retry_interval);
                    tokio::time::sleep(retry_interval).await;
                    retry_interval = std::cmp::min(retry_interval * 2, self.max_reconnect_delay);

                    if self.closing.load(Ordering::SeqCst)
                        || !self.emit(TransportEvent::Reconnecting)
                    {
                        break;
                    }
                }
            }
        }

        self.session_open.store(false, Ordering::SeqCst);
        debug!("Event loop for {} stopped", self.server_uri);
    }

    /// False once nobody listens any more
    fn emit(&self, event: TransportEvent) -> bool {
        self.events.send(event).is_ok()
    }
}

fn topic_text<T: AsRef<[u8]>>(topic: &T) -> String {
    String::from_utf8_lossy(topic.as_ref()).into_owned()
}

/// A live rumqttc session
pub struct MqttTransport {
    client: AsyncClient,
    session_open: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
    driver: Mutex<Option<JoinHandle<()>>>,
    request_timeout: Duration,
}

impl MqttTransport {
    async fn request<F>(&self, call: F) -> Result<(), TransportError>
    where
        F: Future<Output = Result<(), ClientError>> + Send,
    {
        match tokio::time::timeout(self.request_timeout, call).await {
            Ok(result) => result.map_err(|e| TransportError::Client(e.to_string())),
            Err(_) => Err(TransportError::Timeout(self.request_timeout)),
        }
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), TransportError> {
        self.request(self.client.subscribe(filter, qos.into())).await
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), TransportError> {
        self.request(self.client.unsubscribe(filter)).await
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retained: bool,
    ) -> Result<(), TransportError> {
        self.request(self.client.publish_bytes(topic, qos.into(), retained, payload))
            .await
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.closing.store(true, Ordering::SeqCst);
        let Some(mut handle) = self.driver.lock().take() else {
            return Ok(());
        };

        if self.session_open.load(Ordering::SeqCst) {
            let sent = self.request(self.client.disconnect()).await;
            if sent.is_ok()
                && tokio::time::timeout(self.request_timeout, &mut handle)
                    .await
                    .is_ok()
            {
                return Ok(());
            }
            warn!("Graceful disconnect did not complete, dropping the session");
        }

        handle.abort();
        self.session_open.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_session_open(&self) -> bool {
        self.session_open.load(Ordering::SeqCst)
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        if let Some(handle) = self.driver.get_mut().take() {
            handle.abort();
        }
    }
}
