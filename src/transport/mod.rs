//! Transport Layer
//!
//! The relay never talks to an MQTT client library directly. It opens a
//! [`Transport`] through a [`Connector`] and receives everything the broker
//! does as [`TransportEvent`]s on a channel, so tests can swap in a recording
//! fake and the real session can be driven by rumqttc.

mod mqtt;

pub use mqtt::{MqttConnector, MqttTransport};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::BrokerConfig;
use crate::protocol::QoS;

/// Errors raised by a transport
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Options could not be turned into a session
    #[error("cannot connect: {0}")]
    Connect(String),
    /// The broker refused the session (bad credentials, client id, ...)
    #[error("broker rejected connection: {0}")]
    Rejected(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    /// The client refused to queue a request
    #[error("client error: {0}")]
    Client(String),
    /// The session is gone and will not come back
    #[error("transport closed")]
    Closed,
}

/// A message delivered by the broker, exactly as the transport reported it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retained: bool,
}

/// Callbacks from the transport, delivered in order on one channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The broker acknowledged a session; `reconnect` is set for every
    /// acknowledgment after the first
    ConnectComplete { reconnect: bool, server_uri: String },
    /// The session dropped or a connection attempt failed
    ConnectionLost { cause: String },
    /// An automatic reconnect attempt is starting
    Reconnecting,
    MessageArrived(Delivery),
}

pub type EventSender = mpsc::UnboundedSender<TransportEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Session options, resolved from the broker configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub credentials: Option<(String, String)>,
    pub connection_timeout: Duration,
    pub keep_alive: Duration,
    pub clean_session: bool,
    pub auto_reconnect: bool,
    pub reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    pub channel_capacity: usize,
}

impl ConnectOptions {
    pub fn from_config(config: &BrokerConfig) -> Result<Self, TransportError> {
        let (host, port) = config.parse_address().map_err(TransportError::Connect)?;
        Ok(Self {
            host,
            port,
            client_id: config.client_id.clone(),
            credentials: config.credentials(),
            connection_timeout: config.connection_timeout,
            keep_alive: config.keep_alive,
            clean_session: config.clean_session,
            auto_reconnect: config.auto_reconnect,
            reconnect_delay: config.reconnect_delay,
            max_reconnect_delay: config.max_reconnect_delay,
            channel_capacity: config.channel_capacity,
        })
    }

    /// Address as shown in logs and status output
    pub fn server_uri(&self) -> String {
        format!("tcp://{}:{}", self.host, self.port)
    }
}

/// An open client session to the broker.
///
/// Calls return once the client has accepted the request; broker
/// acknowledgments are not awaited.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), TransportError>;

    async fn unsubscribe(&self, filter: &str) -> Result<(), TransportError>;

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retained: bool,
    ) -> Result<(), TransportError>;

    /// Close the session and stop any reconnect attempts
    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Whether the client itself believes the session is up
    fn is_session_open(&self) -> bool;
}

/// Opens transports.
///
/// `open` returns as soon as the client exists. The outcome of the first
/// connection attempt, and of every later one, arrives on `events`.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(
        &self,
        options: &ConnectOptions,
        events: EventSender,
    ) -> Result<Arc<dyn Transport>, TransportError>;
}
