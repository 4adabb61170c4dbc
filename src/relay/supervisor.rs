//! Connection supervisor.
//!
//! Owns the one broker session of the process. The session state is a
//! three-state machine held in a `watch` channel; transport callbacks are
//! applied to it on a dedicated task, and every broker call goes through
//! [`ConnectionSupervisor`] so calls never overlap.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::error::{RelayError, Result};
use crate::protocol::QoS;
use crate::transport::{
    ConnectOptions, Connector, Delivery, EventReceiver, Transport, TransportEvent,
};

/// Broker session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

/// Receives session callbacks once the supervisor has applied them to its
/// state. Runs on the callback task, one event at a time.
#[async_trait]
pub trait SessionHandler: Send + Sync {
    /// The broker acknowledged a session; state is already `Connected`
    async fn on_connect(&self, reconnect: bool);

    async fn on_message(&self, delivery: Delivery);
}

pub struct ConnectionSupervisor {
    connector: Arc<dyn Connector>,
    options: ConnectOptions,
    state: Arc<watch::Sender<ConnectionState>>,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    /// Task applying transport events
    callbacks: Mutex<Option<JoinHandle<()>>>,
    /// Held for the duration of each broker call
    broker_calls: tokio::sync::Mutex<()>,
}

impl ConnectionSupervisor {
    pub fn new(connector: Arc<dyn Connector>, options: ConnectOptions) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            connector,
            options,
            state: Arc::new(state),
            transport: RwLock::new(None),
            callbacks: Mutex::new(None),
            broker_calls: tokio::sync::Mutex::new(()),
        }
    }

    pub fn options(&self) -> &ConnectOptions {
        &self.options
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Follow state transitions
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Connected according to both our own state and the transport
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
            && self
                .transport
                .read()
                .as_ref()
                .is_some_and(|t| t.is_session_open())
    }

    /// Open a session and wait for the first attempt's outcome.
    ///
    /// Returns whether the broker accepted the session within the connection
    /// timeout. Failures are logged, never returned; with auto-reconnect the
    /// transport keeps trying in the background.
    pub async fn connect(&self, handler: Arc<dyn SessionHandler>) -> bool {
        let claimed = self.state.send_if_modified(|state| {
            if *state == ConnectionState::Disconnected {
                *state = ConnectionState::Connecting;
                true
            } else {
                false
            }
        });
        if !claimed {
            debug!("Connect ignored, session is {}", self.state());
            return self.is_connected();
        }

        // a previous session that gave up is replaced
        drop(self.release());

        let server_uri = self.options.server_uri();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = match self.connector.open(&self.options, events_tx).await {
            Ok(transport) => transport,
            Err(e) => {
                error!("Failed to connect to {}: {}", server_uri, e);
                self.state.send_replace(ConnectionState::Disconnected);
                return false;
            }
        };
        *self.transport.write() = Some(transport);

        let (first_tx, first_rx) = oneshot::channel();
        let task = tokio::spawn(dispatch(
            events_rx,
            self.state.clone(),
            handler,
            first_tx,
        ));
        *self.callbacks.lock() = Some(task);

        match tokio::time::timeout(self.options.connection_timeout, first_rx).await {
            Ok(Ok(connected)) => connected,
            Ok(Err(_)) => {
                self.state.send_replace(ConnectionState::Disconnected);
                false
            }
            Err(_) => {
                warn!(
                    "No answer from {} within {:?}",
                    server_uri, self.options.connection_timeout
                );
                self.state.send_if_modified(|state| {
                    if *state == ConnectionState::Connecting {
                        *state = ConnectionState::Disconnected;
                        true
                    } else {
                        false
                    }
                });
                self.is_connected()
            }
        }
    }

    /// Close the session. Graceful only while connected, bounded by the
    /// connection timeout, never fails.
    pub async fn disconnect(&self) {
        let was_connected = self.is_connected();
        let transport = self.release();
        self.state.send_replace(ConnectionState::Disconnected);

        let Some(transport) = transport else {
            return;
        };
        if !was_connected {
            debug!("Dropping session that was not connected");
            return;
        }

        let _calls = self.broker_calls.lock().await;
        info!("Disconnecting from {}", self.options.server_uri());
        match tokio::time::timeout(self.options.connection_timeout, transport.disconnect()).await {
            Ok(Ok(())) => info!("Disconnected from broker"),
            Ok(Err(e)) => warn!("Error while disconnecting: {}", e),
            Err(_) => warn!(
                "Disconnect did not finish within {:?}",
                self.options.connection_timeout
            ),
        }
    }

    pub async fn subscribe(&self, filter: &str, qos: QoS) -> Result<()> {
        let _calls = self.broker_calls.lock().await;
        let transport = self.session()?;
        transport.subscribe(filter, qos).await?;
        debug!("Subscribed to {} (qos {})", filter, qos);
        Ok(())
    }

    pub async fn unsubscribe(&self, filter: &str) -> Result<()> {
        let _calls = self.broker_calls.lock().await;
        let transport = self.session()?;
        transport.unsubscribe(filter).await?;
        debug!("Unsubscribed from {}", filter);
        Ok(())
    }

    pub async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retained: bool,
    ) -> Result<()> {
        let _calls = self.broker_calls.lock().await;
        let transport = self.session()?;
        transport.publish(topic, payload, qos, retained).await?;
        Ok(())
    }

    fn session(&self) -> Result<Arc<dyn Transport>> {
        if self.state() != ConnectionState::Connected {
            return Err(RelayError::NotConnected);
        }
        match self.transport.read().as_ref() {
            Some(transport) if transport.is_session_open() => Ok(transport.clone()),
            _ => Err(RelayError::NotConnected),
        }
    }

    /// Stop applying callbacks and hand back the current transport
    fn release(&self) -> Option<Arc<dyn Transport>> {
        if let Some(task) = self.callbacks.lock().take() {
            task.abort();
        }
        self.transport.write().take()
    }
}

impl Drop for ConnectionSupervisor {
    fn drop(&mut self) {
        if let Some(task) = self.callbacks.get_mut().take() {
            task.abort();
        }
    }
}

/// Apply transport events in order. The first connect outcome is reported
/// back to `connect` after its callbacks ran.
async fn dispatch(
    mut events: EventReceiver,
    state: Arc<watch::Sender<ConnectionState>>,
    handler: Arc<dyn SessionHandler>,
    first_outcome: oneshot::Sender<bool>,
) {
    let mut first_outcome = Some(first_outcome);

    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::ConnectComplete {
                reconnect,
                server_uri,
            } => {
                state.send_replace(ConnectionState::Connected);
                if reconnect {
                    info!("Reconnected to {}", server_uri);
                } else {
                    info!("Connected to {}", server_uri);
                }
                handler.on_connect(reconnect).await;
                if let Some(tx) = first_outcome.take() {
                    let _ = tx.send(true);
                }
            }
            TransportEvent::ConnectionLost { cause } => {
                let previous = state.send_replace(ConnectionState::Disconnected);
                if previous == ConnectionState::Connected {
                    warn!("Connection to broker lost: {}", cause);
                } else {
                    error!("Connection attempt failed: {}", cause);
                }
                if let Some(tx) = first_outcome.take() {
                    let _ = tx.send(false);
                }
            }
            TransportEvent::Reconnecting => {
                let retrying = state.send_if_modified(|state| {
                    if *state == ConnectionState::Disconnected {
                        *state = ConnectionState::Connecting;
                        true
                    } else {
                        false
                    }
                });
                if retrying {
                    debug!("Retrying broker connection");
                }
            }
            TransportEvent::MessageArrived(delivery) => handler.on_message(delivery).await,
        }
    }

    debug!("Broker event stream closed");
}
