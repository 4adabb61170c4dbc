//! RelayMQ - MQTT subscription relay
//!
//! Keeps one broker session alive, keeps its subscriptions in line with a
//! persisted subscription set, and appends every inbound message to a
//! durable log.

pub mod config;
pub mod persistence;
pub mod protocol;
pub mod relay;
pub mod topic;
pub mod transport;

pub use config::Config;
pub use persistence::{FjallBackend, MemoryBackend, StorageBackend};
pub use protocol::QoS;
pub use relay::{ConnectionState, ConnectionStatus, Relay, RelayError};
pub use transport::{Connector, MqttConnector, Transport};
