//! Broker Connection Configuration
//!
//! Options for the single upstream MQTT session owned by the relay.

use std::time::Duration;

use serde::Deserialize;

use crate::protocol::QoS;

/// Default MQTT port for plain TCP
pub const DEFAULT_PORT: u16 = 1883;

/// Configuration for the broker session
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker address (`tcp://host:port`, `mqtt://host:port`, `host:port` or `host`)
    pub url: String,

    /// Client ID presented to the broker
    pub client_id: String,

    /// Username for authentication (ignored when blank)
    pub username: Option<String>,

    /// Password for authentication
    pub password: Option<String>,

    /// Connection timeout (e.g., "30s"); also bounds graceful disconnect
    #[serde(with = "humantime_serde")]
    pub connection_timeout: Duration,

    /// Keep-alive heartbeat interval (e.g., "60s")
    #[serde(with = "humantime_serde")]
    pub keep_alive: Duration,

    /// Ask the broker to discard prior session state on connect
    pub clean_session: bool,

    /// Let the transport reconnect on its own after a connection loss
    pub auto_reconnect: bool,

    /// QoS used when a request does not name one
    pub default_qos: u8,

    /// Initial delay between reconnect attempts
    #[serde(with = "humantime_serde")]
    pub reconnect_delay: Duration,

    /// Upper bound for the exponential reconnect backoff
    #[serde(with = "humantime_serde")]
    pub max_reconnect_delay: Duration,

    /// Depth of the transport's request queue
    pub channel_capacity: usize,
}

pub(crate) fn default_client_id() -> String {
    format!("relaymq-{}", std::process::id())
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: "tcp://localhost:1883".to_string(),
            client_id: default_client_id(),
            username: None,
            password: None,
            connection_timeout: Duration::from_secs(30),
            keep_alive: Duration::from_secs(60),
            clean_session: true,
            auto_reconnect: true,
            default_qos: 1,
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(60),
            channel_capacity: 100,
        }
    }
}

impl BrokerConfig {
    /// Parse the broker url into host and port
    pub fn parse_address(&self) -> Result<(String, u16), String> {
        let address = match self.url.split_once("://") {
            Some(("tcp", rest)) | Some(("mqtt", rest)) => rest,
            Some((scheme, _)) => {
                return Err(format!("unsupported broker url scheme '{}'", scheme));
            }
            None => self.url.as_str(),
        };
        let address = address.trim_end_matches('/');

        if address.is_empty() {
            return Err("broker url has no host".to_string());
        }

        if let Some((host, port_str)) = address.rsplit_once(':') {
            let port = port_str
                .parse::<u16>()
                .map_err(|_| format!("invalid broker port '{}'", port_str))?;
            if host.is_empty() {
                return Err("broker url has no host".to_string());
            }
            return Ok((host.to_string(), port));
        }

        Ok((address.to_string(), DEFAULT_PORT))
    }

    /// Credentials to present, if a non-blank username is configured
    pub fn credentials(&self) -> Option<(String, String)> {
        match self.username.as_deref() {
            Some(user) if !user.trim().is_empty() => Some((
                user.to_string(),
                self.password.clone().unwrap_or_default(),
            )),
            _ => None,
        }
    }

    /// The configured default QoS, clamped to a valid level
    pub fn default_qos(&self) -> QoS {
        QoS::from_u8(self.default_qos).unwrap_or(QoS::AtLeastOnce)
    }
}
