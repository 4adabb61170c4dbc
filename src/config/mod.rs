//! Configuration Module
//!
//! Provides TOML-based configuration for RelayMQ with support for:
//! - Logging level and filter directives
//! - Broker session options (address, credentials, keep-alive, reconnect)
//! - Persistence backend selection
//! - Environment variable overrides (RELAYMQ__* prefix)

use std::path::Path;
use std::sync::OnceLock;

use config::builder::{ConfigBuilder, DefaultState};
use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

pub use broker::{BrokerConfig, DEFAULT_PORT};
pub use persistence::{BackendType, PersistenceConfig};

mod broker;
mod persistence;


fn env_var_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").expect("env var pattern is a valid regex")
    })
}

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    env_var_pattern()
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            std::env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .to_string()
}

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// IO error reading config file
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// TOML parsing error
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),
    /// Config crate error
    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),
    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Broker session configuration
    pub broker: BrokerConfig,
    /// Persistence configuration
    pub persistence: PersistenceConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    pub level: String,
    /// Optional `tracing_subscriber::EnvFilter` directives (e.g. "relaymq=debug,rumqttc=warn")
    pub filter: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            filter: None,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `RELAYMQ__` prefix with double underscores for nesting:
    ///    - `RELAYMQ__BROKER__URL=tcp://10.0.0.5:1883` overrides `broker.url`
    ///    - `RELAYMQ__BROKER__AUTO_RECONNECT=false` overrides `broker.auto_reconnect`
    ///    - `RELAYMQ__PERSISTENCE__PATH=/var/lib/relaymq` overrides `persistence.path`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = Self::defaults()?;

        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content);
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        Self::build(builder)
    }

    /// Load configuration with environment variable overrides only (no file).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::build(Self::defaults()?)
    }

    fn defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
        Ok(config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("broker.url", "tcp://localhost:1883")?
            .set_default("broker.client_id", broker::default_client_id())?
            .set_default("broker.connection_timeout", "30s")?
            .set_default("broker.keep_alive", "60s")?
            .set_default("broker.clean_session", true)?
            .set_default("broker.auto_reconnect", true)?
            .set_default("broker.default_qos", 1)?
            .set_default("broker.reconnect_delay", "1s")?
            .set_default("broker.max_reconnect_delay", "60s")?
            .set_default("broker.channel_capacity", 100)?
            .set_default("persistence.backend", "fjall")?
            .set_default("persistence.path", "./data")?)
    }

    /// Apply `RELAYMQ__*` overrides on top of `builder` and validate
    fn build(builder: ConfigBuilder<DefaultState>) -> Result<Self, ConfigError> {
        let cfg = builder
            .add_source(
                Environment::with_prefix("RELAYMQ")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let broker = &self.broker;

        broker
            .parse_address()
            .map_err(|e| ConfigError::Validation(format!("broker.url: {}", e)))?;

        if broker.client_id.trim().is_empty() {
            return Err(ConfigError::Validation(
                "broker.client_id cannot be empty".to_string(),
            ));
        }

        if broker.default_qos > 2 {
            return Err(ConfigError::Validation(
                "broker.default_qos must be 0, 1, or 2".to_string(),
            ));
        }

        // 0 disables keep-alive, anything else must be at least a second
        if !broker.keep_alive.is_zero() && broker.keep_alive.as_secs() < 1 {
            return Err(ConfigError::Validation(
                "broker.keep_alive must be 0 or at least 1s".to_string(),
            ));
        }

        if broker.connection_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "broker.connection_timeout must be greater than zero".to_string(),
            ));
        }

        // the backoff doubles this, so zero would retry without pausing
        if broker.reconnect_delay.is_zero() {
            return Err(ConfigError::Validation(
                "broker.reconnect_delay must be greater than zero".to_string(),
            ));
        }

        if broker.max_reconnect_delay < broker.reconnect_delay {
            return Err(ConfigError::Validation(
                "broker.max_reconnect_delay must not be less than broker.reconnect_delay"
                    .to_string(),
            ));
        }

        if broker.channel_capacity == 0 {
            return Err(ConfigError::Validation(
                "broker.channel_capacity must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}
