//! Application configuration.
//!
//! Loaded from YAML files and `FANOUT__*` environment variables into a
//! single [`Config`]. Durations are given in milliseconds (`*_ms` keys).

mod broker;

pub use broker::{BrokerConfig, CompressionCodec, KafkaSecurityConfig, ProducerSettings};

use std::time::Duration;

use serde::Deserialize;

use crate::utils::retry::RetryConfig;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "fanout.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "FANOUT_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "FANOUT";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "FANOUT_LOG";

/// Serde adapter for durations given as integer milliseconds.
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Errors from loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Consumer loop settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsumerSettings {
    /// Channels to subscribe to.
    pub channels: Vec<String>,
    /// Messages taken per `consume` call.
    pub batch_size: usize,
    /// Longest a `consume` call waits for the first message.
    #[serde(with = "duration_ms", rename = "poll_timeout_ms")]
    pub poll_timeout: Duration,
    /// Stop after this many messages.
    pub max_messages: Option<u64>,
    /// Stop on the first empty poll.
    pub stop_when_empty: bool,
    /// Re-attempts while the broker is unavailable.
    pub retry: RetryConfig,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            channels: Vec::new(),
            batch_size: 100,
            poll_timeout: Duration::from_millis(1000),
            max_messages: None,
            stop_when_empty: false,
            retry: RetryConfig::for_consumer(),
        }
    }
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Broker connection. `None` runs single-process fanout.
    pub broker: Option<BrokerConfig>,
    pub consumer: ConsumerSettings,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `fanout.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix, `__` as separator
    ///    (`FANOUT__BROKER__DRIVER=redis`); list keys take comma-separated values
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("broker.endpoints")
                    .with_list_parse_key("consumer.channels")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings no component can run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.consumer.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "consumer.batch_size must be at least 1".to_string(),
            ));
        }
        if let Some(broker) = &self.broker {
            if broker.producer.buffer_size == 0 {
                return Err(ConfigError::Invalid(
                    "broker.producer.buffer_size must be at least 1".to_string(),
                ));
            }
            if broker.group_id.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "broker.group_id must not be empty".to_string(),
                ));
            }
            if broker.topic_prefix.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "broker.topic_prefix must not be empty".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests;
