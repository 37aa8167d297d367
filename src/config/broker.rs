//! Broker configuration types.

use std::time::Duration;

use serde::Deserialize;

use crate::bus::{BrokerKind, CommitMode, TopicMapping};
use crate::utils::retry::RetryConfig;

/// Producer compression codec (log backend).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionCodec {
    #[default]
    None,
    Gzip,
    Snappy,
    Lz4,
    Zstd,
}

impl CompressionCodec {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionCodec::None => "none",
            CompressionCodec::Gzip => "gzip",
            CompressionCodec::Snappy => "snappy",
            CompressionCodec::Lz4 => "lz4",
            CompressionCodec::Zstd => "zstd",
        }
    }
}

/// Producer batching (log backend).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProducerSettings {
    /// Records buffered before a flush is forced.
    pub buffer_size: usize,
    /// Longest a record waits in the buffer.
    #[serde(with = "super::duration_ms", rename = "linger_ms")]
    pub linger: Duration,
    pub compression: CompressionCodec,
    /// Flush re-attempts before the buffer is kept for the next flush.
    pub flush_retries: usize,
}

impl Default for ProducerSettings {
    fn default() -> Self {
        Self {
            buffer_size: 100,
            linger: Duration::from_millis(5),
            compression: CompressionCodec::None,
            flush_retries: 3,
        }
    }
}

/// Kafka security settings (SASL/SSL).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct KafkaSecurityConfig {
    /// Security protocol (PLAINTEXT, SSL, SASL_PLAINTEXT, SASL_SSL).
    pub security_protocol: Option<String>,
    /// SASL mechanism (PLAIN, SCRAM-SHA-256, SCRAM-SHA-512).
    pub sasl_mechanism: Option<String>,
    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,
    /// SSL CA certificate path.
    pub ssl_ca_location: Option<String>,
}

/// Broker configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Backend: `kafka`, `rabbitmq` (alias `amqp`) or `redis`.
    pub driver: BrokerKind,
    /// Broker addresses. Empty uses the driver's local default.
    pub endpoints: Vec<String>,
    /// Consumer group. Processes sharing a group split the stream; distinct
    /// groups each receive every message.
    pub group_id: String,
    /// Prefix for topics, exchanges, queues and pub/sub channels.
    pub topic_prefix: String,
    pub topic_mapping: TopicMapping,
    pub producer: ProducerSettings,
    pub commit_mode: CommitMode,
    /// Unacknowledged deliveries in flight (queue backend).
    pub prefetch: u16,
    /// Dead-letter topic or exchange. `None` disables dead-lettering.
    pub dead_letter_topic: Option<String>,
    #[serde(with = "super::duration_ms", rename = "reconnect_delay_ms")]
    pub reconnect_delay: Duration,
    /// Startup connection attempts before giving up.
    pub connect_attempts: u32,
    pub handler_retry: RetryConfig,
    pub security: KafkaSecurityConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            driver: BrokerKind::default(),
            endpoints: Vec::new(),
            group_id: "fanout".to_string(),
            topic_prefix: "fanout".to_string(),
            topic_mapping: TopicMapping::default(),
            producer: ProducerSettings::default(),
            commit_mode: CommitMode::default(),
            prefetch: 50,
            dead_letter_topic: None,
            reconnect_delay: Duration::from_secs(1),
            connect_attempts: 5,
            handler_retry: RetryConfig::for_handlers(),
            security: KafkaSecurityConfig::default(),
        }
    }
}

impl BrokerConfig {
    /// Configured endpoints, or the driver's local default.
    pub fn endpoints_or_default(&self) -> Vec<String> {
        if self.endpoints.is_empty() {
            vec![self.driver.default_endpoint().to_string()]
        } else {
            self.endpoints.clone()
        }
    }
}
