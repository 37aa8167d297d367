//! Broker abstraction for cross-process fanout.
//!
//! This module contains:
//! - `Broker` trait: the capability contract every backend implements
//! - `MessageHandler` trait: callback invoked once per delivered message
//! - Error taxonomy shared by all backends
//! - Driver selection and construction from configuration
//! - Implementations: log-style (Kafka), queue-style (AMQP), ephemeral (Redis)

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Deserialize;

use crate::config::BrokerConfig;
use crate::message::{Message, MessageError};

pub mod amqp;
pub mod dispatch;
pub mod kafka;
pub mod redis;

pub use amqp::{InMemoryQueue, QueueBroker, QueueBrokerConfig, QueueTransport};
pub use dispatch::HandlerRegistry;
pub use kafka::{CommitMode, InMemoryLog, LogBroker, LogBrokerConfig, LogTransport, TopicMapping};
pub use redis::{InMemoryPubSub, PubSubBroker, PubSubBrokerConfig, PubSubTransport};

// ============================================================================
// Errors
// ============================================================================

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors that can occur during broker operations.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// Connection lost or never established.
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    /// Malformed payload. Never retried.
    #[error(transparent)]
    Serialization(#[from] MessageError),

    /// An operation did not complete in time. Not a failure of the broker.
    #[error("Broker operation timed out after {0:?}")]
    Timeout(Duration),

    /// No usable backend for the requested configuration.
    #[error("Broker configuration error: {0}")]
    Configuration(String),

    /// The broker refused an operation on a live connection.
    #[error("Broker rejected operation: {0}")]
    Transport(String),
}

impl BrokerError {
    /// Unavailability is the only class worth retrying with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BrokerError::Unavailable(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, BrokerError::Timeout(_))
    }
}

/// Errors reported by native transports, classified where the call fails.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The connection (or channel) is gone: broken pipe, closed socket,
    /// framing error. Recovered by reconnecting.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// The connection is fine but the operation failed.
    #[error("{0}")]
    Operation(String),
}

impl TransportError {
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, TransportError::ConnectionLost(_))
    }
}

impl From<TransportError> for BrokerError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::ConnectionLost(msg) => BrokerError::Unavailable(msg),
            TransportError::Operation(msg) => BrokerError::Transport(msg),
        }
    }
}

/// Failure reported by a message handler.
///
/// The handler decides retryability; the broker only acts on the class.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    /// May succeed if retried in place.
    #[error("Transient handler failure: {0}")]
    Transient(String),

    /// Retrying will not help; route to the dead-letter destination.
    #[error("Unrecoverable handler failure: {0}")]
    Unrecoverable(String),
}

impl HandlerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, HandlerError::Transient(_))
    }
}

// ============================================================================
// Traits
// ============================================================================

/// Handler for messages delivered by a broker.
pub trait MessageHandler: Send + Sync {
    /// Process one delivered message.
    fn handle(&self, message: Arc<Message>)
        -> BoxFuture<'static, std::result::Result<(), HandlerError>>;
}

/// Capability contract implemented by every broker backend.
///
/// Implementations:
/// - `LogBroker`: partitioned durable log (Kafka)
/// - `QueueBroker`: acknowledged queue (RabbitMQ)
/// - `PubSubBroker`: ephemeral pub/sub (Redis)
#[async_trait]
pub trait Broker: Send + Sync {
    /// Backend family of this broker.
    fn kind(&self) -> BrokerKind;

    /// Hand a message to the backend's delivery pipeline.
    ///
    /// Depending on the backend the message is buffered, queued or sent
    /// immediately; completion does not imply remote delivery.
    async fn publish(&self, channel: &str, message: Arc<Message>) -> Result<()>;

    /// Register the handler for a channel. Idempotent per channel: a second
    /// call replaces the handler without duplicating the subscription.
    async fn subscribe(&self, channel: &str, handler: Arc<dyn MessageHandler>) -> Result<()>;

    /// Remove the channel's registration. Deliveries already dispatched
    /// are not cancelled.
    async fn unsubscribe(&self, channel: &str) -> Result<()>;

    /// Drive delivery: pull up to `batch_size` messages or wait up to
    /// `timeout`, invoking registered handlers.
    ///
    /// Returns the number of messages taken off the broker; zero means the
    /// wait timed out, which is not an error.
    async fn consume(&self, timeout: Duration, batch_size: usize) -> Result<usize>;

    /// Flush pending output, then release the connection. Idempotent.
    async fn disconnect(&self) -> Result<()>;

    /// Cheap health probe. Never reconnects.
    fn is_connected(&self) -> bool;
}

// ============================================================================
// Driver selection
// ============================================================================

/// Broker backend discriminator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize)]
pub enum BrokerKind {
    /// Partitioned log (Kafka).
    #[default]
    #[serde(rename = "kafka")]
    Kafka,
    /// Acknowledged queue (RabbitMQ / AMQP 0-9-1).
    #[serde(rename = "rabbitmq", alias = "amqp")]
    RabbitMq,
    /// Ephemeral pub/sub (Redis).
    #[serde(rename = "redis")]
    Redis,
}

impl BrokerKind {
    pub const ALL: [BrokerKind; 3] = [BrokerKind::Kafka, BrokerKind::RabbitMq, BrokerKind::Redis];

    pub fn as_str(&self) -> &'static str {
        match self {
            BrokerKind::Kafka => "kafka",
            BrokerKind::RabbitMq => "rabbitmq",
            BrokerKind::Redis => "redis",
        }
    }

    /// Cargo feature that compiles the native client for this backend.
    pub fn feature(&self) -> &'static str {
        match self {
            BrokerKind::Kafka => "kafka",
            BrokerKind::RabbitMq => "amqp",
            BrokerKind::Redis => "redis",
        }
    }

    /// Whether the native client for this backend is compiled in.
    pub fn is_compiled(&self) -> bool {
        match self {
            BrokerKind::Kafka => cfg!(feature = "kafka"),
            BrokerKind::RabbitMq => cfg!(feature = "amqp"),
            BrokerKind::Redis => cfg!(feature = "redis"),
        }
    }

    /// Default endpoint for local development.
    pub fn default_endpoint(&self) -> &'static str {
        match self {
            BrokerKind::Kafka => "localhost:9092",
            BrokerKind::RabbitMq => "amqp://localhost:5672",
            BrokerKind::Redis => "redis://localhost:6379",
        }
    }
}

impl fmt::Display for BrokerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BrokerKind {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "kafka" => Ok(BrokerKind::Kafka),
            "rabbitmq" | "amqp" => Ok(BrokerKind::RabbitMq),
            "redis" => Ok(BrokerKind::Redis),
            other => Err(BrokerError::Configuration(format!(
                "unknown broker driver '{}'; expected one of: kafka, rabbitmq, redis",
                other
            ))),
        }
    }
}

/// Resolve the requested backend against what this build can provide.
///
/// Runs once, before any connection attempt, so a missing client library is
/// reported as configuration rather than discovered mid-run.
pub fn select_driver(requested: BrokerKind) -> Result<BrokerKind> {
    if requested.is_compiled() {
        Ok(requested)
    } else {
        Err(missing_driver(requested))
    }
}

fn missing_driver(kind: BrokerKind) -> BrokerError {
    let compiled: Vec<&str> = BrokerKind::ALL
        .iter()
        .filter(|k| k.is_compiled())
        .map(|k| k.as_str())
        .collect();
    let alternatives = if compiled.is_empty() {
        "none (this build only supports local fanout without a broker)".to_string()
    } else {
        compiled.join(", ")
    };
    BrokerError::Configuration(format!(
        "{} support is not compiled into this build. Rebuild with `--features {}`, \
         or set broker.driver to one of the compiled drivers: {}",
        kind,
        kind.feature(),
        alternatives
    ))
}

/// Connect the configured broker.
///
/// Requires the corresponding feature to be enabled:
/// - Kafka: `--features kafka`
/// - RabbitMQ: `--features amqp`
/// - Redis: `--features redis`
pub async fn connect_broker(config: &BrokerConfig) -> Result<Arc<dyn Broker>> {
    let kind = select_driver(config.driver)?;

    match kind {
        BrokerKind::Kafka => {
            #[cfg(feature = "kafka")]
            {
                let transport = kafka::RdKafkaTransport::connect(config).await?;
                let broker =
                    LogBroker::new(Arc::new(transport), LogBrokerConfig::from_broker_config(config))
                        .await?;
                tracing::info!(driver = %kind, "Broker connected");
                Ok(Arc::new(broker))
            }

            #[cfg(not(feature = "kafka"))]
            {
                Err(missing_driver(kind))
            }
        }
        BrokerKind::RabbitMq => {
            #[cfg(feature = "amqp")]
            {
                let url = config
                    .endpoints_or_default()
                    .into_iter()
                    .next()
                    .unwrap_or_else(|| kind.default_endpoint().to_string());
                let transport = amqp::LapinTransport::new(url);
                let broker = QueueBroker::connect(
                    Arc::new(transport),
                    QueueBrokerConfig::from_broker_config(config),
                )
                .await?;
                tracing::info!(driver = %kind, "Broker connected");
                Ok(Arc::new(broker))
            }

            #[cfg(not(feature = "amqp"))]
            {
                Err(missing_driver(kind))
            }
        }
        BrokerKind::Redis => {
            #[cfg(feature = "redis")]
            {
                let url = config
                    .endpoints_or_default()
                    .into_iter()
                    .next()
                    .unwrap_or_else(|| kind.default_endpoint().to_string());
                let transport = redis::RedisPubSubClient::connect(&url).await?;
                let broker = PubSubBroker::new(
                    Arc::new(transport),
                    PubSubBrokerConfig::from_broker_config(config),
                );
                tracing::info!(driver = %kind, "Broker connected");
                Ok(Arc::new(broker))
            }

            #[cfg(not(feature = "redis"))]
            {
                Err(missing_driver(kind))
            }
        }
    }
}
