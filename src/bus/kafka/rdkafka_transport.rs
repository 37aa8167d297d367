//! Kafka transport over librdkafka.

use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode as KafkaCommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::Message as KafkaMessage;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::{Offset, TopicPartitionList};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::transport::{CommitPosition, LogRecord, LogTransport, ProducerRecord};
use crate::bus::{BrokerError, TransportError};
use crate::config::{BrokerConfig, CompressionCodec, KafkaSecurityConfig};

/// Per-record delivery timeout for the producer.
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// How long the startup metadata request may take before the cluster is
/// considered unreachable.
const METADATA_TIMEOUT: Duration = Duration::from_secs(5);

/// How long `poll` keeps filling a batch after the first record arrives.
const BATCH_FILL_WINDOW: Duration = Duration::from_millis(5);

/// Settings shared by the librdkafka producer and consumer.
#[derive(Clone, Debug)]
pub struct KafkaClientConfig {
    /// Comma-separated `host:port` list.
    pub bootstrap_servers: String,
    pub group_id: String,
    pub compression: CompressionCodec,
    pub linger: Duration,
    /// Bound on the startup metadata request.
    pub metadata_timeout: Duration,
    pub security: KafkaSecurityConfig,
}

impl KafkaClientConfig {
    pub fn new(bootstrap_servers: impl Into<String>, group_id: impl Into<String>) -> Self {
        Self {
            bootstrap_servers: bootstrap_servers.into(),
            group_id: group_id.into(),
            compression: CompressionCodec::default(),
            linger: Duration::from_millis(5),
            metadata_timeout: METADATA_TIMEOUT,
            security: KafkaSecurityConfig::default(),
        }
    }

    pub fn from_broker_config(config: &BrokerConfig) -> Self {
        Self {
            bootstrap_servers: config.endpoints_or_default().join(","),
            group_id: config.group_id.clone(),
            compression: config.producer.compression,
            linger: config.producer.linger,
            metadata_timeout: METADATA_TIMEOUT,
            security: config.security.clone(),
        }
    }

    pub fn with_metadata_timeout(mut self, timeout: Duration) -> Self {
        self.metadata_timeout = timeout;
        self
    }

    /// SASL over TLS with the given mechanism (`PLAIN`, `SCRAM-SHA-512`, ...).
    pub fn with_sasl(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
        mechanism: impl Into<String>,
    ) -> Self {
        self.security.security_protocol = Some("SASL_SSL".to_string());
        self.security.sasl_mechanism = Some(mechanism.into());
        self.security.sasl_username = Some(username.into());
        self.security.sasl_password = Some(password.into());
        self
    }

    /// The log broker batches itself; librdkafka's own linger only covers
    /// records within one flushed batch.
    fn producer_config(&self) -> ClientConfig {
        let mut config = self.base_config();
        config
            .set("message.timeout.ms", DELIVERY_TIMEOUT.as_millis().to_string())
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .set("compression.type", self.compression.as_str())
            .set("linger.ms", self.linger.as_millis().to_string())
            .set("partitioner", "murmur2_random");
        config
    }

    /// Offsets are always committed explicitly by the broker.
    fn consumer_config(&self) -> ClientConfig {
        let mut config = self.base_config();
        config
            .set("group.id", &self.group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest");
        config
    }

    fn base_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", &self.bootstrap_servers);

        let security = &self.security;
        let options = [
            ("security.protocol", &security.security_protocol),
            ("sasl.mechanism", &security.sasl_mechanism),
            ("sasl.username", &security.sasl_username),
            ("sasl.password", &security.sasl_password),
            ("ssl.ca.location", &security.ssl_ca_location),
        ];
        for (key, value) in options {
            if let Some(value) = value {
                config.set(key, value);
            }
        }
        config
    }
}

/// Map a librdkafka error onto the transport taxonomy.
fn classify(error: KafkaError) -> TransportError {
    match error.rdkafka_error_code() {
        Some(
            RDKafkaErrorCode::BrokerTransportFailure
            | RDKafkaErrorCode::AllBrokersDown
            | RDKafkaErrorCode::Resolve
            | RDKafkaErrorCode::BrokerNotAvailable
            | RDKafkaErrorCode::NetworkException
            | RDKafkaErrorCode::MessageTimedOut,
        ) => TransportError::ConnectionLost(error.to_string()),
        _ => TransportError::Operation(error.to_string()),
    }
}

fn to_record<M: KafkaMessage>(message: &M) -> LogRecord {
    LogRecord {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        key: message
            .key()
            .map(|k| String::from_utf8_lossy(k).into_owned()),
        payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
    }
}

/// Kafka producer and group consumer.
pub struct RdKafkaTransport {
    producer: FutureProducer,
    consumer: StreamConsumer,
    config: KafkaClientConfig,
}

impl RdKafkaTransport {
    pub async fn connect(config: &BrokerConfig) -> Result<Self, BrokerError> {
        Self::with_client_config(KafkaClientConfig::from_broker_config(config)).await
    }

    /// Create the clients and confirm the cluster answers a metadata
    /// request. librdkafka connects lazily, so without the probe an
    /// unreachable cluster would only show up as empty polls.
    pub async fn with_client_config(config: KafkaClientConfig) -> Result<Self, BrokerError> {
        let producer: FutureProducer = config.producer_config().create().map_err(|e| {
            BrokerError::Configuration(format!("Failed to create Kafka producer: {}", e))
        })?;
        let consumer: StreamConsumer = config.consumer_config().create().map_err(|e| {
            BrokerError::Configuration(format!("Failed to create Kafka consumer: {}", e))
        })?;

        let brokers = probe_cluster(&producer, config.metadata_timeout)
            .await
            .map_err(|e| {
                BrokerError::Unavailable(format!(
                    "Kafka cluster at {} unreachable: {}. Check the broker endpoints",
                    config.bootstrap_servers, e
                ))
            })?;

        info!(
            bootstrap_servers = %config.bootstrap_servers,
            group_id = %config.group_id,
            brokers,
            compression = %config.compression.as_str(),
            "Connected to Kafka"
        );

        Ok(Self {
            producer,
            consumer,
            config,
        })
    }
}

/// Fetch cluster metadata and return the number of live brokers.
async fn probe_cluster(producer: &FutureProducer, timeout: Duration) -> Result<usize, TransportError> {
    let producer = producer.clone();
    let metadata = tokio::task::spawn_blocking(move || {
        producer.client().fetch_metadata(None, timeout)
    })
    .await
    .map_err(|e| TransportError::Operation(format!("metadata request aborted: {}", e)))?
    .map_err(|e| TransportError::ConnectionLost(e.to_string()))?;

    if metadata.brokers().is_empty() {
        return Err(TransportError::ConnectionLost(
            "metadata lists no brokers".to_string(),
        ));
    }
    Ok(metadata.brokers().len())
}

#[async_trait]
impl LogTransport for RdKafkaTransport {
    async fn send_batch(&self, records: &[ProducerRecord]) -> Result<(), TransportError> {
        let deliveries = records.iter().map(|record| {
            self.producer.send(
                FutureRecord::to(&record.topic)
                    .key(&record.key)
                    .payload(&record.payload),
                DELIVERY_TIMEOUT,
            )
        });

        for result in join_all(deliveries).await {
            result.map_err(|(e, _)| classify(e))?;
        }

        debug!(records = records.len(), "Kafka batch acknowledged");
        Ok(())
    }

    async fn subscribe(&self, topics: &[String]) -> Result<(), TransportError> {
        if topics.is_empty() {
            self.consumer.unsubscribe();
            return Ok(());
        }

        let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer.subscribe(&topic_refs).map_err(classify)?;
        info!(topics = ?topics, group_id = %self.config.group_id, "Subscribed to Kafka topics");
        Ok(())
    }

    async fn poll(
        &self,
        timeout: Duration,
        max_records: usize,
    ) -> Result<Vec<LogRecord>, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut batch = Vec::new();

        let first = match tokio::time::timeout_at(deadline, self.consumer.recv()).await {
            Err(_) => return Ok(batch),
            Ok(Ok(message)) => to_record(&message),
            Ok(Err(e)) => return Err(classify(e)),
        };
        batch.push(first);

        while batch.len() < max_records {
            let next = match tokio::time::timeout(BATCH_FILL_WINDOW, self.consumer.recv()).await {
                Ok(Ok(message)) => to_record(&message),
                Ok(Err(e)) => {
                    warn!(error = %e, "Kafka receive failed while filling batch");
                    break;
                }
                Err(_) => break,
            };
            batch.push(next);
        }

        Ok(batch)
    }

    async fn commit(&self, positions: &[CommitPosition]) -> Result<(), TransportError> {
        let mut list = TopicPartitionList::new();
        for position in positions {
            list.add_partition_offset(
                &position.topic,
                position.partition,
                Offset::Offset(position.next_offset),
            )
            .map_err(classify)?;
        }
        self.consumer
            .commit(&list, KafkaCommitMode::Async)
            .map_err(classify)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.consumer.unsubscribe();
        Ok(())
    }
}
