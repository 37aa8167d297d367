//! Log-style broker (Kafka semantics).
//!
//! Publishing appends to a producer buffer flushed by size or linger; the
//! buffer is only cleared once the batch is acknowledged. Consumers use a
//! consumer group: processes that must all see every message use distinct
//! groups, processes sharing a group split the partitions between them.
//!
//! Offsets are committed either when records are fetched (`CommitMode::Auto`,
//! at-most-once) or after the whole batch was dispatched
//! (`CommitMode::Manual`, at-least-once). Records that cannot be delivered are
//! sent to the dead-letter topic and committed past.

mod buffer;
mod memory;
#[cfg(feature = "kafka")]
mod rdkafka_transport;
mod topic;
mod transport;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use backon::BackoffBuilder;
use serde::Deserialize;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::dispatch::{process_payload, HandlerRegistry, ProcessResult};
use super::{Broker, BrokerError, BrokerKind, MessageHandler, Result};
use crate::config::BrokerConfig;
use crate::dlq::{DeadLetter, DeadLetterPublisher, DeadLetterSource, DlqError, NoopDeadLetterPublisher};
use crate::message::Message;
use crate::utils::retry::{flush_backoff, RetryConfig};

pub use buffer::{ProducerBuffer, HARD_LIMIT_FACTOR};
pub use memory::{InMemoryLog, InMemoryLogClient};
#[cfg(feature = "kafka")]
pub use rdkafka_transport::{KafkaClientConfig, RdKafkaTransport};
pub use topic::{
    channel_category, partition_for_key, route_for, sanitize_topic_component, TopicMapping,
    TopicResolver, TopicRoute, DIRECT_TOPIC_WARN_THRESHOLD,
};
pub use transport::{CommitPosition, LogRecord, LogTransport, OffsetTracker, ProducerRecord};

/// When consumed offsets are committed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitMode {
    /// Commit as soon as records are fetched. A crash mid-batch loses it.
    Auto,
    /// Commit after the batch was dispatched. A crash mid-batch redelivers it.
    #[default]
    Manual,
}

/// Configuration for [`LogBroker`].
#[derive(Debug, Clone)]
pub struct LogBrokerConfig {
    pub topic_prefix: String,
    pub topic_mapping: TopicMapping,
    /// Records per flush.
    pub buffer_size: usize,
    /// Longest a record waits in the buffer. Zero flushes every publish.
    pub linger: Duration,
    /// Flush re-attempts after the first failure.
    pub flush_retries: usize,
    pub commit_mode: CommitMode,
    /// Dead-letter topic. `None` disables dead-lettering.
    pub dead_letter_topic: Option<String>,
    pub handler_retry: RetryConfig,
}

impl Default for LogBrokerConfig {
    fn default() -> Self {
        Self {
            topic_prefix: "fanout".to_string(),
            topic_mapping: TopicMapping::default(),
            buffer_size: 100,
            linger: Duration::from_millis(5),
            flush_retries: 3,
            commit_mode: CommitMode::default(),
            dead_letter_topic: None,
            handler_retry: RetryConfig::for_handlers(),
        }
    }
}

impl LogBrokerConfig {
    pub fn from_broker_config(config: &BrokerConfig) -> Self {
        Self {
            topic_prefix: config.topic_prefix.clone(),
            topic_mapping: config.topic_mapping,
            buffer_size: config.producer.buffer_size,
            linger: config.producer.linger,
            flush_retries: config.producer.flush_retries,
            commit_mode: config.commit_mode,
            dead_letter_topic: config.dead_letter_topic.clone(),
            handler_retry: config.handler_retry.clone(),
        }
    }

    pub fn with_topic_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.topic_prefix = prefix.into();
        self
    }

    pub fn with_topic_mapping(mut self, mapping: TopicMapping) -> Self {
        self.topic_mapping = mapping;
        self
    }

    pub fn with_batching(mut self, buffer_size: usize, linger: Duration) -> Self {
        self.buffer_size = buffer_size;
        self.linger = linger;
        self
    }

    pub fn with_flush_retries(mut self, retries: usize) -> Self {
        self.flush_retries = retries;
        self
    }

    pub fn with_commit_mode(mut self, mode: CommitMode) -> Self {
        self.commit_mode = mode;
        self
    }

    pub fn with_dead_letter_topic(mut self, topic: impl Into<String>) -> Self {
        self.dead_letter_topic = Some(topic.into());
        self
    }

    pub fn with_handler_retry(mut self, retry: RetryConfig) -> Self {
        self.handler_retry = retry;
        self
    }
}

/// Buffered producer shared with the linger flusher.
struct Producer<T: LogTransport> {
    transport: Arc<T>,
    buffer: Mutex<ProducerBuffer>,
    flush_retries: usize,
}

impl<T: LogTransport> Producer<T> {
    async fn flush(&self) -> Result<usize> {
        let mut buffer = self.buffer.lock().await;
        self.flush_locked(&mut buffer).await
    }

    async fn flush_if_due(&self) -> Result<usize> {
        let mut buffer = self.buffer.lock().await;
        if !buffer.is_due(Instant::now()) {
            return Ok(0);
        }
        self.flush_locked(&mut buffer).await
    }

    async fn flush_locked(&self, buffer: &mut ProducerBuffer) -> Result<usize> {
        if buffer.is_empty() {
            return Ok(0);
        }

        let count = buffer.len();
        let delays = std::iter::once(Duration::ZERO).chain(flush_backoff(self.flush_retries).build());
        let mut last_error = None;

        for (attempt, delay) in delays.enumerate() {
            if attempt > 0 {
                tokio::time::sleep(delay).await;
            }
            match self.transport.send_batch(buffer.records()).await {
                Ok(()) => {
                    buffer.clear();
                    debug!(records = count, attempt = attempt + 1, "Flushed producer buffer");
                    return Ok(count);
                }
                Err(e) => {
                    warn!(
                        records = count,
                        attempt = attempt + 1,
                        error = %e,
                        "Producer flush failed, buffer retained"
                    );
                    last_error = Some(e);
                }
            }
        }

        let reason = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no attempt made".to_string());
        Err(BrokerError::Unavailable(format!(
            "flush of {} records failed after {} attempts: {}",
            count,
            self.flush_retries + 1,
            reason
        )))
    }
}

/// Flush the buffer when its oldest record's linger expires.
async fn run_flusher<T: LogTransport>(producer: Weak<Producer<T>>, wakeup: Arc<Notify>) {
    loop {
        let Some(strong) = producer.upgrade() else {
            break;
        };
        let deadline = strong.buffer.lock().await.deadline();
        drop(strong);

        match deadline {
            Some(at) => tokio::time::sleep_until(at).await,
            None => {
                wakeup.notified().await;
                continue;
            }
        }

        let Some(strong) = producer.upgrade() else {
            break;
        };
        if let Err(e) = strong.flush_if_due().await {
            warn!(error = %e, "Linger flush failed, will retry on next deadline");
        }
    }
}

/// Publishes dead letters to a topic on the same log.
pub struct LogDeadLetterPublisher<T: LogTransport> {
    transport: Arc<T>,
    topic: String,
}

impl<T: LogTransport> LogDeadLetterPublisher<T> {
    pub fn new(transport: Arc<T>, topic: impl Into<String>) -> Self {
        Self {
            transport,
            topic: topic.into(),
        }
    }
}

#[async_trait]
impl<T: LogTransport> DeadLetterPublisher for LogDeadLetterPublisher<T> {
    async fn publish(&self, dead_letter: DeadLetter) -> std::result::Result<(), DlqError> {
        let record = ProducerRecord {
            topic: self.topic.clone(),
            key: dead_letter.routing_key().to_string(),
            payload: dead_letter.encode()?,
        };
        self.transport
            .send_batch(std::slice::from_ref(&record))
            .await
            .map_err(|e| DlqError::PublishFailed(e.to_string()))?;
        debug!(topic = %self.topic, key = %record.key, "Published dead letter");
        Ok(())
    }
}

/// Log-style broker over a [`LogTransport`].
pub struct LogBroker<T: LogTransport> {
    transport: Arc<T>,
    producer: Arc<Producer<T>>,
    wakeup: Arc<Notify>,
    flusher: std::sync::Mutex<Option<JoinHandle<()>>>,
    config: LogBrokerConfig,
    topics: TopicResolver,
    handlers: HandlerRegistry,
    subscribed_topics: Mutex<BTreeSet<String>>,
    offsets: Mutex<OffsetTracker>,
    dead_letters: Arc<dyn DeadLetterPublisher>,
    consume_lock: Mutex<()>,
    connected: AtomicBool,
}

impl<T: LogTransport> LogBroker<T> {
    /// Create a broker over an established transport.
    ///
    /// Must run inside a tokio runtime: a linger flusher task is spawned when
    /// `linger` is non-zero.
    pub async fn new(transport: Arc<T>, config: LogBrokerConfig) -> Result<Self> {
        if config.buffer_size == 0 {
            return Err(BrokerError::Configuration(
                "producer buffer_size must be at least 1".to_string(),
            ));
        }

        let producer = Arc::new(Producer {
            transport: Arc::clone(&transport),
            buffer: Mutex::new(ProducerBuffer::new(config.buffer_size, config.linger)),
            flush_retries: config.flush_retries,
        });
        let wakeup = Arc::new(Notify::new());

        let flusher = if config.linger.is_zero() {
            None
        } else {
            Some(tokio::spawn(run_flusher(
                Arc::downgrade(&producer),
                Arc::clone(&wakeup),
            )))
        };

        let dead_letters: Arc<dyn DeadLetterPublisher> = match &config.dead_letter_topic {
            Some(topic) => Arc::new(LogDeadLetterPublisher::new(Arc::clone(&transport), topic)),
            None => Arc::new(NoopDeadLetterPublisher),
        };

        info!(
            topic_prefix = %config.topic_prefix,
            topic_mapping = ?config.topic_mapping,
            commit_mode = ?config.commit_mode,
            buffer_size = config.buffer_size,
            linger_ms = config.linger.as_millis() as u64,
            "Log broker ready"
        );

        Ok(Self {
            topics: TopicResolver::new(config.topic_prefix.clone(), config.topic_mapping),
            transport,
            producer,
            wakeup,
            flusher: std::sync::Mutex::new(flusher),
            config,
            handlers: HandlerRegistry::new(),
            subscribed_topics: Mutex::new(BTreeSet::new()),
            offsets: Mutex::new(OffsetTracker::new()),
            dead_letters,
            consume_lock: Mutex::new(()),
            connected: AtomicBool::new(true),
        })
    }

    /// Replace the dead-letter publisher.
    pub fn with_dead_letter_publisher(mut self, publisher: Arc<dyn DeadLetterPublisher>) -> Self {
        self.dead_letters = publisher;
        self
    }

    /// Flush buffered records now.
    pub async fn flush(&self) -> Result<usize> {
        self.producer.flush().await
    }

    /// Records currently buffered.
    pub async fn buffered(&self) -> usize {
        self.producer.buffer.lock().await.len()
    }

    /// Route a channel maps to.
    pub async fn route(&self, channel: &str) -> Arc<TopicRoute> {
        self.topics.resolve(channel).await
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::Unavailable("log broker disconnected".to_string()))
        }
    }

    fn stop_flusher(&self) {
        if let Ok(mut flusher) = self.flusher.lock() {
            if let Some(handle) = flusher.take() {
                handle.abort();
            }
        }
    }

    async fn commit(&self, records: &[LogRecord]) -> Result<()> {
        let positions = self.offsets.lock().await.advance(records);
        if positions.is_empty() {
            return Ok(());
        }
        self.transport.commit(&positions).await?;
        debug!(partitions = positions.len(), "Committed offsets");
        Ok(())
    }

    async fn process_record(&self, record: &LogRecord) {
        let source = DeadLetterSource::log(&record.topic, record.partition, record.offset);
        let result = process_payload(
            &record.payload,
            record.key.as_deref(),
            &self.handlers,
            &self.config.handler_retry,
        )
        .await;

        let dead_letter = match result {
            ProcessResult::Handled => return,
            ProcessResult::Unrouted => {
                debug!(
                    topic = %record.topic,
                    offset = record.offset,
                    "No handler for record, skipping"
                );
                return;
            }
            ProcessResult::Undecodable(e) => {
                DeadLetter::from_decode_failure(&record.payload, &e, source)
            }
            ProcessResult::Failed {
                message,
                error,
                attempts,
            } => DeadLetter::from_handler_failure(&record.payload, &message, &error, attempts, source),
        };

        if let Err(e) = self.dead_letters.publish(dead_letter).await {
            error!(
                topic = %record.topic,
                partition = record.partition,
                offset = record.offset,
                error = %e,
                "Dead-letter publish failed, advancing past record"
            );
        }
    }
}

#[async_trait]
impl<T: LogTransport> Broker for LogBroker<T> {
    fn kind(&self) -> BrokerKind {
        BrokerKind::Kafka
    }

    async fn publish(&self, channel: &str, message: Arc<Message>) -> Result<()> {
        self.ensure_connected()?;

        let route = self.topics.resolve(channel).await;
        let record = ProducerRecord {
            topic: route.topic.clone(),
            key: route.key.clone(),
            payload: message.encode()?,
        };

        let flush_now = {
            let mut buffer = self.producer.buffer.lock().await;
            if buffer.at_hard_limit() {
                return Err(BrokerError::Unavailable(format!(
                    "producer buffer full ({} records awaiting flush)",
                    buffer.len()
                )));
            }
            buffer.push(record);
            if buffer.len() == 1 {
                self.wakeup.notify_one();
            }
            buffer.is_due(Instant::now())
        };

        if flush_now {
            if let Err(e) = self.producer.flush().await {
                warn!(channel = %channel, error = %e, "Flush failed, records kept for retry");
            }
        }

        debug!(channel = %channel, topic = %route.topic, message_id = %message.id(), "Buffered message");
        Ok(())
    }

    async fn subscribe(&self, channel: &str, handler: Arc<dyn MessageHandler>) -> Result<()> {
        self.ensure_connected()?;

        let route = self.topics.resolve(channel).await;
        self.handlers.register(channel, handler).await;

        let mut topics = self.subscribed_topics.lock().await;
        if topics.insert(route.topic.clone()) {
            let list: Vec<String> = topics.iter().cloned().collect();
            if let Err(e) = self.transport.subscribe(&list).await {
                topics.remove(&route.topic);
                self.handlers.remove(channel).await;
                return Err(e.into());
            }
            info!(channel = %channel, topic = %route.topic, "Subscribed to topic");
        }
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<()> {
        if !self.handlers.remove(channel).await {
            return Ok(());
        }

        let route = self.topics.resolve(channel).await;
        let mut still_needed = false;
        for other in self.handlers.channels().await {
            if self.topics.resolve(&other).await.topic == route.topic {
                still_needed = true;
                break;
            }
        }
        if still_needed {
            return Ok(());
        }

        let mut topics = self.subscribed_topics.lock().await;
        if topics.remove(&route.topic) {
            let list: Vec<String> = topics.iter().cloned().collect();
            self.transport.subscribe(&list).await?;
            info!(channel = %channel, topic = %route.topic, "Unsubscribed from topic");
        }
        Ok(())
    }

    async fn consume(&self, timeout: Duration, batch_size: usize) -> Result<usize> {
        let _guard = self.consume_lock.lock().await;
        self.ensure_connected()?;

        if self.handlers.is_empty().await {
            tokio::time::sleep(timeout).await;
            return Ok(0);
        }

        let records = self.transport.poll(timeout, batch_size.max(1)).await?;
        if records.is_empty() {
            return Ok(0);
        }

        if self.config.commit_mode == CommitMode::Auto {
            if let Err(e) = self.commit(&records).await {
                warn!(error = %e, "Auto commit failed");
            }
        }

        for record in &records {
            self.process_record(record).await;
        }

        if self.config.commit_mode == CommitMode::Manual {
            self.commit(&records).await?;
        }

        debug!(records = records.len(), "Consumed batch");
        Ok(records.len())
    }

    async fn disconnect(&self) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }

        self.producer.flush().await?;
        self.stop_flusher();

        if let Err(e) = self.transport.close().await {
            warn!(error = %e, "Error closing log transport");
        }
        self.topics.invalidate().await;
        self.offsets.lock().await.reset();
        self.connected.store(false, Ordering::SeqCst);
        info!("Log broker disconnected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl<T: LogTransport> Drop for LogBroker<T> {
    fn drop(&mut self) {
        self.stop_flusher();
    }
}

#[cfg(test)]
mod tests;
