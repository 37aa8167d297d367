//! Dead Letter Queue (DLQ) infrastructure.
//!
//! Messages that cannot be delivered (undecodable payloads, handlers that
//! failed unrecoverably or exhausted their retries) are parked on a dead-letter
//! destination so the consumer can advance past them.
//!
//! ## Destination Naming
//!
//! Defaults to `{topic_prefix}.dlq`; override with `broker.dead_letter_topic`.
//! For the queue backend this names the dead-letter exchange and queue.
//!
//! ## Message Format
//!
//! A [`DeadLetter`] serialized as JSON. The original payload is kept verbatim:
//! UTF-8 payloads as text, anything else base64-encoded.

use std::collections::HashMap;

use async_trait::async_trait;
use base64::Engine;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::bus::HandlerError;
use crate::message::{Message, MessageError};

/// Suffix appended to the topic prefix for the default DLQ destination.
pub const DLQ_SUFFIX: &str = "dlq";

/// Build the default DLQ destination for a topic prefix.
pub fn default_dead_letter_topic(topic_prefix: &str) -> String {
    format!("{}.{}", topic_prefix, DLQ_SUFFIX)
}

/// Errors that can occur during DLQ operations.
#[derive(Debug, thiserror::Error)]
pub enum DlqError {
    #[error("Failed to serialize dead letter: {0}")]
    Serialization(String),

    #[error("Failed to publish to DLQ: {0}")]
    PublishFailed(String),

    #[error("Invalid dead letter: {0}")]
    InvalidDeadLetter(String),
}

/// How the original payload is stored in [`DeadLetter::payload`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadEncoding {
    Utf8,
    Base64,
}

/// Where the failed message was read from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterSource {
    /// Topic, queue or pub/sub channel name.
    pub origin: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partition: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<i64>,
}

impl DeadLetterSource {
    /// Position in a partitioned log.
    pub fn log(topic: &str, partition: i32, offset: i64) -> Self {
        Self {
            origin: topic.to_string(),
            partition: Some(partition),
            offset: Some(offset),
        }
    }

    /// A named queue without positional information.
    pub fn queue(queue: &str) -> Self {
        Self {
            origin: queue.to_string(),
            partition: None,
            offset: None,
        }
    }
}

/// Dead letter queue entry for a failed message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Id of the decoded message, if decoding got that far.
    pub message_id: Option<String>,
    /// Channel the message was addressed to, if known.
    pub channel: Option<String>,
    /// Original payload, encoded per `payload_encoding`.
    pub payload: String,
    pub payload_encoding: PayloadEncoding,
    /// Human-readable reason for rejection.
    pub reason: String,
    /// Retries performed before giving up.
    pub retry_count: u32,
    /// Whether the last failure was classified transient.
    pub is_transient: bool,
    /// Milliseconds since epoch when the message was dead-lettered.
    pub failed_at: i64,
    pub source: DeadLetterSource,
    /// Additional context.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl DeadLetter {
    fn build(raw: &[u8], reason: String, source: DeadLetterSource) -> Self {
        let (payload, payload_encoding) = match std::str::from_utf8(raw) {
            Ok(text) => (text.to_string(), PayloadEncoding::Utf8),
            Err(_) => (
                base64::engine::general_purpose::STANDARD.encode(raw),
                PayloadEncoding::Base64,
            ),
        };

        Self {
            message_id: None,
            channel: None,
            payload,
            payload_encoding,
            reason,
            retry_count: 0,
            is_transient: false,
            failed_at: Utc::now().timestamp_millis(),
            source,
            metadata: HashMap::new(),
        }
    }

    /// Create a dead letter for a payload that could not be decoded.
    pub fn from_decode_failure(raw: &[u8], error: &MessageError, source: DeadLetterSource) -> Self {
        Self::build(raw, error.to_string(), source)
    }

    /// Create a dead letter for a message whose handler gave up.
    ///
    /// `attempts` counts every invocation, including the first.
    pub fn from_handler_failure(
        raw: &[u8],
        message: &Message,
        error: &HandlerError,
        attempts: u32,
        source: DeadLetterSource,
    ) -> Self {
        let reason = format!("Handler failed after {} attempts: {}", attempts, error);
        let mut dead_letter = Self::build(raw, reason, source);
        dead_letter.message_id = Some(message.id().to_string());
        dead_letter.channel = message.channel().map(str::to_string);
        dead_letter.retry_count = attempts.saturating_sub(1);
        dead_letter.is_transient = error.is_transient();
        dead_letter
            .metadata
            .insert("message_timestamp".to_string(), message.timestamp().to_string());
        dead_letter
    }

    /// Add metadata to the dead letter.
    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    /// Routing key / partition key for the dead-letter destination.
    pub fn routing_key(&self) -> &str {
        self.channel.as_deref().unwrap_or("unknown")
    }

    /// Recover the original payload bytes.
    pub fn original_payload(&self) -> Result<Vec<u8>, DlqError> {
        match self.payload_encoding {
            PayloadEncoding::Utf8 => Ok(self.payload.as_bytes().to_vec()),
            PayloadEncoding::Base64 => base64::engine::general_purpose::STANDARD
                .decode(&self.payload)
                .map_err(|e| DlqError::InvalidDeadLetter(e.to_string())),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, DlqError> {
        serde_json::to_vec(self).map_err(|e| DlqError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DlqError> {
        serde_json::from_slice(bytes).map_err(|e| DlqError::InvalidDeadLetter(e.to_string()))
    }
}

/// Trait for publishing messages to a dead letter queue.
///
/// Implementations handle the actual transport (log topic, queue exchange,
/// in-memory channel).
#[async_trait]
pub trait DeadLetterPublisher: Send + Sync {
    /// Publish a dead letter to the queue.
    async fn publish(&self, dead_letter: DeadLetter) -> Result<(), DlqError>;

    /// Check if the publisher is configured and ready.
    fn is_configured(&self) -> bool {
        true
    }
}

/// No-op DLQ publisher that logs but doesn't actually send anywhere.
///
/// Used when DLQ publishing is disabled.
pub struct NoopDeadLetterPublisher;

#[async_trait]
impl DeadLetterPublisher for NoopDeadLetterPublisher {
    async fn publish(&self, dead_letter: DeadLetter) -> Result<(), DlqError> {
        warn!(
            channel = %dead_letter.routing_key(),
            origin = %dead_letter.source.origin,
            reason = %dead_letter.reason,
            "DLQ not configured, dropping dead letter"
        );
        Ok(())
    }

    fn is_configured(&self) -> bool {
        false
    }
}

/// In-memory DLQ publisher using a channel.
///
/// Used for tests and embedding applications that inspect failures in-process.
pub struct ChannelDeadLetterPublisher {
    sender: mpsc::UnboundedSender<DeadLetter>,
}

impl ChannelDeadLetterPublisher {
    /// Returns the publisher and a receiver for consuming dead letters.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DeadLetter>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl DeadLetterPublisher for ChannelDeadLetterPublisher {
    async fn publish(&self, dead_letter: DeadLetter) -> Result<(), DlqError> {
        info!(
            channel = %dead_letter.routing_key(),
            reason = %dead_letter.reason,
            "Publishing to channel DLQ"
        );
        self.sender
            .send(dead_letter)
            .map_err(|e| DlqError::PublishFailed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_message() -> Message {
        Message::event("orders.42", "created", json!({"total": 10}))
    }

    #[test]
    fn test_default_dead_letter_topic() {
        assert_eq!(default_dead_letter_topic("fanout"), "fanout.dlq");
        assert_eq!(default_dead_letter_topic("app"), "app.dlq");
    }

    #[test]
    fn test_from_handler_failure() {
        let message = make_message();
        let raw = message.encode().unwrap();
        let error = HandlerError::Transient("downstream timeout".to_string());

        let dl = DeadLetter::from_handler_failure(
            &raw,
            &message,
            &error,
            4,
            DeadLetterSource::log("fanout.orders", 2, 17),
        );

        assert_eq!(dl.message_id.as_deref(), Some(message.id()));
        assert_eq!(dl.routing_key(), "orders.42");
        assert_eq!(dl.retry_count, 3);
        assert!(dl.is_transient);
        assert!(dl.reason.contains("4 attempts"));
        assert!(dl.reason.contains("downstream timeout"));
        assert_eq!(dl.payload_encoding, PayloadEncoding::Utf8);
        assert_eq!(dl.original_payload().unwrap(), raw);
        assert_eq!(dl.source.partition, Some(2));
        assert_eq!(dl.source.offset, Some(17));
        assert_eq!(
            dl.metadata.get("message_timestamp"),
            Some(&message.timestamp().to_string())
        );
    }

    #[test]
    fn test_from_decode_failure_binary_payload() {
        let raw = vec![0xff, 0xfe, 0x00, 0x01];
        let error = Message::decode(&raw).unwrap_err();

        let dl = DeadLetter::from_decode_failure(&raw, &error, DeadLetterSource::queue("q"));

        assert!(dl.message_id.is_none());
        assert_eq!(dl.routing_key(), "unknown");
        assert_eq!(dl.retry_count, 0);
        assert_eq!(dl.payload_encoding, PayloadEncoding::Base64);
        assert_eq!(dl.original_payload().unwrap(), raw);
    }

    #[test]
    fn test_encode_decode_preserves_fields() {
        let message = make_message();
        let raw = message.encode().unwrap();
        let dl = DeadLetter::from_handler_failure(
            &raw,
            &message,
            &HandlerError::Unrecoverable("bad data".to_string()),
            1,
            DeadLetterSource::queue("fanout.workers"),
        )
        .with_metadata("consumer", "test");

        let decoded = DeadLetter::decode(&dl.encode().unwrap()).unwrap();

        assert_eq!(decoded.message_id, dl.message_id);
        assert_eq!(decoded.failed_at, dl.failed_at);
        assert_eq!(decoded.retry_count, 0);
        assert!(!decoded.is_transient);
        assert_eq!(decoded.metadata.get("consumer"), Some(&"test".to_string()));
        assert_eq!(decoded.source, DeadLetterSource::queue("fanout.workers"));
    }

    #[tokio::test]
    async fn test_noop_publisher_succeeds() {
        let publisher = NoopDeadLetterPublisher;
        let error = Message::decode(b"nope").unwrap_err();
        let dl = DeadLetter::from_decode_failure(b"nope", &error, DeadLetterSource::queue("q"));

        assert!(publisher.publish(dl).await.is_ok());
        assert!(!publisher.is_configured());
    }

    #[tokio::test]
    async fn test_channel_publisher_preserves_order() {
        let (publisher, mut receiver) = ChannelDeadLetterPublisher::new();

        for i in 0..3 {
            let dl = DeadLetter::from_decode_failure(
                b"{}",
                &Message::decode(b"{}").unwrap_err(),
                DeadLetterSource::log("t", 0, i),
            );
            publisher.publish(dl).await.unwrap();
        }

        for i in 0..3 {
            let received = receiver.recv().await.expect("Should receive");
            assert_eq!(received.source.offset, Some(i));
        }
        assert!(publisher.is_configured());
    }

    #[test]
    fn test_dlq_error_display() {
        let err = DlqError::InvalidDeadLetter("missing payload".to_string());
        assert!(err.to_string().contains("missing payload"));

        let err = DlqError::PublishFailed("connection refused".to_string());
        assert!(err.to_string().contains("connection refused"));
    }
}
