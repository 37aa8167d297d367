//! Wire message for channel fanout.
//!
//! A [`Message`] is created once by the publisher, serialized once, and
//! deserialized once per consumer. Its id is assigned here, never by a broker.
//!
//! Wire format (JSON):
//! ```text
//! { "id": string, "type": "event"|"subscribe"|"unsubscribe"|"ping"|"pong"|"error",
//!   "channel": string|null, "event": string|null, "data": any, "timestamp": integer }
//! ```

use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Structured message payload (map, list or scalar).
pub type Payload = Value;

/// Errors raised while encoding or decoding messages.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("Failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Failed to decode message: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Message kind discriminator, serialized as the `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Event,
    Subscribe,
    Unsubscribe,
    Ping,
    Pong,
    Error,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageKind::Event => "event",
            MessageKind::Subscribe => "subscribe",
            MessageKind::Unsubscribe => "unsubscribe",
            MessageKind::Ping => "ping",
            MessageKind::Pong => "pong",
            MessageKind::Error => "error",
        };
        f.write_str(s)
    }
}

/// Immutable fanout message.
///
/// Fields are private; construct through the kind-specific constructors and
/// read through accessors so a message cannot change after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    id: String,
    #[serde(rename = "type")]
    kind: MessageKind,
    channel: Option<String>,
    event: Option<String>,
    #[serde(default)]
    data: Payload,
    timestamp: i64,
}

impl Message {
    fn build(
        kind: MessageKind,
        channel: Option<String>,
        event: Option<String>,
        data: Payload,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            channel,
            event,
            data,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    /// Application event on a channel.
    pub fn event(channel: impl Into<String>, event: impl Into<String>, data: Payload) -> Self {
        Self::build(
            MessageKind::Event,
            Some(channel.into()),
            Some(event.into()),
            data,
        )
    }

    /// Event addressed to connections directly rather than through a channel.
    pub fn direct(event: impl Into<String>, data: Payload) -> Self {
        Self::build(MessageKind::Event, None, Some(event.into()), data)
    }

    pub fn subscribe(channel: impl Into<String>) -> Self {
        Self::build(MessageKind::Subscribe, Some(channel.into()), None, Value::Null)
    }

    pub fn unsubscribe(channel: impl Into<String>) -> Self {
        Self::build(
            MessageKind::Unsubscribe,
            Some(channel.into()),
            None,
            Value::Null,
        )
    }

    pub fn ping() -> Self {
        Self::build(MessageKind::Ping, None, None, Value::Null)
    }

    pub fn pong() -> Self {
        Self::build(MessageKind::Pong, None, None, Value::Null)
    }

    /// Error notice, optionally scoped to a channel.
    pub fn error(channel: Option<String>, reason: impl Into<String>) -> Self {
        Self::build(
            MessageKind::Error,
            channel,
            None,
            serde_json::json!({ "message": reason.into() }),
        )
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn channel(&self) -> Option<&str> {
        self.channel.as_deref()
    }

    pub fn event_name(&self) -> Option<&str> {
        self.event.as_deref()
    }

    pub fn data(&self) -> &Payload {
        &self.data
    }

    /// Creation time in milliseconds since the Unix epoch.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Serialize to the canonical JSON wire format.
    pub fn encode(&self) -> Result<Vec<u8>, MessageError> {
        serde_json::to_vec(self).map_err(MessageError::Encode)
    }

    /// Serialize to a JSON string, for text transports.
    pub fn encode_to_string(&self) -> Result<String, MessageError> {
        serde_json::to_string(self).map_err(MessageError::Encode)
    }

    /// Parse a message from its wire bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
        serde_json::from_slice(bytes).map_err(MessageError::Decode)
    }
}
