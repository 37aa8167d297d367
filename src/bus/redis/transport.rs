//! Pub/sub transport seam.

use std::time::Duration;

use async_trait::async_trait;

use crate::bus::TransportError;

/// A message received on a subscribed channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubMessage {
    /// Broker-side channel name, prefix included.
    pub channel: String,
    pub payload: Vec<u8>,
}

/// Fire-and-forget publish and live-only subscription.
///
/// Nothing is stored: a message reaches exactly the subscribers connected at
/// publish time.
#[async_trait]
pub trait PubSubTransport: Send + Sync + 'static {
    /// Publish, returning how many subscribers received the message.
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<usize, TransportError>;

    async fn subscribe(&self, channels: &[String]) -> Result<(), TransportError>;

    async fn unsubscribe(&self, channels: &[String]) -> Result<(), TransportError>;

    /// Wait up to `timeout` for the next message on any subscribed channel.
    async fn next_message(
        &self,
        timeout: Duration,
    ) -> Result<Option<PubSubMessage>, TransportError>;

    /// Liveness of the subscriber connection.
    async fn is_open(&self) -> bool;

    /// Open a fresh connection. Subscriptions are not carried over.
    async fn reconnect(&self) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}
