//! Queue transport seam.

use std::time::Duration;

use async_trait::async_trait;

use crate::bus::TransportError;

/// A message taken off a queue, pending settlement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDelivery {
    pub delivery_tag: u64,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub redelivered: bool,
}

/// AMQP 0-9-1 style operations over one connection and channel.
#[async_trait]
pub trait QueueTransport: Send + Sync + 'static {
    /// Open (or re-open) the connection and channel.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Liveness probe of the current connection.
    async fn is_open(&self) -> bool;

    /// Unacknowledged push deliveries allowed in flight.
    async fn set_prefetch(&self, prefetch: u16) -> Result<(), TransportError>;

    /// Declare a durable topic exchange.
    async fn declare_exchange(&self, exchange: &str) -> Result<(), TransportError>;

    /// Declare a durable queue, optionally dead-lettering to `dead_letter_exchange`.
    async fn declare_queue(
        &self,
        queue: &str,
        dead_letter_exchange: Option<&str>,
    ) -> Result<(), TransportError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError>;

    async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError>;

    /// Publish and wait for the broker's confirm.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<(), TransportError>;

    /// Synchronous pop. `None` when the queue is empty.
    async fn get(&self, queue: &str) -> Result<Option<QueueDelivery>, TransportError>;

    /// Register a push consumer, wait up to `timeout` for its first delivery,
    /// then cancel it.
    ///
    /// Returns every delivery the broker pushed before the cancel took
    /// effect, oldest first. All of them are unacknowledged and must be
    /// settled by the caller. Empty when the wait timed out with nothing
    /// pushed.
    async fn next_deliveries(
        &self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Vec<QueueDelivery>, TransportError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError>;

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// AMQP topic-exchange pattern match: `*` matches one word, `#` zero or more.
pub fn routing_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches_words(&pattern, &key)
}

fn matches_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| matches_words(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((&first, key_rest)) if word == "*" || word == first => {
                matches_words(rest, key_rest)
            }
            _ => false,
        },
    }
}
