//! Ephemeral pub/sub broker (Redis semantics).
//!
//! Publish is immediate: no buffering, no offsets, no replay. A message
//! reaches exactly the processes subscribed when it was published; anything
//! published while a subscriber is disconnected is lost to it. Channel
//! `orders` maps to broker channel `{prefix}_orders`.
//!
//! There is no dead-letter destination. Handler failures are logged and the
//! message is gone.

#[cfg(feature = "redis")]
mod client;
mod memory;
mod transport;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::dispatch::{process_payload, HandlerRegistry, ProcessResult};
use super::{Broker, BrokerError, BrokerKind, MessageHandler, Result, TransportError};
use crate::config::BrokerConfig;
use crate::message::Message;
use crate::utils::retry::RetryConfig;

#[cfg(feature = "redis")]
pub use client::RedisPubSubClient;
pub use memory::{InMemoryPubSub, InMemoryPubSubClient};
pub use transport::{PubSubMessage, PubSubTransport};

/// Configuration for [`PubSubBroker`].
#[derive(Debug, Clone)]
pub struct PubSubBrokerConfig {
    pub channel_prefix: String,
    /// Pause before re-establishing a lost connection.
    pub reconnect_delay: Duration,
    pub handler_retry: RetryConfig,
}

impl Default for PubSubBrokerConfig {
    fn default() -> Self {
        Self {
            channel_prefix: "fanout".to_string(),
            reconnect_delay: Duration::from_secs(1),
            handler_retry: RetryConfig::for_handlers(),
        }
    }
}

impl PubSubBrokerConfig {
    pub fn from_broker_config(config: &BrokerConfig) -> Self {
        Self {
            channel_prefix: config.topic_prefix.clone(),
            reconnect_delay: config.reconnect_delay,
            handler_retry: config.handler_retry.clone(),
        }
    }

    pub fn with_channel_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.channel_prefix = prefix.into();
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_handler_retry(mut self, retry: RetryConfig) -> Self {
        self.handler_retry = retry;
        self
    }
}

/// Ephemeral pub/sub broker over a [`PubSubTransport`].
pub struct PubSubBroker<T: PubSubTransport> {
    transport: Arc<T>,
    config: PubSubBrokerConfig,
    handlers: HandlerRegistry,
    connected: AtomicBool,
    consume_lock: Mutex<()>,
    reconnect_lock: Mutex<()>,
    reconnects: AtomicU64,
}

impl<T: PubSubTransport> PubSubBroker<T> {
    pub fn new(transport: Arc<T>, config: PubSubBrokerConfig) -> Self {
        info!(prefix = %config.channel_prefix, "Pub/sub broker ready");
        Self {
            transport,
            config,
            handlers: HandlerRegistry::new(),
            connected: AtomicBool::new(true),
            consume_lock: Mutex::new(()),
            reconnect_lock: Mutex::new(()),
            reconnects: AtomicU64::new(0),
        }
    }

    /// Connections re-established since creation.
    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::SeqCst)
    }

    /// Broker-side name for a channel.
    pub fn broker_channel(&self, channel: &str) -> String {
        format!("{}_{}", self.config.channel_prefix, channel)
    }

    /// Channel name for a broker-side name, if it carries our prefix.
    fn local_channel<'a>(&self, broker_channel: &'a str) -> Option<&'a str> {
        broker_channel
            .strip_prefix(self.config.channel_prefix.as_str())
            .and_then(|rest| rest.strip_prefix('_'))
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::Unavailable(
                "pub/sub broker disconnected".to_string(),
            ))
        }
    }

    /// Reopen the connection and subscribe to every handled channel again,
    /// unless another task already did so since `generation` was observed.
    async fn reconnect(&self, generation: u64, reason: &str) -> Result<()> {
        let _guard = self.reconnect_lock.lock().await;
        if self.reconnects() != generation && self.transport.is_open().await {
            return Ok(());
        }
        warn!(
            reason = %reason,
            delay_ms = self.config.reconnect_delay.as_millis() as u64,
            "Pub/sub connection lost, reconnecting"
        );
        tokio::time::sleep(self.config.reconnect_delay).await;

        self.transport.reconnect().await.map_err(|e| {
            BrokerError::Unavailable(format!("Failed to reconnect pub/sub: {}", e))
        })?;

        let channels: Vec<String> = self
            .handlers
            .channels()
            .await
            .iter()
            .map(|c| self.broker_channel(c))
            .collect();
        if !channels.is_empty() {
            self.transport.subscribe(&channels).await?;
        }

        let count = self.reconnects.fetch_add(1, Ordering::SeqCst) + 1;
        info!(
            reconnects = count,
            channels = channels.len(),
            "Pub/sub connection re-established"
        );
        Ok(())
    }

    async fn ensure_open(&self) -> Result<()> {
        let generation = self.reconnects();
        if !self.transport.is_open().await {
            self.reconnect(generation, "liveness check failed").await?;
        }
        Ok(())
    }

    async fn process(&self, broker_channel: &str, payload: &[u8]) {
        let fallback = self.local_channel(broker_channel);
        let result = process_payload(
            payload,
            fallback,
            &self.handlers,
            &self.config.handler_retry,
        )
        .await;

        match result {
            ProcessResult::Handled | ProcessResult::Unrouted => {}
            ProcessResult::Undecodable(e) => {
                warn!(channel = %broker_channel, error = %e, "Dropping undecodable message");
            }
            ProcessResult::Failed {
                message,
                error,
                attempts,
            } => {
                error!(
                    channel = %broker_channel,
                    message_id = %message.id(),
                    attempts,
                    error = %error,
                    "Handler failed, message dropped"
                );
            }
        }
    }
}

#[async_trait]
impl<T: PubSubTransport> Broker for PubSubBroker<T> {
    fn kind(&self) -> BrokerKind {
        BrokerKind::Redis
    }

    #[tracing::instrument(name = "pubsub.publish", skip_all, fields(channel = %channel))]
    async fn publish(&self, channel: &str, message: Arc<Message>) -> Result<()> {
        self.ensure_connected()?;
        let payload = message.encode()?;
        let name = self.broker_channel(channel);

        let generation = self.reconnects();
        let receivers = match self.transport.publish(&name, &payload).await {
            Err(TransportError::ConnectionLost(reason)) => {
                self.reconnect(generation, &reason).await?;
                self.transport.publish(&name, &payload).await?
            }
            other => other?,
        };

        debug!(
            channel = %name,
            message_id = %message.id(),
            receivers,
            "Published message"
        );
        Ok(())
    }

    async fn subscribe(&self, channel: &str, handler: Arc<dyn MessageHandler>) -> Result<()> {
        self.ensure_connected()?;
        if !self.handlers.register(channel, handler).await {
            return Ok(());
        }

        self.ensure_open().await?;
        let name = self.broker_channel(channel);
        if let Err(e) = self.transport.subscribe(&[name.clone()]).await {
            self.handlers.remove(channel).await;
            return Err(e.into());
        }

        info!(channel = %name, "Subscribed to pub/sub channel");
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<()> {
        if !self.handlers.remove(channel).await {
            return Ok(());
        }
        let name = self.broker_channel(channel);
        match self.transport.unsubscribe(&[name.clone()]).await {
            Ok(()) => {}
            // A fresh connection starts with no subscriptions.
            Err(TransportError::ConnectionLost(_)) => {}
            Err(e) => return Err(e.into()),
        }

        info!(channel = %name, "Unsubscribed from pub/sub channel");
        Ok(())
    }

    async fn consume(&self, timeout: Duration, batch_size: usize) -> Result<usize> {
        let _guard = self.consume_lock.lock().await;
        self.ensure_connected()?;

        if self.handlers.is_empty().await {
            tokio::time::sleep(timeout).await;
            return Ok(0);
        }
        self.ensure_open().await?;

        let mut handled = 0;
        let mut wait = timeout;
        while handled < batch_size.max(1) {
            let generation = self.reconnects();
            match self.transport.next_message(wait).await {
                Ok(Some(message)) => {
                    self.process(&message.channel, &message.payload).await;
                    handled += 1;
                    wait = Duration::ZERO;
                }
                Ok(None) => break,
                Err(TransportError::ConnectionLost(reason)) => {
                    self.reconnect(generation, &reason).await?;
                    break;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(handled)
    }

    async fn disconnect(&self) -> Result<()> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(e) = self.transport.close().await {
            warn!(error = %e, "Error closing pub/sub connection");
        }
        info!("Pub/sub broker disconnected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests;
