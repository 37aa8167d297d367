//! Queue-style broker (AMQP / RabbitMQ semantics).
//!
//! Messages are published to a durable topic exchange with the channel name
//! as routing key. Each consumer group owns one durable queue,
//! `{prefix}.{group}`, bound once per subscribed channel; processes that
//! share a group compete for messages, distinct groups each get a copy.
//!
//! `consume` pops with `basic.get` while the queue has messages. On an empty
//! queue it waits on a short-lived push consumer that is cancelled before
//! anything is settled, so pops never overtake older pushed deliveries.
//!
//! Every operation is preceded by a liveness check. A lost connection is
//! re-established after `reconnect_delay`, the topology and bindings are
//! rebuilt, and the failed operation is retried once.
//!
//! Settlement:
//! - handled (or no handler): ack
//! - undecodable: reject without requeue; the queue's dead-letter exchange
//!   receives the raw message
//! - handler gave up: a [`DeadLetter`] record is published to the
//!   dead-letter exchange, then the delivery is acked

#[cfg(feature = "amqp")]
mod lapin_transport;
mod memory;
mod transport;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::dispatch::{process_payload, HandlerRegistry, ProcessResult};
use super::{Broker, BrokerError, BrokerKind, MessageHandler, Result, TransportError};
use crate::config::BrokerConfig;
use crate::dlq::{DeadLetter, DeadLetterPublisher, DeadLetterSource, DlqError, NoopDeadLetterPublisher};
use crate::message::Message;
use crate::utils::retry::RetryConfig;

#[cfg(feature = "amqp")]
pub use lapin_transport::LapinTransport;
pub use memory::{InMemoryQueue, InMemoryQueueClient};
pub use transport::{routing_matches, QueueDelivery, QueueTransport};

/// Configuration for [`QueueBroker`].
#[derive(Debug, Clone)]
pub struct QueueBrokerConfig {
    /// Topic exchange messages are published to.
    pub exchange: String,
    /// Durable queue this consumer group reads from.
    pub queue: String,
    /// Unacknowledged push deliveries allowed in flight.
    pub prefetch: u16,
    /// Pause before re-establishing a lost connection.
    pub reconnect_delay: Duration,
    /// Dead-letter exchange (and queue of the same name). `None` disables
    /// dead-lettering.
    pub dead_letter_exchange: Option<String>,
    pub handler_retry: RetryConfig,
}

impl Default for QueueBrokerConfig {
    fn default() -> Self {
        Self {
            exchange: "fanout.events".to_string(),
            queue: "fanout.fanout".to_string(),
            prefetch: 50,
            reconnect_delay: Duration::from_secs(1),
            dead_letter_exchange: None,
            handler_retry: RetryConfig::for_handlers(),
        }
    }
}

impl QueueBrokerConfig {
    pub fn from_broker_config(config: &BrokerConfig) -> Self {
        Self {
            exchange: format!("{}.events", config.topic_prefix),
            queue: format!("{}.{}", config.topic_prefix, config.group_id),
            prefetch: config.prefetch,
            reconnect_delay: config.reconnect_delay,
            dead_letter_exchange: config.dead_letter_topic.clone(),
            handler_retry: config.handler_retry.clone(),
        }
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = exchange.into();
        self
    }

    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_dead_letter_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.dead_letter_exchange = Some(exchange.into());
        self
    }

    pub fn with_handler_retry(mut self, retry: RetryConfig) -> Self {
        self.handler_retry = retry;
        self
    }
}

/// Publishes dead letters to an exchange on the same broker.
pub struct QueueDeadLetterPublisher<T: QueueTransport> {
    transport: Arc<T>,
    exchange: String,
}

impl<T: QueueTransport> QueueDeadLetterPublisher<T> {
    pub fn new(transport: Arc<T>, exchange: impl Into<String>) -> Self {
        Self {
            transport,
            exchange: exchange.into(),
        }
    }
}

#[async_trait]
impl<T: QueueTransport> DeadLetterPublisher for QueueDeadLetterPublisher<T> {
    async fn publish(&self, dead_letter: DeadLetter) -> std::result::Result<(), DlqError> {
        let payload = dead_letter.encode()?;
        self.transport
            .publish(&self.exchange, dead_letter.routing_key(), &payload)
            .await
            .map_err(|e| DlqError::PublishFailed(e.to_string()))?;
        debug!(exchange = %self.exchange, "Published dead letter");
        Ok(())
    }
}

enum Settlement {
    Ack,
    Reject,
}

/// Queue-style broker over a [`QueueTransport`].
pub struct QueueBroker<T: QueueTransport> {
    transport: Arc<T>,
    config: QueueBrokerConfig,
    handlers: HandlerRegistry,
    /// Channels bound on the current connection.
    bindings: Mutex<HashSet<String>>,
    queue_declared: AtomicBool,
    dead_letters: Arc<dyn DeadLetterPublisher>,
    connected: AtomicBool,
    consume_lock: Mutex<()>,
    reconnect_lock: Mutex<()>,
    reconnects: AtomicU64,
}

impl<T: QueueTransport> QueueBroker<T> {
    /// Connect and declare the exchange topology.
    pub async fn connect(transport: Arc<T>, config: QueueBrokerConfig) -> Result<Self> {
        transport.connect().await.map_err(|e| {
            BrokerError::Unavailable(format!("Failed to connect to AMQP broker: {}", e))
        })?;

        let dead_letters: Arc<dyn DeadLetterPublisher> = match &config.dead_letter_exchange {
            Some(exchange) => Arc::new(QueueDeadLetterPublisher::new(
                Arc::clone(&transport),
                exchange,
            )),
            None => Arc::new(NoopDeadLetterPublisher),
        };

        let broker = Self {
            transport,
            config,
            handlers: HandlerRegistry::new(),
            bindings: Mutex::new(HashSet::new()),
            queue_declared: AtomicBool::new(false),
            dead_letters,
            connected: AtomicBool::new(true),
            consume_lock: Mutex::new(()),
            reconnect_lock: Mutex::new(()),
            reconnects: AtomicU64::new(0),
        };
        broker.declare_topology().await?;

        info!(
            exchange = %broker.config.exchange,
            queue = %broker.config.queue,
            prefetch = broker.config.prefetch,
            "Connected to AMQP"
        );
        Ok(broker)
    }

    /// Replace the dead-letter publisher.
    pub fn with_dead_letter_publisher(mut self, publisher: Arc<dyn DeadLetterPublisher>) -> Self {
        self.dead_letters = publisher;
        self
    }

    /// Connections re-established since creation.
    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::SeqCst)
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::Unavailable("queue broker disconnected".to_string()))
        }
    }

    async fn declare_topology(&self) -> Result<()> {
        self.transport.set_prefetch(self.config.prefetch).await?;
        self.transport.declare_exchange(&self.config.exchange).await?;
        if let Some(dlx) = &self.config.dead_letter_exchange {
            self.transport.declare_exchange(dlx).await?;
            self.transport.declare_queue(dlx, None).await?;
            self.transport.bind_queue(dlx, dlx, "#").await?;
        }
        Ok(())
    }

    /// Redeclare everything a fresh connection is missing.
    async fn rebuild(&self) -> Result<()> {
        self.declare_topology().await?;

        let channels = self.handlers.channels().await;
        let mut bindings = self.bindings.lock().await;
        bindings.clear();
        self.queue_declared.store(false, Ordering::SeqCst);

        if channels.is_empty() {
            return Ok(());
        }
        self.transport
            .declare_queue(&self.config.queue, self.config.dead_letter_exchange.as_deref())
            .await?;
        self.queue_declared.store(true, Ordering::SeqCst);
        for channel in channels {
            self.transport
                .bind_queue(&self.config.queue, &self.config.exchange, &channel)
                .await?;
            bindings.insert(channel);
        }
        debug!(bindings = bindings.len(), "Rebuilt queue bindings");
        Ok(())
    }

    /// Re-establish the connection unless another task already did so since
    /// `generation` was observed.
    async fn reconnect(&self, generation: u64, reason: &str) -> Result<()> {
        let _guard = self.reconnect_lock.lock().await;
        if self.reconnects() != generation && self.transport.is_open().await {
            return Ok(());
        }
        warn!(
            reason = %reason,
            delay_ms = self.config.reconnect_delay.as_millis() as u64,
            "AMQP connection lost, reconnecting"
        );
        tokio::time::sleep(self.config.reconnect_delay).await;

        self.transport.connect().await.map_err(|e| {
            BrokerError::Unavailable(format!("Failed to reconnect to AMQP broker: {}", e))
        })?;
        self.rebuild().await?;

        let count = self.reconnects.fetch_add(1, Ordering::SeqCst) + 1;
        info!(reconnects = count, "AMQP connection re-established");
        Ok(())
    }

    async fn ensure_open(&self) -> Result<()> {
        let generation = self.reconnects();
        if !self.transport.is_open().await {
            self.reconnect(generation, "liveness check failed").await?;
        }
        Ok(())
    }

    /// Run an operation on a live connection, reconnecting and retrying once
    /// if the connection is lost mid-operation.
    async fn run<'a, R, F>(&'a self, operation: &str, op: F) -> Result<R>
    where
        F: Fn(&'a T) -> BoxFuture<'a, std::result::Result<R, TransportError>>,
    {
        self.ensure_open().await?;
        let generation = self.reconnects();
        match op(&*self.transport).await {
            Err(TransportError::ConnectionLost(reason)) => {
                debug!(operation = %operation, "Retrying after reconnect");
                self.reconnect(generation, &reason).await?;
                op(&*self.transport).await.map_err(BrokerError::from)
            }
            other => other.map_err(BrokerError::from),
        }
    }

    async fn settle_delivery(&self, delivery_tag: u64, settlement: Settlement) -> Result<()> {
        let generation = self.reconnects();
        let result = match settlement {
            Settlement::Ack => self.transport.ack(delivery_tag).await,
            Settlement::Reject => self.transport.reject(delivery_tag, false).await,
        };
        match result {
            Ok(()) => Ok(()),
            Err(TransportError::ConnectionLost(reason)) => {
                warn!(
                    delivery_tag,
                    "Connection lost before settlement, delivery will be redelivered"
                );
                self.reconnect(generation, &reason).await
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn process(&self, delivery: QueueDelivery) -> Result<()> {
        let result = process_payload(
            &delivery.payload,
            Some(&delivery.routing_key),
            &self.handlers,
            &self.config.handler_retry,
        )
        .await;

        match result {
            ProcessResult::Handled | ProcessResult::Unrouted => {
                self.settle_delivery(delivery.delivery_tag, Settlement::Ack)
                    .await
            }
            ProcessResult::Undecodable(e) => {
                warn!(
                    routing_key = %delivery.routing_key,
                    error = %e,
                    "Rejecting undecodable delivery"
                );
                self.settle_delivery(delivery.delivery_tag, Settlement::Reject)
                    .await
            }
            ProcessResult::Failed {
                message,
                error,
                attempts,
            } => {
                let dead_letter = DeadLetter::from_handler_failure(
                    &delivery.payload,
                    &message,
                    &error,
                    attempts,
                    DeadLetterSource::queue(&self.config.queue),
                )
                .with_metadata("redelivered", &delivery.redelivered.to_string());
                if let Err(e) = self.dead_letters.publish(dead_letter).await {
                    error!(
                        routing_key = %delivery.routing_key,
                        error = %e,
                        "Dead-letter publish failed, acknowledging anyway"
                    );
                }
                self.settle_delivery(delivery.delivery_tag, Settlement::Ack)
                    .await
            }
        }
    }
}

#[async_trait]
impl<T: QueueTransport> Broker for QueueBroker<T> {
    fn kind(&self) -> BrokerKind {
        BrokerKind::RabbitMq
    }

    async fn publish(&self, channel: &str, message: Arc<Message>) -> Result<()> {
        self.ensure_connected()?;
        let payload = message.encode()?;
        let exchange = self.config.exchange.as_str();

        self.run("publish", |t| t.publish(exchange, channel, &payload))
            .await?;

        debug!(
            exchange = %exchange,
            routing_key = %channel,
            message_id = %message.id(),
            "Published message"
        );
        Ok(())
    }

    async fn subscribe(&self, channel: &str, handler: Arc<dyn MessageHandler>) -> Result<()> {
        self.ensure_connected()?;
        self.handlers.register(channel, handler).await;

        if self.bindings.lock().await.contains(channel) {
            return Ok(());
        }

        let queue = self.config.queue.as_str();
        let exchange = self.config.exchange.as_str();
        let dlx = self.config.dead_letter_exchange.as_deref();

        if !self.queue_declared.load(Ordering::SeqCst) {
            self.run("declare_queue", |t| t.declare_queue(queue, dlx))
                .await?;
            self.queue_declared.store(true, Ordering::SeqCst);
        }
        self.run("bind", |t| t.bind_queue(queue, exchange, channel))
            .await?;
        self.bindings.lock().await.insert(channel.to_string());

        info!(queue = %queue, routing_key = %channel, "Bound queue to exchange");
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<()> {
        if !self.handlers.remove(channel).await {
            return Ok(());
        }
        if !self.bindings.lock().await.remove(channel) {
            return Ok(());
        }

        let queue = self.config.queue.as_str();
        let exchange = self.config.exchange.as_str();
        self.run("unbind", |t| t.unbind_queue(queue, exchange, channel))
            .await?;

        info!(queue = %queue, routing_key = %channel, "Unbound queue from exchange");
        Ok(())
    }

    async fn consume(&self, timeout: Duration, batch_size: usize) -> Result<usize> {
        let _guard = self.consume_lock.lock().await;
        self.ensure_connected()?;

        if self.handlers.is_empty().await {
            tokio::time::sleep(timeout).await;
            return Ok(0);
        }

        let queue = self.config.queue.as_str();
        let mut handled = 0;

        while handled < batch_size.max(1) {
            match self.run("get", |t| t.get(queue)).await? {
                Some(delivery) => {
                    self.process(delivery).await?;
                    handled += 1;
                }
                None => break,
            }
        }

        if handled == 0 {
            // Everything pushed during the wait is unacked and older than the
            // queue head, so all of it is settled before the next pop.
            let pushed = self
                .run("consume", |t| t.next_deliveries(queue, timeout))
                .await?;
            for delivery in pushed {
                self.process(delivery).await?;
                handled += 1;
            }
        }

        Ok(handled)
    }

    async fn disconnect(&self) -> Result<()> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(e) = self.transport.close().await {
            warn!(error = %e, "Error closing AMQP connection");
        }
        self.bindings.lock().await.clear();
        self.queue_declared.store(false, Ordering::SeqCst);
        info!("Queue broker disconnected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
