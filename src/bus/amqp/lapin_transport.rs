//! AMQP transport over lapin (RabbitMQ).

use std::time::Duration;

use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicGetOptions,
        BasicPublishOptions, BasicQosOptions, BasicRejectOptions, ConfirmSelectOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::transport::{QueueDelivery, QueueTransport};
use crate::bus::TransportError;

const CONSUMER_TAG_PREFIX: &str = "fanout-consumer";

struct Session {
    connection: Connection,
    channel: Channel,
}

/// One AMQP connection with a single confirm-mode channel.
pub struct LapinTransport {
    url: String,
    session: Mutex<Option<Session>>,
}

impl LapinTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            session: Mutex::new(None),
        }
    }

    async fn channel(&self) -> Result<Channel, TransportError> {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|s| s.channel.clone())
            .ok_or_else(|| TransportError::ConnectionLost("AMQP connection closed".to_string()))
    }
}

/// Map a lapin error onto the transport taxonomy.
fn classify(error: lapin::Error) -> TransportError {
    match error {
        lapin::Error::IOError(_)
        | lapin::Error::InvalidChannelState(_)
        | lapin::Error::InvalidConnectionState(_)
        | lapin::Error::ParsingError(_)
        | lapin::Error::MissingHeartbeatError => TransportError::ConnectionLost(error.to_string()),
        _ => TransportError::Operation(error.to_string()),
    }
}

fn to_delivery(delivery: lapin::message::Delivery) -> QueueDelivery {
    QueueDelivery {
        delivery_tag: delivery.delivery_tag,
        routing_key: delivery.routing_key.to_string(),
        payload: delivery.data,
        redelivered: delivery.redelivered,
    }
}

#[async_trait]
impl QueueTransport for LapinTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        let mut session = self.session.lock().await;
        if let Some(old) = session.take() {
            if let Err(e) = old.connection.close(200, "reconnecting").await {
                debug!(error = %e, "Closing stale AMQP connection failed");
            }
        }

        let connection = Connection::connect(&self.url, ConnectionProperties::default())
            .await
            .map_err(|e| TransportError::ConnectionLost(format!("Failed to connect: {}", e)))?;
        let channel = connection.create_channel().await.map_err(classify)?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(classify)?;

        info!(url = %self.url, "Opened AMQP connection");
        *session = Some(Session {
            connection,
            channel,
        });
        Ok(())
    }

    async fn is_open(&self) -> bool {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|s| s.connection.status().connected() && s.channel.status().connected())
            .unwrap_or(false)
    }

    async fn set_prefetch(&self, prefetch: u16) -> Result<(), TransportError> {
        self.channel()
            .await?
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(classify)
    }

    async fn declare_exchange(&self, exchange: &str) -> Result<(), TransportError> {
        self.channel()
            .await?
            .exchange_declare(
                exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(classify)
    }

    async fn declare_queue(
        &self,
        queue: &str,
        dead_letter_exchange: Option<&str>,
    ) -> Result<(), TransportError> {
        let mut arguments = FieldTable::default();
        if let Some(exchange) = dead_letter_exchange {
            arguments.insert(
                "x-dead-letter-exchange".into(),
                AMQPValue::LongString(exchange.into()),
            );
        }

        self.channel()
            .await?
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                arguments,
            )
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        self.channel()
            .await?
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(classify)
    }

    async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        self.channel()
            .await?
            .queue_unbind(
                queue,
                exchange,
                routing_key,
                FieldTable::default(),
            )
            .await
            .map_err(classify)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        let confirmation = self
            .channel()
            .await?
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default()
                    .with_content_type("application/json".into())
                    .with_delivery_mode(2), // persistent
            )
            .await
            .map_err(classify)?
            .await
            .map_err(classify)?;

        if confirmation.is_nack() {
            return Err(TransportError::Operation(format!(
                "Broker refused message for {}",
                routing_key
            )));
        }
        Ok(())
    }

    async fn get(&self, queue: &str) -> Result<Option<QueueDelivery>, TransportError> {
        let message = self
            .channel()
            .await?
            .basic_get(queue, BasicGetOptions { no_ack: false })
            .await
            .map_err(classify)?;
        Ok(message.map(|m| to_delivery(m.delivery)))
    }

    async fn next_deliveries(
        &self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Vec<QueueDelivery>, TransportError> {
        let channel = self.channel().await?;
        let tag = format!("{}-{}", CONSUMER_TAG_PREFIX, queue);
        let mut consumer = channel
            .basic_consume(
                queue,
                &tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(classify)?;
        debug!(queue = %queue, "Registered AMQP push consumer");

        let first = match tokio::time::timeout(timeout, consumer.next()).await {
            Err(_) => None,
            Ok(Some(Ok(delivery))) => Some(to_delivery(delivery)),
            Ok(Some(Err(e))) => return Err(classify(e)),
            Ok(None) => {
                return Err(TransportError::ConnectionLost(
                    "AMQP consumer stream ended".to_string(),
                ))
            }
        };

        // Deliveries pushed before cancel-ok are already buffered in `consumer`.
        channel
            .basic_cancel(&tag, BasicCancelOptions::default())
            .await
            .map_err(classify)?;

        let mut deliveries: Vec<QueueDelivery> = first.into_iter().collect();
        while let Some(Some(delivery)) = consumer.next().now_or_never() {
            deliveries.push(to_delivery(delivery.map_err(classify)?));
        }
        debug!(queue = %queue, deliveries = deliveries.len(), "Cancelled AMQP push consumer");
        Ok(deliveries)
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError> {
        self.channel()
            .await?
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(classify)
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
        self.channel()
            .await?
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(classify)
    }

    async fn close(&self) -> Result<(), TransportError> {
        let Some(session) = self.session.lock().await.take() else {
            return Ok(());
        };
        if let Err(e) = session.channel.close(200, "OK").await {
            warn!(error = %e, "Error closing AMQP channel");
        }
        session.connection.close(200, "OK").await.map_err(classify)
    }
}
