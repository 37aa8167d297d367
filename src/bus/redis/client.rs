//! Redis pub/sub transport.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use ::redis::aio::{ConnectionManager, PubSub};
use ::redis::{AsyncCommands, Client, RedisError};
use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use super::transport::{PubSubMessage, PubSubTransport};
use crate::bus::{BrokerError, TransportError};

/// Longest stretch the reader holds the subscriber connection. Subscribe
/// and unsubscribe commands wait at most this long for it.
const READ_SLICE: Duration = Duration::from_millis(50);

/// Map a redis error onto the transport taxonomy.
fn classify(error: RedisError) -> TransportError {
    if error.is_connection_dropped() || error.is_io_error() || error.is_connection_refusal() {
        TransportError::ConnectionLost(error.to_string())
    } else {
        TransportError::Operation(error.to_string())
    }
}

/// Publisher over a self-healing connection manager, subscriber over a
/// dedicated pub/sub connection.
pub struct RedisPubSubClient {
    client: Client,
    publisher: ConnectionManager,
    subscriber: Mutex<Option<PubSub>>,
    open: AtomicBool,
}

impl RedisPubSubClient {
    pub async fn connect(url: &str) -> Result<Self, BrokerError> {
        let client = Client::open(url)
            .map_err(|e| BrokerError::Configuration(format!("Invalid Redis URL {}: {}", url, e)))?;
        let publisher = client.get_connection_manager().await.map_err(|e| {
            BrokerError::Unavailable(format!("Failed to connect to Redis: {}", e))
        })?;
        let subscriber = client.get_async_pubsub().await.map_err(|e| {
            BrokerError::Unavailable(format!("Failed to open Redis pub/sub connection: {}", e))
        })?;

        info!(url = %url, "Connected to Redis");
        Ok(Self {
            client,
            publisher,
            subscriber: Mutex::new(Some(subscriber)),
            open: AtomicBool::new(true),
        })
    }

    fn lost() -> TransportError {
        TransportError::ConnectionLost("Redis pub/sub connection closed".to_string())
    }

    fn track(&self, error: RedisError) -> TransportError {
        let error = classify(error);
        if error.is_connection_lost() {
            self.open.store(false, Ordering::SeqCst);
        }
        error
    }
}

#[async_trait]
impl PubSubTransport for RedisPubSubClient {
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<usize, TransportError> {
        let mut connection = self.publisher.clone();
        connection.publish(channel, payload).await.map_err(classify)
    }

    async fn subscribe(&self, channels: &[String]) -> Result<(), TransportError> {
        let mut subscriber = self.subscriber.lock().await;
        let pubsub = subscriber.as_mut().ok_or_else(Self::lost)?;
        for channel in channels {
            pubsub
                .subscribe(channel.as_str())
                .await
                .map_err(|e| self.track(e))?;
        }
        Ok(())
    }

    async fn unsubscribe(&self, channels: &[String]) -> Result<(), TransportError> {
        let mut subscriber = self.subscriber.lock().await;
        let pubsub = subscriber.as_mut().ok_or_else(Self::lost)?;
        for channel in channels {
            pubsub
                .unsubscribe(channel.as_str())
                .await
                .map_err(|e| self.track(e))?;
        }
        Ok(())
    }

    async fn next_message(
        &self,
        timeout: Duration,
    ) -> Result<Option<PubSubMessage>, TransportError> {
        let deadline = Instant::now() + timeout;
        loop {
            let slice = deadline.saturating_duration_since(Instant::now()).min(READ_SLICE);
            {
                let mut subscriber = self.subscriber.lock().await;
                let pubsub = subscriber.as_mut().ok_or_else(Self::lost)?;
                let mut messages = pubsub.on_message();

                match tokio::time::timeout(slice, messages.next()).await {
                    Err(_) => {}
                    Ok(Some(message)) => {
                        return Ok(Some(PubSubMessage {
                            channel: message.get_channel_name().to_string(),
                            payload: message.get_payload_bytes().to_vec(),
                        }))
                    }
                    Ok(None) => {
                        self.open.store(false, Ordering::SeqCst);
                        return Err(TransportError::ConnectionLost(
                            "Redis pub/sub stream ended".to_string(),
                        ));
                    }
                }
            }
            // Lock released: queued subscribe commands run before the next slice.
            if Instant::now() >= deadline {
                return Ok(None);
            }
        }
    }

    async fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn reconnect(&self) -> Result<(), TransportError> {
        let pubsub = self.client.get_async_pubsub().await.map_err(classify)?;
        *self.subscriber.lock().await = Some(pubsub);
        self.open.store(true, Ordering::SeqCst);
        debug!("Reopened Redis pub/sub connection");
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.subscriber.lock().await.take();
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }
}
