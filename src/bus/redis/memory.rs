//! In-memory pub/sub hub.
//!
//! Delivers each publish to the clients subscribed at that moment and keeps
//! nothing else. A dropped client loses whatever is published until it
//! reconnects and subscribes again.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::transport::{PubSubMessage, PubSubTransport};
use crate::bus::TransportError;

struct Subscriber {
    channels: HashSet<String>,
    sender: mpsc::UnboundedSender<PubSubMessage>,
}

/// Shared in-memory pub/sub server.
pub struct InMemoryPubSub {
    subscribers: Mutex<HashMap<u64, Subscriber>>,
    next_client: AtomicU64,
}

impl InMemoryPubSub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            subscribers: Mutex::new(HashMap::new()),
            next_client: AtomicU64::new(0),
        })
    }

    /// A connected client.
    pub fn client(self: &Arc<Self>) -> InMemoryPubSubClient {
        let (id, receiver) = self.register();
        InMemoryPubSubClient {
            hub: Arc::clone(self),
            id: AtomicU64::new(id),
            receiver: tokio::sync::Mutex::new(Some(receiver)),
            failing_reconnects: AtomicUsize::new(0),
            reconnects: AtomicUsize::new(0),
        }
    }

    fn subscribers(&self) -> MutexGuard<'_, HashMap<u64, Subscriber>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self) -> (u64, mpsc::UnboundedReceiver<PubSubMessage>) {
        let id = self.next_client.fetch_add(1, Ordering::SeqCst) + 1;
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribers().insert(
            id,
            Subscriber {
                channels: HashSet::new(),
                sender,
            },
        );
        (id, receiver)
    }

    /// Clients currently subscribed to `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.subscribers()
            .values()
            .filter(|s| s.channels.contains(channel))
            .count()
    }

    fn publish(&self, channel: &str, payload: &[u8]) -> usize {
        self.subscribers()
            .values()
            .filter(|s| s.channels.contains(channel))
            .filter(|s| {
                s.sender
                    .send(PubSubMessage {
                        channel: channel.to_string(),
                        payload: payload.to_vec(),
                    })
                    .is_ok()
            })
            .count()
    }
}

/// One connection to an [`InMemoryPubSub`].
pub struct InMemoryPubSubClient {
    hub: Arc<InMemoryPubSub>,
    id: AtomicU64,
    /// `None` once the connection is closed.
    receiver: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<PubSubMessage>>>,
    failing_reconnects: AtomicUsize,
    reconnects: AtomicUsize,
}

impl InMemoryPubSubClient {
    fn id(&self) -> u64 {
        self.id.load(Ordering::SeqCst)
    }

    fn is_registered(&self) -> bool {
        self.hub.subscribers().contains_key(&self.id())
    }

    fn lost() -> TransportError {
        TransportError::ConnectionLost("pub/sub connection closed".to_string())
    }

    /// Drop the connection now. Messages published until the next reconnect
    /// are lost to this client.
    pub fn drop_connection(&self) {
        self.hub.subscribers().remove(&self.id());
    }

    /// Refuse the next `n` reconnect attempts.
    pub fn fail_next_reconnects(&self, n: usize) {
        self.failing_reconnects.store(n, Ordering::SeqCst);
    }

    /// Successful reconnects so far.
    pub fn reconnects(&self) -> usize {
        self.reconnects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PubSubTransport for InMemoryPubSubClient {
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<usize, TransportError> {
        if !self.is_registered() {
            return Err(Self::lost());
        }
        Ok(self.hub.publish(channel, payload))
    }

    async fn subscribe(&self, channels: &[String]) -> Result<(), TransportError> {
        let mut subscribers = self.hub.subscribers();
        let subscriber = subscribers.get_mut(&self.id()).ok_or_else(Self::lost)?;
        subscriber.channels.extend(channels.iter().cloned());
        Ok(())
    }

    async fn unsubscribe(&self, channels: &[String]) -> Result<(), TransportError> {
        let mut subscribers = self.hub.subscribers();
        let subscriber = subscribers.get_mut(&self.id()).ok_or_else(Self::lost)?;
        for channel in channels {
            subscriber.channels.remove(channel);
        }
        Ok(())
    }

    async fn next_message(
        &self,
        timeout: Duration,
    ) -> Result<Option<PubSubMessage>, TransportError> {
        let mut receiver = self.receiver.lock().await;
        let receiver = receiver.as_mut().ok_or_else(Self::lost)?;
        match tokio::time::timeout(timeout, receiver.recv()).await {
            Err(_) => Ok(None),
            Ok(Some(message)) => Ok(Some(message)),
            Ok(None) => Err(Self::lost()),
        }
    }

    async fn is_open(&self) -> bool {
        self.is_registered()
    }

    async fn reconnect(&self) -> Result<(), TransportError> {
        let refused = self
            .failing_reconnects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if refused.is_ok() {
            return Err(TransportError::ConnectionLost(
                "connection refused".to_string(),
            ));
        }

        self.drop_connection();
        let (id, receiver) = self.hub.register();
        self.id.store(id, Ordering::SeqCst);
        *self.receiver.lock().await = Some(receiver);
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.drop_connection();
        self.receiver.lock().await.take();
        Ok(())
    }
}
