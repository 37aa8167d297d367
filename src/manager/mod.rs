//! Fanout coordinator.
//!
//! The [`Manager`] is the single entry point for fanout. It keeps the local
//! connection and channel registries and at most one broker. Connections
//! stay owned by the caller that accepted them; the manager only holds weak
//! handles and forgets a connection once its owner drops it.
//!
//!
//! - `broadcast` publishes through the broker and delivers to local
//!   subscribers of the channel. With no broker, or while the broker is
//!   unreachable, fanout is local-only.
//! - Messages delivered by the broker are dispatched to the channel's local
//!   subscribers. A channel with none drops the message; other processes
//!   receive their own copy.
//! - `send_to_user` reaches every local connection of a user directly.
//!
//! A process's own broadcasts come back from the broker when it listens on
//! the same channel. Ids of recent broadcasts are remembered so those echoes
//! are not delivered twice.

mod recent;
mod registry;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};

use futures::future::BoxFuture;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::bus::{Broker, BrokerError, HandlerError, MessageHandler};
use crate::channel::{ChannelAuthorizer, Visibility, VisibilityAuthorizer};
use crate::connection::{Connection, SinkError};
use crate::message::{Message, MessageError, Payload};

use recent::RecentIds;
use registry::LocalRegistry;

/// Ids of own broadcasts remembered for echo suppression.
pub const DEFAULT_ECHO_WINDOW: usize = 4096;

/// Errors surfaced by the fanout coordinator.
#[derive(Debug, thiserror::Error)]
pub enum FanoutError {
    #[error("Connection not found: {0}")]
    ConnectionNotFound(String),

    #[error("Connection {connection} may not join {visibility} channel {channel}")]
    Unauthorized {
        channel: String,
        connection: String,
        visibility: Visibility,
    },

    #[error("Message has no channel")]
    MissingChannel,

    #[error("No broker configured")]
    NoBroker,

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Serialization(#[from] MessageError),
}

/// Outcome of a broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    pub message_id: String,
    /// Local connections the frame was handed to.
    pub local_deliveries: usize,
    /// Whether the broker accepted the message.
    pub published: bool,
}

/// What happened to a broker-delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Delivered(usize),
    NoSubscribers,
    /// This process broadcast the message itself.
    EchoSuppressed,
    /// The message names no channel.
    Unroutable,
}

/// Delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ManagerStats {
    pub connections: usize,
    pub channels: usize,
    pub published: u64,
    pub publish_failures: u64,
    /// Frames handed to local connections.
    pub delivered: u64,
    /// Broker messages for channels with no local subscribers.
    pub dropped_no_subscribers: u64,
    /// Frames refused by a full or closed connection sink.
    pub sink_failures: u64,
    pub echo_suppressed: u64,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    publish_failures: AtomicU64,
    delivered: AtomicU64,
    dropped_no_subscribers: AtomicU64,
    sink_failures: AtomicU64,
    echo_suppressed: AtomicU64,
}

/// Builder for [`Manager`].
pub struct ManagerBuilder {
    broker: Option<Arc<dyn Broker>>,
    authorizer: Arc<dyn ChannelAuthorizer>,
    echo_window: usize,
}

impl ManagerBuilder {
    pub fn broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn authorizer(mut self, authorizer: Arc<dyn ChannelAuthorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    /// How many own broadcast ids to remember. Zero disables echo suppression.
    pub fn echo_window(mut self, ids: usize) -> Self {
        self.echo_window = ids;
        self
    }

    pub fn build(self) -> Arc<Manager> {
        Arc::new_cyclic(|manager| Manager {
            broker: self.broker,
            handler: Arc::new(ManagerHandler {
                manager: manager.clone(),
            }),
            authorizer: self.authorizer,
            registry: RwLock::new(LocalRegistry::default()),
            broker_channels: Mutex::new(HashMap::new()),
            recent: StdMutex::new(RecentIds::new(self.echo_window)),
            counters: Counters::default(),
        })
    }
}

/// Fanout coordinator for one process.
pub struct Manager {
    broker: Option<Arc<dyn Broker>>,
    /// Registered with the broker for every channel this process receives.
    handler: Arc<dyn MessageHandler>,
    authorizer: Arc<dyn ChannelAuthorizer>,
    registry: RwLock<LocalRegistry>,
    /// Channels subscribed at the broker → pinned by `listen`.
    broker_channels: Mutex<HashMap<String, bool>>,
    recent: StdMutex<RecentIds>,
    counters: Counters,
}

impl Manager {
    pub fn builder() -> ManagerBuilder {
        ManagerBuilder {
            broker: None,
            authorizer: Arc::new(VisibilityAuthorizer),
            echo_window: DEFAULT_ECHO_WINDOW,
        }
    }

    /// Manager over `broker` with default settings.
    pub fn new(broker: Arc<dyn Broker>) -> Arc<Self> {
        Self::builder().broker(broker).build()
    }

    /// Single-process manager without a broker.
    pub fn standalone() -> Arc<Self> {
        Self::builder().build()
    }

    pub fn broker(&self) -> Option<&Arc<dyn Broker>> {
        self.broker.as_ref()
    }

    fn recent(&self) -> std::sync::MutexGuard<'_, RecentIds> {
        self.recent.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------

    /// Register a local connection.
    ///
    /// The manager keeps a weak handle only. Dropping the last `Arc` has the
    /// same effect as [`Manager::disconnect_connection`], applied lazily.
    pub async fn connect(&self, connection: &Arc<Connection>) {
        self.reap().await;
        let replaced = self.registry.write().await.insert_connection(connection);
        if replaced {
            warn!(connection_id = %connection.id(), "Connection id reused, previous handle replaced");
        }
        debug!(
            connection_id = %connection.id(),
            user_id = ?connection.user_id(),
            "Connection registered"
        );
    }

    /// Forget connections dropped by their owner and release the broker
    /// channels they leave empty.
    async fn reap(&self) {
        let emptied = self.registry.write().await.reap();
        if emptied.is_empty() {
            return;
        }
        debug!(channels = ?emptied, "Reaped dropped connections");
        for channel in emptied {
            self.release_broker_channel(&channel).await;
        }
    }

    /// Forget a connection and leave all its channels.
    pub async fn disconnect_connection(&self, connection_id: &str) -> Result<(), FanoutError> {
        let emptied = self
            .registry
            .write()
            .await
            .remove_connection(connection_id)
            .ok_or_else(|| FanoutError::ConnectionNotFound(connection_id.to_string()))?;

        for channel in emptied {
            self.release_broker_channel(&channel).await;
        }
        debug!(connection_id = %connection_id, "Connection removed");
        Ok(())
    }

    pub async fn connection(&self, connection_id: &str) -> Option<Arc<Connection>> {
        self.reap().await;
        self.registry.read().await.connection(connection_id)
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    /// Subscribe a local connection to a channel.
    ///
    /// The first local subscriber also subscribes this process at the
    /// broker. If that fails the subscription stays local-only.
    /// Returns false if the connection was already subscribed.
    pub async fn subscribe(&self, connection_id: &str, channel: &str) -> Result<bool, FanoutError> {
        let joined = {
            let mut registry = self.registry.write().await;
            let connection = registry
                .connection(connection_id)
                .ok_or_else(|| FanoutError::ConnectionNotFound(connection_id.to_string()))?;

            let visibility = Visibility::from_name(channel);
            if !self.authorizer.authorize(&connection, channel, visibility) {
                warn!(
                    connection_id = %connection_id,
                    channel = %channel,
                    visibility = %visibility,
                    "Subscription refused"
                );
                return Err(FanoutError::Unauthorized {
                    channel: channel.to_string(),
                    connection: connection_id.to_string(),
                    visibility,
                });
            }

            let joined = registry.join(channel, &connection);
            connection.add_channel(channel).await;
            joined
        };

        if joined.first_local {
            if let Err(e) = self.acquire_broker_channel(channel, false).await {
                warn!(
                    channel = %channel,
                    error = %e,
                    "Broker subscription failed, channel is local-only"
                );
            }
        }
        debug!(connection_id = %connection_id, channel = %channel, "Subscribed");
        Ok(joined.added)
    }

    /// Unsubscribe a local connection. Returns false if it was not subscribed.
    pub async fn unsubscribe(&self, connection_id: &str, channel: &str) -> Result<bool, FanoutError> {
        let (removed, now_empty) = {
            let mut registry = self.registry.write().await;
            let connection = registry
                .connection(connection_id)
                .ok_or_else(|| FanoutError::ConnectionNotFound(connection_id.to_string()))?;
            let outcome = registry.leave(channel, connection_id);
            connection.remove_channel(channel).await;
            outcome
        };

        if now_empty {
            self.release_broker_channel(channel).await;
        }
        Ok(removed)
    }

    /// Receive a channel from the broker for as long as this manager lives,
    /// independent of local subscribers.
    pub async fn listen(&self, channel: &str) -> Result<(), FanoutError> {
        if self.broker.is_none() {
            return Err(FanoutError::NoBroker);
        }
        self.acquire_broker_channel(channel, true).await?;
        info!(channel = %channel, "Listening on channel");
        Ok(())
    }

    async fn acquire_broker_channel(&self, channel: &str, pinned: bool) -> Result<(), FanoutError> {
        let Some(broker) = &self.broker else {
            return Ok(());
        };
        let mut channels = self.broker_channels.lock().await;
        if let Some(existing) = channels.get_mut(channel) {
            *existing |= pinned;
            return Ok(());
        }
        broker.subscribe(channel, Arc::clone(&self.handler)).await?;
        channels.insert(channel.to_string(), pinned);
        Ok(())
    }

    async fn release_broker_channel(&self, channel: &str) {
        let Some(broker) = &self.broker else {
            return;
        };
        let mut channels = self.broker_channels.lock().await;
        // Pinned and unknown channels stay as they are.
        if channels.get(channel) != Some(&false) {
            return;
        }
        if self.registry.read().await.has_subscribers(channel) {
            return;
        }
        channels.remove(channel);
        if let Err(e) = broker.unsubscribe(channel).await {
            warn!(channel = %channel, error = %e, "Broker unsubscribe failed");
        }
    }

    /// User ids present on a presence channel. `None` for other channels.
    pub async fn presence_members(&self, channel: &str) -> Option<Vec<String>> {
        if Visibility::from_name(channel) != Visibility::Presence {
            return None;
        }
        Some(
            self.registry
                .read()
                .await
                .channel(channel)
                .map(|c| c.members())
                .unwrap_or_default(),
        )
    }

    pub async fn subscriber_count(&self, channel: &str) -> usize {
        self.registry.read().await.subscribers(channel).len()
    }

    // ------------------------------------------------------------------
    // Delivery
    // ------------------------------------------------------------------

    /// Publish an event to a channel and deliver it to local subscribers.
    pub async fn broadcast(
        &self,
        channel: &str,
        event: &str,
        data: Payload,
    ) -> Result<BroadcastReport, FanoutError> {
        self.broadcast_message(Message::event(channel, event, data))
            .await
    }

    /// Broadcast a prebuilt message on its own channel.
    #[tracing::instrument(name = "fanout.broadcast", skip_all, fields(message_id = %message.id()))]
    pub async fn broadcast_message(&self, message: Message) -> Result<BroadcastReport, FanoutError> {
        let channel = message
            .channel()
            .ok_or(FanoutError::MissingChannel)?
            .to_string();
        let frame: Arc<str> = Arc::from(message.encode_to_string()?);
        let message = Arc::new(message);

        let published = match &self.broker {
            Some(broker) => {
                self.recent().insert(message.id());
                match broker.publish(&channel, Arc::clone(&message)).await {
                    Ok(()) => {
                        self.counters.published.fetch_add(1, Ordering::Relaxed);
                        true
                    }
                    Err(e) => {
                        self.counters.publish_failures.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            channel = %channel,
                            error = %e,
                            "Broker publish failed, delivered locally only"
                        );
                        false
                    }
                }
            }
            None => false,
        };

        let subscribers = self.registry.read().await.subscribers(&channel);
        let local_deliveries = self.deliver(&subscribers, &frame);

        debug!(
            channel = %channel,
            local_deliveries,
            published,
            "Broadcast"
        );
        Ok(BroadcastReport {
            message_id: message.id().to_string(),
            local_deliveries,
            published,
        })
    }

    /// Deliver an event to every local connection of a user.
    ///
    /// Returns the number of connections that accepted the frame.
    pub async fn send_to_user(
        &self,
        user_id: &str,
        event: &str,
        data: Payload,
    ) -> Result<usize, FanoutError> {
        let message = Message::direct(event, data);
        let frame: Arc<str> = Arc::from(message.encode_to_string()?);
        self.reap().await;
        let connections = self.registry.read().await.user_connections(user_id);
        let delivered = self.deliver(&connections, &frame);
        debug!(user_id = %user_id, delivered, "Sent to user");
        Ok(delivered)
    }

    /// Deliver a broker message to the channel's local subscribers.
    pub async fn dispatch(&self, message: &Message) -> Result<DispatchOutcome, FanoutError> {
        if self.recent().contains(message.id()) {
            self.counters.echo_suppressed.fetch_add(1, Ordering::Relaxed);
            return Ok(DispatchOutcome::EchoSuppressed);
        }
        let Some(channel) = message.channel() else {
            debug!(message_id = %message.id(), "Broker message without channel");
            return Ok(DispatchOutcome::Unroutable);
        };

        let subscribers = self.registry.read().await.subscribers(channel);
        if subscribers.is_empty() {
            self.counters
                .dropped_no_subscribers
                .fetch_add(1, Ordering::Relaxed);
            debug!(channel = %channel, message_id = %message.id(), "No local subscribers");
            return Ok(DispatchOutcome::NoSubscribers);
        }

        let frame: Arc<str> = Arc::from(message.encode_to_string()?);
        Ok(DispatchOutcome::Delivered(self.deliver(&subscribers, &frame)))
    }

    fn deliver(&self, connections: &[Arc<Connection>], frame: &Arc<str>) -> usize {
        let mut delivered = 0;
        for connection in connections {
            match connection.deliver(Arc::clone(frame)) {
                Ok(()) => delivered += 1,
                Err(SinkError::Full) => {
                    self.counters.sink_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(connection_id = %connection.id(), "Connection buffer full, frame dropped");
                }
                Err(SinkError::Closed) => {
                    self.counters.sink_failures.fetch_add(1, Ordering::Relaxed);
                    debug!(connection_id = %connection.id(), "Connection closed, frame dropped");
                }
            }
        }
        self.counters
            .delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    pub async fn stats(&self) -> ManagerStats {
        self.reap().await;
        let (connections, channels) = {
            let registry = self.registry.read().await;
            (registry.connection_count(), registry.channel_count())
        };
        ManagerStats {
            connections,
            channels,
            published: self.counters.published.load(Ordering::Relaxed),
            publish_failures: self.counters.publish_failures.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            dropped_no_subscribers: self.counters.dropped_no_subscribers.load(Ordering::Relaxed),
            sink_failures: self.counters.sink_failures.load(Ordering::Relaxed),
            echo_suppressed: self.counters.echo_suppressed.load(Ordering::Relaxed),
        }
    }

    /// Flush and disconnect the broker.
    pub async fn shutdown(&self) -> Result<(), FanoutError> {
        if let Some(broker) = &self.broker {
            broker.disconnect().await?;
        }
        info!("Fanout manager shut down");
        Ok(())
    }
}

/// Broker-side handler dispatching into the manager.
struct ManagerHandler {
    manager: Weak<Manager>,
}

impl MessageHandler for ManagerHandler {
    fn handle(&self, message: Arc<Message>) -> BoxFuture<'static, Result<(), HandlerError>> {
        let manager = self.manager.clone();
        Box::pin(async move {
            let Some(manager) = manager.upgrade() else {
                return Ok(());
            };
            manager
                .dispatch(&message)
                .await
                .map(|_| ())
                .map_err(|e| HandlerError::Unrecoverable(e.to_string()))
        })
    }
}
