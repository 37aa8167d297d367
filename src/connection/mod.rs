//! Locally connected clients.
//!
//! A [`Connection`] is owned by the transport layer (WebSocket, SSE, ...).
//! The fanout core only holds handles to it for delivery, and hands frames to
//! the transport through a [`ConnectionSink`].

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, RwLock};

/// Connection identifier.
pub type ConnectionId = String;

/// Errors a sink reports when a frame cannot be handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    #[error("Connection outbound buffer is full")]
    Full,

    #[error("Connection closed")]
    Closed,
}

/// Outbound side of a client transport.
///
/// `send` must not block: slow clients report [`SinkError::Full`] instead of
/// stalling fanout to everyone else.
pub trait ConnectionSink: Send + Sync {
    fn send(&self, frame: Arc<str>) -> Result<(), SinkError>;
}

/// Sink backed by a bounded tokio mpsc channel.
///
/// The transport task owns the receiver and writes frames to the socket.
pub struct MpscSink {
    sender: mpsc::Sender<Arc<str>>,
}

impl MpscSink {
    /// Create a sink holding at most `capacity` undelivered frames.
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<Arc<str>>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }
}

impl ConnectionSink for MpscSink {
    fn send(&self, frame: Arc<str>) -> Result<(), SinkError> {
        self.sender.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SinkError::Full,
            mpsc::error::TrySendError::Closed(_) => SinkError::Closed,
        })
    }
}

#[derive(Debug)]
struct ConnectionState {
    subscribed_channels: BTreeSet<String>,
    last_activity_at: DateTime<Utc>,
}

/// Local client handle.
pub struct Connection {
    id: ConnectionId,
    user_id: Option<String>,
    authenticated: bool,
    connected_at: DateTime<Utc>,
    metadata: HashMap<String, String>,
    state: RwLock<ConnectionState>,
    sink: Arc<dyn ConnectionSink>,
}

impl Connection {
    pub fn new(id: impl Into<ConnectionId>, sink: Arc<dyn ConnectionSink>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            user_id: None,
            authenticated: false,
            connected_at: now,
            metadata: HashMap::new(),
            state: RwLock::new(ConnectionState {
                subscribed_channels: BTreeSet::new(),
                last_activity_at: now,
            }),
            sink,
        }
    }

    /// Attach an authenticated user to the connection.
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self.authenticated = true;
        self
    }

    pub fn with_authenticated(mut self, authenticated: bool) -> Self {
        self.authenticated = authenticated;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    pub async fn last_activity_at(&self) -> DateTime<Utc> {
        self.state.read().await.last_activity_at
    }

    pub async fn subscribed_channels(&self) -> Vec<String> {
        self.state
            .read()
            .await
            .subscribed_channels
            .iter()
            .cloned()
            .collect()
    }

    pub async fn is_subscribed(&self, channel: &str) -> bool {
        self.state.read().await.subscribed_channels.contains(channel)
    }

    /// Record client activity (any inbound frame).
    pub async fn touch(&self) {
        self.state.write().await.last_activity_at = Utc::now();
    }

    pub(crate) async fn add_channel(&self, channel: &str) -> bool {
        let mut state = self.state.write().await;
        state.last_activity_at = Utc::now();
        state.subscribed_channels.insert(channel.to_string())
    }

    pub(crate) async fn remove_channel(&self, channel: &str) -> bool {
        let mut state = self.state.write().await;
        state.last_activity_at = Utc::now();
        state.subscribed_channels.remove(channel)
    }

    /// Hand a serialized frame to the transport.
    pub fn deliver(&self, frame: Arc<str>) -> Result<(), SinkError> {
        self.sink.send(frame)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("authenticated", &self.authenticated)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests;
