//! Named subscriber sets.
//!
//! A [`Channel`] scopes fanout to the local connections subscribed to it.
//! It holds weak references only: connection lifetime belongs to the transport.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Weak};

use crate::connection::{Connection, ConnectionId};

/// Name prefix marking a private channel.
pub const PRIVATE_PREFIX: &str = "private-";
/// Name prefix marking a presence channel.
pub const PRESENCE_PREFIX: &str = "presence-";

/// Channel visibility, derived from the channel name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Visibility {
    Public,
    Private,
    Presence,
}

impl Visibility {
    /// Classify a channel by its name prefix.
    pub fn from_name(name: &str) -> Self {
        if name.starts_with(PRESENCE_PREFIX) {
            Visibility::Presence
        } else if name.starts_with(PRIVATE_PREFIX) {
            Visibility::Private
        } else {
            Visibility::Public
        }
    }

    pub fn requires_auth(&self) -> bool {
        !matches!(self, Visibility::Public)
    }
}

impl fmt::Display for Visibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Visibility::Public => f.write_str("public"),
            Visibility::Private => f.write_str("private"),
            Visibility::Presence => f.write_str("presence"),
        }
    }
}

/// Decides whether a connection may join a channel.
pub trait ChannelAuthorizer: Send + Sync {
    fn authorize(&self, connection: &Connection, channel: &str, visibility: Visibility) -> bool;
}

/// Default authorizer: public channels are open, private and presence
/// channels require an authenticated connection.
#[derive(Debug, Default, Clone, Copy)]
pub struct VisibilityAuthorizer;

impl ChannelAuthorizer for VisibilityAuthorizer {
    fn authorize(&self, connection: &Connection, _channel: &str, visibility: Visibility) -> bool {
        !visibility.requires_auth() || connection.is_authenticated()
    }
}

/// Local subscriber set for one channel name.
pub struct Channel {
    name: String,
    visibility: Visibility,
    subscribers: HashMap<ConnectionId, Weak<Connection>>,
}

impl Channel {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let visibility = Visibility::from_name(&name);
        Self {
            name,
            visibility,
            subscribers: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn visibility(&self) -> Visibility {
        self.visibility
    }

    /// Add a subscriber. Returns false if it was already present.
    pub fn add(&mut self, connection: &Arc<Connection>) -> bool {
        self.subscribers
            .insert(connection.id().to_string(), Arc::downgrade(connection))
            .is_none()
    }

    /// Remove a subscriber. Returns false if it was not present.
    pub fn remove(&mut self, connection_id: &str) -> bool {
        self.subscribers.remove(connection_id).is_some()
    }

    pub fn contains(&self, connection_id: &str) -> bool {
        self.subscribers.contains_key(connection_id)
    }

    /// Drop entries whose connection has already been released.
    pub fn prune(&mut self) -> usize {
        let before = self.subscribers.len();
        self.subscribers.retain(|_, conn| conn.strong_count() > 0);
        before - self.subscribers.len()
    }

    /// Subscribers still alive at the time of the call.
    pub fn live_subscribers(&self) -> Vec<Arc<Connection>> {
        self.subscribers.values().filter_map(Weak::upgrade).collect()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    /// Distinct user ids of live subscribers (presence listing).
    pub fn members(&self) -> Vec<String> {
        self.live_subscribers()
            .iter()
            .filter_map(|c| c.user_id().map(str::to_string))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("visibility", &self.visibility)
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests;
