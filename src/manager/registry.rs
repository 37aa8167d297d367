//! Local channel and connection registries.
//!
//! Connections are owned by the transport that accepted them. The registry
//! keeps weak handles only; a connection dropped without an explicit
//! disconnect is reaped the next time [`LocalRegistry::reap`] runs.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use crate::channel::Channel;
use crate::connection::{Connection, ConnectionId};

/// Result of adding a connection to a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Joined {
    /// The connection was not already subscribed.
    pub added: bool,
    /// The channel had no live local subscribers before this one.
    pub first_local: bool,
}

struct Registered {
    handle: Weak<Connection>,
    /// Kept here so a dead handle can still be unindexed.
    user_id: Option<String>,
}

/// Connections and channels of this process.
#[derive(Default)]
pub(crate) struct LocalRegistry {
    channels: HashMap<String, Channel>,
    connections: HashMap<ConnectionId, Registered>,
    by_user: HashMap<String, HashSet<ConnectionId>>,
}

impl LocalRegistry {
    /// Register a connection. Returns true if a live connection with the
    /// same id was replaced.
    pub fn insert_connection(&mut self, connection: &Arc<Connection>) -> bool {
        let id = connection.id().to_string();
        let replaced = match self.connections.remove(&id) {
            Some(old) => {
                self.unindex_user(&id, old.user_id.as_deref());
                old.handle.strong_count() > 0
            }
            None => false,
        };

        let user_id = connection.user_id().map(str::to_string);
        if let Some(user_id) = &user_id {
            self.by_user
                .entry(user_id.clone())
                .or_default()
                .insert(id.clone());
        }
        self.connections.insert(
            id,
            Registered {
                handle: Arc::downgrade(connection),
                user_id,
            },
        );
        replaced
    }

    /// Remove a connection from every index. Returns the channels it left
    /// that now have no subscribers, or `None` if it was not registered.
    pub fn remove_connection(&mut self, connection_id: &str) -> Option<Vec<String>> {
        let removed = self.connections.remove(connection_id)?;
        self.unindex_user(connection_id, removed.user_id.as_deref());

        let mut emptied = Vec::new();
        self.channels.retain(|name, channel| {
            channel.remove(connection_id);
            channel.prune();
            if channel.is_empty() {
                emptied.push(name.clone());
                false
            } else {
                true
            }
        });
        emptied.sort();
        Some(emptied)
    }

    /// Forget connections whose owner dropped them. Returns the channels
    /// left without subscribers.
    pub fn reap(&mut self) -> Vec<String> {
        let dead: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|(_, registered)| registered.handle.strong_count() == 0)
            .map(|(id, _)| id.clone())
            .collect();

        let mut emptied = Vec::new();
        for id in dead {
            if let Some(channels) = self.remove_connection(&id) {
                emptied.extend(channels);
            }
        }
        emptied.sort();
        emptied.dedup();
        emptied
    }

    fn unindex_user(&mut self, connection_id: &str, user_id: Option<&str>) {
        let Some(user_id) = user_id else {
            return;
        };
        if let Some(ids) = self.by_user.get_mut(user_id) {
            ids.remove(connection_id);
            if ids.is_empty() {
                self.by_user.remove(user_id);
            }
        }
    }

    pub fn connection(&self, connection_id: &str) -> Option<Arc<Connection>> {
        self.connections
            .get(connection_id)
            .and_then(|registered| registered.handle.upgrade())
    }

    /// Subscribe a connection, creating the channel on first use.
    pub fn join(&mut self, channel: &str, connection: &Arc<Connection>) -> Joined {
        let entry = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| Channel::new(channel));
        entry.prune();
        let first_local = entry.is_empty();
        let added = entry.add(connection);
        Joined { added, first_local }
    }

    /// Unsubscribe a connection. Returns `(removed, now_empty)`; an emptied
    /// channel is dropped from the registry.
    pub fn leave(&mut self, channel: &str, connection_id: &str) -> (bool, bool) {
        let Some(entry) = self.channels.get_mut(channel) else {
            return (false, false);
        };
        let removed = entry.remove(connection_id);
        entry.prune();
        let now_empty = entry.is_empty();
        if now_empty {
            self.channels.remove(channel);
        }
        (removed, now_empty)
    }

    /// Live subscribers of a channel.
    pub fn subscribers(&self, channel: &str) -> Vec<Arc<Connection>> {
        self.channels
            .get(channel)
            .map(Channel::live_subscribers)
            .unwrap_or_default()
    }

    pub fn has_subscribers(&self, channel: &str) -> bool {
        self.channels
            .get(channel)
            .map(|c| !c.live_subscribers().is_empty())
            .unwrap_or(false)
    }

    pub fn channel(&self, channel: &str) -> Option<&Channel> {
        self.channels.get(channel)
    }

    /// Live connections of a user.
    pub fn user_connections(&self, user_id: &str) -> Vec<Arc<Connection>> {
        self.by_user
            .get(user_id)
            .map(|ids| ids.iter().filter_map(|id| self.connection(id)).collect())
            .unwrap_or_default()
    }

    /// Registered connections that are still alive.
    pub fn connection_count(&self) -> usize {
        self.connections
            .values()
            .filter(|registered| registered.handle.strong_count() > 0)
            .count()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}
