//! Channel → topic mapping.
//!
//! Two schemes:
//! - `Direct`: one topic per channel, `{prefix}_{channel}`. Only suitable for
//!   small channel counts; every channel costs the cluster a topic.
//! - `Grouped`: channels sharing a category (the name up to the first `.` or
//!   `:`) share one topic, `{prefix}.{category}`, keyed by the full channel
//!   name so per-channel order is kept within a partition.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::warn;

/// Distinct direct-mapped topics after which a warning is logged once.
pub const DIRECT_TOPIC_WARN_THRESHOLD: usize = 200;

/// Category used for channels whose name starts with a separator.
const DEFAULT_CATEGORY: &str = "default";

/// Channel → topic mapping scheme.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopicMapping {
    #[default]
    Direct,
    Grouped,
}

/// Where a channel's messages go on the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicRoute {
    pub topic: String,
    /// Partition key. Always the channel name, so one channel stays on one
    /// partition.
    pub key: String,
}

/// Replace characters the log does not allow in topic names.
pub fn sanitize_topic_component(component: &str) -> String {
    component
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Leading segment of a channel name, used to group channels.
pub fn channel_category(channel: &str) -> &str {
    channel
        .split(['.', ':'])
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or(DEFAULT_CATEGORY)
}

/// Compute the route for a channel under a mapping scheme.
pub fn route_for(prefix: &str, mapping: TopicMapping, channel: &str) -> TopicRoute {
    let topic = match mapping {
        TopicMapping::Direct => format!("{}_{}", prefix, sanitize_topic_component(channel)),
        TopicMapping::Grouped => format!(
            "{}.{}",
            prefix,
            sanitize_topic_component(channel_category(channel))
        ),
    };
    TopicRoute {
        topic,
        key: channel.to_string(),
    }
}

/// Deterministic partition for a key (32-bit FNV-1a).
pub fn partition_for_key(key: &str, partitions: i32) -> i32 {
    if partitions <= 1 {
        return 0;
    }
    let mut hash: u32 = 0x811c_9dc5;
    for byte in key.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    (hash % partitions as u32) as i32
}

/// Caches channel routes for the lifetime of a connection.
pub struct TopicResolver {
    prefix: String,
    mapping: TopicMapping,
    cache: RwLock<HashMap<String, Arc<TopicRoute>>>,
    warned: AtomicBool,
}

impl TopicResolver {
    pub fn new(prefix: impl Into<String>, mapping: TopicMapping) -> Self {
        Self {
            prefix: prefix.into(),
            mapping,
            cache: RwLock::new(HashMap::new()),
            warned: AtomicBool::new(false),
        }
    }

    pub fn mapping(&self) -> TopicMapping {
        self.mapping
    }

    pub async fn resolve(&self, channel: &str) -> Arc<TopicRoute> {
        if let Some(route) = self.cache.read().await.get(channel) {
            return Arc::clone(route);
        }

        let route = Arc::new(route_for(&self.prefix, self.mapping, channel));
        let mut cache = self.cache.write().await;
        let route = Arc::clone(
            cache
                .entry(channel.to_string())
                .or_insert_with(|| Arc::clone(&route)),
        );

        if self.mapping == TopicMapping::Direct
            && cache.len() > DIRECT_TOPIC_WARN_THRESHOLD
            && !self.warned.swap(true, Ordering::Relaxed)
        {
            warn!(
                channels = cache.len(),
                "Direct topic mapping creates one topic per channel; \
                 switch broker.topic_mapping to 'grouped' for large channel counts"
            );
        }

        route
    }

    /// Drop cached routes. Called when the connection is released.
    pub async fn invalidate(&self) {
        self.cache.write().await.clear();
    }

    pub async fn cached(&self) -> usize {
        self.cache.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_mapping() {
        let route = route_for("fanout", TopicMapping::Direct, "orders.42");
        assert_eq!(route.topic, "fanout_orders.42");
        assert_eq!(route.key, "orders.42");
    }

    #[test]
    fn test_grouped_mapping_shares_topic() {
        let a = route_for("fanout", TopicMapping::Grouped, "orders.42");
        let b = route_for("fanout", TopicMapping::Grouped, "orders.43");
        let c = route_for("fanout", TopicMapping::Grouped, "private-user:7");

        assert_eq!(a.topic, "fanout.orders");
        assert_eq!(a.topic, b.topic);
        assert_ne!(a.key, b.key);
        assert_eq!(c.topic, "fanout.private-user");
    }

    #[test]
    fn test_sanitize_replaces_illegal_characters() {
        assert_eq!(sanitize_topic_component("room/1 a"), "room_1_a");
        assert_eq!(sanitize_topic_component("ok.name-1_x"), "ok.name-1_x");
    }

    #[test]
    fn test_category_of_leading_separator() {
        assert_eq!(channel_category(".hidden"), "default");
        assert_eq!(channel_category("plain"), "plain");
    }

    #[test]
    fn test_partition_for_key_is_stable() {
        let p = partition_for_key("orders.42", 8);
        assert!((0..8).contains(&p));
        assert_eq!(p, partition_for_key("orders.42", 8));
        assert_eq!(partition_for_key("anything", 1), 0);
    }

    #[tokio::test]
    async fn test_resolver_caches_and_invalidates() {
        let resolver = TopicResolver::new("fanout", TopicMapping::Grouped);
        let first = resolver.resolve("orders.1").await;
        let second = resolver.resolve("orders.1").await;

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(resolver.cached().await, 1);

        resolver.invalidate().await;
        assert_eq!(resolver.cached().await, 0);
    }
}
