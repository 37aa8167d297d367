//! Log transport seam.
//!
//! `LogBroker` owns buffering, dispatch and offset policy; a `LogTransport`
//! only moves records to and from the log.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::bus::TransportError;

/// Record queued for the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerRecord {
    pub topic: String,
    pub key: String,
    pub payload: Vec<u8>,
}

/// Record read from the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Vec<u8>,
}

/// Committed position: the offset of the next record to read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitPosition {
    pub topic: String,
    pub partition: i32,
    pub next_offset: i64,
}

/// Moves records to and from a partitioned log.
#[async_trait]
pub trait LogTransport: Send + Sync + 'static {
    /// Send a batch. Succeeds only when every record is acknowledged.
    async fn send_batch(&self, records: &[ProducerRecord]) -> Result<(), TransportError>;

    /// Replace the consumer's topic subscription. An empty list unsubscribes.
    async fn subscribe(&self, topics: &[String]) -> Result<(), TransportError>;

    /// Wait up to `timeout` for records, returning at most `max_records`.
    /// An empty result is a timeout.
    async fn poll(
        &self,
        timeout: Duration,
        max_records: usize,
    ) -> Result<Vec<LogRecord>, TransportError>;

    /// Commit positions for the consumer group.
    async fn commit(&self, positions: &[CommitPosition]) -> Result<(), TransportError>;

    /// Release connections.
    async fn close(&self) -> Result<(), TransportError>;
}

/// Tracks committed positions so they only ever move forward.
#[derive(Debug, Default)]
pub struct OffsetTracker {
    next: HashMap<(String, i32), i64>,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Positions to commit after `records` were dispatched.
    ///
    /// Returns one position per partition, past the highest offset seen.
    /// Partitions whose position would not move forward are left out.
    pub fn advance(&mut self, records: &[LogRecord]) -> Vec<CommitPosition> {
        let mut highest: BTreeMap<(&str, i32), i64> = BTreeMap::new();
        for record in records {
            let entry = highest
                .entry((record.topic.as_str(), record.partition))
                .or_insert(record.offset);
            *entry = (*entry).max(record.offset);
        }

        let mut positions = Vec::with_capacity(highest.len());
        for ((topic, partition), offset) in highest {
            let next_offset = offset + 1;
            let current = self.next.entry((topic.to_string(), partition)).or_insert(0);
            if next_offset > *current {
                *current = next_offset;
                positions.push(CommitPosition {
                    topic: topic.to_string(),
                    partition,
                    next_offset,
                });
            } else {
                warn!(
                    topic = %topic,
                    partition,
                    committed = *current,
                    attempted = next_offset,
                    "Refusing to move committed offset backwards"
                );
            }
        }
        positions
    }

    pub fn position(&self, topic: &str, partition: i32) -> Option<i64> {
        self.next.get(&(topic.to_string(), partition)).copied()
    }

    pub fn reset(&mut self) {
        self.next.clear();
    }
}
