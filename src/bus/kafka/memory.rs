//! In-memory partitioned log.
//!
//! Behaves like a single-node log cluster: topics are created on first write,
//! records are keyed onto partitions, and consumer groups keep committed
//! offsets independently. Clients that share a group resume from the group's
//! committed offsets; uncommitted records are redelivered.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::topic::partition_for_key;
use super::transport::{CommitPosition, LogRecord, LogTransport, ProducerRecord};
use crate::bus::TransportError;

#[derive(Debug, Clone)]
struct StoredRecord {
    key: String,
    payload: Vec<u8>,
}

#[derive(Debug, Default)]
struct LogState {
    topics: HashMap<String, Vec<Vec<StoredRecord>>>,
    /// (group, topic, partition) → next offset to read.
    committed: HashMap<(String, String, i32), i64>,
}

/// Shared in-memory log cluster.
pub struct InMemoryLog {
    partitions: i32,
    state: Mutex<LogState>,
    appended: Notify,
    send_calls: AtomicUsize,
    failing_sends: AtomicUsize,
}

impl InMemoryLog {
    pub fn new(partitions: i32) -> Arc<Self> {
        Arc::new(Self {
            partitions: partitions.max(1),
            state: Mutex::new(LogState::default()),
            appended: Notify::new(),
            send_calls: AtomicUsize::new(0),
            failing_sends: AtomicUsize::new(0),
        })
    }

    /// Connect a client in consumer group `group`.
    pub fn client(self: &Arc<Self>, group: impl Into<String>) -> InMemoryLogClient {
        InMemoryLogClient {
            log: Arc::clone(self),
            group: group.into(),
            subscription: Mutex::new(Subscription::default()),
            closed: AtomicBool::new(false),
        }
    }

    fn state(&self) -> MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the next `n` batch sends with a lost connection.
    pub fn fail_next_sends(&self, n: usize) {
        self.failing_sends.store(n, Ordering::SeqCst);
    }

    /// Successful batch sends so far.
    pub fn send_calls(&self) -> usize {
        self.send_calls.load(Ordering::SeqCst)
    }

    /// All records of a topic, ordered by partition then offset.
    pub fn records(&self, topic: &str) -> Vec<LogRecord> {
        let state = self.state();
        let Some(partitions) = state.topics.get(topic) else {
            return Vec::new();
        };
        partitions
            .iter()
            .enumerate()
            .flat_map(|(partition, records)| {
                records.iter().enumerate().map(move |(offset, r)| LogRecord {
                    topic: topic.to_string(),
                    partition: partition as i32,
                    offset: offset as i64,
                    key: Some(r.key.clone()),
                    payload: r.payload.clone(),
                })
            })
            .collect()
    }

    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.state().topics.keys().cloned().collect();
        topics.sort();
        topics
    }

    pub fn committed_offset(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        self.state()
            .committed
            .get(&(group.to_string(), topic.to_string(), partition))
            .copied()
    }

    /// Operator reset: forget a group's committed offsets.
    pub fn reset_group(&self, group: &str) {
        self.state().committed.retain(|(g, _, _), _| g != group);
    }

    fn append(&self, records: &[ProducerRecord]) {
        let mut state = self.state();
        for record in records {
            let partitions = state
                .topics
                .entry(record.topic.clone())
                .or_insert_with(|| vec![Vec::new(); self.partitions as usize]);
            let partition = partition_for_key(&record.key, self.partitions) as usize;
            partitions[partition].push(StoredRecord {
                key: record.key.clone(),
                payload: record.payload.clone(),
            });
        }
        drop(state);
        self.appended.notify_waiters();
    }
}

#[derive(Debug, Default)]
struct Subscription {
    topics: Vec<String>,
    positions: HashMap<(String, i32), i64>,
}

/// One consumer/producer connection to an [`InMemoryLog`].
pub struct InMemoryLogClient {
    log: Arc<InMemoryLog>,
    group: String,
    subscription: Mutex<Subscription>,
    closed: AtomicBool,
}

impl InMemoryLogClient {
    fn subscription(&self) -> MutexGuard<'_, Subscription> {
        self.subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(TransportError::ConnectionLost("client closed".to_string()))
        } else {
            Ok(())
        }
    }

    fn fetch(&self, max_records: usize) -> Vec<LogRecord> {
        let state = self.log.state();
        let mut subscription = self.subscription();
        let Subscription { topics, positions } = &mut *subscription;
        let mut batch = Vec::new();

        for topic in topics.iter() {
            let Some(partitions) = state.topics.get(topic) else {
                continue;
            };
            for (partition, records) in partitions.iter().enumerate() {
                let position = positions
                    .entry((topic.clone(), partition as i32))
                    .or_insert(0);
                while (*position as usize) < records.len() && batch.len() < max_records {
                    let stored = &records[*position as usize];
                    batch.push(LogRecord {
                        topic: topic.clone(),
                        partition: partition as i32,
                        offset: *position,
                        key: Some(stored.key.clone()),
                        payload: stored.payload.clone(),
                    });
                    *position += 1;
                }
                if batch.len() >= max_records {
                    return batch;
                }
            }
        }
        batch
    }
}

#[async_trait]
impl LogTransport for InMemoryLogClient {
    async fn send_batch(&self, records: &[ProducerRecord]) -> Result<(), TransportError> {
        self.ensure_open()?;
        let injected = self
            .log
            .failing_sends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(TransportError::ConnectionLost(
                "injected send failure".to_string(),
            ));
        }

        self.log.append(records);
        self.log.send_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(&self, topics: &[String]) -> Result<(), TransportError> {
        self.ensure_open()?;
        let state = self.log.state();
        let mut subscription = self.subscription();

        subscription
            .positions
            .retain(|(topic, _), _| topics.contains(topic));
        for topic in topics {
            if subscription.topics.contains(topic) {
                continue;
            }
            for partition in 0..self.log.partitions {
                let committed = state
                    .committed
                    .get(&(self.group.clone(), topic.clone(), partition))
                    .copied()
                    .unwrap_or(0);
                subscription
                    .positions
                    .insert((topic.clone(), partition), committed);
            }
        }
        subscription.topics = topics.to_vec();
        Ok(())
    }

    async fn poll(
        &self,
        timeout: Duration,
        max_records: usize,
    ) -> Result<Vec<LogRecord>, TransportError> {
        let deadline = Instant::now() + timeout;

        loop {
            self.ensure_open()?;
            let notified = self.log.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.fetch(max_records.max(1));
            if !batch.is_empty() {
                return Ok(batch);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn commit(&self, positions: &[CommitPosition]) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut state = self.log.state();
        for position in positions {
            let committed = state
                .committed
                .entry((
                    self.group.clone(),
                    position.topic.clone(),
                    position.partition,
                ))
                .or_insert(0);
            *committed = (*committed).max(position.next_offset);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
