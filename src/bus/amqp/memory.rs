//! In-memory AMQP-style server.
//!
//! Models what the queue broker relies on: topic exchanges with bindings,
//! durable queues that outlive client connections, and requeue of
//! unacknowledged deliveries when a connection drops. A registered push
//! consumer is handed ready messages as soon as they arrive, up to its
//! prefetch window, the way a real broker fills the client's buffer. Clients can be told to lose their connection to exercise recovery.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::transport::{routing_matches, QueueDelivery, QueueTransport};
use crate::bus::TransportError;

#[derive(Debug, Clone)]
struct QueuedMessage {
    routing_key: String,
    payload: Vec<u8>,
    redelivered: bool,
}

#[derive(Debug, Clone, Copy)]
struct PushConsumer {
    session: u64,
    prefetch: u16,
}

#[derive(Debug, Default)]
struct QueueState {
    dead_letter_exchange: Option<String>,
    ready: VecDeque<QueuedMessage>,
    /// delivery tag → (owning session, message)
    unacked: HashMap<u64, (u64, QueuedMessage)>,
    consumers: Vec<PushConsumer>,
    /// session → deliveries pushed but not yet read by the client
    pushed: HashMap<u64, VecDeque<QueueDelivery>>,
}

#[derive(Debug, Default)]
struct ServerState {
    /// exchange → (binding pattern, queue)
    exchanges: HashMap<String, Vec<(String, String)>>,
    queues: HashMap<String, QueueState>,
    next_tag: u64,
}

impl ServerState {
    /// Copy a message into every queue bound to `exchange` with a matching key.
    fn route(&mut self, exchange: &str, routing_key: &str, payload: &[u8]) -> Result<(), TransportError> {
        let targets: HashSet<String> = self
            .exchanges
            .get(exchange)
            .ok_or_else(|| {
                TransportError::Operation(format!("NOT_FOUND - no exchange '{}'", exchange))
            })?
            .iter()
            .filter(|(pattern, _)| routing_matches(pattern, routing_key))
            .map(|(_, queue)| queue.clone())
            .collect();

        for queue in targets {
            if let Some(q) = self.queues.get_mut(&queue) {
                q.ready.push_back(QueuedMessage {
                    routing_key: routing_key.to_string(),
                    payload: payload.to_vec(),
                    redelivered: false,
                });
            }
            self.push(&queue);
        }
        Ok(())
    }

    /// Move ready messages into registered consumers' buffers, up to each
    /// consumer's prefetch window.
    fn push(&mut self, queue: &str) {
        let consumers = match self.queues.get(queue) {
            Some(state) => state.consumers.clone(),
            None => return,
        };
        for consumer in consumers {
            loop {
                let in_flight = self.unacked_for(queue, consumer.session);
                if consumer.prefetch != 0 && in_flight >= consumer.prefetch as usize {
                    break;
                }
                let Some(delivery) = self.deliver(queue, consumer.session) else {
                    break;
                };
                if let Some(state) = self.queues.get_mut(queue) {
                    state
                        .pushed
                        .entry(consumer.session)
                        .or_default()
                        .push_back(delivery);
                }
            }
        }
    }

    fn requeue_session(&mut self, session: u64) {
        for queue in self.queues.values_mut() {
            queue.consumers.retain(|c| c.session != session);
            queue.pushed.remove(&session);
            let mut orphaned: Vec<(u64, QueuedMessage)> = queue
                .unacked
                .iter()
                .filter(|(_, (owner, _))| *owner == session)
                .map(|(tag, (_, message))| (*tag, message.clone()))
                .collect();
            orphaned.sort_by_key(|(tag, _)| *tag);
            for (tag, _) in &orphaned {
                queue.unacked.remove(tag);
            }
            for (_, mut message) in orphaned.into_iter().rev() {
                message.redelivered = true;
                queue.ready.push_front(message);
            }
        }
        let names: Vec<String> = self.queues.keys().cloned().collect();
        for name in names {
            self.push(&name);
        }
    }

    fn deliver(&mut self, queue: &str, session: u64) -> Option<QueueDelivery> {
        self.next_tag += 1;
        let tag = self.next_tag;
        let state = self.queues.get_mut(queue)?;
        let message = state.ready.pop_front()?;
        state.unacked.insert(tag, (session, message.clone()));
        Some(QueueDelivery {
            delivery_tag: tag,
            routing_key: message.routing_key,
            payload: message.payload,
            redelivered: message.redelivered,
        })
    }

    fn unacked_for(&self, queue: &str, session: u64) -> usize {
        self.queues
            .get(queue)
            .map(|q| q.unacked.values().filter(|(owner, _)| *owner == session).count())
            .unwrap_or(0)
    }
}

/// Shared in-memory queue server.
pub struct InMemoryQueue {
    state: Mutex<ServerState>,
    ready: Notify,
    next_session: AtomicU64,
}

impl InMemoryQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ServerState::default()),
            ready: Notify::new(),
            next_session: AtomicU64::new(0),
        })
    }

    /// A client that must `connect` before use.
    pub fn client(self: &Arc<Self>) -> InMemoryQueueClient {
        InMemoryQueueClient {
            server: Arc::clone(self),
            session: Mutex::new(None),
            lose_connection: AtomicBool::new(false),
            failing_connects: AtomicUsize::new(0),
            connects: AtomicUsize::new(0),
            consumers_registered: AtomicUsize::new(0),
        }
    }

    fn state(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Messages waiting in a queue.
    pub fn depth(&self, queue: &str) -> usize {
        self.state()
            .queues
            .get(queue)
            .map(|q| q.ready.len())
            .unwrap_or(0)
    }

    /// Delivered but unsettled messages in a queue.
    pub fn unacked(&self, queue: &str) -> usize {
        self.state()
            .queues
            .get(queue)
            .map(|q| q.unacked.len())
            .unwrap_or(0)
    }

    /// Remove and return waiting payloads, for inspection.
    pub fn drain(&self, queue: &str) -> Vec<Vec<u8>> {
        self.state()
            .queues
            .get_mut(queue)
            .map(|q| q.ready.drain(..).map(|m| m.payload).collect())
            .unwrap_or_default()
    }

    /// Push consumers currently registered on a queue.
    pub fn consumers(&self, queue: &str) -> usize {
        self.state()
            .queues
            .get(queue)
            .map(|q| q.consumers.len())
            .unwrap_or(0)
    }

    pub fn bindings(&self, exchange: &str) -> Vec<(String, String)> {
        self.state()
            .exchanges
            .get(exchange)
            .cloned()
            .unwrap_or_default()
    }
}

#[derive(Debug)]
struct Session {
    id: u64,
    prefetch: u16,
}

/// One connection + channel to an [`InMemoryQueue`].
pub struct InMemoryQueueClient {
    server: Arc<InMemoryQueue>,
    session: Mutex<Option<Session>>,
    lose_connection: AtomicBool,
    failing_connects: AtomicUsize,
    connects: AtomicUsize,
    consumers_registered: AtomicUsize,
}

impl InMemoryQueueClient {
    fn session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop the connection now; unacknowledged deliveries are requeued.
    pub fn drop_connection(&self) {
        let session = self.session().take();
        if let Some(session) = session {
            self.server.state().requeue_session(session.id);
            self.server.ready.notify_waiters();
        }
    }

    /// The next operation finds the connection broken.
    pub fn lose_connection_on_next_op(&self) {
        self.lose_connection.store(true, Ordering::SeqCst);
    }

    /// Refuse the next `n` connection attempts.
    pub fn fail_next_connects(&self, n: usize) {
        self.failing_connects.store(n, Ordering::SeqCst);
    }

    /// Successful connects so far.
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Push consumers registered so far.
    pub fn consumers_registered(&self) -> usize {
        self.consumers_registered.load(Ordering::SeqCst)
    }

    /// Session id of the live connection.
    fn live(&self) -> Result<u64, TransportError> {
        if self.lose_connection.swap(false, Ordering::SeqCst) {
            self.drop_connection();
            return Err(TransportError::ConnectionLost("broken pipe".to_string()));
        }
        self.session()
            .as_ref()
            .map(|s| s.id)
            .ok_or_else(|| TransportError::ConnectionLost("connection closed".to_string()))
    }

    fn has_pushed(&self, queue: &str, session: u64) -> bool {
        self.server
            .state()
            .queues
            .get(queue)
            .and_then(|q| q.pushed.get(&session))
            .is_some_and(|buffer| !buffer.is_empty())
    }

    fn missing_queue(queue: &str) -> TransportError {
        TransportError::Operation(format!("NOT_FOUND - no queue '{}'", queue))
    }

    fn unknown_tag(delivery_tag: u64) -> TransportError {
        TransportError::Operation(format!(
            "PRECONDITION_FAILED - unknown delivery tag {}",
            delivery_tag
        ))
    }
}

#[async_trait]
impl QueueTransport for InMemoryQueueClient {
    async fn connect(&self) -> Result<(), TransportError> {
        let refused = self
            .failing_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if refused.is_ok() {
            return Err(TransportError::ConnectionLost(
                "connection refused".to_string(),
            ));
        }

        self.drop_connection();
        let id = self.server.next_session.fetch_add(1, Ordering::SeqCst) + 1;
        *self.session() = Some(Session {
            id,
            prefetch: 0,
        });
        self.lose_connection.store(false, Ordering::SeqCst);
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn is_open(&self) -> bool {
        self.session().is_some()
    }

    async fn set_prefetch(&self, prefetch: u16) -> Result<(), TransportError> {
        self.live()?;
        if let Some(session) = self.session().as_mut() {
            session.prefetch = prefetch;
        }
        Ok(())
    }

    async fn declare_exchange(&self, exchange: &str) -> Result<(), TransportError> {
        self.live()?;
        self.server
            .state()
            .exchanges
            .entry(exchange.to_string())
            .or_default();
        Ok(())
    }

    async fn declare_queue(
        &self,
        queue: &str,
        dead_letter_exchange: Option<&str>,
    ) -> Result<(), TransportError> {
        self.live()?;
        self.server
            .state()
            .queues
            .entry(queue.to_string())
            .or_default()
            .dead_letter_exchange = dead_letter_exchange.map(str::to_string);
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        self.live()?;
        let mut state = self.server.state();
        if !state.queues.contains_key(queue) {
            return Err(Self::missing_queue(queue));
        }
        let bindings = state.exchanges.get_mut(exchange).ok_or_else(|| {
            TransportError::Operation(format!("NOT_FOUND - no exchange '{}'", exchange))
        })?;
        let binding = (routing_key.to_string(), queue.to_string());
        if !bindings.contains(&binding) {
            bindings.push(binding);
        }
        Ok(())
    }

    async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        self.live()?;
        if let Some(bindings) = self.server.state().exchanges.get_mut(exchange) {
            bindings.retain(|(pattern, q)| !(pattern == routing_key && q == queue));
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        self.live()?;
        self.server.state().route(exchange, routing_key, payload)?;
        self.server.ready.notify_waiters();
        Ok(())
    }

    async fn get(&self, queue: &str) -> Result<Option<QueueDelivery>, TransportError> {
        let session = self.live()?;
        let mut state = self.server.state();
        if !state.queues.contains_key(queue) {
            return Err(Self::missing_queue(queue));
        }
        Ok(state.deliver(queue, session))
    }

    async fn next_deliveries(
        &self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Vec<QueueDelivery>, TransportError> {
        let session = self.live()?;
        let prefetch = self.session().as_ref().map(|s| s.prefetch).unwrap_or(0);
        {
            let mut state = self.server.state();
            let queue_state = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| Self::missing_queue(queue))?;
            queue_state.consumers.push(PushConsumer { session, prefetch });
            state.push(queue);
        }
        self.consumers_registered.fetch_add(1, Ordering::SeqCst);

        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.server.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.has_pushed(queue, session) {
                break;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                break;
            }
            // A dropped session has already lost its consumer.
            self.live()?;
        }

        // Cancel: stop pushing and hand back whatever was buffered.
        let mut state = self.server.state();
        let Some(queue_state) = state.queues.get_mut(queue) else {
            return Err(Self::missing_queue(queue));
        };
        queue_state.consumers.retain(|c| c.session != session);
        Ok(queue_state
            .pushed
            .remove(&session)
            .map(Vec::from)
            .unwrap_or_default())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError> {
        let session = self.live()?;
        let mut state = self.server.state();
        let queue = state
            .queues
            .values_mut()
            .find(|q| matches!(q.unacked.get(&delivery_tag), Some((owner, _)) if *owner == session))
            .ok_or_else(|| Self::unknown_tag(delivery_tag))?;
        queue.unacked.remove(&delivery_tag);
        let names: Vec<String> = state.queues.keys().cloned().collect();
        for name in names {
            state.push(&name);
        }
        Ok(())
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
        let session = self.live()?;
        {
            let mut state = self.server.state();
            let queue = state
                .queues
                .values_mut()
                .find(|q| matches!(q.unacked.get(&delivery_tag), Some((owner, _)) if *owner == session))
                .ok_or_else(|| Self::unknown_tag(delivery_tag))?;
            let dead_letter_exchange = queue.dead_letter_exchange.clone();
            if let Some((_, mut message)) = queue.unacked.remove(&delivery_tag) {
                if requeue {
                    message.redelivered = true;
                    queue.ready.push_front(message);
                } else if let Some(exchange) = dead_letter_exchange {
                    state.route(&exchange, &message.routing_key, &message.payload)?;
                }
            }
            let names: Vec<String> = state.queues.keys().cloned().collect();
            for name in names {
                state.push(&name);
            }
        }
        self.server.ready.notify_waiters();
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.drop_connection();
        Ok(())
    }
}
