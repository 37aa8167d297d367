use super::*;
use crate::bus::HandlerError;
use futures::future::BoxFuture;
use serde_json::json;
use std::sync::atomic::AtomicU32;
use tokio::sync::mpsc;

// ============================================================================
// Helpers
// ============================================================================

struct RecordingHandler {
    sender: mpsc::UnboundedSender<Arc<Message>>,
}

impl RecordingHandler {
    fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Arc<Message>>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Arc::new(Self { sender }), receiver)
    }
}

impl MessageHandler for RecordingHandler {
    fn handle(&self, message: Arc<Message>) -> BoxFuture<'static, std::result::Result<(), HandlerError>> {
        let _ = self.sender.send(message);
        Box::pin(async { Ok(()) })
    }
}

/// Signals when invoked, then never completes.
struct BlockingHandler {
    started: Arc<Notify>,
}

impl MessageHandler for BlockingHandler {
    fn handle(&self, _message: Arc<Message>) -> BoxFuture<'static, std::result::Result<(), HandlerError>> {
        let started = Arc::clone(&self.started);
        Box::pin(async move {
            started.notify_one();
            futures::future::pending::<()>().await;
            Ok(())
        })
    }
}

struct FailingHandler {
    error: HandlerError,
    calls: Arc<AtomicU32>,
}

impl MessageHandler for FailingHandler {
    fn handle(&self, _message: Arc<Message>) -> BoxFuture<'static, std::result::Result<(), HandlerError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let error = self.error.clone();
        Box::pin(async move { Err(error) })
    }
}

struct BrokenDeadLetterPublisher;

#[async_trait]
impl DeadLetterPublisher for BrokenDeadLetterPublisher {
    async fn publish(&self, _dead_letter: DeadLetter) -> std::result::Result<(), DlqError> {
        Err(DlqError::PublishFailed("dlq down".to_string()))
    }
}

fn fast_retry(max_retries: u32) -> RetryConfig {
    RetryConfig {
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(2),
        max_retries,
        jitter: 0.0,
    }
}

/// Flush on every publish, no linger task.
fn unbatched() -> LogBrokerConfig {
    LogBrokerConfig::default()
        .with_batching(1, Duration::ZERO)
        .with_handler_retry(fast_retry(0))
}

async fn broker(
    log: &Arc<InMemoryLog>,
    group: &str,
    config: LogBrokerConfig,
) -> LogBroker<InMemoryLogClient> {
    LogBroker::new(Arc::new(log.client(group)), config)
        .await
        .unwrap()
}

fn event(channel: &str, seq: u32) -> Arc<Message> {
    Arc::new(Message::event(channel, "tick", json!({ "seq": seq })))
}

fn drain(receiver: &mut mpsc::UnboundedReceiver<Arc<Message>>) -> Vec<Arc<Message>> {
    let mut out = Vec::new();
    while let Ok(message) = receiver.try_recv() {
        out.push(message);
    }
    out
}

// ============================================================================
// Producer
// ============================================================================

#[tokio::test]
async fn test_single_record_batch_flushes_exactly_once() {
    let log = InMemoryLog::new(1);
    let producer = broker(&log, "p", unbatched()).await;

    producer.publish("orders", event("orders", 1)).await.unwrap();

    assert_eq!(log.send_calls(), 1);
    assert_eq!(log.records("fanout_orders").len(), 1);
    assert_eq!(producer.buffered().await, 0);
}

#[tokio::test]
async fn test_linger_flushes_partial_batch() {
    let log = InMemoryLog::new(1);
    let config = LogBrokerConfig::default().with_batching(100, Duration::from_millis(20));
    let producer = broker(&log, "p", config).await;

    producer.publish("orders", event("orders", 1)).await.unwrap();
    producer.publish("orders", event("orders", 2)).await.unwrap();
    assert_eq!(log.send_calls(), 0);

    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(log.send_calls(), 1);
    assert_eq!(log.records("fanout_orders").len(), 2);
}

#[tokio::test]
async fn test_size_threshold_flushes_before_linger() {
    let log = InMemoryLog::new(1);
    let config = LogBrokerConfig::default().with_batching(3, Duration::from_secs(60));
    let producer = broker(&log, "p", config).await;

    for seq in 0..3 {
        producer.publish("orders", event("orders", seq)).await.unwrap();
    }

    assert_eq!(log.send_calls(), 1);
    assert_eq!(log.records("fanout_orders").len(), 3);
}

#[tokio::test]
async fn test_disconnect_flushes_buffer() {
    let log = InMemoryLog::new(1);
    let config = LogBrokerConfig::default().with_batching(100, Duration::from_secs(60));
    let producer = broker(&log, "p", config).await;

    for seq in 0..3 {
        producer.publish("orders", event("orders", seq)).await.unwrap();
    }
    assert_eq!(producer.buffered().await, 3);

    producer.disconnect().await.unwrap();

    assert_eq!(log.send_calls(), 1);
    assert_eq!(log.records("fanout_orders").len(), 3);
    assert!(!producer.is_connected());
}

#[tokio::test]
async fn test_flush_retry_keeps_buffer_until_acknowledged() {
    let log = InMemoryLog::new(1);
    let producer = broker(&log, "p", unbatched().with_flush_retries(3)).await;
    log.fail_next_sends(2);

    producer.publish("orders", event("orders", 1)).await.unwrap();

    assert_eq!(log.send_calls(), 1);
    assert_eq!(log.records("fanout_orders").len(), 1);
    assert_eq!(producer.buffered().await, 0);
}

#[tokio::test]
async fn test_failed_flush_retains_records() {
    let log = InMemoryLog::new(1);
    let producer = broker(&log, "p", unbatched().with_flush_retries(0)).await;
    log.fail_next_sends(1);

    producer.publish("orders", event("orders", 1)).await.unwrap();
    assert_eq!(producer.buffered().await, 1);
    assert!(log.records("fanout_orders").is_empty());

    assert_eq!(producer.flush().await.unwrap(), 1);
    assert_eq!(log.records("fanout_orders").len(), 1);
}

#[tokio::test]
async fn test_publish_refused_at_hard_limit() {
    let log = InMemoryLog::new(1);
    let producer = broker(&log, "p", unbatched().with_flush_retries(0)).await;
    log.fail_next_sends(usize::MAX);

    for seq in 0..HARD_LIMIT_FACTOR as u32 {
        producer.publish("orders", event("orders", seq)).await.unwrap();
    }
    let result = producer.publish("orders", event("orders", 99)).await;

    assert!(matches!(result, Err(BrokerError::Unavailable(_))));
    assert_eq!(producer.buffered().await, HARD_LIMIT_FACTOR);
}

#[tokio::test]
async fn test_publish_after_disconnect_is_unavailable() {
    let log = InMemoryLog::new(1);
    let producer = broker(&log, "p", unbatched()).await;

    producer.disconnect().await.unwrap();
    producer.disconnect().await.unwrap();

    let result = producer.publish("orders", event("orders", 1)).await;
    assert!(matches!(result, Err(BrokerError::Unavailable(_))));
}

// ============================================================================
// Consumer
// ============================================================================

#[tokio::test]
async fn test_consume_without_subscriptions_waits_and_returns_zero() {
    let log = InMemoryLog::new(1);
    let consumer = broker(&log, "g", unbatched()).await;

    let started = Instant::now();
    let consumed = consumer.consume(Duration::from_millis(30), 10).await.unwrap();

    assert_eq!(consumed, 0);
    assert!(started.elapsed() >= Duration::from_millis(30));
}

#[tokio::test]
async fn test_consume_timeout_returns_zero() {
    let log = InMemoryLog::new(1);
    let consumer = broker(&log, "g", unbatched()).await;
    let (handler, _rx) = RecordingHandler::new();
    consumer.subscribe("orders", handler).await.unwrap();

    let consumed = consumer.consume(Duration::from_millis(20), 10).await.unwrap();
    assert_eq!(consumed, 0);
}

#[tokio::test]
async fn test_per_channel_order_preserved() {
    let log = InMemoryLog::new(4);
    let producer = broker(&log, "p", unbatched()).await;
    let consumer = broker(&log, "g", unbatched()).await;
    let (handler, mut rx) = RecordingHandler::new();
    consumer.subscribe("orders", handler).await.unwrap();

    for seq in 0..20 {
        producer.publish("orders", event("orders", seq)).await.unwrap();
    }

    let mut total = 0;
    while total < 20 {
        total += consumer.consume(Duration::from_millis(100), 7).await.unwrap();
    }

    let seen: Vec<u64> = drain(&mut rx)
        .iter()
        .map(|m| m.data()["seq"].as_u64().unwrap())
        .collect();
    assert_eq!(seen, (0..20).collect::<Vec<u64>>());
}

#[tokio::test]
async fn test_batch_size_bounds_consume() {
    let log = InMemoryLog::new(1);
    let producer = broker(&log, "p", unbatched()).await;
    let consumer = broker(&log, "g", unbatched()).await;
    let (handler, _rx) = RecordingHandler::new();
    consumer.subscribe("orders", handler).await.unwrap();

    for seq in 0..5 {
        producer.publish("orders", event("orders", seq)).await.unwrap();
    }

    assert_eq!(consumer.consume(Duration::from_millis(50), 2).await.unwrap(), 2);
    assert_eq!(consumer.consume(Duration::from_millis(50), 10).await.unwrap(), 3);
}

#[tokio::test]
async fn test_subscribe_replaces_handler() {
    let log = InMemoryLog::new(1);
    let producer = broker(&log, "p", unbatched()).await;
    let consumer = broker(&log, "g", unbatched()).await;
    let (first, mut first_rx) = RecordingHandler::new();
    let (second, mut second_rx) = RecordingHandler::new();

    consumer.subscribe("orders", first).await.unwrap();
    consumer.subscribe("orders", second).await.unwrap();
    producer.publish("orders", event("orders", 1)).await.unwrap();
    consumer.consume(Duration::from_millis(100), 10).await.unwrap();

    assert!(drain(&mut first_rx).is_empty());
    assert_eq!(drain(&mut second_rx).len(), 1);
}

#[tokio::test]
async fn test_grouped_mapping_routes_by_channel_key() {
    let log = InMemoryLog::new(2);
    let config = || unbatched().with_topic_mapping(TopicMapping::Grouped);
    let producer = broker(&log, "p", config()).await;
    let consumer = broker(&log, "g", config()).await;
    let (handler, mut rx) = RecordingHandler::new();
    consumer.subscribe("orders.1", handler).await.unwrap();

    producer.publish("orders.1", event("orders.1", 1)).await.unwrap();
    producer.publish("orders.2", event("orders.2", 2)).await.unwrap();

    assert_eq!(log.topics(), vec!["fanout.orders".to_string()]);

    let mut total = 0;
    while total < 2 {
        total += consumer.consume(Duration::from_millis(100), 10).await.unwrap();
    }
    let seen = drain(&mut rx);
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].channel(), Some("orders.1"));
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let log = InMemoryLog::new(1);
    let producer = broker(&log, "p", unbatched()).await;
    let consumer = broker(&log, "g", unbatched()).await;
    let (handler, mut rx) = RecordingHandler::new();
    consumer.subscribe("orders", handler).await.unwrap();
    consumer.unsubscribe("orders").await.unwrap();

    producer.publish("orders", event("orders", 1)).await.unwrap();

    assert_eq!(consumer.consume(Duration::from_millis(20), 10).await.unwrap(), 0);
    assert!(drain(&mut rx).is_empty());
}

// ============================================================================
// Commit modes
// ============================================================================

async fn crash_mid_batch(log: &Arc<InMemoryLog>, mode: CommitMode) {
    let producer = broker(log, "p", unbatched()).await;
    for seq in 0..3 {
        producer.publish("orders", event("orders", seq)).await.unwrap();
    }

    let consumer = Arc::new(broker(log, "g", unbatched().with_commit_mode(mode)).await);
    let started = Arc::new(Notify::new());
    consumer
        .subscribe(
            "orders",
            Arc::new(BlockingHandler {
                started: Arc::clone(&started),
            }),
        )
        .await
        .unwrap();

    let task = {
        let consumer = Arc::clone(&consumer);
        tokio::spawn(async move { consumer.consume(Duration::from_secs(1), 10).await })
    };
    started.notified().await;
    task.abort();
    let _ = task.await;
}

#[tokio::test]
async fn test_manual_commit_redelivers_after_crash() {
    let log = InMemoryLog::new(1);
    crash_mid_batch(&log, CommitMode::Manual).await;

    let replacement = broker(&log, "g", unbatched()).await;
    let (handler, mut rx) = RecordingHandler::new();
    replacement.subscribe("orders", handler).await.unwrap();

    let consumed = replacement.consume(Duration::from_millis(100), 10).await.unwrap();

    assert_eq!(consumed, 3);
    assert_eq!(drain(&mut rx).len(), 3);
    assert_eq!(log.committed_offset("g", "fanout_orders", 0), Some(3));
}

#[tokio::test]
async fn test_auto_commit_loses_batch_after_crash() {
    let log = InMemoryLog::new(1);
    crash_mid_batch(&log, CommitMode::Auto).await;

    assert_eq!(log.committed_offset("g", "fanout_orders", 0), Some(3));

    let replacement = broker(&log, "g", unbatched()).await;
    let (handler, mut rx) = RecordingHandler::new();
    replacement.subscribe("orders", handler).await.unwrap();

    let consumed = replacement.consume(Duration::from_millis(50), 10).await.unwrap();

    assert_eq!(consumed, 0);
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn test_operator_reset_replays_from_start() {
    let log = InMemoryLog::new(1);
    let producer = broker(&log, "p", unbatched()).await;
    producer.publish("orders", event("orders", 1)).await.unwrap();

    let first = broker(&log, "g", unbatched()).await;
    let (handler, _rx) = RecordingHandler::new();
    first.subscribe("orders", handler).await.unwrap();
    assert_eq!(first.consume(Duration::from_millis(100), 10).await.unwrap(), 1);

    log.reset_group("g");

    let second = broker(&log, "g", unbatched()).await;
    let (handler, _rx) = RecordingHandler::new();
    second.subscribe("orders", handler).await.unwrap();
    assert_eq!(second.consume(Duration::from_millis(100), 10).await.unwrap(), 1);
}

#[test]
fn test_offset_tracker_never_moves_backwards() {
    let record = |offset| LogRecord {
        topic: "t".to_string(),
        partition: 0,
        offset,
        key: None,
        payload: Vec::new(),
    };
    let mut tracker = OffsetTracker::new();

    let positions = tracker.advance(&[record(4), record(2)]);
    assert_eq!(positions.len(), 1);
    assert_eq!(positions[0].next_offset, 5);

    assert!(tracker.advance(&[record(3)]).is_empty());
    assert_eq!(tracker.position("t", 0), Some(5));
}

// ============================================================================
// Dead letters
// ============================================================================

#[tokio::test]
async fn test_unrecoverable_failure_dead_lettered_and_committed() {
    let log = InMemoryLog::new(1);
    let producer = broker(&log, "p", unbatched()).await;
    let consumer = broker(&log, "g", unbatched().with_dead_letter_topic("fanout.dlq")).await;
    let calls = Arc::new(AtomicU32::new(0));
    consumer
        .subscribe(
            "orders",
            Arc::new(FailingHandler {
                error: HandlerError::Unrecoverable("bad order".to_string()),
                calls: Arc::clone(&calls),
            }),
        )
        .await
        .unwrap();

    let message = event("orders", 7);
    producer.publish("orders", Arc::clone(&message)).await.unwrap();

    assert_eq!(consumer.consume(Duration::from_millis(100), 10).await.unwrap(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let dead = log.records("fanout.dlq");
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].key.as_deref(), Some("orders"));

    let dead_letter = DeadLetter::decode(&dead[0].payload).unwrap();
    assert_eq!(dead_letter.message_id.as_deref(), Some(message.id()));
    assert_eq!(dead_letter.original_payload().unwrap(), message.encode().unwrap());
    assert_eq!(dead_letter.retry_count, 0);
    assert!(dead_letter.failed_at > 0);
    assert_eq!(dead_letter.source.offset, Some(0));

    assert_eq!(log.committed_offset("g", "fanout_orders", 0), Some(1));
}

#[tokio::test]
async fn test_exhausted_retries_record_retry_count() {
    let log = InMemoryLog::new(1);
    let producer = broker(&log, "p", unbatched()).await;
    let config = unbatched()
        .with_dead_letter_topic("fanout.dlq")
        .with_handler_retry(fast_retry(2));
    let consumer = broker(&log, "g", config).await;
    let calls = Arc::new(AtomicU32::new(0));
    consumer
        .subscribe(
            "orders",
            Arc::new(FailingHandler {
                error: HandlerError::Transient("timeout".to_string()),
                calls: Arc::clone(&calls),
            }),
        )
        .await
        .unwrap();

    producer.publish("orders", event("orders", 1)).await.unwrap();
    consumer.consume(Duration::from_millis(100), 10).await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let dead_letter = DeadLetter::decode(&log.records("fanout.dlq")[0].payload).unwrap();
    assert_eq!(dead_letter.retry_count, 2);
    assert!(dead_letter.is_transient);
}

#[tokio::test]
async fn test_undecodable_record_dead_lettered() {
    let log = InMemoryLog::new(1);
    let consumer = broker(&log, "g", unbatched().with_dead_letter_topic("fanout.dlq")).await;
    let (handler, mut rx) = RecordingHandler::new();
    consumer.subscribe("orders", handler).await.unwrap();

    let raw = log.client("raw");
    raw.send_batch(&[ProducerRecord {
        topic: "fanout_orders".to_string(),
        key: "orders".to_string(),
        payload: vec![0xde, 0xad, 0xbe, 0xef],
    }])
    .await
    .unwrap();

    assert_eq!(consumer.consume(Duration::from_millis(100), 10).await.unwrap(), 1);
    assert!(drain(&mut rx).is_empty());

    let dead_letter = DeadLetter::decode(&log.records("fanout.dlq")[0].payload).unwrap();
    assert_eq!(dead_letter.original_payload().unwrap(), vec![0xde, 0xad, 0xbe, 0xef]);
    assert_eq!(log.committed_offset("g", "fanout_orders", 0), Some(1));
}

#[tokio::test]
async fn test_dead_letter_failure_still_advances() {
    let log = InMemoryLog::new(1);
    let producer = broker(&log, "p", unbatched()).await;
    let consumer = broker(&log, "g", unbatched())
        .await
        .with_dead_letter_publisher(Arc::new(BrokenDeadLetterPublisher));
    consumer
        .subscribe(
            "orders",
            Arc::new(FailingHandler {
                error: HandlerError::Unrecoverable("bad".to_string()),
                calls: Arc::new(AtomicU32::new(0)),
            }),
        )
        .await
        .unwrap();

    producer.publish("orders", event("orders", 1)).await.unwrap();

    assert_eq!(consumer.consume(Duration::from_millis(100), 10).await.unwrap(), 1);
    assert_eq!(log.committed_offset("g", "fanout_orders", 0), Some(1));
    assert_eq!(consumer.consume(Duration::from_millis(20), 10).await.unwrap(), 0);
}
