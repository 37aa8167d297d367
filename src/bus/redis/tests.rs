use super::*;
use crate::bus::HandlerError;
use futures::future::BoxFuture;
use serde_json::json;
use std::sync::atomic::AtomicU32;
use tokio::sync::mpsc;

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

struct CountingFailure {
    calls: Arc<AtomicU32>,
}

impl MessageHandler for CountingFailure {
    fn handle(&self, _message: Arc<Message>) -> BoxFuture<'static, std::result::Result<(), HandlerError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Err(HandlerError::Unrecoverable("nope".to_string())) })
    }
}

const SHORT: Duration = Duration::from_millis(20);

fn config() -> PubSubBrokerConfig {
    PubSubBrokerConfig::default()
        .with_reconnect_delay(Duration::from_millis(1))
        .with_handler_retry(RetryConfig::none())
}

fn broker(hub: &Arc<InMemoryPubSub>) -> (PubSubBroker<InMemoryPubSubClient>, Arc<InMemoryPubSubClient>) {
    let client = Arc::new(hub.client());
    (PubSubBroker::new(Arc::clone(&client), config()), client)
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

#[tokio::test]
async fn test_publish_reaches_live_subscribers() {
    let hub = InMemoryPubSub::new();
    let (a, _a_client) = broker(&hub);
    let (b, _b_client) = broker(&hub);
    let (handler_a, mut received_a) = RecordingHandler::new();
    let (handler_b, mut received_b) = RecordingHandler::new();

    a.subscribe("orders", handler_a).await.unwrap();
    b.subscribe("orders", handler_b).await.unwrap();
    a.publish("orders", event("orders", 1)).await.unwrap();

    assert_eq!(a.consume(SHORT, 10).await.unwrap(), 1);
    assert_eq!(b.consume(SHORT, 10).await.unwrap(), 1);
    assert_eq!(drain(&mut received_a).len(), 1);
    assert_eq!(drain(&mut received_b).len(), 1);
}

#[tokio::test]
async fn test_channels_are_prefixed() {
    let hub = InMemoryPubSub::new();
    let (broker, _client) = broker(&hub);
    let (handler, _received) = RecordingHandler::new();

    broker.subscribe("orders", handler).await.unwrap();

    assert_eq!(broker.broker_channel("orders"), "fanout_orders");
    assert_eq!(hub.subscriber_count("fanout_orders"), 1);
    assert_eq!(hub.subscriber_count("orders"), 0);
}

#[tokio::test]
async fn test_no_replay_for_late_subscriber() {
    let hub = InMemoryPubSub::new();
    let (publisher, _publisher_client) = broker(&hub);
    let (late, _late_client) = broker(&hub);
    let (handler, mut received) = RecordingHandler::new();

    publisher.publish("orders", event("orders", 1)).await.unwrap();
    late.subscribe("orders", handler).await.unwrap();

    assert_eq!(late.consume(SHORT, 10).await.unwrap(), 0);
    assert!(drain(&mut received).is_empty());
}

#[tokio::test]
async fn test_consume_preserves_order_and_batch_bound() {
    let hub = InMemoryPubSub::new();
    let (broker, _client) = broker(&hub);
    let (handler, mut received) = RecordingHandler::new();
    broker.subscribe("orders", handler).await.unwrap();

    for seq in 0..5 {
        broker.publish("orders", event("orders", seq)).await.unwrap();
    }

    assert_eq!(broker.consume(SHORT, 3).await.unwrap(), 3);
    assert_eq!(broker.consume(SHORT, 3).await.unwrap(), 2);
    let seqs: Vec<u64> = drain(&mut received)
        .iter()
        .filter_map(|m| m.data()["seq"].as_u64())
        .collect();
    assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn test_consume_without_subscriptions_waits_timeout() {
    let hub = InMemoryPubSub::new();
    let (broker, _client) = broker(&hub);

    let started = tokio::time::Instant::now();
    assert_eq!(broker.consume(SHORT, 10).await.unwrap(), 0);
    assert!(started.elapsed() >= SHORT);
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let hub = InMemoryPubSub::new();
    let (broker, _client) = broker(&hub);
    let (handler, mut received) = RecordingHandler::new();
    broker.subscribe("orders", Arc::clone(&handler) as Arc<dyn MessageHandler>).await.unwrap();
    broker.subscribe("users", handler).await.unwrap();

    broker.unsubscribe("orders").await.unwrap();
    broker.publish("orders", event("orders", 1)).await.unwrap();
    broker.publish("users", event("users", 2)).await.unwrap();

    assert_eq!(broker.consume(SHORT, 10).await.unwrap(), 1);
    let messages = drain(&mut received);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].channel(), Some("users"));
    assert_eq!(hub.subscriber_count("fanout_orders"), 0);
}

#[tokio::test]
async fn test_subscribe_while_consume_waits() {
    let hub = InMemoryPubSub::new();
    let (broker, _client) = broker(&hub);
    let (handler, mut received) = RecordingHandler::new();
    broker.subscribe("orders", Arc::clone(&handler) as Arc<dyn MessageHandler>).await.unwrap();

    let broker = Arc::new(broker);
    let waiting = {
        let broker = Arc::clone(&broker);
        tokio::spawn(async move { broker.consume(Duration::from_secs(5), 10).await })
    };
    tokio::time::sleep(SHORT).await;

    let started = tokio::time::Instant::now();
    broker.subscribe("users", handler).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));

    broker.publish("users", event("users", 1)).await.unwrap();
    assert_eq!(waiting.await.unwrap().unwrap(), 1);
    assert_eq!(drain(&mut received)[0].channel(), Some("users"));
}

#[tokio::test]
async fn test_handler_failure_is_dropped() {
    let hub = InMemoryPubSub::new();
    let (broker, _client) = broker(&hub);
    let calls = Arc::new(AtomicU32::new(0));
    broker
        .subscribe(
            "orders",
            Arc::new(CountingFailure {
                calls: Arc::clone(&calls),
            }),
        )
        .await
        .unwrap();

    broker.publish("orders", event("orders", 1)).await.unwrap();

    assert_eq!(broker.consume(SHORT, 10).await.unwrap(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(broker.consume(SHORT, 10).await.unwrap(), 0);
}

#[tokio::test]
async fn test_reconnect_resubscribes_and_loses_gap() {
    let hub = InMemoryPubSub::new();
    let (subscriber, client) = broker(&hub);
    let (publisher, _publisher_client) = broker(&hub);
    let (handler, mut received) = RecordingHandler::new();
    subscriber.subscribe("orders", handler).await.unwrap();

    client.drop_connection();
    publisher.publish("orders", event("orders", 1)).await.unwrap();

    assert_eq!(subscriber.consume(SHORT, 10).await.unwrap(), 0);
    assert_eq!(subscriber.reconnects(), 1);
    assert_eq!(hub.subscriber_count("fanout_orders"), 1);

    publisher.publish("orders", event("orders", 2)).await.unwrap();
    assert_eq!(subscriber.consume(SHORT, 10).await.unwrap(), 1);

    let seqs: Vec<u64> = drain(&mut received)
        .iter()
        .filter_map(|m| m.data()["seq"].as_u64())
        .collect();
    assert_eq!(seqs, vec![2]);
}

#[tokio::test]
async fn test_publish_reconnects_once() {
    let hub = InMemoryPubSub::new();
    let (broker, client) = broker(&hub);

    client.drop_connection();
    broker.publish("orders", event("orders", 1)).await.unwrap();

    assert_eq!(client.reconnects(), 1);
}

#[tokio::test]
async fn test_failed_reconnect_is_unavailable() {
    let hub = InMemoryPubSub::new();
    let (broker, client) = broker(&hub);

    client.drop_connection();
    client.fail_next_reconnects(1);
    let result = broker.publish("orders", event("orders", 1)).await;

    assert!(matches!(result, Err(BrokerError::Unavailable(_))));
}

#[tokio::test]
async fn test_disconnect_is_idempotent() {
    let hub = InMemoryPubSub::new();
    let (broker, _client) = broker(&hub);
    let (handler, _received) = RecordingHandler::new();
    broker.subscribe("orders", handler).await.unwrap();

    broker.disconnect().await.unwrap();
    broker.disconnect().await.unwrap();

    assert!(!broker.is_connected());
    assert_eq!(hub.subscriber_count("fanout_orders"), 0);
    assert!(matches!(
        broker.publish("orders", event("orders", 1)).await,
        Err(BrokerError::Unavailable(_))
    ));
}
