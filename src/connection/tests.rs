use super::*;

fn make_connection(id: &str) -> (Connection, mpsc::Receiver<Arc<str>>) {
    let (sink, rx) = MpscSink::bounded(2);
    (Connection::new(id, Arc::new(sink)), rx)
}

#[test]
fn test_with_user_marks_authenticated() {
    let (conn, _rx) = make_connection("c1");
    assert!(!conn.is_authenticated());
    assert!(conn.user_id().is_none());

    let conn = conn.with_user("u1").with_metadata("agent", "test");
    assert!(conn.is_authenticated());
    assert_eq!(conn.user_id(), Some("u1"));
    assert_eq!(conn.metadata().get("agent"), Some(&"test".to_string()));
}

#[tokio::test]
async fn test_channel_membership() {
    let (conn, _rx) = make_connection("c1");

    assert!(conn.add_channel("orders").await);
    assert!(!conn.add_channel("orders").await);
    assert!(conn.is_subscribed("orders").await);
    assert_eq!(conn.subscribed_channels().await, vec!["orders".to_string()]);

    assert!(conn.remove_channel("orders").await);
    assert!(!conn.is_subscribed("orders").await);
}

#[tokio::test]
async fn test_touch_advances_activity() {
    let (conn, _rx) = make_connection("c1");
    let before = conn.last_activity_at().await;
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    conn.touch().await;
    assert!(conn.last_activity_at().await > before);
    assert!(conn.connected_at() <= before);
}

#[tokio::test]
async fn test_deliver_reaches_receiver() {
    let (conn, mut rx) = make_connection("c1");
    conn.deliver(Arc::from("hello")).unwrap();
    assert_eq!(rx.recv().await.as_deref(), Some("hello"));
}

#[test]
fn test_full_sink_reports_full() {
    let (conn, _rx) = make_connection("c1");
    conn.deliver(Arc::from("1")).unwrap();
    conn.deliver(Arc::from("2")).unwrap();
    assert_eq!(conn.deliver(Arc::from("3")), Err(SinkError::Full));
}

#[test]
fn test_closed_sink_reports_closed() {
    let (conn, rx) = make_connection("c1");
    drop(rx);
    assert_eq!(conn.deliver(Arc::from("1")), Err(SinkError::Closed));
}
