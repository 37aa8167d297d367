use super::*;
use crate::connection::MpscSink;

fn make_connection(id: &str) -> Arc<Connection> {
    let (sink, _rx) = MpscSink::bounded(8);
    Arc::new(Connection::new(id, Arc::new(sink)))
}

#[test]
fn test_visibility_from_name() {
    assert_eq!(Visibility::from_name("orders"), Visibility::Public);
    assert_eq!(Visibility::from_name("private-user.7"), Visibility::Private);
    assert_eq!(Visibility::from_name("presence-room.1"), Visibility::Presence);
    assert!(!Visibility::Public.requires_auth());
    assert!(Visibility::Presence.requires_auth());
}

#[test]
fn test_add_remove_subscribers() {
    let mut channel = Channel::new("orders");
    let conn = make_connection("c1");

    assert!(channel.add(&conn));
    assert!(!channel.add(&conn));
    assert!(channel.contains("c1"));
    assert_eq!(channel.subscriber_count(), 1);

    assert!(channel.remove("c1"));
    assert!(!channel.remove("c1"));
    assert!(channel.is_empty());
}

#[test]
fn test_channel_does_not_own_connections() {
    let mut channel = Channel::new("orders");
    let conn = make_connection("c1");
    channel.add(&conn);

    drop(conn);

    assert!(channel.live_subscribers().is_empty());
    assert_eq!(channel.prune(), 1);
    assert!(channel.is_empty());
}

#[test]
fn test_presence_members_distinct_users() {
    let mut channel = Channel::new("presence-room.1");
    let (sink_a, _ra) = MpscSink::bounded(1);
    let (sink_b, _rb) = MpscSink::bounded(1);
    let (sink_c, _rc) = MpscSink::bounded(1);
    let a = Arc::new(Connection::new("a", Arc::new(sink_a)).with_user("alice"));
    let b = Arc::new(Connection::new("b", Arc::new(sink_b)).with_user("alice"));
    let c = Arc::new(Connection::new("c", Arc::new(sink_c)).with_user("bob"));
    channel.add(&a);
    channel.add(&b);
    channel.add(&c);

    assert_eq!(channel.members(), vec!["alice".to_string(), "bob".to_string()]);
}

#[test]
fn test_visibility_authorizer() {
    let anonymous = make_connection("anon");
    let (sink, _rx) = MpscSink::bounded(1);
    let user = Connection::new("u", Arc::new(sink)).with_user("u1");
    let authorizer = VisibilityAuthorizer;

    assert!(authorizer.authorize(&anonymous, "orders", Visibility::Public));
    assert!(!authorizer.authorize(&anonymous, "private-x", Visibility::Private));
    assert!(authorizer.authorize(&user, "private-x", Visibility::Private));
    assert!(authorizer.authorize(&user, "presence-x", Visibility::Presence));
}
