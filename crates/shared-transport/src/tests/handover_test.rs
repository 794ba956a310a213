use super::*;
use crate::config::FOLLOWER_CONNECTION_PREFIX;
use crate::ConnectionState;
use peer_bridge::ChannelKey;
use std::collections::BTreeSet;

fn sessions(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|s| s.to_string()).collect()
}

#[tokio::test(start_paused = true)]
async fn test_resign_hands_over_all_subscriptions() {
    let cluster = Cluster::with_locks();
    let peers = cluster.connected(&["peer-a", "peer-b"]).await;
    let (a, b) = (&peers[0], &peers[1]);

    a.subscribe_to_session("s1").await.unwrap();
    b.subscribe_to_session("s2").await.unwrap();
    b.subscribe_to_channel("s2", "presence").await.unwrap();

    a.resign().await;
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert!(b.is_leader());
    assert!(!a.is_leader());
    assert_eq!(cluster.factory.count(), 2);

    let real = cluster.latest();
    assert_eq!(real.subscribed_sessions(), sessions(&["s1", "s2"]));
    assert!(real
        .subscribed_channels()
        .contains(&ChannelKey::new("s2", "presence")));

    // Old connection is closed; roles and ids follow the new term
    assert!(cluster.factory.created()[0]
        .calls()
        .contains(&"disconnect".to_string()));
    assert_eq!(b.connection_id().as_deref(), Some("loopback-2"));
    assert!(a
        .connection_id()
        .unwrap()
        .starts_with(FOLLOWER_CONNECTION_PREFIX));
    assert_eq!(a.state(), ConnectionState::Connected);

    // The old leader now forwards
    a.subscribe_to_session("s3").await.unwrap();
    assert!(real.subscribed_sessions().contains("s3"));
}

#[tokio::test(start_paused = true)]
async fn test_requests_during_handover_wait_for_new_leader() {
    let cluster = Cluster::with_locks();
    let peers = cluster.connected(&["peer-a", "peer-b", "peer-c"]).await;
    let (a, b, c) = (&peers[0], &peers[1], &peers[2]);

    a.resign().await;
    // New leader is still collecting subscriptions
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(b.is_leader());

    c.subscribe_to_session("s9").await.unwrap();

    let real = cluster.latest();
    assert_eq!(real.id(), 2);
    assert!(real.subscribed_sessions().contains("s9"));
}

#[tokio::test(start_paused = true)]
async fn test_dropped_leader_is_replaced() {
    let cluster = Cluster::with_locks();
    let mut peers = cluster.connected(&["peer-a", "peer-b"]).await;
    peers[1].subscribe_to_session("s2").await.unwrap();

    // Leader's process goes away without a clean disconnect
    drop(peers.remove(0));
    tokio::time::sleep(Duration::from_secs(2)).await;

    let survivor = &peers[0];
    assert!(survivor.is_leader());
    assert_eq!(survivor.state(), ConnectionState::Connected);
    assert_eq!(cluster.latest().subscribed_sessions(), sessions(&["s2"]));
}

#[tokio::test(start_paused = true)]
async fn test_leader_connection_failure_triggers_reelection() {
    let cluster = Cluster::with_locks();
    let peers = cluster.connected(&["peer-a", "peer-b"]).await;
    peers[1].subscribe_to_session("s2").await.unwrap();

    cluster.latest().fail();
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert!(!peers[0].is_leader());
    assert!(peers[1].is_leader());
    assert_eq!(cluster.factory.count(), 2);
    assert_eq!(cluster.latest().subscribed_sessions(), sessions(&["s2"]));
    assert_eq!(peers[0].state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_follower_events_resume_after_handover() {
    let cluster = Cluster::with_locks();
    let peers = cluster.connected(&["peer-a", "peer-b", "peer-c"]).await;
    peers[2].subscribe_to_session("s1").await.unwrap();
    let mut events = peers[2].on_event();

    peers[0].resign().await;
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(peers[1].is_leader());

    let event = peer_bridge::TransportEvent::session("s1", "delta", serde_json::json!({}));
    cluster.latest().emit(event.clone());
    assert_eq!(events.recv().await.unwrap(), event);
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_fallback_hands_over_on_resign() {
    let cluster = Cluster::without_locks();
    let peers = cluster.connected(&["peer-a", "peer-b"]).await;
    let leader = peers.iter().position(|p| p.is_leader()).unwrap();
    let follower = 1 - leader;
    peers[follower].subscribe_to_session("s2").await.unwrap();

    peers[leader].resign().await;
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(leader_count(&peers), 1);
    assert!(peers[follower].is_leader());
    assert_eq!(cluster.factory.count(), 2);
    assert!(cluster.latest().subscribed_sessions().contains("s2"));
}
