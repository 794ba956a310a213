use super::*;
use crate::loopback::echo_events;
use crate::TransportError;
use futures::StreamExt;
use peer_bridge::{ChannelKey, PeerId, TransportEvent};
use serde_json::json;
use tokio::sync::broadcast::error::TryRecvError;

#[tokio::test(start_paused = true)]
async fn test_follower_send_matches_direct_send() {
    let cluster = Cluster::with_locks();
    let peers = cluster.connected(&["peer-a", "peer-b"]).await;
    let (leader, follower) = (&peers[0], &peers[1]);
    assert!(leader.is_leader());

    let input = json!({ "chunks": ["hel", "lo"] });
    let forwarded: Vec<TransportEvent> = follower
        .send(input.clone(), "s1")
        .map(|item| item.unwrap())
        .collect()
        .await;
    let direct: Vec<TransportEvent> = leader
        .send(input.clone(), "s1")
        .map(|item| item.unwrap())
        .collect()
        .await;

    assert_eq!(forwarded, echo_events("s1", &input));
    assert_eq!(forwarded, direct);
    assert_eq!(
        cluster.latest().calls(),
        vec!["send:s1".to_string(), "send:s1".to_string()]
    );
}

#[tokio::test(start_paused = true)]
async fn test_send_before_connect_fails() {
    let cluster = Cluster::with_locks();
    let peer = cluster.peer("peer-a").await;

    let items: Vec<_> = peer.send(json!("hi"), "s1").collect().await;
    assert_eq!(items.len(), 1);
    assert!(matches!(items[0], Err(TransportError::NotConnected)));
}

#[tokio::test(start_paused = true)]
async fn test_forwarded_subscriptions_reach_leader_connection() {
    let cluster = Cluster::with_locks();
    let peers = cluster.connected(&["peer-a", "peer-b"]).await;

    peers[1].subscribe_to_session("s2").await.unwrap();
    peers[1].subscribe_to_channel("s2", "presence").await.unwrap();

    let real = cluster.latest();
    assert!(real.subscribed_sessions().contains("s2"));
    assert!(real
        .subscribed_channels()
        .contains(&ChannelKey::new("s2", "presence")));

    peers[1].unsubscribe_from_session("s2").await.unwrap();
    assert!(!real.subscribed_sessions().contains("s2"));
    assert!(!peers[1].subscriptions().sessions.contains("s2"));
}

#[tokio::test(start_paused = true)]
async fn test_events_are_filtered_per_peer() {
    let cluster = Cluster::with_locks();
    let peers = cluster.connected(&["peer-a", "peer-b"]).await;
    let (leader, follower) = (&peers[0], &peers[1]);

    leader.subscribe_to_session("s1").await.unwrap();
    follower.subscribe_to_session("s2").await.unwrap();

    let mut leader_events = leader.on_event();
    let mut follower_events = follower.on_event();

    let real = cluster.latest();
    let for_s1 = TransportEvent::session("s1", "delta", json!({ "text": "a" }));
    let for_s2 = TransportEvent::session("s2", "delta", json!({ "text": "b" }));
    real.emit(for_s2.clone());
    real.emit(for_s1.clone());
    real.emit(TransportEvent::session("s3", "delta", json!({})));

    assert_eq!(follower_events.recv().await.unwrap(), for_s2);
    assert_eq!(leader_events.recv().await.unwrap(), for_s1);

    settle().await;
    assert!(matches!(follower_events.try_recv(), Err(TryRecvError::Empty)));
    assert!(matches!(leader_events.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test(start_paused = true)]
async fn test_channel_publish_reaches_channel_subscribers() {
    let cluster = Cluster::with_locks();
    let peers = cluster.connected(&["peer-a", "peer-b", "peer-c"]).await;

    peers[1].subscribe_to_channel("s1", "chat").await.unwrap();
    let mut subscriber = peers[1].on_event();
    let mut bystander = peers[2].on_event();

    peers[2]
        .publish_to_channel("s1", "chat", json!({ "msg": "hi" }))
        .await
        .unwrap();

    let event = subscriber.recv().await.unwrap();
    assert_eq!(event.channel.as_deref(), Some("chat"));
    assert_eq!(event.payload, json!({ "msg": "hi" }));

    settle().await;
    assert!(matches!(bystander.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test(start_paused = true)]
async fn test_remote_errors_come_back_as_messages() {
    let cluster = Cluster::with_locks();
    let peers = cluster.connected(&["peer-a", "peer-b"]).await;

    let direct = peers[0]
        .submit_tool_result("unknown", "call-1", json!(1))
        .await
        .unwrap_err();
    assert!(matches!(direct, TransportError::Connection(_)));

    let forwarded = peers[1]
        .submit_tool_result("unknown", "call-1", json!(1))
        .await
        .unwrap_err();
    match forwarded {
        TransportError::Remote(message) => assert_eq!(message, direct.to_string()),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_forwarded_request_times_out() {
    let cluster = Cluster::with_locks();
    let locks = cluster.locks.clone().unwrap();
    // Leader slot taken by a peer that never answers
    let _ghost = locks
        .try_acquire(&cluster.leader_lock(), &PeerId::from("ghost"))
        .unwrap();

    let follower = cluster.peer("peer-b").await;
    follower.connect().await.unwrap();

    let started = tokio::time::Instant::now();
    let err = follower.subscribe_to_session("s1").await.unwrap_err();

    assert!(matches!(
        err,
        TransportError::ForwardedRequestTimeout { timeout, .. } if timeout == Duration::from_secs(30)
    ));
    assert!(started.elapsed() >= Duration::from_secs(30));
}

#[tokio::test(start_paused = true)]
async fn test_abort_before_dispatch() {
    let cluster = Cluster::with_locks();
    let peers = cluster.connected(&["peer-a", "peer-b"]).await;

    let stream = peers[1].send(json!("hi"), "s1");
    stream.abort();

    let items: Vec<_> = stream.collect().await;
    assert_eq!(items.len(), 1);
    assert!(matches!(items[0], Err(TransportError::Aborted)));

    settle().await;
    assert!(cluster.latest().calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_abort_in_flight_send_cancels_on_leader() {
    let cluster = Cluster::with_locks();
    let peers = cluster.connected(&["peer-a", "peer-b"]).await;

    let mut stream = peers[1].send(json!({ "chunks": ["a", "b", "c"] }), "s1");
    let first = stream.next().await.unwrap().unwrap();
    assert_eq!(first.kind, "start");

    let canceller = stream.canceller();
    canceller.abort();
    assert!(matches!(stream.next().await, Some(Err(TransportError::Aborted))));
    assert!(stream.next().await.is_none());

    // Aborting again is a no-op
    canceller.abort();

    settle().await;
    let calls = cluster.latest().calls();
    assert_eq!(calls, vec!["send:s1".to_string(), "abort:s1".to_string()]);
}
