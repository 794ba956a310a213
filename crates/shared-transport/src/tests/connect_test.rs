use super::*;
use crate::config::FOLLOWER_CONNECTION_PREFIX;
use crate::{ConnectionState, RealTransport, TransportError};
use futures::future::join_all;
use peer_bridge::{BridgeMessage, BroadcastBridge, PeerId};
use rand::seq::SliceRandom;

#[tokio::test(start_paused = true)]
async fn test_concurrent_connects_share_one_attempt() {
    let cluster = Cluster::with_locks();
    let peer = cluster.peer("peer-a").await;

    let (r1, r2, r3) = tokio::join!(peer.connect(), peer.connect(), peer.connect());
    assert!(r1.is_ok() && r2.is_ok() && r3.is_ok());

    assert_eq!(cluster.factory.count(), 1);
    assert!(peer.is_leader());
    assert_eq!(peer.state(), ConnectionState::Connected);
    assert_eq!(peer.connection_id().as_deref(), Some("loopback-1"));

    // Connected again: no new connection
    peer.connect().await.unwrap();
    assert_eq!(cluster.factory.count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_two_peers_elect_one_leader() {
    let cluster = Cluster::with_locks();
    let a = cluster.peer("peer-a").await;
    let b = cluster.peer("peer-b").await;

    let (ra, rb) = tokio::join!(a.connect(), b.connect());
    ra.unwrap();
    rb.unwrap();

    let peers = [a, b];
    assert_eq!(leader_count(&peers), 1);
    let follower = peers.iter().find(|p| !p.is_leader()).unwrap();
    assert!(follower
        .connection_id()
        .unwrap()
        .starts_with(FOLLOWER_CONNECTION_PREFIX));
    assert_eq!(follower.state(), ConnectionState::Connected);
    assert_eq!(cluster.factory.count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_many_peers_elect_one_leader() {
    for n in 2..=10 {
        let cluster = Cluster::with_locks();
        let mut peers = Vec::new();
        for i in 0..n {
            peers.push(cluster.peer(&format!("peer-{}", i)).await);
        }
        peers.shuffle(&mut rand::thread_rng());

        let results = join_all(peers.iter().map(|p| p.connect())).await;
        assert!(results.iter().all(|r| r.is_ok()));

        assert_eq!(leader_count(&peers), 1, "{} peers", n);
        assert_eq!(cluster.factory.count(), 1);
    }
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_fallback_elects_one_leader() {
    let cluster = Cluster::without_locks();
    let mut peers = Vec::new();
    for name in ["peer-a", "peer-b", "peer-c"] {
        peers.push(cluster.peer(name).await);
    }

    let results = join_all(peers.iter().map(|p| p.connect())).await;
    assert!(results.iter().all(|r| r.is_ok()));

    assert_eq!(leader_count(&peers), 1);
    assert_eq!(cluster.factory.count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_operations_before_connect_fail() {
    let cluster = Cluster::with_locks();
    let peer = cluster.peer("peer-a").await;

    assert!(matches!(
        peer.subscribe_to_session("s1").await,
        Err(TransportError::NotConnected)
    ));
    assert_eq!(peer.state(), ConnectionState::Disconnected);
    assert!(peer.connection_id().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_is_terminal_and_releases_leadership() {
    let cluster = Cluster::with_locks();
    let a = cluster.peer("peer-a").await;
    a.connect().await.unwrap();
    a.subscribe_to_session("s1").await.unwrap();
    assert!(cluster.locks.as_ref().unwrap().is_held(&cluster.leader_lock()));

    a.disconnect().await;

    assert_eq!(a.state(), ConnectionState::Disconnected);
    assert!(a.connection_id().is_none());
    assert!(!a.is_leader());
    assert!(!cluster.locks.as_ref().unwrap().is_held(&cluster.leader_lock()));
    assert!(cluster.latest().calls().contains(&"disconnect".to_string()));

    assert!(matches!(a.connect().await, Err(TransportError::Disconnected)));
    assert!(matches!(
        a.subscribe_to_session("s2").await,
        Err(TransportError::Disconnected)
    ));

    // A new peer takes the vacant slot right away
    let c = cluster.peer("peer-c").await;
    c.connect().await.unwrap();
    assert!(c.is_leader());
    assert_eq!(cluster.factory.count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_follower_probe_times_out_without_leader() {
    let cluster = Cluster::with_locks();
    let locks = cluster.locks.clone().unwrap();
    let _ghost = locks
        .try_acquire(&cluster.leader_lock(), &PeerId::from("ghost"))
        .unwrap();

    let b = cluster.peer("peer-b").await;
    let started = tokio::time::Instant::now();
    b.connect().await.unwrap();

    assert!(started.elapsed() >= Duration::from_secs(2));
    assert!(!b.is_leader());
    assert_eq!(cluster.factory.count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_probe_campaigns_for_leadership() {
    let cluster = Cluster::without_locks();

    // A leader that answers one claim, then goes quiet without resigning
    let ghost = BroadcastBridge::open(cluster.bus.as_ref(), ENDPOINT, PeerId::from("ghost"))
        .await
        .unwrap();
    let mut ghost_rx = ghost.subscribe();
    let ghost_task = tokio::spawn(async move {
        while let Some(frame) = ghost_rx.recv().await {
            if matches!(frame.message, BridgeMessage::LeaderClaim { .. }) {
                ghost.broadcast(BridgeMessage::LeaderHeartbeat { claimed_at: 0 });
                break;
            }
        }
    });

    let b = cluster.peer("peer-b").await;
    let started = tokio::time::Instant::now();
    b.connect().await.unwrap();
    ghost_task.await.unwrap();
    assert!(started.elapsed() >= Duration::from_secs(2));

    // Took over at the probe deadline, before heartbeat silence would have
    tokio::time::sleep_until(started + Duration::from_millis(2600)).await;
    assert!(b.is_leader());
    assert_eq!(b.state(), ConnectionState::Connected);
    assert_eq!(cluster.factory.count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_follower_takes_over_after_leader_disconnects() {
    let cluster = Cluster::with_locks();
    let peers = cluster.connected(&["peer-a", "peer-b"]).await;
    let (a, b) = (&peers[0], &peers[1]);
    b.subscribe_to_session("s2").await.unwrap();
    assert!(!b.is_leader());

    a.disconnect().await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert!(b.is_leader());
    assert_eq!(b.state(), ConnectionState::Connected);
    assert_eq!(b.connection_id().as_deref(), Some("loopback-2"));
    assert!(cluster.latest().subscribed_sessions().contains("s2"));

    // Already connected: the promoted follower keeps its term
    b.connect().await.unwrap();
    assert_eq!(cluster.factory.count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_failed_leader_connect_recovers() {
    let cluster = Cluster::with_locks();
    cluster.factory.fail_next_connects(1);
    let a = cluster.peer("peer-a").await;

    let err = a.connect().await.unwrap_err();
    assert!(matches!(err, TransportError::LeaderConnect(_)));
    assert!(!a.is_leader());

    // Rejoins after the resign delay and opens a fresh connection
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(a.is_leader());
    assert_eq!(a.state(), ConnectionState::Connected);
    assert_eq!(cluster.factory.count(), 2);

    a.subscribe_to_session("s1").await.unwrap();
    assert!(cluster.latest().subscribed_sessions().contains("s1"));
}

#[tokio::test(start_paused = true)]
async fn test_usable_as_real_transport() {
    let cluster = Cluster::with_locks();
    let leader = cluster.peer("peer-a").await;
    leader.connect().await.unwrap();

    let shared: Arc<dyn RealTransport> = Arc::new(cluster.peer("peer-b").await);
    shared.connect().await.unwrap();
    shared.subscribe_to_session("s1").await.unwrap();

    assert!(shared
        .connection_id()
        .unwrap()
        .starts_with(FOLLOWER_CONNECTION_PREFIX));
    assert!(cluster.latest().subscribed_sessions().contains("s1"));
}
