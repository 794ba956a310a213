//! Multi-peer scenarios on an in-process bus with loopback connections

mod connect_test;
mod forwarding_test;
mod handover_test;

use crate::{LoopbackFactory, LoopbackTransport, SharedTransport};
use peer_bridge::{group_key, LocalBus};
use peer_election::{lock_key, LockRegistry};
use std::sync::Arc;
use std::time::Duration;

pub(crate) const ENDPOINT: &str = "wss://agents.example.com/v1";

/// Peers of one endpoint sharing a bus, a lock registry and a factory
pub(crate) struct Cluster {
    pub bus: Arc<LocalBus>,
    pub locks: Option<LockRegistry>,
    pub factory: Arc<LoopbackFactory>,
}

impl Cluster {
    pub fn with_locks() -> Self {
        Self {
            bus: Arc::new(LocalBus::new()),
            locks: Some(LockRegistry::new()),
            factory: Arc::new(LoopbackFactory::new()),
        }
    }

    pub fn without_locks() -> Self {
        Self {
            locks: None,
            ..Self::with_locks()
        }
    }

    pub async fn peer(&self, name: &str) -> SharedTransport {
        SharedTransport::builder(ENDPOINT)
            .peer_id(name)
            .bus(self.bus.clone())
            .locks(self.locks.clone())
            .factory(self.factory.clone())
            .build()
            .await
            .unwrap()
    }

    /// Peers connected one after another; the first one leads
    pub async fn connected(&self, names: &[&str]) -> Vec<SharedTransport> {
        let mut peers = Vec::new();
        for name in names {
            let peer = self.peer(name).await;
            peer.connect().await.unwrap();
            peers.push(peer);
        }
        peers
    }

    pub fn leader_lock(&self) -> String {
        lock_key(&group_key(ENDPOINT))
    }

    /// Real connection of the current leadership term
    pub fn latest(&self) -> Arc<LoopbackTransport> {
        self.factory.latest().unwrap()
    }
}

pub(crate) fn leader_count(peers: &[SharedTransport]) -> usize {
    peers.iter().filter(|p| p.is_leader()).count()
}

/// Let bridge traffic drain
pub(crate) async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}
