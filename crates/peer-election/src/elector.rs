//! Leader elector contract and backend selection

use crate::config::ElectionConfig;
use crate::heartbeat::HeartbeatElector;
use crate::lock::{lock_key, LockRegistry};
use crate::lock_elector::LockElector;
use async_trait::async_trait;
use peer_bridge::{BroadcastBridge, PeerId};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Capacity of the leadership change feed
pub(crate) const CHANGE_CHANNEL_CAPACITY: usize = 16;

/// Snapshot of one peer's role
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeadershipState {
    pub is_leader: bool,
    pub peer_id: PeerId,
}

/// Decides which peer of a group owns leadership
///
/// Change notifications cover transitions after `await_leadership` settled
/// the initial role; the initial outcome is read through `is_leader`.
#[async_trait]
pub trait LeaderElector: Send + Sync {
    fn peer_id(&self) -> &PeerId;

    fn is_leader(&self) -> bool;

    fn state(&self) -> LeadershipState {
        LeadershipState {
            is_leader: self.is_leader(),
            peer_id: self.peer_id().clone(),
        }
    }

    /// Settle this peer's role. Returns immediately once settled.
    async fn await_leadership(&self);

    /// Feed of role transitions (`true` = became leader)
    fn on_leadership_change(&self) -> broadcast::Receiver<bool>;

    /// Give up leadership; the remaining peers elect a successor
    async fn resign(&self);

    /// Try to become leader right now instead of waiting
    async fn campaign(&self);

    /// Resign for good and stop all background work
    async fn shutdown(&self);
}

/// Builder for a group's elector
///
/// Uses the exclusive lock when a registry is available and falls back to the
/// broadcast heartbeat race otherwise.
pub struct ElectorBuilder {
    peer_id: PeerId,
    bridge: Arc<BroadcastBridge>,
    locks: Option<LockRegistry>,
    config: ElectionConfig,
}

impl ElectorBuilder {
    pub fn new(bridge: Arc<BroadcastBridge>) -> Self {
        Self {
            peer_id: bridge.peer_id().clone(),
            bridge,
            locks: None,
            config: ElectionConfig::default(),
        }
    }

    pub fn locks(mut self, locks: Option<LockRegistry>) -> Self {
        self.locks = locks;
        self
    }

    pub fn config(mut self, config: ElectionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Arc<dyn LeaderElector> {
        match self.locks {
            Some(registry) => Arc::new(LockElector::new(
                self.peer_id,
                lock_key(self.bridge.group()),
                registry,
                self.config,
            )),
            None => {
                tracing::info!(
                    "No lock primitive for {}; using heartbeat election",
                    self.bridge.group()
                );
                Arc::new(HeartbeatElector::new(self.bridge, self.config))
            }
        }
    }
}
