//! Broadcast bus primitive
//!
//! A bus hands out one channel per group key. Every frame posted on a channel
//! reaches every subscriber of that group, including the poster; the bridge
//! drops its own frames.

use crate::error::BridgeError;
use crate::types::BridgeFrame;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Capacity of the per-group fan-out buffer
pub const GROUP_CHANNEL_CAPACITY: usize = 1024;

/// Derive the group key peers of one endpoint share
pub fn group_key(endpoint: &str) -> String {
    let sanitized: String = endpoint
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("shared-transport:{}", sanitized)
}

/// An open membership in one broadcast group
pub trait BusChannel: Send + Sync {
    /// Fire-and-forget fan-out to the group
    fn post(&self, frame: BridgeFrame) -> Result<(), BridgeError>;

    /// Receive every frame posted to the group from now on
    fn subscribe(&self) -> broadcast::Receiver<BridgeFrame>;

    /// Leave the group
    fn close(&self) {}
}

/// Source of group channels
#[async_trait]
pub trait BroadcastBus: Send + Sync {
    async fn open(&self, group: &str) -> Result<Arc<dyn BusChannel>, BridgeError>;
}

/// In-process bus: a keyed registry of broadcast channels
///
/// Each `LocalBus` is an independent universe; peers only see each other when
/// they share the same instance.
#[derive(Clone, Default)]
pub struct LocalBus {
    groups: Arc<DashMap<String, broadcast::Sender<BridgeFrame>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of groups opened so far
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    fn sender(&self, group: &str) -> broadcast::Sender<BridgeFrame> {
        self.groups
            .entry(group.to_string())
            .or_insert_with(|| broadcast::channel(GROUP_CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl BroadcastBus for LocalBus {
    async fn open(&self, group: &str) -> Result<Arc<dyn BusChannel>, BridgeError> {
        tracing::debug!("Opening local bus group {}", group);
        Ok(Arc::new(LocalChannel {
            tx: self.sender(group),
        }))
    }
}

struct LocalChannel {
    tx: broadcast::Sender<BridgeFrame>,
}

impl BusChannel for LocalChannel {
    fn post(&self, frame: BridgeFrame) -> Result<(), BridgeError> {
        // No receivers just means nobody is listening yet
        let _ = self.tx.send(frame);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<BridgeFrame> {
        self.tx.subscribe()
    }
}
