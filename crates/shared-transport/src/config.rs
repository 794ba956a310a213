//! Shared transport configuration

use peer_election::ElectionConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How long a follower waits for a ready leader before campaigning
pub const LEADER_PROBE_TIMEOUT_MS: u64 = 2_000;

/// How long a forwarded request waits for its response
pub const REQUEST_TIMEOUT_MS: u64 = 30_000;

/// Fixed window a new leader collects peer subscriptions in
pub const COLLECT_WINDOW_MS: u64 = 300;

/// Marks connection ids of peers that do not own the real connection
pub const FOLLOWER_CONNECTION_PREFIX: &str = "follower:";

/// Shared transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SharedTransportConfig {
    /// Server endpoint; peers with the same endpoint share one connection
    pub endpoint: String,
    /// Leader discovery window
    pub leader_probe_timeout_ms: u64,
    /// Forwarded request correlation window
    pub request_timeout_ms: u64,
    /// Subscription collection window during handover
    pub collect_window_ms: u64,
    /// Election timing
    pub election: ElectionConfig,
}

impl SharedTransportConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

    pub fn leader_probe_timeout(&self) -> Duration {
        Duration::from_millis(self.leader_probe_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn collect_window(&self) -> Duration {
        Duration::from_millis(self.collect_window_ms)
    }
}

impl Default for SharedTransportConfig {
    fn default() -> Self {
        Self {
            endpoint: "ws://127.0.0.1:8900".to_string(),
            leader_probe_timeout_ms: LEADER_PROBE_TIMEOUT_MS,
            request_timeout_ms: REQUEST_TIMEOUT_MS,
            collect_window_ms: COLLECT_WINDOW_MS,
            election: ElectionConfig::default(),
        }
    }
}
