//! Election configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Claim collection window of the fallback race
pub const CLAIM_WINDOW_MS: u64 = 150;

/// How often a fallback leader re-asserts itself
pub const HEARTBEAT_INTERVAL_MS: u64 = 1_000;

/// Silence after which followers start a fresh race
pub const HEARTBEAT_TIMEOUT_MS: u64 = 3_000;

/// Pause before a resigned peer queues for leadership again
pub const REJOIN_DELAY_MS: u64 = 1_000;

/// Election timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ElectionConfig {
    /// How long a racing peer collects competing claims
    pub claim_window_ms: u64,
    /// Leader heartbeat period (fallback election)
    pub heartbeat_interval_ms: u64,
    /// Missing-heartbeat threshold (fallback election)
    pub heartbeat_timeout_ms: u64,
    /// Delay before a resigned peer becomes a candidate again
    pub rejoin_delay_ms: u64,
}

impl ElectionConfig {
    pub fn claim_window(&self) -> Duration {
        Duration::from_millis(self.claim_window_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn rejoin_delay(&self) -> Duration {
        Duration::from_millis(self.rejoin_delay_ms)
    }
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            claim_window_ms: CLAIM_WINDOW_MS,
            heartbeat_interval_ms: HEARTBEAT_INTERVAL_MS,
            heartbeat_timeout_ms: HEARTBEAT_TIMEOUT_MS,
            rejoin_delay_ms: REJOIN_DELAY_MS,
        }
    }
}
