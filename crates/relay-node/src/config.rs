//! Node configuration

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use shared_transport::SharedTransportConfig;
use std::path::Path;

/// Relay node configuration, read from a JSON file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Address the bus hub listens on
    pub hub_addr: String,
    /// Sessions a peer subscribes to on start
    pub sessions: Vec<String>,
    /// Seconds between demo sends of a peer (0 = never)
    pub send_interval_secs: u64,
    /// Shared transport settings, including the endpoint
    pub transport: SharedTransportConfig,
}

impl NodeConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config = serde_json::from_str(&raw)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }

    /// WebSocket URL peers use to reach the hub
    pub fn hub_url(&self) -> String {
        format!("ws://{}", self.hub_addr)
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            hub_addr: "127.0.0.1:9100".to_string(),
            sessions: vec!["main".to_string()],
            send_interval_secs: 0,
            transport: SharedTransportConfig::default(),
        }
    }
}
