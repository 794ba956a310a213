//! Peer Bridge - group-scoped messaging between peers of one endpoint
//!
//! Architecture:
//! - A `BroadcastBus` hands out one channel per group key
//! - `LocalBus` connects peers inside one process, `HubBus` connects
//!   processes through a `BusHub` relay
//! - `BroadcastBridge` stamps frames with the sender's peer id and hides a
//!   peer's own frames from it

pub mod bridge;
pub mod bus;
pub mod error;
pub mod hub;
pub mod types;

pub use bridge::{BroadcastBridge, PeerReceiver};
pub use bus::{group_key, BroadcastBus, BusChannel, LocalBus};
pub use error::BridgeError;
pub use hub::{BusHub, HubBus, HubStats};
pub use types::*;
