//! Peer Election - one leader per endpoint group
//!
//! Architecture:
//! - `LockElector` uses an exclusive lock: the holder leads, everybody else
//!   queues for the lock in the background
//! - `HeartbeatElector` races claims over the broadcast bridge and keeps the
//!   winner alive with heartbeats, for runtimes without a lock primitive
//! - `ElectorBuilder` picks the lock when a `LockRegistry` is available

pub mod config;
pub mod elector;
pub mod heartbeat;
pub mod lock;
pub mod lock_elector;

pub use config::ElectionConfig;
pub use elector::{ElectorBuilder, LeaderElector, LeadershipState};
pub use heartbeat::HeartbeatElector;
pub use lock::{lock_key, LockGuard, LockRegistry};
pub use lock_elector::LockElector;
