//! Shared Transport - one server connection per endpoint, shared by peers
//!
//! This crate lets many peers of one endpoint behave as if each owned a
//! connection while only the elected leader holds a real one:
//! - `SharedTransport` is the per-peer operation surface
//! - The leader runs operations on its `RealTransport` and relays server
//!   events to followers over the peer bridge
//! - Followers forward operations to the leader and correlate the replies
//! - On leader change the new leader collects every peer's subscriptions,
//!   reconnects, resubscribes and announces readiness

pub mod config;
mod dispatch;
pub mod error;
mod handover;
pub mod loopback;
mod pending;
mod readiness;
pub mod real;
pub mod stream;
pub mod subscriptions;
pub mod transport;

#[cfg(test)]
mod tests;

pub use config::SharedTransportConfig;
pub use error::TransportError;
pub use loopback::{LoopbackFactory, LoopbackTransport};
pub use real::{ConnectionState, EventStream, RealTransport, TransportFactory};
pub use stream::{SendCanceller, SendStream};
pub use subscriptions::{SubscriptionSets, SubscriptionSnapshot};
pub use transport::{SharedTransport, SharedTransportBuilder};
