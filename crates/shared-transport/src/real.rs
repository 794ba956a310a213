//! The real network client contract
//!
//! Only the leader talks to a `RealTransport`. `SharedTransport` implements
//! the same trait, so callers can swap one for the other.

use crate::error::TransportError;
use async_trait::async_trait;
use futures::stream::BoxStream;
use peer_bridge::TransportEvent;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Events produced by one `send`
pub type EventStream = BoxStream<'static, Result<TransportEvent, TransportError>>;

#[async_trait]
pub trait RealTransport: Send + Sync {
    async fn connect(&self) -> Result<(), TransportError>;

    async fn disconnect(&self);

    /// Run `input` in a session and stream the resulting events
    async fn send(&self, input: Value, session_id: &str) -> Result<EventStream, TransportError>;

    async fn subscribe_to_session(&self, session_id: &str) -> Result<(), TransportError>;

    async fn unsubscribe_from_session(&self, session_id: &str) -> Result<(), TransportError>;

    async fn abort_session(&self, session_id: &str) -> Result<(), TransportError>;

    async fn close_session(&self, session_id: &str) -> Result<(), TransportError>;

    async fn submit_tool_result(
        &self,
        session_id: &str,
        tool_call_id: &str,
        result: Value,
    ) -> Result<(), TransportError>;

    async fn subscribe_to_channel(&self, session_id: &str, channel: &str)
        -> Result<(), TransportError>;

    async fn publish_to_channel(
        &self,
        session_id: &str,
        channel: &str,
        payload: Value,
    ) -> Result<(), TransportError>;

    /// Server events for subscribed sessions and channels
    fn on_event(&self) -> broadcast::Receiver<TransportEvent>;

    fn on_state_change(&self) -> watch::Receiver<ConnectionState>;

    fn state(&self) -> ConnectionState;

    fn connection_id(&self) -> Option<String>;
}

/// Opens a fresh real connection for each leadership term
pub trait TransportFactory: Send + Sync {
    fn create(&self, endpoint: &str) -> Arc<dyn RealTransport>;
}

impl<F> TransportFactory for F
where
    F: Fn(&str) -> Arc<dyn RealTransport> + Send + Sync,
{
    fn create(&self, endpoint: &str) -> Arc<dyn RealTransport> {
        self(endpoint)
    }
}
