//! In-process `RealTransport` for tests and demos
//!
//! Records every call, echoes `send` input back as a short event sequence
//! and lets callers inject server events or connection failures.

use crate::error::TransportError;
use crate::real::{ConnectionState, EventStream, RealTransport, TransportFactory};
use async_trait::async_trait;
use dashmap::DashSet;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use peer_bridge::{ChannelKey, SessionId, TransportEvent};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

/// Events a loopback `send` yields for `input`
///
/// `start`, one `delta` per entry of `input["chunks"]` (or the whole input),
/// then `end`.
pub fn echo_events(session_id: &str, input: &Value) -> Vec<TransportEvent> {
    let chunks = match input.get("chunks").and_then(Value::as_array) {
        Some(chunks) => chunks.clone(),
        None => vec![input.clone()],
    };

    let mut events = vec![TransportEvent::session(session_id, "start", json!({}))];
    events.extend(
        chunks
            .into_iter()
            .map(|chunk| TransportEvent::session(session_id, "delta", json!({ "text": chunk }))),
    );
    events.push(TransportEvent::session(session_id, "end", json!({})));
    events
}

pub struct LoopbackTransport {
    id: u64,
    fail_connect: bool,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: broadcast::Sender<TransportEvent>,
    sessions: DashSet<SessionId>,
    channels: DashSet<ChannelKey>,
    calls: Mutex<Vec<String>>,
}

impl LoopbackTransport {
    pub fn new(id: u64) -> Self {
        Self::with_connect_failure(id, false)
    }

    pub fn with_connect_failure(id: u64, fail_connect: bool) -> Self {
        Self {
            id,
            fail_connect,
            state_tx: watch::channel(ConnectionState::Disconnected).0,
            events_tx: broadcast::channel(256).0,
            sessions: DashSet::new(),
            channels: DashSet::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn subscribed_sessions(&self) -> BTreeSet<SessionId> {
        self.sessions.iter().map(|s| s.key().clone()).collect()
    }

    pub fn subscribed_channels(&self) -> BTreeSet<ChannelKey> {
        self.channels.iter().map(|c| c.key().clone()).collect()
    }

    /// Calls received so far, as `op:session`
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Inject a server event
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events_tx.send(event);
    }

    /// Simulate the connection failing at runtime
    pub fn fail(&self) {
        self.state_tx.send_replace(ConnectionState::Error);
    }

    fn record(&self, op: &str, session_id: &str) {
        self.calls.lock().push(format!("{}:{}", op, session_id));
    }

    fn ensure_connected(&self) -> Result<(), TransportError> {
        match *self.state_tx.borrow() {
            ConnectionState::Connected => Ok(()),
            _ => Err(TransportError::NotConnected),
        }
    }
}

#[async_trait]
impl RealTransport for LoopbackTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        if self.fail_connect {
            self.state_tx.send_replace(ConnectionState::Error);
            return Err(TransportError::Connection("loopback refused connection".to_string()));
        }
        self.state_tx.send_replace(ConnectionState::Connected);
        Ok(())
    }

    async fn disconnect(&self) {
        self.calls.lock().push("disconnect".to_string());
        self.state_tx.send_replace(ConnectionState::Disconnected);
    }

    async fn send(&self, input: Value, session_id: &str) -> Result<EventStream, TransportError> {
        self.ensure_connected()?;
        self.record("send", session_id);
        let events = echo_events(session_id, &input);
        Ok(stream::iter(events.into_iter().map(Ok)).boxed())
    }

    async fn subscribe_to_session(&self, session_id: &str) -> Result<(), TransportError> {
        self.ensure_connected()?;
        self.record("subscribe", session_id);
        self.sessions.insert(session_id.to_string());
        Ok(())
    }

    async fn unsubscribe_from_session(&self, session_id: &str) -> Result<(), TransportError> {
        self.ensure_connected()?;
        self.record("unsubscribe", session_id);
        self.sessions.remove(session_id);
        Ok(())
    }

    async fn abort_session(&self, session_id: &str) -> Result<(), TransportError> {
        self.ensure_connected()?;
        self.record("abort", session_id);
        Ok(())
    }

    async fn close_session(&self, session_id: &str) -> Result<(), TransportError> {
        self.ensure_connected()?;
        self.record("close", session_id);
        self.sessions.remove(session_id);
        self.channels.retain(|key| key.session_id != session_id);
        Ok(())
    }

    async fn submit_tool_result(
        &self,
        session_id: &str,
        tool_call_id: &str,
        result: Value,
    ) -> Result<(), TransportError> {
        self.ensure_connected()?;
        self.record("submit_tool_result", session_id);
        if !self.sessions.contains(session_id) {
            return Err(TransportError::Connection(format!("unknown session {}", session_id)));
        }
        self.emit(TransportEvent::session(
            session_id,
            "tool_result",
            json!({ "toolCallId": tool_call_id, "result": result }),
        ));
        Ok(())
    }

    async fn subscribe_to_channel(
        &self,
        session_id: &str,
        channel: &str,
    ) -> Result<(), TransportError> {
        self.ensure_connected()?;
        self.record("channel_subscribe", session_id);
        self.channels.insert(ChannelKey::new(session_id, channel));
        Ok(())
    }

    /// Echoes the payload to channel subscribers, as the server would
    async fn publish_to_channel(
        &self,
        session_id: &str,
        channel: &str,
        payload: Value,
    ) -> Result<(), TransportError> {
        self.ensure_connected()?;
        self.record("channel_publish", session_id);
        let key = ChannelKey::new(session_id, channel);
        if self.channels.contains(&key) {
            self.emit(TransportEvent::channel(key, "message", payload));
        }
        Ok(())
    }

    fn on_event(&self) -> broadcast::Receiver<TransportEvent> {
        self.events_tx.subscribe()
    }

    fn on_state_change(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn connection_id(&self) -> Option<String> {
        match self.state() {
            ConnectionState::Connected => Some(format!("loopback-{}", self.id)),
            _ => None,
        }
    }
}

/// Hands out loopback connections and keeps them for inspection
#[derive(Default)]
pub struct LoopbackFactory {
    created: Mutex<Vec<Arc<LoopbackTransport>>>,
    next_id: AtomicU64,
    failing_connects: AtomicUsize,
}

impl LoopbackFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` connections refuse to connect
    pub fn fail_next_connects(&self, count: usize) {
        self.failing_connects.store(count, Ordering::SeqCst);
    }

    pub fn created(&self) -> Vec<Arc<LoopbackTransport>> {
        self.created.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.created.lock().len()
    }

    pub fn latest(&self) -> Option<Arc<LoopbackTransport>> {
        self.created.lock().last().cloned()
    }
}

impl TransportFactory for LoopbackFactory {
    fn create(&self, endpoint: &str) -> Arc<dyn RealTransport> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let fail = self
            .failing_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();

        tracing::debug!("Opening loopback connection {} to {}", id, endpoint);
        let transport = Arc::new(LoopbackTransport::with_connect_failure(id, fail));
        self.created.lock().push(transport.clone());
        transport
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_echo_events_split_chunks() {
        let events = echo_events("s1", &json!({ "chunks": ["a", "b"] }));
        let kinds: Vec<&str> = events.iter().map(|e| e.kind.as_str()).collect();
        assert_eq!(kinds, vec!["start", "delta", "delta", "end"]);
        assert_eq!(events[2].payload, json!({ "text": "b" }));
    }

    #[tokio::test]
    async fn test_factory_fails_requested_connects_only() {
        let factory = LoopbackFactory::new();
        factory.fail_next_connects(1);

        let first = factory.create("ws://a");
        let second = factory.create("ws://a");

        assert!(first.connect().await.is_err());
        assert_eq!(first.state(), ConnectionState::Error);
        assert!(second.connect().await.is_ok());
        assert_eq!(second.connection_id().as_deref(), Some("loopback-2"));
        assert_eq!(factory.count(), 2);
    }

    #[tokio::test]
    async fn test_requires_connection() {
        let transport = LoopbackTransport::new(1);
        assert!(matches!(
            transport.subscribe_to_session("s1").await,
            Err(TransportError::NotConnected)
        ));
    }
}
