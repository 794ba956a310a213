//! SharedTransport: the per-peer operation surface
//!
//! Exactly one peer of an endpoint group (the leader) owns a `RealTransport`.
//! Every other peer forwards its operations to the leader over the bridge
//! and receives results and relayed server events back. Callers see the same
//! contract either way.

use crate::config::{SharedTransportConfig, FOLLOWER_CONNECTION_PREFIX};
use crate::error::TransportError;
use crate::pending::{PendingTables, StreamItem};
use crate::readiness::{ReadyOutcome, Readiness};
use crate::real::{ConnectionState, EventStream, RealTransport, TransportFactory};
use crate::stream::{CancelTarget, SendCanceller, SendStream};
use crate::subscriptions::{SubscriptionSets, SubscriptionSnapshot};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use peer_bridge::{
    BridgeMessage, BroadcastBridge, BroadcastBus, PeerId, RequestId, SessionId, TransportEvent,
};
use peer_election::{ElectorBuilder, LeaderElector, LeadershipState, LockRegistry};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

/// Capacity of the local event feed
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// One leadership term
pub(crate) struct LeaderTerm {
    /// Real connection, set once it opened
    pub(crate) real: Option<Arc<dyn RealTransport>>,
    /// Handover finished; requests are served
    pub(crate) ready: bool,
    /// Event relay and state watch of `real`
    pub(crate) tasks: Vec<JoinHandle<()>>,
}

impl LeaderTerm {
    pub(crate) fn opening() -> Self {
        Self {
            real: None,
            ready: false,
            tasks: Vec::new(),
        }
    }
}

pub(crate) enum Role {
    /// Not connected yet, or disconnected for good
    Detached,
    Follower,
    Leader(LeaderTerm),
}

pub(crate) struct Core {
    pub(crate) role: Role,
    pub(crate) connection_id: Option<String>,
    pub(crate) started: bool,
    pub(crate) terminated: bool,
}

/// Where an operation runs
pub(crate) enum Route {
    Direct(Arc<dyn RealTransport>),
    Forward,
}

pub(crate) struct Inner {
    pub(crate) config: SharedTransportConfig,
    pub(crate) peer_id: PeerId,
    pub(crate) bridge: Arc<BroadcastBridge>,
    pub(crate) elector: Arc<dyn LeaderElector>,
    pub(crate) factory: Arc<dyn TransportFactory>,
    pub(crate) core: Mutex<Core>,
    pub(crate) subscriptions: SubscriptionSets,
    pub(crate) pending: PendingTables,
    pub(crate) readiness: Readiness,
    pub(crate) state_tx: watch::Sender<ConnectionState>,
    pub(crate) events_tx: broadcast::Sender<TransportEvent>,
    /// Serializes role transitions
    pub(crate) transition: tokio::sync::Mutex<()>,
    /// Bridge dispatcher and leadership watcher
    pub(crate) tasks: Mutex<Vec<JoinHandle<()>>>,
    next_request: AtomicU64,
}

impl Inner {
    pub(crate) fn next_request_id(&self) -> RequestId {
        let n = self.next_request.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", self.peer_id, n)
    }

    pub(crate) fn follower_connection_id(&self) -> String {
        format!("{}{}", FOLLOWER_CONNECTION_PREFIX, self.peer_id)
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            tracing::debug!("Peer {} transport state -> {:?}", self.peer_id, state);
        }
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.core.lock().terminated
    }

    /// Real connection if this peer is a leader that finished its handover
    pub(crate) fn ready_real(&self) -> Option<Arc<dyn RealTransport>> {
        match &self.core.lock().role {
            Role::Leader(term) if term.ready => term.real.clone(),
            _ => None,
        }
    }

    pub(crate) fn is_leader_ready(&self) -> bool {
        self.ready_real().is_some()
    }

    /// Hand a relayed or real event to local subscribers if it is wanted here
    pub(crate) fn deliver_local(&self, event: TransportEvent) {
        if self.subscriptions.accepts(&event) {
            let _ = self.events_tx.send(event);
        }
    }

    /// Wait for readiness, then pick where the operation runs
    pub(crate) async fn route(&self) -> Result<Route, TransportError> {
        loop {
            self.readiness.wait().await?;

            let decided = {
                let core = self.core.lock();
                if core.terminated {
                    Some(Err(TransportError::Disconnected))
                } else {
                    match &core.role {
                        Role::Leader(term) if term.ready => {
                            term.real.clone().map(|real| Ok(Route::Direct(real)))
                        }
                        // Handover in progress; readiness turns pending shortly
                        Role::Leader(_) => None,
                        Role::Follower => Some(Ok(Route::Forward)),
                        Role::Detached => Some(Err(TransportError::NotConnected)),
                    }
                }
            };
            if let Some(route) = decided {
                return route;
            }
            tokio::task::yield_now().await;
        }
    }

    /// Send a request to the leader and wait for its response
    pub(crate) async fn forward_request<F>(&self, build: F) -> Result<(), TransportError>
    where
        F: FnOnce(RequestId) -> BridgeMessage + Send,
    {
        let request_id = self.next_request_id();
        let rx = self.pending.register_request(&request_id);
        let message = build(request_id.clone());
        tracing::debug!("Forwarding {} as {}", message.kind(), request_id);
        self.bridge.broadcast(message);

        let timeout = self.config.request_timeout();
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::Disconnected),
            Err(_) => {
                self.pending.drop_request(&request_id);
                tracing::warn!("Forwarded request {} timed out", request_id);
                Err(TransportError::ForwardedRequestTimeout {
                    request_id,
                    timeout,
                })
            }
        }
    }

    pub(crate) fn open_send(self: &Arc<Self>, input: Value, session_id: SessionId) -> SendStream {
        let request_id = self.next_request_id();
        let (canceller, abort_rx) = SendCanceller::new(CancelTarget {
            transport: Arc::downgrade(self),
            request_id: request_id.clone(),
            session_id: session_id.clone(),
        });

        // Ready leader: straight to the real connection
        if let Some(real) = self.ready_real() {
            let dispatch = canceller.clone();
            let events = stream::once(async move {
                dispatch.mark_dispatched();
                match real.send(input, &session_id).await {
                    Ok(events) => events,
                    Err(e) => error_stream(e),
                }
            })
            .flatten()
            .boxed();
            return SendStream::new(events, abort_rx, canceller);
        }

        let relayed = self.pending.register_stream(&request_id);
        let inner = self.clone();
        let dispatch = canceller.clone();
        let events = stream::once(async move {
            match inner.route().await {
                Err(e) => {
                    inner.pending.remove_stream(&request_id);
                    error_stream(e)
                }
                Ok(Route::Direct(real)) => {
                    inner.pending.remove_stream(&request_id);
                    dispatch.mark_dispatched();
                    match real.send(input, &session_id).await {
                        Ok(events) => events,
                        Err(e) => error_stream(e),
                    }
                }
                Ok(Route::Forward) => {
                    inner.pending.mark_dispatched(&request_id);
                    dispatch.mark_dispatched();
                    tracing::debug!("Forwarding send for {} as {}", session_id, request_id);
                    inner.bridge.broadcast(BridgeMessage::SendRequest {
                        request_id,
                        session_id,
                        input,
                    });
                    relay_stream(relayed)
                }
            }
        })
        .flatten()
        .boxed();

        SendStream::new(events, abort_rx, canceller)
    }

    /// Best-effort cancellation of an aborted `send`
    pub(crate) fn cancel_send(self: &Arc<Self>, request_id: &str, session_id: &str, dispatched: bool) {
        self.pending.remove_stream(request_id);
        if !dispatched {
            return;
        }

        tracing::debug!("Aborting send {} on session {}", request_id, session_id);
        match self.ready_real() {
            Some(real) => {
                let session_id = session_id.to_string();
                tokio::spawn(async move {
                    if let Err(e) = real.abort_session(&session_id).await {
                        tracing::warn!("Abort of session {} failed: {}", session_id, e);
                    }
                });
            }
            None => self.bridge.broadcast(BridgeMessage::AbortRequest {
                request_id: self.next_request_id(),
                session_id: session_id.to_string(),
            }),
        }
    }

    /// Start the bridge dispatcher and the leadership watcher
    fn start_background(self: &Arc<Self>) {
        let frames = self.bridge.subscribe();
        let changes = self.elector.on_leadership_change();

        let dispatcher = tokio::spawn(self.clone().run_dispatcher(frames));
        let watcher = tokio::spawn(self.clone().watch_leadership(changes));
        self.tasks.lock().extend([dispatcher, watcher]);
    }

    fn abort_tasks(&self) {
        let term_tasks = match &mut self.core.lock().role {
            Role::Leader(term) => std::mem::take(&mut term.tasks),
            _ => Vec::new(),
        };
        for task in self.tasks.lock().drain(..).chain(term_tasks) {
            task.abort();
        }
    }
}

fn error_stream(error: TransportError) -> EventStream {
    stream::once(async move { Err(error) }).boxed()
}

/// Turn relayed stream items into events, ending on the terminal item
fn relay_stream(rx: mpsc::UnboundedReceiver<StreamItem>) -> EventStream {
    stream::unfold(Some(rx), |state| async move {
        let mut rx = state?;
        match rx.recv().await {
            Some(StreamItem::Event(event)) => Some((Ok(event), Some(rx))),
            Some(StreamItem::Failed(e)) => Some((Err(e), None)),
            Some(StreamItem::End) | None => None,
        }
    })
    .boxed()
}

/// Builder for `SharedTransport`
pub struct SharedTransportBuilder {
    config: SharedTransportConfig,
    peer_id: Option<PeerId>,
    bus: Option<Arc<dyn BroadcastBus>>,
    locks: Option<LockRegistry>,
    factory: Option<Arc<dyn TransportFactory>>,
}

impl SharedTransportBuilder {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            config: SharedTransportConfig::new(endpoint),
            peer_id: None,
            bus: None,
            locks: None,
            factory: None,
        }
    }

    /// Replace timing settings, keeping the endpoint
    pub fn config(mut self, config: SharedTransportConfig) -> Self {
        let endpoint = std::mem::take(&mut self.config.endpoint);
        self.config = SharedTransportConfig { endpoint, ..config };
        self
    }

    pub fn peer_id(mut self, peer_id: impl Into<PeerId>) -> Self {
        self.peer_id = Some(peer_id.into());
        self
    }

    pub fn bus(mut self, bus: Arc<dyn BroadcastBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Lock primitive for election; without one peers fall back to heartbeats
    pub fn locks(mut self, locks: Option<LockRegistry>) -> Self {
        self.locks = locks;
        self
    }

    pub fn factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Join the endpoint group. Nothing is elected until `connect`.
    pub async fn build(self) -> Result<SharedTransport, TransportError> {
        let bus = self
            .bus
            .ok_or_else(|| TransportError::Config("no broadcast bus".to_string()))?;
        let factory = self
            .factory
            .ok_or_else(|| TransportError::Config("no transport factory".to_string()))?;
        let peer_id = self.peer_id.unwrap_or_else(PeerId::generate);

        let bridge =
            Arc::new(BroadcastBridge::open(bus.as_ref(), &self.config.endpoint, peer_id.clone()).await?);
        let elector = ElectorBuilder::new(bridge.clone())
            .locks(self.locks)
            .config(self.config.election.clone())
            .build();

        tracing::info!(
            "Peer {} joined shared transport group {}",
            peer_id,
            bridge.group()
        );

        Ok(SharedTransport {
            inner: Arc::new(Inner {
                config: self.config,
                peer_id,
                bridge,
                elector,
                factory,
                core: Mutex::new(Core {
                    role: Role::Detached,
                    connection_id: None,
                    started: false,
                    terminated: false,
                }),
                subscriptions: SubscriptionSets::new(),
                pending: PendingTables::default(),
                readiness: Readiness::new(),
                state_tx: watch::channel(ConnectionState::Disconnected).0,
                events_tx: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
                transition: tokio::sync::Mutex::new(()),
                tasks: Mutex::new(Vec::new()),
                next_request: AtomicU64::new(1),
            }),
        })
    }
}

/// Per-peer handle on the endpoint's shared connection
pub struct SharedTransport {
    inner: Arc<Inner>,
}

impl SharedTransport {
    pub fn builder(endpoint: impl Into<String>) -> SharedTransportBuilder {
        SharedTransportBuilder::new(endpoint)
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.inner.peer_id
    }

    pub fn endpoint(&self) -> &str {
        &self.inner.config.endpoint
    }

    pub fn is_leader(&self) -> bool {
        self.inner.elector.is_leader()
    }

    pub fn leadership(&self) -> LeadershipState {
        self.inner.elector.state()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn connection_id(&self) -> Option<String> {
        self.inner.core.lock().connection_id.clone()
    }

    /// Relayed server events for this peer's sessions and channels
    pub fn on_event(&self) -> broadcast::Receiver<TransportEvent> {
        self.inner.events_tx.subscribe()
    }

    pub fn on_state_change(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Sessions and channels requested through this peer
    pub fn subscriptions(&self) -> SubscriptionSnapshot {
        self.inner.subscriptions.snapshot()
    }

    /// Elect, then open the real connection or find the leader
    ///
    /// Concurrent and repeated calls share one attempt and its outcome.
    pub async fn connect(&self) -> Result<(), TransportError> {
        let inner = &self.inner;
        let first = {
            let mut core = inner.core.lock();
            if core.terminated {
                return Err(TransportError::Disconnected);
            }
            if core.started {
                None
            } else {
                core.started = true;
                Some(inner.readiness.begin())
            }
        };
        let Some(generation) = first else {
            return inner.readiness.wait().await;
        };

        inner.set_state(ConnectionState::Connecting);
        inner.start_background();

        let follower = {
            let _transition = inner.transition.lock().await;
            inner.elector.await_leadership().await;

            if inner.elector.is_leader() {
                tracing::info!("Peer {} elected leader of {}", inner.peer_id, inner.bridge.group());
                match inner.connect_as_leader().await {
                    Ok(real) => {
                        let own = inner.subscriptions.snapshot();
                        inner.resubscribe(&real, &own).await;
                        inner.announce_ready(generation);
                        false
                    }
                    Err(e) => {
                        tracing::error!("Leader {} failed to connect: {}", inner.peer_id, e);
                        inner.set_state(ConnectionState::Error);
                        inner
                            .readiness
                            .resolve(generation, ReadyOutcome::Failed(e.to_string()));
                        inner.elector.resign().await;
                        return Err(e);
                    }
                }
            } else {
                inner.become_follower();
                true
            }
        };

        if follower {
            inner.wait_for_leader().await;
            inner.readiness.resolve(generation, ReadyOutcome::Ready);
        }
        inner.readiness.wait().await
    }

    /// Leave for good: close the real connection, release leadership and
    /// reject everything outstanding
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        let _transition = inner.transition.lock().await;

        let term = {
            let mut core = inner.core.lock();
            if core.terminated {
                return;
            }
            core.terminated = true;
            core.connection_id = None;
            match std::mem::replace(&mut core.role, Role::Detached) {
                Role::Leader(term) => Some(term),
                _ => None,
            }
        };

        if let Some(term) = term {
            for task in term.tasks {
                task.abort();
            }
            if let Some(real) = term.real {
                real.disconnect().await;
            }
        }

        inner.elector.shutdown().await;
        inner.bridge.close();
        inner.abort_tasks();

        let outstanding = inner.pending.len();
        inner.pending.fail_all();
        inner.readiness.force(ReadyOutcome::Disconnected);
        inner.set_state(ConnectionState::Disconnected);

        tracing::info!(
            "Peer {} disconnected ({} pending operations rejected)",
            inner.peer_id,
            outstanding
        );
    }

    /// Give up leadership; another peer takes over the connection
    pub async fn resign(&self) {
        self.inner.elector.resign().await;
    }

    /// Run `input` in a session; the stream starts on first poll
    pub fn send(&self, input: Value, session_id: &str) -> SendStream {
        self.inner.open_send(input, session_id.to_string())
    }

    pub async fn subscribe_to_session(&self, session_id: &str) -> Result<(), TransportError> {
        self.inner.subscriptions.add_session(session_id);
        match self.inner.route().await? {
            Route::Direct(real) => real.subscribe_to_session(session_id).await,
            Route::Forward => {
                self.inner
                    .forward_request(|request_id| BridgeMessage::SubscribeRequest {
                        request_id,
                        session_id: session_id.to_string(),
                    })
                    .await
            }
        }
    }

    pub async fn unsubscribe_from_session(&self, session_id: &str) -> Result<(), TransportError> {
        self.inner.subscriptions.remove_session(session_id);
        match self.inner.route().await? {
            Route::Direct(real) => real.unsubscribe_from_session(session_id).await,
            Route::Forward => {
                self.inner
                    .forward_request(|request_id| BridgeMessage::UnsubscribeRequest {
                        request_id,
                        session_id: session_id.to_string(),
                    })
                    .await
            }
        }
    }

    pub async fn abort_session(&self, session_id: &str) -> Result<(), TransportError> {
        match self.inner.route().await? {
            Route::Direct(real) => real.abort_session(session_id).await,
            Route::Forward => {
                self.inner
                    .forward_request(|request_id| BridgeMessage::AbortRequest {
                        request_id,
                        session_id: session_id.to_string(),
                    })
                    .await
            }
        }
    }

    pub async fn close_session(&self, session_id: &str) -> Result<(), TransportError> {
        self.inner.subscriptions.close_session(session_id);
        match self.inner.route().await? {
            Route::Direct(real) => real.close_session(session_id).await,
            Route::Forward => {
                self.inner
                    .forward_request(|request_id| BridgeMessage::CloseRequest {
                        request_id,
                        session_id: session_id.to_string(),
                    })
                    .await
            }
        }
    }

    pub async fn submit_tool_result(
        &self,
        session_id: &str,
        tool_call_id: &str,
        result: Value,
    ) -> Result<(), TransportError> {
        match self.inner.route().await? {
            Route::Direct(real) => real.submit_tool_result(session_id, tool_call_id, result).await,
            Route::Forward => {
                self.inner
                    .forward_request(|request_id| BridgeMessage::SubmitToolResultRequest {
                        request_id,
                        session_id: session_id.to_string(),
                        tool_call_id: tool_call_id.to_string(),
                        result,
                    })
                    .await
            }
        }
    }

    pub async fn subscribe_to_channel(
        &self,
        session_id: &str,
        channel: &str,
    ) -> Result<(), TransportError> {
        self.inner.subscriptions.add_channel(session_id, channel);
        match self.inner.route().await? {
            Route::Direct(real) => real.subscribe_to_channel(session_id, channel).await,
            Route::Forward => {
                self.inner
                    .forward_request(|request_id| BridgeMessage::ChannelSubscribeRequest {
                        request_id,
                        session_id: session_id.to_string(),
                        channel: channel.to_string(),
                    })
                    .await
            }
        }
    }

    pub async fn publish_to_channel(
        &self,
        session_id: &str,
        channel: &str,
        payload: Value,
    ) -> Result<(), TransportError> {
        match self.inner.route().await? {
            Route::Direct(real) => real.publish_to_channel(session_id, channel, payload).await,
            Route::Forward => {
                self.inner
                    .forward_request(|request_id| BridgeMessage::ChannelPublishRequest {
                        request_id,
                        session_id: session_id.to_string(),
                        channel: channel.to_string(),
                        payload,
                    })
                    .await
            }
        }
    }
}

impl Drop for SharedTransport {
    fn drop(&mut self) {
        self.inner.abort_tasks();
        self.inner.bridge.close();
    }
}

#[async_trait]
impl RealTransport for SharedTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        SharedTransport::connect(self).await
    }

    async fn disconnect(&self) {
        SharedTransport::disconnect(self).await
    }

    async fn send(&self, input: Value, session_id: &str) -> Result<EventStream, TransportError> {
        Ok(SharedTransport::send(self, input, session_id).boxed())
    }

    async fn subscribe_to_session(&self, session_id: &str) -> Result<(), TransportError> {
        SharedTransport::subscribe_to_session(self, session_id).await
    }

    async fn unsubscribe_from_session(&self, session_id: &str) -> Result<(), TransportError> {
        SharedTransport::unsubscribe_from_session(self, session_id).await
    }

    async fn abort_session(&self, session_id: &str) -> Result<(), TransportError> {
        SharedTransport::abort_session(self, session_id).await
    }

    async fn close_session(&self, session_id: &str) -> Result<(), TransportError> {
        SharedTransport::close_session(self, session_id).await
    }

    async fn submit_tool_result(
        &self,
        session_id: &str,
        tool_call_id: &str,
        result: Value,
    ) -> Result<(), TransportError> {
        SharedTransport::submit_tool_result(self, session_id, tool_call_id, result).await
    }

    async fn subscribe_to_channel(
        &self,
        session_id: &str,
        channel: &str,
    ) -> Result<(), TransportError> {
        SharedTransport::subscribe_to_channel(self, session_id, channel).await
    }

    async fn publish_to_channel(
        &self,
        session_id: &str,
        channel: &str,
        payload: Value,
    ) -> Result<(), TransportError> {
        SharedTransport::publish_to_channel(self, session_id, channel, payload).await
    }

    fn on_event(&self) -> broadcast::Receiver<TransportEvent> {
        SharedTransport::on_event(self)
    }

    fn on_state_change(&self) -> watch::Receiver<ConnectionState> {
        SharedTransport::on_state_change(self)
    }

    fn state(&self) -> ConnectionState {
        SharedTransport::state(self)
    }

    fn connection_id(&self) -> Option<String> {
        SharedTransport::connection_id(self)
    }
}
