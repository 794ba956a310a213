//! Bridge message dispatch
//!
//! Followers route replies and relayed events to their waiting callers; the
//! leader runs forwarded requests against its real connection.

use crate::error::TransportError;
use crate::pending::StreamItem;
use crate::real::RealTransport;
use crate::transport::{Inner, Role};
use futures::StreamExt;
use peer_bridge::{BridgeFrame, BridgeMessage, PeerId, PeerReceiver, RequestId, SessionId};
use serde_json::Value;
use std::sync::Arc;

const NOT_READY: &str = "Leader transport is not ready";

impl Inner {
    pub(crate) async fn run_dispatcher(self: Arc<Self>, mut frames: PeerReceiver) {
        while let Some(frame) = frames.recv().await {
            self.dispatch(frame);
        }
        tracing::debug!("Dispatcher of peer {} stopped", self.peer_id);
    }

    fn dispatch(self: &Arc<Self>, frame: BridgeFrame) {
        let BridgeFrame { peer_id, message } = frame;
        match message {
            BridgeMessage::CollectingSubscriptions => self.answer_collection(&peer_id),
            BridgeMessage::PingLeader => {
                if self.is_leader_ready() {
                    self.bridge.broadcast(BridgeMessage::PongLeader);
                }
            }
            BridgeMessage::TransportReady { connection_id } => {
                tracing::debug!("Leader {} ready on {}", peer_id, connection_id);
            }
            BridgeMessage::Event { event } => self.deliver_local(event),
            BridgeMessage::StreamEvent { request_id, event } => {
                self.route_stream_item(&request_id, StreamItem::Event(event));
            }
            BridgeMessage::StreamEnd { request_id } => {
                self.route_stream_item(&request_id, StreamItem::End);
            }
            BridgeMessage::StreamError { request_id, error } => {
                self.route_stream_item(&request_id, StreamItem::Failed(TransportError::Remote(error)));
            }
            BridgeMessage::Response { request_id, error } => {
                let result = match error {
                    Some(message) => Err(TransportError::Remote(message)),
                    None => Ok(()),
                };
                if !self.pending.resolve_request(&request_id, result) {
                    tracing::trace!("Dropping stale response {}", request_id);
                }
            }
            request @ (BridgeMessage::SendRequest { .. }
            | BridgeMessage::SubscribeRequest { .. }
            | BridgeMessage::UnsubscribeRequest { .. }
            | BridgeMessage::AbortRequest { .. }
            | BridgeMessage::CloseRequest { .. }
            | BridgeMessage::SubmitToolResultRequest { .. }
            | BridgeMessage::ChannelSubscribeRequest { .. }
            | BridgeMessage::ChannelPublishRequest { .. }) => {
                self.handle_follower_request(peer_id, request);
            }
            // Consumed by handover collection, probes and the elector
            BridgeMessage::SubscriptionsAnnounce { .. }
            | BridgeMessage::PongLeader
            | BridgeMessage::LeaderClaim { .. }
            | BridgeMessage::LeaderHeartbeat { .. }
            | BridgeMessage::LeaderResign => {}
        }
    }

    fn route_stream_item(&self, request_id: &str, item: StreamItem) {
        if !self.pending.push_stream(request_id, item) {
            tracing::trace!("Dropping stale stream item for {}", request_id);
        }
    }

    /// Answer a new leader with this peer's subscriptions
    ///
    /// A follower also treats the solicitation as a handover: operations wait
    /// for the new leader, and sends that went to the old one fail.
    fn answer_collection(self: &Arc<Self>, from: &PeerId) {
        let snapshot = self.subscriptions.snapshot();
        self.bridge.broadcast(BridgeMessage::SubscriptionsAnnounce {
            sessions: snapshot.sessions.into_iter().collect(),
            channels: snapshot.channels.into_iter().collect(),
        });

        let generation = {
            let core = self.core.lock();
            if core.terminated || !matches!(core.role, Role::Follower) {
                return;
            }
            self.readiness.begin()
        };

        let failed = self.pending.fail_dispatched_streams();
        tracing::debug!(
            "Peer {} waiting for new leader {} ({} in-flight sends failed)",
            self.peer_id,
            from,
            failed
        );
        self.spawn_leader_wait(generation);
    }

    /// Run a forwarded request if this peer is the leader
    fn handle_follower_request(self: &Arc<Self>, from: PeerId, request: BridgeMessage) {
        let real = {
            let core = self.core.lock();
            match &core.role {
                Role::Leader(term) => term.real.clone().filter(|_| term.ready),
                _ => return,
            }
        };

        let Some(real) = real else {
            self.reject_not_ready(request);
            return;
        };

        tracing::debug!("Leader {} running {} for {}", self.peer_id, request.kind(), from);
        let inner = self.clone();
        tokio::spawn(async move { inner.execute_forwarded(real, request).await });
    }

    fn reject_not_ready(&self, request: BridgeMessage) {
        let Some(request_id) = request.request_id().cloned() else {
            return;
        };
        tracing::debug!("Rejecting {} while handover is in progress", request_id);
        let reply = match request {
            BridgeMessage::SendRequest { .. } => BridgeMessage::StreamError {
                request_id,
                error: NOT_READY.to_string(),
            },
            _ => BridgeMessage::Response {
                request_id,
                error: Some(NOT_READY.to_string()),
            },
        };
        self.bridge.broadcast(reply);
    }

    async fn execute_forwarded(&self, real: Arc<dyn RealTransport>, request: BridgeMessage) {
        let (request_id, result) = match request {
            BridgeMessage::SendRequest {
                request_id,
                session_id,
                input,
            } => {
                self.relay_send(real, request_id, session_id, input).await;
                return;
            }
            BridgeMessage::SubscribeRequest {
                request_id,
                session_id,
            } => (request_id, real.subscribe_to_session(&session_id).await),
            BridgeMessage::UnsubscribeRequest {
                request_id,
                session_id,
            } => (request_id, real.unsubscribe_from_session(&session_id).await),
            BridgeMessage::AbortRequest {
                request_id,
                session_id,
            } => (request_id, real.abort_session(&session_id).await),
            BridgeMessage::CloseRequest {
                request_id,
                session_id,
            } => (request_id, real.close_session(&session_id).await),
            BridgeMessage::SubmitToolResultRequest {
                request_id,
                session_id,
                tool_call_id,
                result,
            } => (
                request_id,
                real.submit_tool_result(&session_id, &tool_call_id, result).await,
            ),
            BridgeMessage::ChannelSubscribeRequest {
                request_id,
                session_id,
                channel,
            } => (request_id, real.subscribe_to_channel(&session_id, &channel).await),
            BridgeMessage::ChannelPublishRequest {
                request_id,
                session_id,
                channel,
                payload,
            } => (
                request_id,
                real.publish_to_channel(&session_id, &channel, payload).await,
            ),
            other => {
                tracing::debug!("Ignoring non-request {}", other.kind());
                return;
            }
        };

        if let Err(e) = &result {
            tracing::warn!("Forwarded request {} failed: {}", request_id, e);
        }
        self.bridge.broadcast(BridgeMessage::Response {
            request_id,
            error: result.err().map(|e| e.to_string()),
        });
    }

    /// Relay every event of a forwarded send, then its end or error
    async fn relay_send(
        &self,
        real: Arc<dyn RealTransport>,
        request_id: RequestId,
        session_id: SessionId,
        input: Value,
    ) {
        let mut events = match real.send(input, &session_id).await {
            Ok(events) => events,
            Err(e) => {
                self.bridge.broadcast(BridgeMessage::StreamError {
                    request_id,
                    error: e.to_string(),
                });
                return;
            }
        };

        while let Some(item) = events.next().await {
            match item {
                Ok(event) => self.bridge.broadcast(BridgeMessage::StreamEvent {
                    request_id: request_id.clone(),
                    event,
                }),
                Err(e) => {
                    self.bridge.broadcast(BridgeMessage::StreamError {
                        request_id,
                        error: e.to_string(),
                    });
                    return;
                }
            }
        }
        self.bridge.broadcast(BridgeMessage::StreamEnd { request_id });
    }
}
