//! Leadership handover
//!
//! A new leader collects every peer's subscriptions, opens a fresh real
//! connection, restores the union of those subscriptions and only then
//! announces readiness. A peer losing leadership drops its connection and
//! goes looking for the next leader.

use crate::error::TransportError;
use crate::readiness::ReadyOutcome;
use crate::real::{ConnectionState, RealTransport};
use crate::subscriptions::SubscriptionSnapshot;
use crate::transport::{Inner, LeaderTerm, Role};
use peer_bridge::{BridgeMessage, TransportEvent};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;

impl Inner {
    /// Open a real connection for this term and start relaying its events
    pub(crate) async fn connect_as_leader(
        self: &Arc<Self>,
    ) -> Result<Arc<dyn RealTransport>, TransportError> {
        self.core.lock().role = Role::Leader(LeaderTerm::opening());

        let real = self.factory.create(&self.config.endpoint);
        let events = real.on_event();
        let states = real.on_state_change();
        real.connect()
            .await
            .map_err(|e| TransportError::LeaderConnect(e.to_string()))?;

        let relay = tokio::spawn(self.clone().relay_real_events(events));
        let watch = tokio::spawn(self.clone().watch_real_state(states));
        let connection_id = real
            .connection_id()
            .unwrap_or_else(|| format!("leader:{}", self.peer_id));

        {
            let mut core = self.core.lock();
            if let Role::Leader(term) = &mut core.role {
                term.real = Some(real.clone());
                term.tasks = vec![relay, watch];
            }
            core.connection_id = Some(connection_id.clone());
        }
        self.set_state(ConnectionState::Connected);
        tracing::info!("Leader {} opened connection {}", self.peer_id, connection_id);

        Ok(real)
    }

    /// Restore subscriptions on a fresh connection. Failures are logged.
    pub(crate) async fn resubscribe(&self, real: &Arc<dyn RealTransport>, wanted: &SubscriptionSnapshot) {
        if wanted.is_empty() {
            return;
        }
        for session_id in &wanted.sessions {
            if let Err(e) = real.subscribe_to_session(session_id).await {
                tracing::warn!("Resubscribe to session {} failed: {}", session_id, e);
            }
        }
        for key in &wanted.channels {
            if let Err(e) = real.subscribe_to_channel(&key.session_id, &key.channel).await {
                tracing::warn!(
                    "Resubscribe to channel {}/{} failed: {}",
                    key.session_id,
                    key.channel,
                    e
                );
            }
        }
        tracing::debug!(
            "Restored {} sessions and {} channels",
            wanted.sessions.len(),
            wanted.channels.len()
        );
    }

    /// Serve requests and tell every peer the connection is usable
    pub(crate) fn announce_ready(&self, generation: u64) {
        let connection_id = {
            let mut core = self.core.lock();
            if let Role::Leader(term) = &mut core.role {
                term.ready = true;
            }
            core.connection_id.clone().unwrap_or_default()
        };
        self.readiness.resolve(generation, ReadyOutcome::Ready);
        self.bridge.broadcast(BridgeMessage::TransportReady {
            connection_id: connection_id.clone(),
        });
        tracing::info!("Leader {} ready on {}", self.peer_id, connection_id);
    }

    pub(crate) fn become_follower(&self) {
        {
            let mut core = self.core.lock();
            core.role = Role::Follower;
            core.connection_id = Some(self.follower_connection_id());
        }
        self.set_state(ConnectionState::Connected);
    }

    /// Probe for a ready leader; campaign if none answers in time
    ///
    /// Returns whether a ready leader answered.
    pub(crate) async fn wait_for_leader(&self) -> bool {
        let mut rx = self.bridge.subscribe();
        self.bridge.broadcast(BridgeMessage::PingLeader);

        let timeout = self.config.leader_probe_timeout();
        let deadline = Instant::now() + timeout;
        while let Ok(Some(frame)) = tokio::time::timeout_at(deadline, rx.recv()).await {
            if matches!(
                frame.message,
                BridgeMessage::PongLeader | BridgeMessage::TransportReady { .. }
            ) {
                tracing::debug!("Peer {} found ready leader {}", self.peer_id, frame.peer_id);
                return true;
            }
        }

        if self.is_terminated() {
            return false;
        }
        tracing::warn!(
            "No ready leader answered {} within {:?}; attempting re-election",
            self.peer_id,
            timeout
        );
        self.elector.campaign().await;
        false
    }

    /// Wait for the current leader in the background, then settle readiness
    pub(crate) fn spawn_leader_wait(self: &Arc<Self>, generation: u64) {
        let inner = self.clone();
        tokio::spawn(async move {
            inner.wait_for_leader().await;
            inner.readiness.resolve(generation, ReadyOutcome::Ready);
        });
    }

    pub(crate) async fn on_become_leader(self: &Arc<Self>) {
        let generation = {
            let mut core = self.core.lock();
            core.role = Role::Leader(LeaderTerm::opening());
            self.readiness.begin()
        };
        tracing::info!("Peer {} took over leadership; collecting subscriptions", self.peer_id);

        let replies = self
            .bridge
            .collect_responses(
                BridgeMessage::CollectingSubscriptions,
                self.config.collect_window(),
                |message| match message {
                    BridgeMessage::SubscriptionsAnnounce { sessions, channels } => {
                        Some((sessions.clone(), channels.clone()))
                    }
                    _ => None,
                },
            )
            .await;

        let mut wanted = self.subscriptions.snapshot();
        let peers = replies.len();
        for (_, (sessions, channels)) in replies {
            wanted.merge(sessions, channels);
        }
        tracing::debug!("Collected subscriptions from {} peers", peers);

        let real = match self.connect_as_leader().await {
            Ok(real) => real,
            Err(e) => {
                // Waiters stay pending until the next leader is ready
                tracing::error!("New leader {} failed to connect: {}", self.peer_id, e);
                self.set_state(ConnectionState::Error);
                self.elector.resign().await;
                return;
            }
        };

        self.resubscribe(&real, &wanted).await;
        self.announce_ready(generation);
    }

    /// Drop the real connection and return the new readiness generation
    pub(crate) async fn on_lose_leadership(&self) -> u64 {
        let (generation, term) = {
            let mut core = self.core.lock();
            let term = match std::mem::replace(&mut core.role, Role::Follower) {
                Role::Leader(term) => Some(term),
                _ => None,
            };
            core.connection_id = Some(self.follower_connection_id());
            (self.readiness.begin(), term)
        };
        tracing::info!("Peer {} lost leadership", self.peer_id);

        if let Some(term) = term {
            for task in term.tasks {
                task.abort();
            }
            if let Some(real) = term.real {
                real.disconnect().await;
            }
        }
        self.set_state(ConnectionState::Connected);
        generation
    }

    /// Bring the role in line with the elector
    pub(crate) async fn reconcile_role(self: &Arc<Self>) {
        let lost = {
            let _transition = self.transition.lock().await;
            let (started, terminated, leading) = {
                let core = self.core.lock();
                (
                    core.started,
                    core.terminated,
                    matches!(core.role, Role::Leader(_)),
                )
            };
            if !started || terminated {
                return;
            }

            match (self.elector.is_leader(), leading) {
                (true, false) => {
                    self.on_become_leader().await;
                    None
                }
                (false, true) => Some(self.on_lose_leadership().await),
                _ => None,
            }
        };

        if let Some(generation) = lost {
            self.spawn_leader_wait(generation);
        }
    }

    pub(crate) async fn watch_leadership(self: Arc<Self>, mut changes: broadcast::Receiver<bool>) {
        loop {
            match changes.recv().await {
                Ok(is_leader) => {
                    tracing::debug!("Peer {} leadership changed: {}", self.peer_id, is_leader);
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            }
            self.reconcile_role().await;
        }
    }

    /// Relay real events to followers and local subscribers
    async fn relay_real_events(self: Arc<Self>, mut events: broadcast::Receiver<TransportEvent>) {
        loop {
            match events.recv().await {
                Ok(event) => {
                    self.bridge.broadcast(BridgeMessage::Event {
                        event: event.clone(),
                    });
                    self.deliver_local(event);
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Leader {} dropped {} server events", self.peer_id, n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    /// Resign when the real connection fails at runtime
    async fn watch_real_state(self: Arc<Self>, mut states: watch::Receiver<ConnectionState>) {
        while states.changed().await.is_ok() {
            let state = *states.borrow();
            if state == ConnectionState::Error {
                tracing::warn!("Connection of leader {} failed; resigning", self.peer_id);
                self.set_state(ConnectionState::Error);
                // Detached: the handover aborts this task
                let elector = self.elector.clone();
                tokio::spawn(async move { elector.resign().await });
                break;
            }
        }
    }
}
