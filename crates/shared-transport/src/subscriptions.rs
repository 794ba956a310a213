//! Subscription bookkeeping
//!
//! Every peer records the sessions and channels its own callers asked for,
//! whether the request ran locally or was forwarded. A new leader rebuilds
//! the union of all peers' sets on its fresh connection, and each peer uses
//! its own set to filter relayed events.

use dashmap::DashSet;
use peer_bridge::{ChannelKey, SessionId, TransportEvent};
use std::collections::BTreeSet;

/// Point-in-time copy of a subscription set
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionSnapshot {
    pub sessions: BTreeSet<SessionId>,
    pub channels: BTreeSet<ChannelKey>,
}

impl SubscriptionSnapshot {
    /// Fold another peer's announcement into this snapshot
    pub fn merge(
        &mut self,
        sessions: impl IntoIterator<Item = SessionId>,
        channels: impl IntoIterator<Item = ChannelKey>,
    ) {
        self.sessions.extend(sessions);
        self.channels.extend(channels);
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty() && self.channels.is_empty()
    }
}

/// Sessions and channels requested through one peer
#[derive(Debug, Default)]
pub struct SubscriptionSets {
    sessions: DashSet<SessionId>,
    channels: DashSet<ChannelKey>,
}

impl SubscriptionSets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_session(&self, session_id: &str) {
        if self.sessions.insert(session_id.to_string()) {
            tracing::debug!("Tracking session {}", session_id);
        }
    }

    pub fn remove_session(&self, session_id: &str) {
        self.sessions.remove(session_id);
    }

    /// Forget a session together with all of its channels
    pub fn close_session(&self, session_id: &str) {
        self.sessions.remove(session_id);
        self.channels.retain(|key| key.session_id != session_id);
    }

    pub fn add_channel(&self, session_id: &str, channel: &str) {
        if self.channels.insert(ChannelKey::new(session_id, channel)) {
            tracing::debug!("Tracking channel {}/{}", session_id, channel);
        }
    }

    pub fn has_session(&self, session_id: &str) -> bool {
        self.sessions.contains(session_id)
    }

    pub fn has_channel(&self, session_id: &str, channel: &str) -> bool {
        self.channels.contains(&ChannelKey::new(session_id, channel))
    }

    /// Whether a relayed event belongs to something this peer asked for
    ///
    /// Channel events need the exact (session, channel) pair; session events
    /// need the session.
    pub fn accepts(&self, event: &TransportEvent) -> bool {
        match &event.channel {
            Some(channel) => self.has_channel(&event.session_id, channel),
            None => self.has_session(&event.session_id),
        }
    }

    pub fn snapshot(&self) -> SubscriptionSnapshot {
        SubscriptionSnapshot {
            sessions: self.sessions.iter().map(|s| s.key().clone()).collect(),
            channels: self.channels.iter().map(|c| c.key().clone()).collect(),
        }
    }
}
