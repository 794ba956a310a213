//! Broadcast bridge: one peer's membership in its endpoint group
//!
//! Stamps outgoing messages with the local peer id and hides frames this peer
//! sent itself from every receiver it hands out.

use crate::bus::{group_key, BroadcastBus, BusChannel};
use crate::error::BridgeError;
use crate::types::{BridgeFrame, BridgeMessage, PeerId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;

/// Group-scoped fan-out messaging for one peer
pub struct BroadcastBridge {
    /// This peer's id, stamped on every frame
    peer_id: PeerId,
    /// Group key derived from the endpoint
    group: String,
    /// Underlying bus membership
    channel: Arc<dyn BusChannel>,
    /// Flips to true on close; ends every receiver
    closed: watch::Sender<bool>,
}

impl BroadcastBridge {
    /// Join the group of `endpoint` on `bus`
    pub async fn open(
        bus: &dyn BroadcastBus,
        endpoint: &str,
        peer_id: PeerId,
    ) -> Result<Self, BridgeError> {
        let group = group_key(endpoint);
        let channel = bus.open(&group).await?;
        tracing::debug!("Peer {} joined bridge group {}", peer_id, group);

        Ok(Self {
            peer_id,
            group,
            channel,
            closed: watch::channel(false).0,
        })
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Fire-and-forget send to every other peer of the group
    pub fn broadcast(&self, message: BridgeMessage) {
        if self.is_closed() {
            tracing::trace!("Dropping {} on closed bridge", message.kind());
            return;
        }

        let kind = message.kind();
        let frame = BridgeFrame {
            peer_id: self.peer_id.clone(),
            message,
        };
        if let Err(e) = self.channel.post(frame) {
            tracing::warn!("Failed to broadcast {}: {}", kind, e);
        }
    }

    /// Receive every message from other peers, starting now
    ///
    /// Dropping the receiver unsubscribes it.
    pub fn subscribe(&self) -> PeerReceiver {
        PeerReceiver {
            peer_id: self.peer_id.clone(),
            rx: self.channel.subscribe(),
            closed: self.closed.subscribe(),
        }
    }

    /// Broadcast `solicitation` and gather every reply `extract` accepts
    ///
    /// Always waits the full window so slow peers still get counted. Replies
    /// are deduplicated per peer, keeping the latest.
    pub async fn collect_responses<T, F>(
        &self,
        solicitation: BridgeMessage,
        window: Duration,
        mut extract: F,
    ) -> Vec<(PeerId, T)>
    where
        F: FnMut(&BridgeMessage) -> Option<T>,
    {
        let deadline = Instant::now() + window;
        let mut rx = self.subscribe();
        self.broadcast(solicitation);

        let mut replies: Vec<(PeerId, T)> = Vec::new();
        while let Ok(Some(frame)) = tokio::time::timeout_at(deadline, rx.recv()).await {
            if let Some(value) = extract(&frame.message) {
                replies.retain(|(peer, _)| peer != &frame.peer_id);
                replies.push((frame.peer_id, value));
            }
        }

        tracing::debug!(
            "Collected {} replies in {:?} on {}",
            replies.len(),
            window,
            self.group
        );
        replies
    }

    /// Release the underlying channel and end all receivers
    pub fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        self.channel.close();
        tracing::debug!("Peer {} left bridge group {}", self.peer_id, self.group);
    }
}

impl Drop for BroadcastBridge {
    fn drop(&mut self) {
        self.close();
    }
}

/// Receiver of frames sent by other peers
pub struct PeerReceiver {
    peer_id: PeerId,
    rx: broadcast::Receiver<BridgeFrame>,
    closed: watch::Receiver<bool>,
}

impl PeerReceiver {
    /// Next frame from another peer, or `None` once the bridge is closed
    pub async fn recv(&mut self) -> Option<BridgeFrame> {
        loop {
            if *self.closed.borrow() {
                return None;
            }

            tokio::select! {
                changed = self.closed.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
                received = self.rx.recv() => match received {
                    Ok(frame) if frame.peer_id == self.peer_id => {}
                    Ok(frame) => return Some(frame),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Peer {} lagged {} bridge messages", self.peer_id, n);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                },
            }
        }
    }
}
