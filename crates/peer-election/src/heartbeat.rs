//! Election by broadcast race for runtimes without an exclusive lock
//!
//! Algorithm:
//! - A candidate broadcasts a claim stamped with its claim time and collects
//!   competing claims for a short window. The lowest `(claimed_at, peer_id)`
//!   wins; a heartbeat heard during the window means a leader already exists.
//! - Racers re-broadcast their own claim once per newly seen competitor, so
//!   peers that subscribed late still see every claim.
//! - The leader re-asserts itself every heartbeat interval and answers every
//!   claim with a heartbeat.
//! - Followers start a fresh race when heartbeats stop for the timeout window
//!   or when the leader announces its resignation.
//! - Two leaders hearing each other keep the lower rank; the other steps down.

use crate::config::ElectionConfig;
use crate::elector::{LeaderElector, CHANGE_CHANNEL_CAPACITY};
use async_trait::async_trait;
use parking_lot::Mutex;
use peer_bridge::{BridgeFrame, BridgeMessage, BroadcastBridge, PeerId, PeerReceiver};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Election order: earlier claim first, peer id breaks ties
type Rank = (i64, PeerId);

pub struct HeartbeatElector {
    inner: Arc<HeartbeatInner>,
}

struct HeartbeatInner {
    peer_id: PeerId,
    bridge: Arc<BroadcastBridge>,
    config: ElectionConfig,
    state: Mutex<HeartbeatState>,
    changes: broadcast::Sender<bool>,
    /// Serializes races started by the monitor and by callers
    race_lock: tokio::sync::Mutex<()>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

struct HeartbeatState {
    is_leader: bool,
    /// Rank this peer won with, while leader
    rank: Option<Rank>,
    /// Last known leader
    leader: Option<Rank>,
    /// When the leader was last heard from
    last_heartbeat: Instant,
    settled: bool,
    active: bool,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl HeartbeatElector {
    pub fn new(bridge: Arc<BroadcastBridge>, config: ElectionConfig) -> Self {
        Self {
            inner: Arc::new(HeartbeatInner {
                peer_id: bridge.peer_id().clone(),
                bridge,
                config,
                state: Mutex::new(HeartbeatState {
                    is_leader: false,
                    rank: None,
                    leader: None,
                    last_heartbeat: Instant::now(),
                    settled: false,
                    active: true,
                }),
                changes: broadcast::channel(CHANGE_CHANNEL_CAPACITY).0,
                race_lock: tokio::sync::Mutex::new(()),
                monitor: Mutex::new(None),
            }),
        }
    }
}

impl HeartbeatInner {
    /// Peer this elector currently believes to be leader
    fn known_leader(&self) -> Option<PeerId> {
        self.state.lock().leader.as_ref().map(|(_, peer)| peer.clone())
    }

    /// Run one race; returns whether this peer won
    ///
    /// `initial` races are skipped when an earlier race already settled the role.
    async fn race(self: &Arc<Self>, initial: bool) -> bool {
        let _racing = self.race_lock.lock().await;
        {
            let state = self.state.lock();
            if !state.active {
                return false;
            }
            if state.is_leader || (initial && state.settled) {
                return state.is_leader;
            }
        }

        let claimed_at = now_ms();
        let own: Rank = (claimed_at, self.peer_id.clone());
        let deadline = Instant::now() + self.config.claim_window();
        let mut rx = self.bridge.subscribe();
        self.bridge.broadcast(BridgeMessage::LeaderClaim { claimed_at });

        let mut best = own.clone();
        let mut competitors: HashSet<PeerId> = HashSet::new();
        let mut incumbent: Option<Rank> = None;

        while let Ok(Some(frame)) = tokio::time::timeout_at(deadline, rx.recv()).await {
            match frame.message {
                BridgeMessage::LeaderClaim { claimed_at: theirs } => {
                    if competitors.insert(frame.peer_id.clone()) {
                        self.bridge.broadcast(BridgeMessage::LeaderClaim { claimed_at });
                    }
                    let rank = (theirs, frame.peer_id);
                    if rank < best {
                        best = rank;
                    }
                }
                BridgeMessage::LeaderHeartbeat { claimed_at: theirs } => {
                    incumbent = Some((theirs, frame.peer_id));
                    break;
                }
                _ => {}
            }
        }

        let won = incumbent.is_none() && best == own;
        let changed = {
            let mut state = self.state.lock();
            if !state.active {
                return false;
            }
            let was_leader = state.is_leader;
            if won {
                state.is_leader = true;
                state.rank = Some(own.clone());
                state.leader = Some(own);
            } else {
                state.is_leader = false;
                state.rank = None;
                state.leader = Some(incumbent.unwrap_or(best));
            }
            state.last_heartbeat = Instant::now();
            let changed = state.settled && was_leader != won;
            state.settled = true;
            changed
        };

        if won {
            self.bridge
                .broadcast(BridgeMessage::LeaderHeartbeat { claimed_at });
            tracing::info!(
                "Peer {} won the leadership race of {} ({} competitors)",
                self.peer_id,
                self.bridge.group(),
                competitors.len()
            );
        } else {
            tracing::info!(
                "Peer {} lost the leadership race of {} to {:?}",
                self.peer_id,
                self.bridge.group(),
                self.known_leader()
            );
        }

        if changed {
            let _ = self.changes.send(won);
        }
        won
    }

    /// Handle one bus frame; returns whether a race should start
    fn on_frame(&self, frame: BridgeFrame) -> bool {
        match frame.message {
            BridgeMessage::LeaderHeartbeat { claimed_at } => {
                let rank = (claimed_at, frame.peer_id);
                let mut state = self.state.lock();
                if !state.is_leader {
                    state.leader = Some(rank);
                    state.last_heartbeat = Instant::now();
                    return false;
                }

                let own = state.rank.clone();
                match own {
                    Some(own) if rank < own => {
                        state.is_leader = false;
                        state.rank = None;
                        state.leader = Some(rank.clone());
                        state.last_heartbeat = Instant::now();
                        drop(state);
                        tracing::warn!(
                            "Peer {} stepping down in favour of {}",
                            self.peer_id,
                            rank.1
                        );
                        let _ = self.changes.send(false);
                    }
                    Some((own_claim, _)) => {
                        drop(state);
                        self.bridge
                            .broadcast(BridgeMessage::LeaderHeartbeat { claimed_at: own_claim });
                    }
                    None => {}
                }
                false
            }
            BridgeMessage::LeaderClaim { .. } => {
                // Answer candidates so they yield to the sitting leader
                let own = {
                    let state = self.state.lock();
                    if state.is_leader {
                        state.rank.clone()
                    } else {
                        None
                    }
                };
                if let Some((claimed_at, _)) = own {
                    self.bridge
                        .broadcast(BridgeMessage::LeaderHeartbeat { claimed_at });
                }
                false
            }
            BridgeMessage::LeaderResign => {
                let mut state = self.state.lock();
                if state.is_leader || !state.active {
                    return false;
                }
                if state
                    .leader
                    .as_ref()
                    .is_some_and(|(_, leader)| leader != &frame.peer_id)
                {
                    return false;
                }
                state.leader = None;
                tracing::info!("Leader {} resigned; starting election", frame.peer_id);
                true
            }
            _ => false,
        }
    }

    /// Periodic work; returns whether a race should start
    fn on_tick(&self) -> bool {
        let state = self.state.lock();
        if !state.active {
            return false;
        }

        if state.is_leader {
            if let Some((claimed_at, _)) = state.rank.clone() {
                drop(state);
                self.bridge
                    .broadcast(BridgeMessage::LeaderHeartbeat { claimed_at });
            }
            return false;
        }

        let silence = state.last_heartbeat.elapsed();
        if silence >= self.config.heartbeat_timeout() {
            tracing::warn!(
                "No leader heartbeat on {} for {:?}; starting election",
                self.bridge.group(),
                silence
            );
            return true;
        }
        false
    }

    async fn monitor(self: Arc<Self>, mut rx: PeerReceiver) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let should_race = tokio::select! {
                frame = rx.recv() => match frame {
                    Some(frame) => self.on_frame(frame),
                    None => break,
                },
                _ = ticker.tick() => self.on_tick(),
            };

            if should_race {
                self.race(false).await;
            }
        }
    }
}

#[async_trait]
impl LeaderElector for HeartbeatElector {
    fn peer_id(&self) -> &PeerId {
        &self.inner.peer_id
    }

    fn is_leader(&self) -> bool {
        self.inner.state.lock().is_leader
    }

    async fn await_leadership(&self) {
        // Subscribed before the race so no frame between the race and the
        // monitor's first poll is missed
        let rx = self
            .inner
            .monitor
            .lock()
            .is_none()
            .then(|| self.inner.bridge.subscribe());

        self.inner.race(true).await;

        let Some(rx) = rx else {
            return;
        };
        let mut monitor = self.inner.monitor.lock();
        if monitor.is_none() && self.inner.state.lock().active {
            *monitor = Some(tokio::spawn(self.inner.clone().monitor(rx)));
        }
    }

    fn on_leadership_change(&self) -> broadcast::Receiver<bool> {
        self.inner.changes.subscribe()
    }

    async fn resign(&self) {
        {
            let mut state = self.inner.state.lock();
            if !state.is_leader {
                return;
            }
            state.is_leader = false;
            state.rank = None;
            state.leader = None;
            // Stay out of the successor race
            state.last_heartbeat = Instant::now() + self.inner.config.rejoin_delay();
        }

        self.inner.bridge.broadcast(BridgeMessage::LeaderResign);
        tracing::info!("Peer {} resigned leadership of {}", self.inner.peer_id, self.inner.bridge.group());
        let _ = self.inner.changes.send(false);
    }

    async fn campaign(&self) {
        {
            let state = self.inner.state.lock();
            if state.is_leader || !state.active {
                return;
            }
        }
        self.inner.race(false).await;
    }

    async fn shutdown(&self) {
        let was_leader = {
            let mut state = self.inner.state.lock();
            state.active = false;
            let was_leader = state.is_leader;
            state.is_leader = false;
            state.rank = None;
            was_leader
        };

        if let Some(monitor) = self.inner.monitor.lock().take() {
            monitor.abort();
        }

        if was_leader {
            self.inner.bridge.broadcast(BridgeMessage::LeaderResign);
            tracing::info!("Peer {} released leadership of {}", self.inner.peer_id, self.inner.bridge.group());
            let _ = self.inner.changes.send(false);
        }
    }
}

impl Drop for HeartbeatElector {
    fn drop(&mut self) {
        self.inner.state.lock().active = false;
        if let Some(monitor) = self.inner.monitor.lock().take() {
            monitor.abort();
        }
    }
}
