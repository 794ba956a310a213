//! Election through the exclusive lock
//!
//! The holder of the group's lock is leader. A peer that finds the lock taken
//! queues for it in the background and takes over when it is released.

use crate::config::ElectionConfig;
use crate::elector::{LeaderElector, CHANGE_CHANNEL_CAPACITY};
use crate::lock::{LockGuard, LockRegistry};
use async_trait::async_trait;
use parking_lot::Mutex;
use peer_bridge::PeerId;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

pub struct LockElector {
    inner: Arc<LockInner>,
}

struct LockInner {
    peer_id: PeerId,
    key: String,
    registry: LockRegistry,
    config: ElectionConfig,
    state: Mutex<LockState>,
    changes: broadcast::Sender<bool>,
}

struct LockState {
    /// Held lock; `Some` means leader
    guard: Option<LockGuard>,
    /// Background acquisition queued behind the holder
    waiter: Option<JoinHandle<()>>,
    settled: bool,
    active: bool,
}

impl LockElector {
    pub fn new(peer_id: PeerId, key: String, registry: LockRegistry, config: ElectionConfig) -> Self {
        Self {
            inner: Arc::new(LockInner {
                peer_id,
                key,
                registry,
                config,
                state: Mutex::new(LockState {
                    guard: None,
                    waiter: None,
                    settled: false,
                    active: true,
                }),
                changes: broadcast::channel(CHANGE_CHANNEL_CAPACITY).0,
            }),
        }
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }
}

impl LockInner {
    fn spawn_waiter(self: &Arc<Self>, state: &mut LockState, delay: Duration) {
        if state.waiter.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let inner = self.clone();
        state.waiter = Some(tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let guard = inner.registry.acquire(&inner.key, &inner.peer_id).await;

            {
                let mut state = inner.state.lock();
                if !state.active {
                    return;
                }
                state.guard = Some(guard);
                state.waiter = None;
            }

            tracing::info!("Peer {} took over leadership of {}", inner.peer_id, inner.key);
            let _ = inner.changes.send(true);
        }));
    }
}

#[async_trait]
impl LeaderElector for LockElector {
    fn peer_id(&self) -> &PeerId {
        &self.inner.peer_id
    }

    fn is_leader(&self) -> bool {
        self.inner.state.lock().guard.is_some()
    }

    async fn await_leadership(&self) {
        let mut state = self.inner.state.lock();
        if state.settled || !state.active {
            return;
        }
        state.settled = true;

        match self.inner.registry.try_acquire(&self.inner.key, &self.inner.peer_id) {
            Some(guard) => {
                state.guard = Some(guard);
                tracing::info!("Peer {} acquired leadership of {}", self.inner.peer_id, self.inner.key);
            }
            None => {
                tracing::info!("Peer {} is a follower of {}", self.inner.peer_id, self.inner.key);
                self.inner.spawn_waiter(&mut state, Duration::ZERO);
            }
        }
    }

    fn on_leadership_change(&self) -> broadcast::Receiver<bool> {
        self.inner.changes.subscribe()
    }

    async fn resign(&self) {
        let guard = {
            let mut state = self.inner.state.lock();
            let guard = state.guard.take();
            if guard.is_some() && state.active {
                let delay = self.inner.config.rejoin_delay();
                self.inner.spawn_waiter(&mut state, delay);
            }
            guard
        };

        if let Some(guard) = guard {
            drop(guard);
            tracing::info!("Peer {} resigned leadership of {}", self.inner.peer_id, self.inner.key);
            let _ = self.inner.changes.send(false);
        }
    }

    async fn campaign(&self) {
        let acquired = {
            let mut state = self.inner.state.lock();
            if state.guard.is_some() || !state.active {
                return;
            }
            match self.inner.registry.try_acquire(&self.inner.key, &self.inner.peer_id) {
                Some(guard) => {
                    if let Some(waiter) = state.waiter.take() {
                        waiter.abort();
                    }
                    state.guard = Some(guard);
                    true
                }
                None => false,
            }
        };

        if acquired {
            tracing::info!("Peer {} claimed vacant leadership of {}", self.inner.peer_id, self.inner.key);
            let _ = self.inner.changes.send(true);
        }
    }

    async fn shutdown(&self) {
        let guard = {
            let mut state = self.inner.state.lock();
            state.active = false;
            if let Some(waiter) = state.waiter.take() {
                waiter.abort();
            }
            state.guard.take()
        };

        if let Some(guard) = guard {
            drop(guard);
            tracing::info!("Peer {} released leadership of {}", self.inner.peer_id, self.inner.key);
            let _ = self.inner.changes.send(false);
        }
    }
}

impl Drop for LockElector {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        state.active = false;
        if let Some(waiter) = state.waiter.take() {
            waiter.abort();
        }
        state.guard.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn elector(registry: &LockRegistry, name: &str, rejoin_ms: u64) -> LockElector {
        let config = ElectionConfig {
            rejoin_delay_ms: rejoin_ms,
            ..Default::default()
        };
        LockElector::new(PeerId::from(name), "g:leader".to_string(), registry.clone(), config)
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_acquirer_leads() {
        let registry = LockRegistry::new();
        let a = elector(&registry, "a", 1_000);
        let b = elector(&registry, "b", 1_000);

        a.await_leadership().await;
        b.await_leadership().await;

        assert!(a.is_leader());
        assert!(!b.is_leader());
        assert_eq!(b.state().peer_id, PeerId::from("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_follower_takes_over_after_resign() {
        let registry = LockRegistry::new();
        let a = elector(&registry, "a", 1_000);
        let b = elector(&registry, "b", 1_000);
        a.await_leadership().await;
        b.await_leadership().await;

        let mut a_changes = a.on_leadership_change();
        let mut b_changes = b.on_leadership_change();

        a.resign().await;

        assert_eq!(a_changes.recv().await.unwrap(), false);
        assert_eq!(b_changes.recv().await.unwrap(), true);
        assert!(b.is_leader());
        assert!(!a.is_leader());

        // The resigned peer queues again and inherits once b leaves
        tokio::time::sleep(Duration::from_secs(2)).await;
        b.shutdown().await;
        assert_eq!(a_changes.recv().await.unwrap(), true);
        assert!(a.is_leader());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_leader_releases_lock() {
        let registry = LockRegistry::new();
        let a = elector(&registry, "a", 1_000);
        let b = elector(&registry, "b", 1_000);
        a.await_leadership().await;
        b.await_leadership().await;

        let mut b_changes = b.on_leadership_change();
        drop(a);

        assert_eq!(b_changes.recv().await.unwrap(), true);
        assert!(b.is_leader());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_does_not_rejoin() {
        let registry = LockRegistry::new();
        let a = elector(&registry, "a", 10);
        a.await_leadership().await;
        assert!(a.is_leader());

        a.shutdown().await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(!a.is_leader());
        assert!(!registry.is_held("g:leader"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_campaign_is_noop_while_lock_is_held() {
        let registry = LockRegistry::new();
        let external = registry.try_acquire("g:leader", &PeerId::from("x")).unwrap();
        let a = elector(&registry, "a", 1_000);
        a.await_leadership().await;
        assert!(!a.is_leader());

        a.campaign().await;
        assert!(!a.is_leader());

        drop(external);
        tokio::task::yield_now().await;
        a.campaign().await;
        assert!(a.is_leader());
        assert!(registry.is_held("g:leader"));
    }
}
