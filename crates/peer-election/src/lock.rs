//! Exclusive-acquisition primitive
//!
//! A keyed registry of fair async mutexes. Waiters are granted the lock in
//! request order, and dropping a guard hands it straight to the next waiter.

use dashmap::DashMap;
use peer_bridge::PeerId;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Leadership lock key for a bridge group
pub fn lock_key(group: &str) -> String {
    format!("{}:leader", group)
}

/// Registry of named exclusive locks
#[derive(Clone, Default)]
pub struct LockRegistry {
    locks: Arc<DashMap<String, Arc<Mutex<Option<PeerId>>>>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &str) -> Arc<Mutex<Option<PeerId>>> {
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    /// Take the lock if nobody holds it or waits for it
    pub fn try_acquire(&self, key: &str, peer_id: &PeerId) -> Option<LockGuard> {
        let guard = self.slot(key).try_lock_owned().ok()?;
        Some(LockGuard::new(key, peer_id, guard))
    }

    /// Queue for the lock and wait until it is granted
    pub async fn acquire(&self, key: &str, peer_id: &PeerId) -> LockGuard {
        let guard = self.slot(key).lock_owned().await;
        LockGuard::new(key, peer_id, guard)
    }

    /// Whether the lock is currently held
    pub fn is_held(&self, key: &str) -> bool {
        match self.locks.get(key) {
            Some(slot) => slot.try_lock().is_err(),
            None => false,
        }
    }
}

/// Proof of holding a lock; released on drop
pub struct LockGuard {
    key: String,
    guard: OwnedMutexGuard<Option<PeerId>>,
}

impl LockGuard {
    fn new(key: &str, peer_id: &PeerId, mut guard: OwnedMutexGuard<Option<PeerId>>) -> Self {
        *guard = Some(peer_id.clone());
        tracing::debug!("Peer {} holds lock {}", peer_id, key);
        Self {
            key: key.to_string(),
            guard,
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(peer_id) = self.guard.take() {
            tracing::debug!("Peer {} released lock {}", peer_id, self.key);
        }
    }
}
