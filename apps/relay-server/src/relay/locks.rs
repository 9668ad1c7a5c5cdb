//! Keyed lock arena
//!
//! One async mutex per key, created on demand and dropped from the arena
//! once nobody holds or waits on it.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

type Slot = Arc<Mutex<()>>;

#[derive(Default)]
pub struct KeyedLocks {
    slots: parking_lot::Mutex<HashMap<String, Slot>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`
    pub async fn lock(&self, key: &str) -> KeyedGuard<'_> {
        let slot = self.slot(key);
        let guard = slot.clone().lock_owned().await;
        self.guard(key, slot, guard)
    }

    /// Take `key` only if nobody holds it right now
    pub fn try_lock(&self, key: &str) -> Option<KeyedGuard<'_>> {
        let slot = self.slot(key);
        let guard = slot.clone().try_lock_owned().ok()?;
        Some(self.guard(key, slot, guard))
    }

    fn slot(&self, key: &str) -> Slot {
        let mut slots = self.slots.lock();
        // Slots only the arena references were left by cancelled waiters
        slots.retain(|_, slot| Arc::strong_count(slot) > 1);
        slots.entry(key.to_string()).or_default().clone()
    }

    fn guard(&self, key: &str, slot: Slot, guard: OwnedMutexGuard<()>) -> KeyedGuard<'_> {
        KeyedGuard {
            arena: self,
            key: key.to_string(),
            slot,
            guard: Some(guard),
        }
    }

    /// Number of keys currently tracked
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Exclusive access to one key; released on drop
pub struct KeyedGuard<'a> {
    arena: &'a KeyedLocks,
    key: String,
    slot: Slot,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyedGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();

        let mut slots = self.arena.slots.lock();
        // Only the arena and this guard still reference the slot
        if Arc::strong_count(&self.slot) == 2 {
            slots.remove(&self.key);
        }
    }
}
