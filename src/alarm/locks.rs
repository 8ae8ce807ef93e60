//! Per-slot serialization.
//!
//! Every state change on one alarm runs under that slot's lock; different
//! slots never contend. Idle entries are dropped so the map only holds
//! slots with an operation in progress.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Keyed async mutex map.
#[derive(Debug, Default)]
pub struct SlotLocks {
    slots: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// Held while operating on one slot. Releases on drop.
pub struct SlotGuard {
    _guard: OwnedMutexGuard<()>,
}

impl SlotLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `slot_id`.
    pub async fn lock(&self, slot_id: &str) -> SlotGuard {
        let slot = {
            let mut slots = self
                .slots
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            // Only the map holds idle entries; prune them while we are here.
            slots.retain(|key, lock| key == slot_id || Arc::strong_count(lock) > 1);
            Arc::clone(slots.entry(slot_id.to_owned()).or_default())
        };
        SlotGuard {
            _guard: slot.lock_owned().await,
        }
    }

    /// Number of slots currently tracked (held, awaited, or not yet pruned).
    pub fn tracked(&self) -> usize {
        self.slots
            .lock()
            .map(|slots| slots.len())
            .unwrap_or_default()
    }
}
