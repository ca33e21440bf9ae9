use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::session::SessionState;

/// Per-transfer slot. Holding its lock is what grants exclusivity over one
/// transfer.
#[derive(Debug, Default)]
pub(crate) struct SessionSlot {
    /// `None` until the first accepted chunk (or after a failed first chunk).
    pub state: Option<SessionState>,
    /// Set once the slot has been removed from the registry. Anyone who
    /// raced for it must look the id up again.
    retired: bool,
}

impl SessionSlot {
    pub fn is_retired(&self) -> bool {
        self.retired
    }
}

pub(crate) type SlotHandle = Arc<Mutex<SessionSlot>>;
pub(crate) type SlotGuard = OwnedMutexGuard<SessionSlot>;

/// Authoritative map from transfer id to session slot.
///
/// The map lock is only held to look up, insert or remove a slot, never
/// across I/O. Lock order is slot, then map.
#[derive(Debug, Default)]
pub(crate) struct SessionRegistry {
    slots: Mutex<HashMap<String, SlotHandle>>,
}

impl SessionRegistry {
    /// Returns the slot for `id`, if one exists.
    pub async fn slot(&self, id: &str) -> Option<SlotHandle> {
        self.slots.lock().await.get(id).cloned()
    }

    /// Returns the slot for `id`, inserting an empty one if needed.
    pub async fn slot_or_create(&self, id: &str) -> SlotHandle {
        let mut slots = self.slots.lock().await;
        Arc::clone(slots.entry(id.to_string()).or_default())
    }

    /// Locks the slot for `id`, creating it if needed and retrying when the
    /// slot was retired while we waited for it.
    pub async fn lock_or_create(&self, id: &str) -> (SlotHandle, SlotGuard) {
        loop {
            let handle = self.slot_or_create(id).await;
            let guard = Arc::clone(&handle).lock_owned().await;
            if !guard.is_retired() {
                return (handle, guard);
            }
        }
    }

    /// Locks the existing slot for `id`.
    pub async fn lock(&self, id: &str) -> Option<(SlotHandle, SlotGuard)> {
        loop {
            let handle = self.slot(id).await?;
            let guard = Arc::clone(&handle).lock_owned().await;
            if !guard.is_retired() {
                return Some((handle, guard));
            }
        }
    }

    /// Empties and retires a locked slot and drops it from the map.
    pub async fn retire(&self, id: &str, handle: &SlotHandle, guard: &mut SessionSlot) {
        guard.state = None;
        guard.retired = true;
        let mut slots = self.slots.lock().await;
        if slots.get(id).is_some_and(|current| Arc::ptr_eq(current, handle)) {
            slots.remove(id);
        }
    }

    /// Snapshot of the ids currently registered.
    pub async fn ids(&self) -> Vec<String> {
        self.slots.lock().await.keys().cloned().collect()
    }
}
