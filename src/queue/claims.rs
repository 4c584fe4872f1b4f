//! Per-document claims that serialize jobs sharing a document id.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type Slot = Arc<AsyncMutex<()>>;

/// Registry of in-flight document ids.
///
/// A worker claims a document before running its pipeline. A second job for the same id
/// waits on the claim until the first reaches a terminal state; jobs for other ids are
/// unaffected.
#[derive(Default)]
pub struct ClaimRegistry {
    slots: Arc<Mutex<HashMap<String, Slot>>>,
}

/// Exclusive hold on a document id; released on drop.
pub struct DocumentClaim {
    document_id: String,
    slots: Arc<Mutex<HashMap<String, Slot>>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl ClaimRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until `document_id` is free and claim it.
    pub async fn claim(&self, document_id: &str) -> DocumentClaim {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            Arc::clone(slots.entry(document_id.to_string()).or_default())
        };
        if slot.try_lock().is_err() {
            tracing::info!(document_id, "Waiting for in-flight job on the same document");
        }
        let guard = slot.lock_owned().await;
        DocumentClaim {
            document_id: document_id.to_string(),
            slots: Arc::clone(&self.slots),
            guard: Some(guard),
        }
    }

    /// Number of document ids currently claimed or awaited.
    pub fn in_flight(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

impl DocumentClaim {
    /// Claimed document id.
    pub fn document_id(&self) -> &str {
        &self.document_id
    }
}

impl Drop for DocumentClaim {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut slots = self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        // Only the registry map still references the slot once nobody holds or awaits it.
        if slots
            .get(&self.document_id)
            .is_some_and(|slot| Arc::strong_count(slot) == 1)
        {
            slots.remove(&self.document_id);
        }
    }
}
