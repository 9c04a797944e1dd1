//! In-memory storage backend for development and testing

use crate::{Snapshot, SnapshotStore, StorageError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// In-memory snapshot slot.
///
/// Clones share the same slot, so a test can hand one clone to a session and
/// inspect what it persisted through another.
#[derive(Clone, Default)]
pub struct MemoryStore {
    slot: Arc<Mutex<Option<Snapshot>>>,
    saves: Arc<AtomicUsize>,
    clears: Arc<AtomicUsize>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that already holds `snapshot`
    pub fn with_snapshot(snapshot: Snapshot) -> Self {
        let store = Self::new();
        *store.lock() = Some(snapshot);
        store
    }

    /// Currently stored snapshot
    pub fn current(&self) -> Option<Snapshot> {
        self.lock().clone()
    }

    /// Number of `save` calls so far
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Number of `clear` calls so far
    pub fn clear_count(&self) -> usize {
        self.clears.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Snapshot>> {
        // A poisoned slot still holds a whole snapshot; keep using it.
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl SnapshotStore for MemoryStore {
    fn save(&self, snapshot: &Snapshot) -> Result<(), StorageError> {
        debug!(
            "Snapshot save owner={} handled={:?} last_ack={:?} queued={}",
            snapshot.owner,
            snapshot.handled,
            snapshot.last_ack,
            snapshot.queue.len()
        );
        *self.lock() = Some(snapshot.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn restore(&self) -> Result<Option<Snapshot>, StorageError> {
        Ok(self.current())
    }

    fn clear(&self) -> Result<(), StorageError> {
        debug!("Snapshot clear");
        *self.lock() = None;
        self.clears.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
