//! Ordered record of outbound units awaiting acknowledgment.

use sm_storage::PersistedEntry;
use sm_wire::{encode_unit, TrackableKinds, Unit, UnitFactory, UnitKind, WireError};
use std::collections::VecDeque;

use crate::error::SmError;

/// Queued unit with its kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedUnit {
    /// Kind of the unit
    pub kind: UnitKind,
    /// The unit as transmitted
    pub unit: Unit,
}

/// FIFO of tracked units.
///
/// Order is transmission order, which is also the order the peer acknowledges
/// in. Entries only ever leave from the front.
#[derive(Debug, Clone, Default)]
pub struct UnackedQueue {
    entries: VecDeque<QueuedUnit>,
    trackable: TrackableKinds,
}

impl UnackedQueue {
    /// Create an empty queue accepting `trackable` kinds
    pub fn new(trackable: TrackableKinds) -> Self {
        Self {
            entries: VecDeque::new(),
            trackable,
        }
    }

    /// Whether units of `kind` may be queued
    pub fn accepts(&self, kind: UnitKind) -> bool {
        self.trackable.accepts(kind)
    }

    /// Queue `unit` if its kind is trackable; returns whether it was queued
    pub fn append(&mut self, unit: Unit) -> bool {
        let kind = unit.kind();
        if !self.accepts(kind) {
            return false;
        }
        self.entries.push_back(QueuedUnit { kind, unit });
        true
    }

    /// Remove the oldest entry
    pub fn pop_front(&mut self) -> Option<QueuedUnit> {
        self.entries.pop_front()
    }

    /// Remove every entry, oldest first
    pub fn drain_all(&mut self) -> Vec<QueuedUnit> {
        self.entries.drain(..).collect()
    }

    /// Put back an entry taken out by [`drain_all`](Self::drain_all)
    pub(crate) fn requeue(&mut self, entry: QueuedUnit) {
        self.entries.push_back(entry);
    }

    /// Drop every entry
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of queued units
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Queued units, oldest first
    pub fn iter(&self) -> impl Iterator<Item = &QueuedUnit> {
        self.entries.iter()
    }

    /// Persisted form of the queue
    pub fn to_persisted(&self) -> Result<Vec<PersistedEntry>, SmError> {
        self.entries
            .iter()
            .map(|entry| {
                let (kind, unit) = encode_unit(&entry.unit)?;
                Ok::<_, SmError>(PersistedEntry {
                    kind: kind.as_str().to_string(),
                    unit,
                })
            })
            .collect()
    }

    /// Rebuild a queue from persisted entries.
    ///
    /// Any entry the factory rejects, or whose kind is outside `trackable`,
    /// fails the whole restore.
    pub fn from_persisted(
        entries: &[PersistedEntry],
        factory: &dyn UnitFactory,
        trackable: TrackableKinds,
    ) -> Result<Self, SmError> {
        let mut queue = Self::new(trackable);
        for (index, entry) in entries.iter().enumerate() {
            let unit = factory
                .rehydrate(&entry.kind, &entry.unit)
                .map_err(|source| SmError::RestoreCorrupted { index, source })?;
            let kind = unit.kind();
            if !queue.accepts(kind) {
                return Err(SmError::RestoreCorrupted {
                    index,
                    source: WireError::Untrackable(kind),
                });
            }
            queue.requeue(QueuedUnit { kind, unit });
        }
        Ok(queue)
    }
}
