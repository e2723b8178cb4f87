use std::collections::HashSet;

use parking_lot::Mutex;

use crate::{
    archetype::ArchetypeID,
    entity::EntityId,
    util::{ahash_map, id_map, AHashMap, IdMap},
};

use super::{ComponentID, ComponentValue};

const PARTITIONS: usize = 16;

/// A write to a tracked component that has not been notified yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrackedChange {
    pub eid: EntityId,
    pub component: ComponentID,
}

/// Reference values of one tracked column, taken before a query got write access to it.
#[derive(Default)]
pub struct ColumnSnapshot {
    values: IdMap<EntityId, ComponentValue>,
}

impl ColumnSnapshot {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            values: id_map(capacity),
        }
    }

    pub fn insert(&mut self, eid: EntityId, value: ComponentValue) {
        self.values.insert(eid, value);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Whether the value at `ptr` differs from the recorded one. Entities without a recorded
    /// value are compared against `fallback`, usually their template default.
    ///
    /// # Safety
    /// - `ptr` must point to an initialised value of the snapshot's component type.
    pub unsafe fn differs(
        &self,
        eid: EntityId,
        ptr: *const u8,
        fallback: Option<&ComponentValue>,
    ) -> bool {
        match self.values.get(&eid).or(fallback) {
            Some(reference) => unsafe { !reference.eq_raw(ptr) },
            None => true,
        }
    }
}

/// Collects writes to tracked components until the next flush.
///
/// Per-entity writes land in archetype-partitioned pending lists so that concurrent writers on
/// different archetypes rarely share a lock. Queries with write access to a tracked column mark
/// the whole `(archetype, component)` pair instead, and are diffed against a snapshot at flush.
pub struct ChangeTracker {
    pending: Vec<Mutex<Vec<TrackedChange>>>,
    archetype_marks: Mutex<Vec<(ArchetypeID, ComponentID)>>,
    snapshots: Mutex<AHashMap<(ArchetypeID, ComponentID), ColumnSnapshot>>,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self {
            pending: (0..PARTITIONS).map(|_| Mutex::new(Vec::new())).collect(),
            archetype_marks: Mutex::new(Vec::new()),
            snapshots: Mutex::new(ahash_map(8)),
        }
    }

    #[inline]
    pub fn schedule(&self, archetype: ArchetypeID, eid: EntityId, component: ComponentID) {
        self.pending[archetype as usize % PARTITIONS]
            .lock()
            .push(TrackedChange { eid, component });
    }

    pub fn mark_archetype(&self, archetype: ArchetypeID, component: ComponentID) {
        self.archetype_marks.lock().push((archetype, component));
    }

    pub fn has_snapshot(&self, archetype: ArchetypeID, component: ComponentID) -> bool {
        self.snapshots.lock().contains_key(&(archetype, component))
    }

    pub fn store_snapshot(&self, archetype: ArchetypeID, component: ComponentID, snapshot: ColumnSnapshot) {
        self.snapshots.lock().insert((archetype, component), snapshot);
    }

    pub fn take_snapshot(&self, archetype: ArchetypeID, component: ComponentID) -> Option<ColumnSnapshot> {
        self.snapshots.lock().remove(&(archetype, component))
    }

    pub fn snapshot_keys(&self) -> Vec<(ArchetypeID, ComponentID)> {
        let mut keys: Vec<_> = self.snapshots.lock().keys().copied().collect();
        keys.sort_unstable();
        keys
    }

    pub fn pending_len(&self) -> usize {
        self.pending.iter().map(|partition| partition.lock().len()).sum()
    }

    /// Takes every pending write, keeping the first occurrence of each `(entity, component)` pair.
    pub fn drain_pending(&self) -> Vec<TrackedChange> {
        let mut changes = Vec::new();
        for partition in self.pending.iter() {
            changes.append(&mut partition.lock());
        }
        dedup_in_order(changes)
    }

    pub fn drain_archetype_marks(&self) -> Vec<(ArchetypeID, ComponentID)> {
        let marks = core::mem::take(&mut *self.archetype_marks.lock());
        dedup_in_order(marks)
    }

    /// Drops pending writes and snapshots; used when the world is cleared or archetypes are
    /// renumbered.
    pub fn clear(&self) {
        for partition in self.pending.iter() {
            partition.lock().clear();
        }
        self.archetype_marks.lock().clear();
        self.snapshots.lock().clear();
    }

    pub fn clear_snapshots(&self) {
        self.snapshots.lock().clear();
    }
}

impl Default for ChangeTracker {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn dedup_in_order<T: Copy + Eq + core::hash::Hash>(items: Vec<T>) -> Vec<T> {
    let mut seen = HashSet::with_capacity_and_hasher(items.len(), ahash::RandomState::default());
    items.into_iter().filter(|item| seen.insert(*item)).collect()
}
