use core::cell::Cell;

use crate::{
    archetype::{Archetype, ArchetypeID},
    component::{Component, ComponentID, ComponentsInit},
    entity::EntityId,
    error::ErrorCounters,
    event::{EcsEvent, Event, EventTarget},
    world::{ComponentKey, World},
};

use super::QueryID;

/// A row range of one chunk, with typed access to the columns of a query.
///
/// Write slots are addressed by their index in the query's `rw` list, read slots by their index
/// in its `ro` list. Each write slot can be borrowed once per view.
pub struct QueryView<'a> {
    archetype: Option<&'a Archetype>,
    columns: &'a [Option<u16>],
    rw_count: usize,
    chunk: u32,
    begin: usize,
    end: usize,
    writable: bool,
    borrowed: Cell<u64>,
    errors: &'a ErrorCounters,
}

impl<'a> QueryView<'a> {
    pub(crate) fn new(
        archetype: &'a Archetype,
        columns: &'a [Option<u16>],
        rw_count: usize,
        chunk: u32,
        rows: core::ops::Range<usize>,
        writable: bool,
        errors: &'a ErrorCounters,
    ) -> Self {
        debug_assert!(rows.end <= archetype.chunk_len(chunk));
        Self {
            archetype: Some(archetype),
            columns,
            rw_count,
            chunk,
            begin: rows.start,
            end: rows.end,
            writable,
            borrowed: Cell::new(0),
            errors,
        }
    }

    /// A view without rows, handed to systems that have no component signature.
    pub(crate) fn empty(errors: &'a ErrorCounters) -> Self {
        Self {
            archetype: None,
            columns: &[],
            rw_count: 0,
            chunk: 0,
            begin: 0,
            end: 0,
            writable: false,
            borrowed: Cell::new(0),
            errors,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.end - self.begin
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }

    pub fn archetype_id(&self) -> Option<ArchetypeID> {
        self.archetype.map(|archetype| archetype.id)
    }

    #[inline]
    pub fn chunk(&self) -> u32 {
        self.chunk
    }

    /// Entity ids of the rows in this view.
    pub fn entities(&self) -> &'a [EntityId] {
        match self.archetype {
            Some(archetype) => &archetype.entities(self.chunk)[self.begin..self.end],
            None => &[],
        }
    }

    /// Whether the optional read slot `index` exists in this archetype.
    pub fn has_ro(&self, index: usize) -> bool {
        self.column(self.rw_count + index).is_some()
    }

    pub fn has_rw(&self, index: usize) -> bool {
        index < self.rw_count && self.column(index).is_some()
    }

    fn column(&self, slot: usize) -> Option<usize> {
        self.columns.get(slot).copied().flatten().map(usize::from)
    }

    /// Checks the slot's column and type, returning the column index.
    fn typed_column<T: Component>(&self, slot: usize) -> Option<(&'a Archetype, usize)> {
        let archetype = self.archetype?;
        let column = self.column(slot)?;

        let hooks = &archetype.columns()[column].hooks;
        if !hooks.is::<T>() {
            log::error!(
                "query slot {} holds `{}`, accessed as `{}`",
                slot,
                hooks.name,
                T::type_name()
            );
            self.errors.type_mismatch();
            return None;
        }

        Some((archetype, column))
    }

    /// Read access to read slot `index`. `None` when an optional component is absent or the
    /// type does not match.
    pub fn ro<T: Component>(&self, index: usize) -> Option<&'a [T]> {
        let (archetype, column) = self.typed_column::<T>(self.rw_count + index)?;

        // SAFETY: The column type was checked, and read slots are never handed out mutably.
        let ptr = unsafe { archetype.component_ptr(self.chunk, column, self.begin as u16) };
        Some(unsafe { core::slice::from_raw_parts(ptr.cast::<T>(), self.len()) })
    }

    /// Write access to write slot `index`. `None` when an optional component is absent, the
    /// type does not match or the slot is already borrowed.
    #[allow(clippy::mut_from_ref)]
    pub fn rw<T: Component>(&self, index: usize) -> Option<&mut [T]> {
        if index >= self.rw_count {
            log::error!("write slot {} out of range ({} declared)", index, self.rw_count);
            self.errors.contract_violation();
            return None;
        }
        if !self.writable {
            log::error!("write access through a read only query");
            self.errors.contract_violation();
            return None;
        }

        let (archetype, column) = self.typed_column::<T>(index)?;

        let bit = 1u64 << index;
        if self.borrowed.get() & bit != 0 {
            log::error!("write slot {} borrowed twice in one view", index);
            self.errors.contract_violation();
            return None;
        }
        self.borrowed.set(self.borrowed.get() | bit);

        // SAFETY: The column type was checked. Write slots never share a column with another
        //         slot, the borrow bit makes this the only reference to the slot in this view,
        //         and views over the same chunk cover disjoint row ranges.
        let ptr = unsafe { archetype.component_ptr(self.chunk, column, self.begin as u16) };
        Some(unsafe { core::slice::from_raw_parts_mut(ptr.cast::<T>(), self.len()) })
    }
}

/// What a query callback may do with the world: read components the running query does not
/// write, and queue structural changes and events for the next tick.
///
/// There is no immediate structural or dispatch API here, those need `&mut World`.
pub struct QueryContext<'a> {
    world: &'a World,
    /// Components written by the running query.
    guard: &'a [ComponentID],
}

impl<'a> QueryContext<'a> {
    pub(crate) fn new(world: &'a World, guard: &'a [ComponentID]) -> Self {
        Self { world, guard }
    }

    pub fn create_entity_async(&self, template: &str, overrides: ComponentsInit) -> EntityId {
        self.world.create_entity_async(template, overrides)
    }

    pub fn destroy_entity_async(&self, eid: EntityId) -> bool {
        self.world.destroy_entity_async(eid)
    }

    pub fn recreate_entity_async(&self, eid: EntityId, template: &str, overrides: ComponentsInit) -> EntityId {
        self.world.recreate_entity_async(eid, template, overrides)
    }

    pub fn send_event<E: EcsEvent>(&self, eid: EntityId, event: E) {
        self.world.queue_event(EventTarget::Entity(eid), Event::new(event));
    }

    pub fn broadcast_event<E: EcsEvent>(&self, event: E) {
        self.world.queue_event(EventTarget::Broadcast, Event::new(event));
    }

    pub fn does_entity_exist(&self, eid: EntityId) -> bool {
        self.world.does_entity_exist(eid)
    }

    pub fn is_loading_entity(&self, eid: EntityId) -> bool {
        self.world.is_loading_entity(eid)
    }

    pub fn get_entity_template_name(&self, eid: EntityId) -> Option<String> {
        self.world.get_entity_template_name(eid)
    }

    pub fn tick(&self) -> u64 {
        self.world.current_tick()
    }

    /// Reads a component of any entity, unless the running query writes it.
    pub fn get<T: Component>(&self, eid: EntityId, key: impl ComponentKey<T>) -> Option<&T> {
        let component = key.resolve(self.world)?;
        if self.guard.contains(&component) {
            log::error!(
                "`{}` is written by the running query and cannot be read through the context",
                self.world.component_name(component)
            );
            self.world.error_counters().contract_violation();
            return None;
        }
        self.world.get(eid, key)
    }

    /// Runs a read only query from inside another query's callback.
    pub fn perform_query_shared(&self, query: QueryID, f: impl FnMut(&QueryView, &QueryContext)) -> bool {
        self.world.perform_query_guarded(query, self.guard, f)
    }
}
