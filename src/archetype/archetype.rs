use core::{alloc::Layout, ptr};
use std::collections::HashMap;

use fixedbitset::FixedBitSet;

use crate::{
    component::{ComponentID, ComponentTypeID, ComponentTypes, DataComponents, TypeHooks, EID_COMPONENT},
    config::EcsConfig,
    entity::{EntityId, EntityManager},
    util::{align_up, get_two_mut_unchecked},
};

use super::chunk::Chunk;

/// Unique sequential integer
pub type ArchetypeID = u32;

/// One component column of an archetype.
#[derive(Debug, Clone, Copy)]
pub struct Column {
    pub component: ComponentID,
    pub type_id: ComponentTypeID,
    pub hooks: TypeHooks,
    /// Byte offset of the column from the start of each chunk.
    pub offset: usize,
}

/// Storage for every entity that has exactly this set of components.
///
/// # Implementation
/// Rows live in fixed-capacity [Chunk]s, each holding one contiguous array per column (SoA). A
/// chunk is kept dense: removing a row moves the chunk's last row into the hole, so the free part
/// of a chunk is always its tail. Chunks themselves are never released until the archetype table
/// is compacted.
///
/// Column 0 is always the entity id column, as components are sorted and [EID_COMPONENT] is 0.
pub struct Archetype {
    pub id: ArchetypeID,

    /// Sorted component IDs, one per column.
    components: Vec<ComponentID>,

    /// A bitset that represents the component IDs that are present within this archetype,
    /// where the index of each set bit corresponds to the component ID.
    pub component_bitset: FixedBitSet,

    columns: Vec<Column>,
    capacity: u16,
    chunk_layout: Layout,
    chunks: Vec<Chunk>,

    /// No chunk before this index has a free slot.
    first_free_chunk: usize,
    entity_count: usize,
}

#[cold]
#[inline(never)]
#[track_caller]
fn layout_overflow(components: &[ComponentID]) -> ! {
    panic!("chunk layout for archetype {:?} overflows", components);
}

impl Archetype {
    pub fn new(
        id: ArchetypeID,
        components: Vec<ComponentID>,
        data: &DataComponents,
        types: &ComponentTypes,
        config: &EcsConfig,
    ) -> Self {
        debug_assert!(components.windows(2).all(|pair| pair[0] < pair[1]));
        debug_assert_eq!(components.first(), Some(&EID_COMPONENT));

        let column_types: Vec<(ComponentTypeID, TypeHooks)> = components
            .iter()
            .map(|&component| {
                let type_id = data.get(component).type_id;
                (type_id, *types.hooks(type_id))
            })
            .collect();

        let row_stride: usize = column_types.iter().map(|(_, hooks)| hooks.layout.size()).sum();
        let capacity = config.chunk_capacity(row_stride);

        let mut offset = 0usize;
        let mut align = 1usize;
        let mut columns = Vec::with_capacity(components.len());
        for (&component, &(type_id, hooks)) in components.iter().zip(column_types.iter()) {
            offset = align_up(offset, hooks.layout.align());
            align = align.max(hooks.layout.align());
            columns.push(Column {
                component,
                type_id,
                hooks,
                offset,
            });

            let Some(next) = hooks
                .layout
                .size()
                .checked_mul(capacity as usize)
                .and_then(|size| offset.checked_add(size))
            else {
                layout_overflow(&components);
            };
            offset = next;
        }

        let Ok(chunk_layout) = Layout::from_size_align(offset.max(1), align) else {
            layout_overflow(&components);
        };

        let mut component_bitset =
            FixedBitSet::with_capacity(components.last().map_or(0, |&last| last as usize + 1));
        for &component in components.iter() {
            component_bitset.insert(component as usize);
        }

        log::debug!(
            "created archetype {} with {} components, {} rows per chunk ({} bytes)",
            id,
            components.len(),
            capacity,
            chunk_layout.size()
        );

        Self {
            id,
            components,
            component_bitset,
            columns,
            capacity,
            chunk_layout,
            chunks: Vec::new(),
            first_free_chunk: 0,
            entity_count: 0,
        }
    }

    #[inline]
    pub fn components(&self) -> &[ComponentID] {
        &self.components
    }

    #[inline]
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    #[inline]
    pub fn has_component(&self, component: ComponentID) -> bool {
        self.component_bitset.contains(component as usize)
    }

    #[inline]
    pub fn column_index(&self, component: ComponentID) -> Option<usize> {
        self.components.binary_search(&component).ok()
    }

    /// Rows per chunk.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entity_count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entity_count == 0
    }

    #[inline]
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    #[inline]
    pub fn chunk_len(&self, chunk: u32) -> usize {
        self.chunks.get(chunk as usize).map_or(0, Chunk::len)
    }

    pub fn chunk_byte_size(&self) -> usize {
        self.chunk_layout.size()
    }

    pub fn memory_usage(&self) -> usize {
        self.chunks.iter().map(Chunk::byte_size).sum()
    }

    /// Reserves an uninitialised row, allocating a chunk if every existing one is full.
    ///
    /// The caller must initialise every column of the returned row before it is read or removed.
    pub fn allocate_slot(&mut self) -> (u32, u16) {
        let capacity = self.capacity as usize;

        let start = self.first_free_chunk.min(self.chunks.len());
        let index = match self.chunks[start..]
            .iter()
            .position(|chunk| chunk.len() < capacity)
        {
            Some(position) => start + position,
            None => {
                self.chunks.push(Chunk::new(self.chunk_layout));
                self.chunks.len() - 1
            }
        };
        self.first_free_chunk = index;

        let chunk = &mut self.chunks[index];
        let slot = chunk.len();
        chunk.set_len(slot + 1);
        self.entity_count += 1;

        (index as u32, slot as u16)
    }

    /// Pointer to the value of a column in the given row.
    ///
    /// # Safety
    /// - The chunk, column and slot must be within bounds.
    #[inline(always)]
    pub unsafe fn component_ptr(&self, chunk: u32, column: usize, slot: u16) -> *mut u8 {
        debug_assert!((chunk as usize) < self.chunks.len());
        debug_assert!((slot as usize) < self.capacity as usize);

        // SAFETY: Bounds are guaranteed by the caller, and each column spans `capacity` values.
        unsafe {
            let column = self.columns.get_unchecked(column);
            self.chunks
                .get_unchecked(chunk as usize)
                .as_ptr()
                .add(column.offset + column.hooks.layout.size() * slot as usize)
        }
    }

    /// The initialised part of a column as a typed slice.
    ///
    /// # Safety
    /// - `T` must be the column's type.
    /// - The chunk and column must be within bounds.
    #[inline]
    pub unsafe fn column_slice<T: 'static>(&self, chunk: u32, column: usize) -> &[T] {
        debug_assert!(self.columns[column].hooks.is::<T>());
        unsafe {
            let chunk_ref = self.chunks.get_unchecked(chunk as usize);
            let ptr = chunk_ref.as_ptr().add(self.columns.get_unchecked(column).offset);
            core::slice::from_raw_parts(ptr.cast::<T>(), chunk_ref.len())
        }
    }

    /// The initialised part of a column as a mutable typed slice.
    ///
    /// # Safety
    /// - `T` must be the column's type.
    /// - The chunk and column must be within bounds.
    /// - No other reference to this column of this chunk may exist while the slice is alive.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn column_slice_mut<T: 'static>(&self, chunk: u32, column: usize) -> &mut [T] {
        debug_assert!(self.columns[column].hooks.is::<T>());
        unsafe {
            let chunk_ref = self.chunks.get_unchecked(chunk as usize);
            let ptr = chunk_ref.as_ptr().add(self.columns.get_unchecked(column).offset);
            core::slice::from_raw_parts_mut(ptr.cast::<T>(), chunk_ref.len())
        }
    }

    /// Checked typed access to one column of a chunk.
    pub fn column<T: 'static>(&self, chunk: u32, component: ComponentID) -> Option<&[T]> {
        let column = self.column_index(component)?;
        if (chunk as usize) >= self.chunks.len() || !self.columns[column].hooks.is::<T>() {
            return None;
        }

        // SAFETY: Type and bounds were checked above.
        Some(unsafe { self.column_slice::<T>(chunk, column) })
    }

    #[inline]
    pub fn entities(&self, chunk: u32) -> &[EntityId] {
        if (chunk as usize) >= self.chunks.len() {
            return &[];
        }

        // SAFETY: Column 0 always holds entity ids.
        unsafe { self.column_slice::<EntityId>(chunk, 0) }
    }

    /// Removes a row, keeping the chunk dense by moving its last row into the hole.
    ///
    /// Columns for which `drop_column` returns false are treated as already moved out and are
    /// not dropped. The descriptor of the entity moved into the hole is updated, and its id is
    /// returned.
    ///
    /// # Safety
    /// - The chunk and slot must refer to an initialised row.
    /// - The entity ids stored in this archetype must index valid descriptors.
    pub unsafe fn remove_slot(
        &mut self,
        chunk: u32,
        slot: u16,
        drop_column: impl Fn(usize) -> bool,
        entities: &mut EntityManager,
    ) -> Option<EntityId> {
        let last = (self.chunk_len(chunk) - 1) as u16;
        debug_assert!(slot <= last);

        for (index, column) in self.columns.iter().enumerate() {
            if column.hooks.needs_drop && drop_column(index) {
                // SAFETY: The row is initialised, as guaranteed by the caller.
                unsafe { (column.hooks.drop)(self.component_ptr(chunk, index, slot)) };
            }
        }

        let mut moved = None;
        if slot != last {
            for (index, column) in self.columns.iter().enumerate() {
                // SAFETY: Both rows are in bounds and distinct, the hole has been dropped or
                //         moved out, so this is a plain move of the last row's values.
                unsafe {
                    ptr::copy_nonoverlapping(
                        self.component_ptr(chunk, index, last),
                        self.component_ptr(chunk, index, slot),
                        column.hooks.layout.size(),
                    )
                };
            }

            // SAFETY: Column 0 holds the entity id, which is now initialised at `slot`.
            let eid = unsafe { *self.component_ptr(chunk, 0, slot).cast::<EntityId>() };
            // SAFETY: Caller guarantees the stored ids index valid descriptors.
            let desc = unsafe { entities.get_by_index_unchecked_mut(eid.index()) };
            desc.slot = slot;
            moved = Some(eid);
        }

        // SAFETY: Chunk index was bounds checked by `chunk_len` above.
        unsafe { self.chunks.get_unchecked_mut(chunk as usize) }.set_len(last as usize);
        self.entity_count -= 1;
        self.first_free_chunk = self.first_free_chunk.min(chunk as usize);

        moved
    }

    /// Drops empty chunks from the end of the chunk list.
    fn release_trailing_chunks(&mut self) {
        while self.chunks.last().is_some_and(Chunk::is_empty) {
            self.chunks.pop();
        }
        self.first_free_chunk = self.first_free_chunk.min(self.chunks.len());
    }
}

impl Drop for Archetype {
    fn drop(&mut self) {
        for (index, column) in self.columns.iter().enumerate() {
            if !column.hooks.needs_drop {
                continue;
            }

            for (chunk_index, chunk) in self.chunks.iter().enumerate() {
                for slot in 0..chunk.len() {
                    // SAFETY: Rows below the chunk length are initialised.
                    unsafe {
                        (column.hooks.drop)(self.component_ptr(chunk_index as u32, index, slot as u16))
                    };
                }
            }
        }
    }
}

pub struct ArchetypeManager {
    /// A map of sorted component id lists to archetype IDs.
    ids: HashMap<Vec<ComponentID>, ArchetypeID, ahash::RandomState>,

    /// A table of all archetypes that exist within the world.
    archetype_table: Vec<Archetype>,

    config: EcsConfig,
}

impl ArchetypeManager {
    pub fn new(config: EcsConfig) -> Self {
        Self {
            ids: HashMap::with_capacity_and_hasher(16, ahash::RandomState::default()),
            archetype_table: Vec::with_capacity(16),
            config,
        }
    }

    /// Returns the archetype for the given sorted component set, creating it if it was never seen.
    pub fn archetype_for(
        &mut self,
        components: &[ComponentID],
        data: &DataComponents,
        types: &ComponentTypes,
    ) -> ArchetypeID {
        if let Some(&id) = self.ids.get(components) {
            return id;
        }

        let id = self.archetype_table.len() as ArchetypeID;
        let archetype = Archetype::new(id, components.to_vec(), data, types, &self.config);
        self.archetype_table.push(archetype);
        self.ids.insert(components.to_vec(), id);

        id
    }

    pub fn find(&self, components: &[ComponentID]) -> Option<ArchetypeID> {
        self.ids.get(components).copied()
    }

    #[inline]
    pub fn get(&self, id: ArchetypeID) -> Option<&Archetype> {
        self.archetype_table.get(id as usize)
    }

    /// # Safety
    /// - The archetype ID must exist within this manager, as no existence check is performed.
    #[inline]
    pub unsafe fn get_unchecked(&self, id: ArchetypeID) -> &Archetype {
        debug_assert!((id as usize) < self.archetype_table.len());
        unsafe { self.archetype_table.get_unchecked(id as usize) }
    }

    /// # Safety
    /// - The archetype ID must exist within this manager, as no existence check is performed.
    #[inline]
    pub unsafe fn get_unchecked_mut(&mut self, id: ArchetypeID) -> &mut Archetype {
        debug_assert!((id as usize) < self.archetype_table.len());
        unsafe { self.archetype_table.get_unchecked_mut(id as usize) }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.archetype_table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.archetype_table.is_empty()
    }

    pub fn iter(&self) -> core::slice::Iter<'_, Archetype> {
        self.archetype_table.iter()
    }

    /// Moves a row from one archetype to another.
    ///
    /// Columns present in both archetypes are moved bitwise, columns only in `dst` are written by
    /// `init`, and columns only in `src` are dropped. Returns the row's new location; updating the
    /// moved entity's own descriptor is left to the caller.
    ///
    /// # Safety
    /// - `src` and `dst` must be distinct archetypes of this manager.
    /// - `chunk` and `slot` must refer to an initialised row of `src`.
    /// - `init` must initialise the pointer it is handed with a value of the given type.
    pub unsafe fn move_entity(
        &mut self,
        src: ArchetypeID,
        chunk: u32,
        slot: u16,
        dst: ArchetypeID,
        mut init: impl FnMut(ComponentID, &TypeHooks, *mut u8),
        entities: &mut EntityManager,
    ) -> (u32, u16) {
        // SAFETY: Caller guarantees the archetypes exist and are distinct.
        let (src_arche, dst_arche) = unsafe {
            get_two_mut_unchecked(&mut self.archetype_table, src as usize, dst as usize)
        };

        let (dst_chunk, dst_slot) = dst_arche.allocate_slot();
        let mut moved = vec![false; src_arche.columns.len()];

        for (dst_index, column) in dst_arche.columns.iter().enumerate() {
            // SAFETY: The slot was just allocated, so every index is in bounds.
            let dst_ptr = unsafe { dst_arche.component_ptr(dst_chunk, dst_index, dst_slot) };

            match src_arche.column_index(column.component) {
                Some(src_index) => {
                    moved[src_index] = true;
                    // SAFETY: Same component, so same type and size; rows are initialised and in
                    //         different allocations.
                    unsafe {
                        ptr::copy_nonoverlapping(
                            src_arche.component_ptr(chunk, src_index, slot),
                            dst_ptr,
                            column.hooks.layout.size(),
                        )
                    };
                }
                None => init(column.component, &column.hooks, dst_ptr),
            }
        }

        // SAFETY: The row is initialised, moved columns are excluded from dropping.
        unsafe { src_arche.remove_slot(chunk, slot, |index| !moved[index], entities) };

        (dst_chunk, dst_slot)
    }

    /// Removes archetypes without entities and renumbers the rest, returning the new ID of every
    /// old archetype (`None` for removed ones).
    pub fn compact(&mut self) -> Vec<Option<ArchetypeID>> {
        let old_table = core::mem::take(&mut self.archetype_table);
        let mut remap = Vec::with_capacity(old_table.len());
        self.ids.clear();

        for mut archetype in old_table {
            if archetype.is_empty() {
                remap.push(None);
                continue;
            }

            let id = self.archetype_table.len() as ArchetypeID;
            archetype.id = id;
            archetype.release_trailing_chunks();
            self.ids.insert(archetype.components.clone(), id);
            self.archetype_table.push(archetype);
            remap.push(Some(id));
        }

        log::debug!(
            "compacted archetypes: {} kept, {} removed",
            self.archetype_table.len(),
            remap.iter().filter(|id| id.is_none()).count()
        );

        remap
    }

    pub fn clear(&mut self) {
        self.archetype_table.clear();
        self.ids.clear();
    }

    pub fn memory_usage(&self) -> usize {
        self.archetype_table.iter().map(Archetype::memory_usage).sum()
    }
}

#[cfg(test)]
mod tests {
    use crate::component::ComponentFlags;

    use super::*;

    struct Fixture {
        types: ComponentTypes,
        data: DataComponents,
        pos: ComponentID,
        name: ComponentID,
    }

    fn fixture() -> Fixture {
        let mut types = ComponentTypes::new();
        let mut data = DataComponents::new(&mut types);
        let pos_type = types.register::<[f32; 3]>();
        let name_type = types.register::<String>();
        let pos = data.register("pos", pos_type, ComponentFlags::NONE, &types).unwrap();
        let name = data.register("name", name_type, ComponentFlags::NONE, &types).unwrap();

        Fixture {
            types,
            data,
            pos,
            name,
        }
    }

    fn config() -> EcsConfig {
        EcsConfig {
            chunk_byte_budget: 64,
            min_chunk_capacity: 2,
            max_chunk_capacity: 4,
            ..EcsConfig::default()
        }
    }

    unsafe fn spawn(
        archetype: &mut Archetype,
        entities: &mut EntityManager,
        name: &str,
    ) -> EntityId {
        let eid = entities.allocate().unwrap();
        let (chunk, slot) = archetype.allocate_slot();
        unsafe {
            archetype.component_ptr(chunk, 0, slot).cast::<EntityId>().write(eid);
            archetype.component_ptr(chunk, 1, slot).cast::<[f32; 3]>().write([slot as f32; 3]);
            archetype.component_ptr(chunk, 2, slot).cast::<String>().write(name.to_string());
        }

        let desc = entities.get_mut(eid).unwrap();
        desc.archetype = archetype.id;
        desc.chunk = chunk;
        desc.slot = slot;
        eid
    }

    #[test]
    fn archetype_is_idempotent() {
        let f = fixture();
        let mut manager = ArchetypeManager::new(config());

        let a = manager.archetype_for(&[EID_COMPONENT, f.pos], &f.data, &f.types);
        let b = manager.archetype_for(&[EID_COMPONENT, f.pos, f.name], &f.data, &f.types);
        assert_ne!(a, b);
        assert_eq!(manager.archetype_for(&[EID_COMPONENT, f.pos], &f.data, &f.types), a);
        assert_eq!(manager.len(), 2);

        let archetype = manager.get(b).unwrap();
        assert!(archetype.has_component(f.name));
        assert!(!archetype.has_component(200));
        assert_eq!(archetype.column_index(f.name), Some(2));
    }

    #[test]
    fn column_offsets_are_aligned() {
        let f = fixture();
        let mut manager = ArchetypeManager::new(EcsConfig::default());
        let id = manager.archetype_for(&[EID_COMPONENT, f.pos, f.name], &f.data, &f.types);
        let archetype = manager.get(id).unwrap();

        for column in archetype.columns() {
            assert_eq!(column.offset % column.hooks.layout.align(), 0);
        }
    }

    #[test]
    fn slots_fill_chunks_in_order() {
        let f = fixture();
        let mut manager = ArchetypeManager::new(config());
        let id = manager.archetype_for(&[EID_COMPONENT, f.pos, f.name], &f.data, &f.types);
        let mut entities = EntityManager::new(0);
        let archetype = unsafe { manager.get_unchecked_mut(id) };
        let capacity = archetype.capacity();

        for i in 0..capacity + 1 {
            unsafe { spawn(archetype, &mut entities, &format!("e{i}")) };
        }

        assert_eq!(archetype.chunk_count(), 2);
        assert_eq!(archetype.chunk_len(0), capacity);
        assert_eq!(archetype.chunk_len(1), 1);
        assert_eq!(archetype.len(), capacity + 1);
    }

    #[test]
    fn remove_keeps_chunk_dense() {
        let f = fixture();
        let mut manager = ArchetypeManager::new(config());
        let id = manager.archetype_for(&[EID_COMPONENT, f.pos, f.name], &f.data, &f.types);
        let mut entities = EntityManager::new(0);
        let archetype = unsafe { manager.get_unchecked_mut(id) };

        let first = unsafe { spawn(archetype, &mut entities, "first") };
        let second = unsafe { spawn(archetype, &mut entities, "second") };

        let desc = *entities.get(first).unwrap();
        let moved = unsafe { archetype.remove_slot(desc.chunk, desc.slot, |_| true, &mut entities) };
        assert_eq!(moved, Some(second));
        assert_eq!(archetype.entities(0), &[second]);
        assert_eq!(entities.get(second).unwrap().slot, 0);
        assert_eq!(archetype.column::<String>(0, f.name).unwrap(), &["second".to_string()]);

        // The freed slot is reused by the next allocation
        unsafe { spawn(archetype, &mut entities, "third") };
        assert_eq!(archetype.chunk_count(), 1);
        assert_eq!(archetype.chunk_len(0), 2);
    }

    #[test]
    fn move_entity_between_archetypes() {
        let f = fixture();
        let mut manager = ArchetypeManager::new(config());
        let full = manager.archetype_for(&[EID_COMPONENT, f.pos, f.name], &f.data, &f.types);
        let reduced = manager.archetype_for(&[EID_COMPONENT, f.name], &f.data, &f.types);
        let mut entities = EntityManager::new(0);

        let eid = unsafe { spawn(manager.get_unchecked_mut(full), &mut entities, "mover") };
        let desc = *entities.get(eid).unwrap();

        let mut initialised = Vec::new();
        let (chunk, slot) = unsafe {
            manager.move_entity(
                full,
                desc.chunk,
                desc.slot,
                reduced,
                |component, _, _| initialised.push(component),
                &mut entities,
            )
        };
        assert!(initialised.is_empty());
        assert!(manager.get(full).unwrap().is_empty());

        let target = manager.get(reduced).unwrap();
        assert_eq!(target.entities(chunk), &[eid]);
        assert_eq!(target.column::<String>(chunk, f.name).unwrap()[slot as usize], "mover");

        // Moving back has to initialise the missing position
        let back = unsafe {
            manager.move_entity(
                reduced,
                chunk,
                slot,
                full,
                |component, hooks, ptr| {
                    initialised.push(component);
                    unsafe { (hooks.write_default)(ptr) };
                },
                &mut entities,
            )
        };
        assert_eq!(initialised, vec![f.pos]);
        let source = manager.get(full).unwrap();
        assert_eq!(source.column::<[f32; 3]>(back.0, f.pos).unwrap(), &[[0.0; 3]]);
    }

    #[test]
    fn compact_renumbers() {
        let f = fixture();
        let mut manager = ArchetypeManager::new(config());
        let empty = manager.archetype_for(&[EID_COMPONENT, f.pos], &f.data, &f.types);
        let used = manager.archetype_for(&[EID_COMPONENT, f.pos, f.name], &f.data, &f.types);
        let mut entities = EntityManager::new(0);
        unsafe { spawn(manager.get_unchecked_mut(used), &mut entities, "kept") };

        let remap = manager.compact();
        assert_eq!(remap[empty as usize], None);
        assert_eq!(remap[used as usize], Some(0));
        assert_eq!(manager.len(), 1);
        assert_eq!(manager.find(&[EID_COMPONENT, f.pos, f.name]), Some(0));
        assert_eq!(manager.find(&[EID_COMPONENT, f.pos]), None);
    }
}
