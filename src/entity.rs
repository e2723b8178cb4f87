use std::collections::VecDeque;

use crate::{archetype::ArchetypeID, template::TemplateID};

const INDEX_BITS: u32 = 22;
const INDEX_MASK: u32 = (1 << INDEX_BITS) - 1;
const GENERATION_MASK: u32 = 0xff;

/// Largest dense index an entity can occupy.
pub const MAX_ENTITY_INDEX: u32 = INDEX_MASK;

pub const INVALID_ARCHETYPE: ArchetypeID = ArchetypeID::MAX;
pub const INVALID_TEMPLATE: TemplateID = TemplateID::MAX;

/// Handle to an entity: a 22 bit dense index and an 8 bit generation.
///
/// Index 0 with generation 0 is the null handle, and index 0 is never handed out.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct EntityId(u32);

impl EntityId {
    pub const INVALID: Self = Self(0);

    #[inline]
    pub const fn new(index: u32, generation: u8) -> Self {
        Self((index & INDEX_MASK) | ((generation as u32) << INDEX_BITS))
    }

    #[inline]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    #[inline]
    pub const fn to_bits(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn index(self) -> u32 {
        self.0 & INDEX_MASK
    }

    #[inline]
    pub const fn generation(self) -> u8 {
        ((self.0 >> INDEX_BITS) & GENERATION_MASK) as u8
    }

    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl core::fmt::Debug for EntityId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}:{}", self.index(), self.generation())
    }
}

impl core::fmt::Display for EntityId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}:{}", self.index(), self.generation())
    }
}

impl nohash_hasher::IsEnabled for EntityId {}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntityState {
    Free,
    /// Allocated, but without an archetype slot yet (queued or waiting for resources).
    Loading,
    Alive,
    /// Destruction is queued, the entity stays readable until the queue is flushed.
    Destroying,
}

/// Where an entity lives. Kept at 16 bytes: the chunk index is a full `u32` so archetypes of
/// one-row chunks never run out of chunks.
#[derive(Clone, Copy, Debug)]
pub struct EntityDesc {
    pub archetype: ArchetypeID,
    pub chunk: u32,
    pub slot: u16,
    pub generation: u8,
    pub state: EntityState,
    pub template: TemplateID,
}

impl Default for EntityDesc {
    fn default() -> Self {
        Self {
            archetype: INVALID_ARCHETYPE,
            chunk: 0,
            slot: 0,
            generation: 0,
            state: EntityState::Free,
            template: INVALID_TEMPLATE,
        }
    }
}

impl EntityDesc {
    #[inline]
    pub fn has_slot(&self) -> bool {
        self.archetype != INVALID_ARCHETYPE
    }
}

/// Dense table of entity descriptors, indexed by [EntityId::index].
pub struct EntityManager {
    descs: Vec<EntityDesc>,
    free_indices: VecDeque<u32>,
    min_free_indices: usize,
    live: usize,
}

impl EntityManager {
    pub fn new(min_free_indices: usize) -> Self {
        let mut descs = Vec::with_capacity(64);
        // Index 0 is reserved so that the null handle never matches a live descriptor
        descs.push(EntityDesc::default());

        Self {
            descs,
            free_indices: VecDeque::new(),
            min_free_indices,
            live: 0,
        }
    }

    /// Allocates a dense index in the [EntityState::Loading] state.
    ///
    /// Freed indices are recycled in FIFO order once more than `min_free_indices` of them are
    /// queued, so a freshly freed index is not handed out again straight away.
    pub fn allocate(&mut self) -> Option<EntityId> {
        let index = if self.free_indices.len() > self.min_free_indices {
            self.free_indices.pop_front()?
        } else if (self.descs.len() as u32) <= MAX_ENTITY_INDEX {
            self.descs.push(EntityDesc::default());
            (self.descs.len() - 1) as u32
        } else {
            // Out of fresh indices, recycle regardless of the reuse delay
            self.free_indices.pop_front()?
        };

        let desc = &mut self.descs[index as usize];
        debug_assert_eq!(desc.state, EntityState::Free);
        desc.state = EntityState::Loading;
        desc.archetype = INVALID_ARCHETYPE;
        desc.template = INVALID_TEMPLATE;
        self.live += 1;

        Some(EntityId::new(index, desc.generation))
    }

    /// Returns the descriptor if the handle refers to a non-free slot with a matching generation.
    #[inline]
    pub fn get(&self, eid: EntityId) -> Option<&EntityDesc> {
        let desc = self.descs.get(eid.index() as usize)?;
        (desc.generation == eid.generation() && desc.state != EntityState::Free && eid.is_valid())
            .then_some(desc)
    }

    #[inline]
    pub fn get_mut(&mut self, eid: EntityId) -> Option<&mut EntityDesc> {
        let desc = self.descs.get_mut(eid.index() as usize)?;
        (desc.generation == eid.generation() && desc.state != EntityState::Free && eid.is_valid())
            .then_some(desc)
    }

    /// # Safety
    /// - The index must be within the bounds of the descriptor table.
    #[inline]
    pub unsafe fn get_by_index_unchecked_mut(&mut self, index: u32) -> &mut EntityDesc {
        debug_assert!((index as usize) < self.descs.len());
        unsafe { self.descs.get_unchecked_mut(index as usize) }
    }

    #[inline]
    pub fn exists(&self, eid: EntityId) -> bool {
        self.get(eid).is_some()
    }

    /// Returns the index to the free queue, bumping its generation so that stale handles no
    /// longer resolve.
    pub fn free(&mut self, eid: EntityId) -> bool {
        let Some(desc) = self.get_mut(eid) else {
            return false;
        };

        desc.generation = desc.generation.wrapping_add(1);
        desc.state = EntityState::Free;
        desc.archetype = INVALID_ARCHETYPE;
        desc.template = INVALID_TEMPLATE;
        self.free_indices.push_back(eid.index());
        self.live -= 1;

        true
    }

    /// Number of allocated entities, alive or loading.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn capacity(&self) -> usize {
        self.descs.len()
    }

    pub fn free_count(&self) -> usize {
        self.free_indices.len()
    }

    /// Iterates every allocated entity.
    pub fn iter(&self) -> impl Iterator<Item = (EntityId, &EntityDesc)> + '_ {
        self.descs
            .iter()
            .enumerate()
            .skip(1)
            .filter(|(_, desc)| desc.state != EntityState::Free)
            .map(|(index, desc)| (EntityId::new(index as u32, desc.generation), desc))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (EntityId, &mut EntityDesc)> + '_ {
        self.descs
            .iter_mut()
            .enumerate()
            .skip(1)
            .filter(|(_, desc)| desc.state != EntityState::Free)
            .map(|(index, desc)| (EntityId::new(index as u32, desc.generation), desc))
    }

    /// Frees every allocated entity.
    pub fn clear(&mut self) {
        let live: Vec<EntityId> = self.iter().map(|(eid, _)| eid).collect();
        for eid in live {
            self.free(eid);
        }
    }
}
