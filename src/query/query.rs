use std::borrow::Cow;

use crate::{
    archetype::{Archetype, ArchetypeID, ArchetypeManager},
    component::{ComponentID, ComponentTypes, DataComponents},
    error::{ErrorCounters, SchemaError},
    util::{id_map, IdMap},
};

use super::{
    desc::{ComponentRef, NamedQueryDesc, QueryDesc},
    filter::{Filter, FilterBuilder},
};

/// Handle to a persistent query. Stale handles (destroyed queries) never resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueryID {
    index: u32,
    generation: u32,
}

impl QueryID {
    pub const INVALID: Self = Self {
        index: u32::MAX,
        generation: 0,
    };

    #[inline]
    pub fn index(self) -> u32 {
        self.index
    }

    #[inline]
    pub fn generation(self) -> u32 {
        self.generation
    }

    #[inline]
    pub fn is_valid(self) -> bool {
        self.index != u32::MAX
    }
}

/// A matching archetype and, for every read/write slot, the column it maps to.
///
/// Slots are ordered `rw` first, then `ro`. A `None` column is an optional component the
/// archetype lacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryArchetype {
    pub archetype: ArchetypeID,
    pub columns: Vec<Option<u16>>,
}

/// Component ids and the archetype filter of a query, for one state of the component table.
#[derive(Clone)]
pub(crate) struct QueryPlan {
    pub filter: Filter,
    /// Component of every rw/ro slot, `None` when the name is not registered yet.
    pub slots: Vec<Option<ComponentID>>,
    pub rw_count: usize,
}

impl QueryPlan {
    pub fn new(
        name: &str,
        desc: &QueryDesc,
        components: &DataComponents,
        types: &ComponentTypes,
        errors: &ErrorCounters,
    ) -> Self {
        let mut builder = FilterBuilder::with_capacity(desc.rw.len() + desc.ro.len() + desc.rq.len());
        let mut slots = Vec::with_capacity(desc.rw.len() + desc.ro.len());

        for component in desc.rw.iter().chain(desc.ro.iter()) {
            let id = components.find_hash(component.hash);
            match id {
                Some(id) if !type_matches(component, id, components, types) => {
                    log::error!(
                        "query `{}`: component `{}` is `{}`, the query expects `{}`",
                        name,
                        component.name,
                        types.name(components.get(id).type_id),
                        component.type_name
                    );
                    errors.type_mismatch();
                    builder = builder.unresolved();
                }
                Some(id) if !component.optional => builder = builder.and(id),
                None if !component.optional => builder = builder.unresolved(),
                _ => {}
            }
            slots.push(id);
        }

        for component in desc.rq.iter() {
            builder = match components.find_hash(component.hash) {
                Some(id) => builder.and(id),
                None => builder.unresolved(),
            };
        }

        for component in desc.no.iter() {
            if let Some(id) = components.find_hash(component.hash) {
                builder = builder.not(id);
            }
        }

        Self {
            filter: builder.build(),
            slots,
            rw_count: desc.rw.len(),
        }
    }

    pub fn match_archetype(&self, archetype: &Archetype) -> Option<QueryArchetype> {
        if !self.filter.matches_archetype(archetype) {
            return None;
        }

        let columns = self
            .slots
            .iter()
            .map(|slot| {
                slot.and_then(|component| archetype.column_index(component))
                    .map(|column| column as u16)
            })
            .collect();

        Some(QueryArchetype {
            archetype: archetype.id,
            columns,
        })
    }

    pub fn rw_components(&self) -> impl Iterator<Item = ComponentID> + '_ {
        self.slots[..self.rw_count].iter().flatten().copied()
    }
}

fn type_matches(
    component: &ComponentRef,
    id: ComponentID,
    components: &DataComponents,
    types: &ComponentTypes,
) -> bool {
    match component.type_id {
        Some(type_id) => types.hooks(components.get(id).type_id).type_id == type_id,
        None => true,
    }
}

struct ResolvedQuery {
    name: String,
    desc: QueryDesc,
    hash: u64,
    refcount: u32,

    plan: Option<QueryPlan>,
    archetypes: Vec<QueryArchetype>,
    /// Archetypes below this id have been tested against the plan.
    seen_archetypes: usize,
    /// Size of the component table the plan was built against.
    seen_components: usize,
}

impl ResolvedQuery {
    fn is_current(&self, archetypes: &ArchetypeManager, components: &DataComponents) -> bool {
        self.plan.is_some()
            && self.seen_components == components.len()
            && self.seen_archetypes == archetypes.len()
    }
}

/// Persistent queries, shared by content and resolved lazily.
///
/// # Implementation
/// A query keeps the list of archetypes it matched so far and the archetype count at that point.
/// Archetypes are append-only between compactions, so bringing a query up to date only tests the
/// tail. Registering components can turn an unresolved name into a resolved one, so a change of
/// the component table rebuilds the plan and matches everything again.
pub struct QueryManager {
    queries: Vec<Option<ResolvedQuery>>,
    generations: Vec<u32>,
    free: Vec<u32>,
    by_hash: IdMap<u64, u32>,
}

impl QueryManager {
    pub fn new() -> Self {
        Self {
            queries: Vec::new(),
            generations: Vec::new(),
            free: Vec::new(),
            by_hash: id_map(32),
        }
    }

    /// Creates a query, or returns the existing query with the same lists with its reference
    /// count incremented.
    pub fn create(&mut self, named: NamedQueryDesc) -> Result<QueryID, SchemaError> {
        named.desc.validate(&named.name)?;

        let hash = named.desc.content_hash();
        if let Some(&index) = self.by_hash.get(&hash) {
            if let Some(query) = self.queries[index as usize].as_mut() {
                query.refcount += 1;
                return Ok(QueryID {
                    index,
                    generation: self.generations[index as usize],
                });
            }
        }

        let query = ResolvedQuery {
            name: named.name,
            desc: named.desc,
            hash,
            refcount: 1,
            plan: None,
            archetypes: Vec::new(),
            seen_archetypes: 0,
            seen_components: 0,
        };
        log::debug!("created query `{}`", query.name);

        let index = match self.free.pop() {
            Some(index) => {
                self.queries[index as usize] = Some(query);
                index
            }
            None => {
                self.queries.push(Some(query));
                self.generations.push(0);
                (self.queries.len() - 1) as u32
            }
        };
        self.by_hash.insert(hash, index);

        Ok(QueryID {
            index,
            generation: self.generations[index as usize],
        })
    }

    /// Drops one reference, returning true when the query was destroyed.
    pub fn destroy(&mut self, id: QueryID) -> bool {
        let Some(query) = self.get_mut(id) else {
            return false;
        };

        query.refcount -= 1;
        if query.refcount > 0 {
            return false;
        }

        let hash = query.hash;
        log::debug!("destroyed query `{}`", query.name);
        self.queries[id.index as usize] = None;
        self.generations[id.index as usize] = self.generations[id.index as usize].wrapping_add(1);
        self.free.push(id.index);
        self.by_hash.remove(&hash);

        true
    }

    fn get(&self, id: QueryID) -> Option<&ResolvedQuery> {
        if self.generations.get(id.index as usize) != Some(&id.generation) {
            return None;
        }
        self.queries.get(id.index as usize)?.as_ref()
    }

    fn get_mut(&mut self, id: QueryID) -> Option<&mut ResolvedQuery> {
        if self.generations.get(id.index as usize) != Some(&id.generation) {
            return None;
        }
        self.queries.get_mut(id.index as usize)?.as_mut()
    }

    pub fn exists(&self, id: QueryID) -> bool {
        self.get(id).is_some()
    }

    pub fn name(&self, id: QueryID) -> Option<&str> {
        self.get(id).map(|query| query.name.as_str())
    }

    pub fn desc(&self, id: QueryID) -> Option<&QueryDesc> {
        self.get(id).map(|query| &query.desc)
    }

    pub fn refcount(&self, id: QueryID) -> u32 {
        self.get(id).map_or(0, |query| query.refcount)
    }

    pub fn len(&self) -> usize {
        self.by_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_hash.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = QueryID> + '_ {
        self.queries
            .iter()
            .enumerate()
            .filter(|(_, query)| query.is_some())
            .map(|(index, _)| QueryID {
                index: index as u32,
                generation: self.generations[index],
            })
    }

    /// Brings the cached resolution up to date with the archetype and component tables.
    pub fn resolve(
        &mut self,
        id: QueryID,
        archetypes: &ArchetypeManager,
        components: &DataComponents,
        types: &ComponentTypes,
        errors: &ErrorCounters,
    ) -> bool {
        let Some(query) = self.get_mut(id) else {
            return false;
        };

        if query.plan.is_none() || query.seen_components != components.len() {
            query.plan = Some(QueryPlan::new(&query.name, &query.desc, components, types, errors));
            query.archetypes.clear();
            query.seen_archetypes = 0;
            query.seen_components = components.len();
        }

        let Some(plan) = query.plan.as_ref() else {
            return false;
        };

        for archetype in archetypes.iter().skip(query.seen_archetypes) {
            if let Some(matched) = plan.match_archetype(archetype) {
                query.archetypes.push(matched);
            }
        }
        query.seen_archetypes = archetypes.len();

        true
    }

    /// Matched archetypes and the plan they were matched with, assuming [Self::resolve] ran.
    pub(crate) fn resolved(&self, id: QueryID) -> Option<(&QueryPlan, &[QueryArchetype])> {
        let query = self.get(id)?;
        Some((query.plan.as_ref()?, &query.archetypes))
    }

    /// Matched archetypes without updating the cache. Whatever the cache misses is evaluated on
    /// the fly.
    pub(crate) fn resolved_shared<'a>(
        &'a self,
        id: QueryID,
        archetypes: &ArchetypeManager,
        components: &DataComponents,
        types: &ComponentTypes,
        errors: &ErrorCounters,
    ) -> Option<(Cow<'a, QueryPlan>, Cow<'a, [QueryArchetype]>)> {
        let query = self.get(id)?;

        if query.is_current(archetypes, components) {
            let plan = query.plan.as_ref()?;
            return Some((Cow::Borrowed(plan), Cow::Borrowed(&query.archetypes)));
        }

        let (plan, mut matched, start) = match query.plan.as_ref() {
            Some(plan) if query.seen_components == components.len() => {
                (Cow::Borrowed(plan), query.archetypes.clone(), query.seen_archetypes)
            }
            _ => (
                Cow::Owned(QueryPlan::new(&query.name, &query.desc, components, types, errors)),
                Vec::new(),
                0,
            ),
        };

        for archetype in archetypes.iter().skip(start) {
            if let Some(found) = plan.match_archetype(archetype) {
                matched.push(found);
            }
        }

        Some((plan, Cow::Owned(matched)))
    }

    /// Forgets every resolution, e.g. after archetypes were renumbered.
    pub fn invalidate_all(&mut self) {
        for query in self.queries.iter_mut().flatten() {
            query.plan = None;
            query.archetypes.clear();
            query.seen_archetypes = 0;
        }
    }

    pub fn clear(&mut self) {
        self.queries.clear();
        self.generations.clear();
        self.free.clear();
        self.by_hash.clear();
    }
}

impl Default for QueryManager {
    fn default() -> Self {
        Self::new()
    }
}
