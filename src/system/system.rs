use std::sync::Arc;

use crate::{
    archetype::{ArchetypeID, ArchetypeManager},
    component::{Component, ComponentID, ComponentTypes, DataComponents},
    error::{ErrorCounters, SchemaError},
    event::{event_type, EcsEvent, Event},
    query::{NamedQueryDesc, QueryContext, QueryDesc, QueryID, QueryManager, QueryView},
    util::{ahash_map, AHashMap, IdMap, NameHash},
};

use super::schedule::{stage_mask, Schedule, UpdateStageInfo};

/// What an entity system is being run for.
#[derive(Debug, Clone, Copy)]
pub enum EsPayload<'a> {
    Stage(&'a UpdateStageInfo),
    Event(&'a Event),
}

impl<'a> EsPayload<'a> {
    pub fn stage(&self) -> Option<&'a UpdateStageInfo> {
        match self {
            Self::Stage(info) => Some(info),
            Self::Event(_) => None,
        }
    }

    pub fn event(&self) -> Option<&'a Event> {
        match self {
            Self::Stage(_) => None,
            Self::Event(event) => Some(event),
        }
    }
}

/// The function an entity system runs, once per chunk slice (or once with an empty view for
/// systems without components).
pub type EsFn = Arc<dyn Fn(&EsPayload, &QueryView, &QueryContext) + Send + Sync>;

/// Declaration of an entity system: a component signature, what it subscribes to and the
/// function it runs.
#[derive(Clone)]
pub struct EntitySystemDesc {
    pub name: String,
    query: QueryDesc,
    stages: u32,
    events: Vec<(NameHash, &'static str)>,
    tracked: Vec<String>,
    priority: i32,
    tags: Vec<String>,
    quant: usize,
    function: Option<EsFn>,
}

impl EntitySystemDesc {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            query: QueryDesc::new(),
            stages: 0,
            events: Vec::new(),
            tracked: Vec::new(),
            priority: 0,
            tags: Vec::new(),
            quant: 0,
            function: None,
        }
    }

    pub fn rw<T: Component>(mut self, name: &str) -> Self {
        self.query = self.query.rw::<T>(name);
        self
    }

    pub fn rw_optional<T: Component>(mut self, name: &str) -> Self {
        self.query = self.query.rw_optional::<T>(name);
        self
    }

    pub fn ro<T: Component>(mut self, name: &str) -> Self {
        self.query = self.query.ro::<T>(name);
        self
    }

    pub fn ro_optional<T: Component>(mut self, name: &str) -> Self {
        self.query = self.query.ro_optional::<T>(name);
        self
    }

    pub fn rq(mut self, name: &str) -> Self {
        self.query = self.query.rq(name);
        self
    }

    pub fn no(mut self, name: &str) -> Self {
        self.query = self.query.no(name);
        self
    }

    /// Runs the system with [EventComponentChanged](crate::EventComponentChanged) whenever the
    /// component changes on a matching entity. Marks the component as tracked.
    pub fn track(mut self, name: &str) -> Self {
        self.tracked.push(name.to_string());
        self
    }

    pub fn on_stage(mut self, stage: u32) -> Self {
        let mask = stage_mask(stage);
        if mask == 0 {
            log::error!("system `{}` registered for stage {}, which is out of range", self.name, stage);
        }
        self.stages |= mask;
        self
    }

    pub fn on_event<E: EcsEvent>(mut self) -> Self {
        let event = (event_type::<E>(), E::NAME);
        if !self.events.contains(&event) {
            self.events.push(event);
        }
        self
    }

    /// Lower priorities run first, equal priorities run in registration order.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn tag(mut self, tag: &str) -> Self {
        self.tags.push(tag.to_string());
        self
    }

    /// Minimum rows per parallel job. Zero runs the system on the calling thread.
    pub fn quant(mut self, quant: usize) -> Self {
        self.quant = quant;
        self
    }

    pub fn run(mut self, f: impl Fn(&EsPayload, &QueryView, &QueryContext) + Send + Sync + 'static) -> Self {
        self.function = Some(Arc::new(f));
        self
    }

    pub fn query(&self) -> &QueryDesc {
        &self.query
    }
}

impl core::fmt::Debug for EntitySystemDesc {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EntitySystemDesc")
            .field("name", &self.name)
            .field("query", &self.query)
            .field("stages", &self.stages)
            .field("events", &self.events)
            .field("priority", &self.priority)
            .finish()
    }
}

pub struct EntitySystem {
    pub name: String,
    pub query: QueryID,
    pub stages: u32,
    events: Vec<(NameHash, &'static str)>,
    tracked: Vec<String>,
    tracked_ids: Vec<ComponentID>,
    pub priority: i32,
    pub tags: Vec<String>,
    pub quant: usize,
    pub enabled: bool,
    function: EsFn,
    /// Components written by the system's query, as resolved by the last sync.
    rw_components: Vec<ComponentID>,
    rw_count: usize,
    /// No component signature, so the system runs once per stage or broadcast.
    global: bool,
}

impl EntitySystem {
    #[inline]
    pub fn function(&self) -> &EsFn {
        &self.function
    }

    #[inline]
    pub fn rw_components(&self) -> &[ComponentID] {
        &self.rw_components
    }

    #[inline]
    pub fn rw_count(&self) -> usize {
        self.rw_count
    }

    #[inline]
    pub fn is_global(&self) -> bool {
        self.global
    }

    pub fn handles_event(&self, event: NameHash) -> bool {
        self.events.iter().any(|&(handled, _)| handled == event)
    }

    pub fn tracked(&self) -> &[String] {
        &self.tracked
    }
}

/// A system that applies to an archetype, with the column of every rw/ro slot.
#[derive(Clone)]
pub(crate) struct EsEntry {
    pub system: usize,
    pub columns: Arc<[Option<u16>]>,
}

#[derive(Default)]
pub(crate) struct ArchetypeSystems {
    pub stages: Vec<EsEntry>,
    pub events: IdMap<NameHash, Vec<EsEntry>>,
    pub tracked: IdMap<ComponentID, Vec<EsEntry>>,
}

/// Registered entity systems and, for every archetype, the ordered list of systems that apply.
///
/// # Implementation
/// Per-archetype lists are built incrementally: a sync only visits archetypes created since the
/// previous one. Registering a system, changing the order, tags or enabled state, or registering
/// new components makes the next sync rebuild everything.
pub struct SystemManager {
    systems: Vec<EntitySystem>,
    names: AHashMap<String, usize>,
    schedule: Schedule,
    /// Indices of runnable systems in run order.
    order: Vec<usize>,

    archetypes: Vec<ArchetypeSystems>,
    global_stages: Vec<usize>,
    /// Systems that see a recreate as disappear and appear, per (old, new) archetype pair.
    recreate_cache: AHashMap<(ArchetypeID, ArchetypeID), (Arc<[usize]>, Arc<[usize]>)>,

    dirty: bool,
    seen_components: usize,
}

impl SystemManager {
    pub fn new() -> Self {
        Self {
            systems: Vec::new(),
            names: ahash_map(32),
            schedule: Schedule::default(),
            order: Vec::new(),
            archetypes: Vec::new(),
            global_stages: Vec::new(),
            recreate_cache: ahash_map(16),
            dirty: true,
            seen_components: 0,
        }
    }

    pub fn register(&mut self, desc: EntitySystemDesc, queries: &mut QueryManager) -> Result<usize, SchemaError> {
        if self.names.contains_key(&desc.name) {
            return Err(SchemaError::DuplicateSystem(desc.name));
        }
        let Some(function) = desc.function else {
            return Err(SchemaError::MissingSystemFunction(desc.name));
        };

        let global = desc.query.is_empty();
        let rw_count = desc.query.rw.len();
        let query = queries.create(NamedQueryDesc::new(&desc.name, desc.query))?;

        let index = self.systems.len();
        log::debug!("registered entity system `{}`", desc.name);
        self.names.insert(desc.name.clone(), index);
        self.systems.push(EntitySystem {
            name: desc.name,
            query,
            stages: desc.stages,
            events: desc.events,
            tracked: desc.tracked,
            tracked_ids: Vec::new(),
            priority: desc.priority,
            tags: desc.tags,
            quant: desc.quant,
            enabled: true,
            function,
            rw_components: Vec::new(),
            rw_count,
            global,
        });
        self.dirty = true;

        Ok(index)
    }

    pub fn find(&self, name: &str) -> Option<usize> {
        self.names.get(name).copied()
    }

    #[inline]
    pub fn get(&self, index: usize) -> &EntitySystem {
        &self.systems[index]
    }

    pub fn len(&self) -> usize {
        self.systems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.systems.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EntitySystem> + '_ {
        self.systems.iter()
    }

    /// Runnable systems in run order.
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    pub fn enable(&mut self, name: &str, enabled: bool) -> bool {
        let Some(index) = self.find(name) else {
            return false;
        };
        if self.systems[index].enabled != enabled {
            self.systems[index].enabled = enabled;
            self.dirty = true;
        }
        true
    }

    pub fn set_order(&mut self, names: Vec<String>) {
        self.schedule.set_order(names);
        self.dirty = true;
    }

    pub fn set_tags(&mut self, tags: Option<Vec<String>>) {
        self.schedule.set_tags(tags);
        self.dirty = true;
    }

    /// Forces a full rebuild on the next sync, e.g. after archetypes were renumbered.
    pub fn invalidate(&mut self) {
        self.dirty = true;
    }

    /// Every component name some system tracks.
    pub fn tracked_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.systems
            .iter()
            .flat_map(|system| system.tracked.iter().map(String::as_str))
    }

    pub fn needs_sync(&self, archetypes: &ArchetypeManager, components: &DataComponents) -> bool {
        self.dirty
            || self.seen_components != components.len()
            || self.archetypes.len() != archetypes.len()
    }

    /// Brings the per-archetype lists up to date with the archetype table.
    pub fn sync(
        &mut self,
        queries: &mut QueryManager,
        archetypes: &ArchetypeManager,
        components: &DataComponents,
        types: &ComponentTypes,
        errors: &ErrorCounters,
    ) {
        if !self.needs_sync(archetypes, components) {
            return;
        }

        if self.dirty || self.seen_components != components.len() {
            self.rebuild_order(components);
        }

        for &index in self.order.iter() {
            queries.resolve(self.systems[index].query, archetypes, components, types, errors);
        }

        for system in self.systems.iter_mut() {
            system.rw_components = queries
                .resolved(system.query)
                .map(|(plan, _)| plan.rw_components().collect())
                .unwrap_or_default();
        }

        for archetype in archetypes.iter().skip(self.archetypes.len()) {
            let mut lists = ArchetypeSystems::default();

            for &index in self.order.iter() {
                let system = &self.systems[index];
                let Some((_, matched)) = queries.resolved(system.query) else {
                    continue;
                };
                let Ok(position) = matched.binary_search_by_key(&archetype.id, |found| found.archetype) else {
                    continue;
                };

                let entry = EsEntry {
                    system: index,
                    columns: matched[position].columns.as_slice().into(),
                };
                if system.stages != 0 && !system.global {
                    lists.stages.push(entry.clone());
                }
                for &(event, _) in system.events.iter() {
                    lists.events.entry(event).or_default().push(entry.clone());
                }
                for &component in system.tracked_ids.iter() {
                    if archetype.has_component(component) {
                        lists.tracked.entry(component).or_default().push(entry.clone());
                    }
                }
            }

            self.archetypes.push(lists);
        }
    }

    fn rebuild_order(&mut self, components: &DataComponents) {
        let sorted = self
            .schedule
            .sort(self.systems.iter().map(|system| (system.name.as_str(), system.priority)));
        self.order = sorted
            .into_iter()
            .filter(|&index| {
                let system = &self.systems[index];
                system.enabled && self.schedule.tags_allow(&system.tags)
            })
            .collect();

        for system in self.systems.iter_mut() {
            system.tracked_ids = system
                .tracked
                .iter()
                .filter_map(|name| components.find(name))
                .collect();
        }

        self.global_stages.clear();
        for &index in self.order.iter() {
            let system = &self.systems[index];
            if !system.global {
                continue;
            }
            if system.stages != 0 {
                self.global_stages.push(index);
            }
        }

        self.archetypes.clear();
        self.recreate_cache.clear();
        self.seen_components = components.len();
        self.dirty = false;
        log::trace!("rebuilt entity system order, {} runnable", self.order.len());
    }

    pub(crate) fn archetype(&self, archetype: ArchetypeID) -> Option<&ArchetypeSystems> {
        self.archetypes.get(archetype as usize)
    }

    pub(crate) fn global_stages(&self) -> &[usize] {
        &self.global_stages
    }

    /// Systems handling the disappear event of `old` that don't match `new`, and systems handling
    /// the appear event of `new` that don't match `old`.
    pub(crate) fn recreate_systems(
        &mut self,
        old: ArchetypeID,
        new: ArchetypeID,
        disappear: NameHash,
        appear: NameHash,
    ) -> (Arc<[usize]>, Arc<[usize]>) {
        if let Some(cached) = self.recreate_cache.get(&(old, new)) {
            return cached.clone();
        }

        let matching = |archetype: ArchetypeID, event: NameHash| -> Vec<usize> {
            self.archetypes
                .get(archetype as usize)
                .and_then(|lists| lists.events.get(&event))
                .map(|entries| entries.iter().map(|entry| entry.system).collect())
                .unwrap_or_default()
        };
        let applies = |archetype: ArchetypeID, system: usize| -> bool {
            self.archetypes.get(archetype as usize).is_some_and(|lists| {
                lists
                    .stages
                    .iter()
                    .chain(lists.events.values().flatten())
                    .chain(lists.tracked.values().flatten())
                    .any(|entry| entry.system == system)
            })
        };

        let gone: Vec<usize> = matching(old, disappear)
            .into_iter()
            .filter(|&system| !applies(new, system))
            .collect();
        let came: Vec<usize> = matching(new, appear)
            .into_iter()
            .filter(|&system| !applies(old, system))
            .collect();

        let result: (Arc<[usize]>, Arc<[usize]>) = (gone.into(), came.into());
        self.recreate_cache.insert((old, new), result.clone());
        result
    }

    /// Forgets every system.
    pub fn clear(&mut self, queries: &mut QueryManager) {
        for system in self.systems.drain(..) {
            queries.destroy(system.query);
        }
        self.names.clear();
        self.order.clear();
        self.archetypes.clear();
        self.global_stages.clear();
        self.recreate_cache.clear();
        self.dirty = true;
    }
}

impl Default for SystemManager {
    fn default() -> Self {
        Self::new()
    }
}
