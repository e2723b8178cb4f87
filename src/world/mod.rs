use core::{
    any::{Any, TypeId},
    sync::atomic::{AtomicU32, Ordering},
};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::{
    archetype::{ArchetypeID, ArchetypeManager},
    component::{ChangeTracker, ComponentDecl, ComponentID, ComponentTypes, DataComponents},
    config::EcsConfig,
    entity::{EntityId, EntityManager, EntityState, INVALID_ARCHETYPE},
    error::{ConfigError, ErrorCounters, SchemaError, TemplateError},
    event::{EventQueue, EventsDb},
    executor::{Executor, ScopedExecutor},
    query::{NamedQueryDesc, QueryID, QueryManager},
    resource::{ResourceLoader, ResourceManager},
    system::{CommandQueue, EntitySystemDesc, SystemManager},
    template::{AddTemplateResult, RemoveTemplateResult, ResolvedTemplate, TemplateDb, TemplateDesc, TemplateID},
    util::{ahash_map, id_map, AHashMap, IdMap},
};

mod access;
mod dispatch;
mod lifecycle;

pub use access::{ComponentEntry, ComponentHandle, ComponentKey};

type ReplicationHook = Box<dyn Fn(EntityId, ComponentID) + Send + Sync>;

/// The engine context: component schema, templates, archetype storage, entities, queries and
/// entity systems.
///
/// Structural changes (spawning, recreating, destroying) either go through `&mut self` or are
/// queued from `&self` and applied by [World::tick]. Query callbacks only ever see `&World`
/// through a [QueryContext](crate::QueryContext).
pub struct World {
    pub(crate) types: ComponentTypes,
    pub(crate) components: DataComponents,
    pub(crate) templates: TemplateDb,
    pub(crate) archetypes: ArchetypeManager,
    /// Also serves as the creation lock for index allocation from query callbacks.
    pub(crate) entities: RwLock<EntityManager>,
    pub(crate) queries: QueryManager,
    pub(crate) systems: SystemManager,
    pub(crate) events_db: EventsDb,
    pub(crate) commands: Mutex<CommandQueue>,
    pub(crate) events: Mutex<EventQueue>,
    pub(crate) tracker: ChangeTracker,
    pub(crate) resources: ResourceManager,

    template_archetypes: IdMap<TemplateID, ArchetypeID>,
    singletons: AHashMap<String, EntityId>,
    constrained: AtomicU32,
    pub(crate) errors: ErrorCounters,
    config: EcsConfig,
    executor: Arc<dyn Executor>,
    tick: u64,

    /// Values handed out by failed `get_rw` calls, one per type.
    scratch: AHashMap<TypeId, Box<dyn Any + Send + Sync>>,
    replication_hook: Option<ReplicationHook>,
}

impl World {
    pub fn new() -> Self {
        Self::with_config(EcsConfig::default())
    }

    /// Builds a world from a config that has already been checked, for example one loaded
    /// through [EcsConfig::from_toml_str]. An invalid config is logged and its chunk capacity
    /// bounds are repaired. Use [World::try_with_config] to reject it instead.
    pub fn with_config(config: EcsConfig) -> Self {
        let executor = Arc::new(ScopedExecutor::from_config(&config));
        Self::with_executor(config, executor)
    }

    pub fn try_with_config(config: EcsConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::with_config(config))
    }

    pub fn with_executor(config: EcsConfig, executor: Arc<dyn Executor>) -> Self {
        if let Err(err) = config.validate() {
            log::warn!("{}, chunk capacity falls back to at least one row", err);
        }

        let mut types = ComponentTypes::new();
        let components = DataComponents::new(&mut types);

        Self {
            types,
            components,
            templates: TemplateDb::new(),
            archetypes: ArchetypeManager::new(config.clone()),
            entities: RwLock::new(EntityManager::new(config.min_free_indices)),
            queries: QueryManager::new(),
            systems: SystemManager::new(),
            events_db: EventsDb::new(),
            commands: Mutex::new(CommandQueue::new()),
            events: Mutex::new(EventQueue::new()),
            tracker: ChangeTracker::new(),
            resources: ResourceManager::new(),
            template_archetypes: id_map(64),
            singletons: ahash_map(8),
            constrained: AtomicU32::new(0),
            errors: ErrorCounters::default(),
            config,
            executor,
            tick: 0,
            scratch: ahash_map(8),
            replication_hook: None,
        }
    }

    pub fn config(&self) -> &EcsConfig {
        &self.config
    }

    pub fn error_counters(&self) -> &ErrorCounters {
        &self.errors
    }

    pub fn current_tick(&self) -> u64 {
        self.tick
    }

    pub fn component_types(&self) -> &ComponentTypes {
        &self.types
    }

    pub fn data_components(&self) -> &DataComponents {
        &self.components
    }

    pub fn archetypes(&self) -> &ArchetypeManager {
        &self.archetypes
    }

    pub fn templates(&self) -> &TemplateDb {
        &self.templates
    }

    pub fn component_name(&self, component: ComponentID) -> &str {
        self.components.name(component)
    }

    pub fn events_db(&self) -> &EventsDb {
        &self.events_db
    }

    pub fn events_db_mut(&mut self) -> &mut EventsDb {
        &mut self.events_db
    }

    /// Enters (or, with `false`, leaves) constrained multithreaded mode. Calls nest.
    ///
    /// While active, synchronous structural changes and registration are refused, events are
    /// only queued and change tracking is postponed, which is what allows quantized systems to
    /// run on worker threads.
    pub fn set_constrained_mt_mode(&self, enabled: bool) {
        if enabled {
            self.constrained.fetch_add(1, Ordering::AcqRel);
            return;
        }

        let left = self
            .constrained
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |depth| depth.checked_sub(1));
        if left.is_err() {
            log::error!("constrained multithreaded mode left more often than entered");
            self.errors.contract_violation();
        }
    }

    #[inline]
    pub fn is_constrained_mt_mode(&self) -> bool {
        self.constrained.load(Ordering::Acquire) > 0
    }

    /// Logs and counts an operation refused by constrained multithreaded mode.
    fn refuse_constrained(&self, operation: &str) -> bool {
        if !self.is_constrained_mt_mode() {
            return false;
        }
        log::error!("`{}` is not allowed in constrained multithreaded mode", operation);
        self.errors.contract_violation();
        true
    }

    pub fn set_resource_loader(&mut self, loader: Option<Box<dyn ResourceLoader>>) {
        self.resources.set_loader(loader);
    }

    /// Called with every write to a component flagged as replicated.
    pub fn set_replication_hook(&mut self, hook: impl Fn(EntityId, ComponentID) + Send + Sync + 'static) {
        self.replication_hook = Some(Box::new(hook));
    }

    /// Registers an ordered table of components. Dependencies may name components declared later
    /// in the same table.
    pub fn register_components(&mut self, decls: &[ComponentDecl]) -> Result<(), SchemaError> {
        if self.refuse_constrained("register_components") {
            return Err(SchemaError::ConstrainedMode);
        }

        for decl in decls.iter() {
            let type_id = (decl.register_type)(&mut self.types);
            self.components.register(&decl.name, type_id, decl.flags, &self.types)?;
        }

        for decl in decls.iter() {
            let Some(component) = self.components.find(&decl.name) else {
                continue;
            };
            for dependency in decl.dependencies.iter() {
                let Some(dependency_id) = self.components.find(dependency) else {
                    return Err(SchemaError::UnknownDependency {
                        component: decl.name.clone(),
                        dependency: dependency.clone(),
                    });
                };
                self.components.add_dependency(component, dependency_id);
            }
        }

        // Dependencies can invalidate previously valid templates
        self.templates.invalidate_all();
        self.resolve_live_templates();
        Ok(())
    }

    pub fn register_entity_system(&mut self, desc: EntitySystemDesc) -> Result<(), SchemaError> {
        if self.refuse_constrained("register_entity_system") {
            return Err(SchemaError::ConstrainedMode);
        }
        self.systems.register(desc, &mut self.queries).map(|_| ())
    }

    pub fn entity_systems(&self) -> &SystemManager {
        &self.systems
    }

    pub fn enable_es(&mut self, name: &str, enabled: bool) -> bool {
        self.systems.enable(name, enabled)
    }

    /// Runs the named systems first, in the given order.
    pub fn set_es_order(&mut self, names: &[&str]) {
        self.systems.set_order(names.iter().map(|name| name.to_string()).collect());
    }

    /// Only systems without tags or with one of these tags run. `None` runs everything.
    pub fn set_es_tags(&mut self, tags: Option<&[&str]>) {
        self.systems
            .set_tags(tags.map(|tags| tags.iter().map(|tag| tag.to_string()).collect()));
    }

    /// Brings the per-archetype system lists up to date, marking tracked components first.
    pub(crate) fn sync_systems(&mut self) {
        if !self.systems.needs_sync(&self.archetypes, &self.components) {
            return;
        }

        let tracked: Vec<ComponentID> = self
            .systems
            .tracked_names()
            .filter_map(|name| self.components.find(name))
            .collect();
        for component in tracked {
            self.components.mark_tracked(component);
        }

        self.systems
            .sync(&mut self.queries, &self.archetypes, &self.components, &self.types, &self.errors);
    }

    pub fn add_template(&mut self, desc: TemplateDesc) -> AddTemplateResult {
        if self.refuse_constrained("add_template") {
            return AddTemplateResult::Refused;
        }
        self.templates.add(desc, &self.components, &self.types)
    }

    /// Replaces a template. With `update_existing_values`, entities of the template and of every
    /// template inheriting from it get the new defaults for every component whose value still
    /// equals the old default, and move to the new component set.
    pub fn update_template(&mut self, desc: TemplateDesc, update_existing_values: bool) -> Result<(), TemplateError> {
        if self.refuse_constrained("update_template") {
            return Err(TemplateError::ConstrainedMode);
        }

        let id = self
            .templates
            .find(&desc.name)
            .ok_or_else(|| TemplateError::UnknownTemplate(desc.name.clone()))?;

        let affected = self.templates.dependents(id);
        let old: Vec<(TemplateID, Option<Arc<ResolvedTemplate>>)> = affected
            .iter()
            .map(|&template| {
                let resolved = self.templates.build(template, &mut self.components, &mut self.types).ok();
                (template, resolved)
            })
            .collect();

        self.templates.update(desc, &self.components, &self.types)?;
        for &template in affected.iter() {
            self.template_archetypes.remove(&template);
        }

        if !update_existing_values {
            self.resolve_live_templates();
            return Ok(());
        }

        let targets: Vec<(EntityId, TemplateID)> = self
            .entities
            .get_mut()
            .iter()
            .filter(|(_, desc)| desc.has_slot() && affected.contains(&desc.template))
            .map(|(eid, desc)| (eid, desc.template))
            .collect();

        for (eid, template) in targets {
            let new = match self.templates.build(template, &mut self.components, &mut self.types) {
                Ok(new) => new,
                Err(err) => {
                    log::error!("cannot update entity {}: {}", eid, err);
                    self.errors.template_failure();
                    continue;
                }
            };
            let previous = old
                .iter()
                .find(|(id, _)| *id == template)
                .and_then(|(_, resolved)| resolved.clone());
            self.migrate_entity(eid, &new, previous.as_deref(), &Default::default());
        }

        self.resolve_live_templates();
        Ok(())
    }

    pub fn remove_template(&mut self, name: &str) -> RemoveTemplateResult {
        if self.refuse_constrained("remove_template") {
            return RemoveTemplateResult::Refused;
        }

        let entities = self.entities.get_mut();
        let result = self
            .templates
            .remove(name, |id| entities.iter().any(|(_, desc)| desc.template == id));
        if result == RemoveTemplateResult::Removed {
            self.template_archetypes.retain(|&id, _| self.templates.name(id).is_some());
        }
        result
    }

    /// Restricts which tagged template components are instantiated by future spawns.
    pub fn set_template_filter_tags(&mut self, tags: Option<Vec<String>>) {
        self.templates.set_filter_tags(tags);
        self.template_archetypes.clear();
        self.resolve_live_templates();
    }

    /// Re-resolves every template that placed entities still refer to, so default comparisons
    /// from `&self` never find an empty cache.
    fn resolve_live_templates(&mut self) {
        let mut live: Vec<TemplateID> = self
            .entities
            .get_mut()
            .iter()
            .filter(|(_, desc)| desc.has_slot())
            .map(|(_, desc)| desc.template)
            .collect();
        live.sort_unstable();
        live.dedup();

        for template in live {
            if let Err(err) = self.templates.build(template, &mut self.components, &mut self.types) {
                log::warn!("template #{} no longer resolves: {}", template, err);
            }
        }
    }

    pub(crate) fn build_template(&mut self, name: &str) -> Result<Arc<ResolvedTemplate>, TemplateError> {
        self.templates
            .build_by_name(name, &mut self.components, &mut self.types)
    }

    pub(crate) fn archetype_for_template(&mut self, template: &ResolvedTemplate) -> ArchetypeID {
        if let Some(&archetype) = self.template_archetypes.get(&template.id) {
            return archetype;
        }

        let archetype = self
            .archetypes
            .archetype_for(template.components(), &self.components, &self.types);
        self.template_archetypes.insert(template.id, archetype);
        archetype
    }

    pub fn create_query(&mut self, desc: NamedQueryDesc) -> Result<QueryID, SchemaError> {
        self.queries.create(desc)
    }

    /// Drops one reference to the query, returning true when it was destroyed.
    pub fn destroy_query(&mut self, query: QueryID) -> bool {
        self.queries.destroy(query)
    }

    pub fn query_name(&self, query: QueryID) -> Option<&str> {
        self.queries.name(query)
    }

    pub fn query_refcount(&self, query: QueryID) -> u32 {
        self.queries.refcount(query)
    }

    /// Number of entities the query currently matches.
    pub fn query_size(&self, query: QueryID) -> usize {
        let Some((_, matched)) =
            self.queries
                .resolved_shared(query, &self.archetypes, &self.components, &self.types, &self.errors)
        else {
            return 0;
        };

        matched
            .iter()
            .filter_map(|found| self.archetypes.get(found.archetype))
            .map(|archetype| archetype.len())
            .sum()
    }

    pub fn get_singleton_entity(&self, name: &str) -> EntityId {
        match self.singletons.get(name) {
            Some(&eid) if self.does_entity_exist(eid) => eid,
            _ => EntityId::INVALID,
        }
    }

    /// The singleton of the template `name`, spawned synchronously if it does not exist yet.
    pub fn get_or_create_singleton_entity(&mut self, name: &str) -> EntityId {
        let existing = self.get_singleton_entity(name);
        if existing.is_valid() {
            return existing;
        }
        self.create_entity_sync(name, Default::default())
    }

    pub(crate) fn register_singleton(&mut self, template: &ResolvedTemplate, eid: EntityId) {
        if !template.singleton {
            return;
        }

        let previous = self.singletons.insert(template.name.clone(), eid);
        if let Some(previous) = previous.filter(|&previous| previous != eid && self.does_entity_exist(previous)) {
            log::warn!(
                "singleton `{}` replaced: {} takes over from {}",
                template.name,
                eid,
                previous
            );
        }
    }

    pub(crate) fn unregister_singleton(&mut self, eid: EntityId) {
        self.singletons.retain(|_, singleton| *singleton != eid);
    }

    /// Removes archetypes without entities and renumbers the rest. Pending tracked changes are
    /// flushed first, as they refer to archetypes by id.
    pub fn defrag_archetypes(&mut self) -> bool {
        if self.refuse_constrained("defrag_archetypes") {
            return false;
        }

        self.perform_track_changes(true);
        self.tracker.clear_snapshots();

        let remap = self.archetypes.compact();
        for (_, desc) in self.entities.get_mut().iter_mut() {
            if desc.has_slot() {
                desc.archetype = remap
                    .get(desc.archetype as usize)
                    .copied()
                    .flatten()
                    .unwrap_or(INVALID_ARCHETYPE);
            }
        }
        self.template_archetypes.retain(|_, archetype| {
            match remap.get(*archetype as usize).copied().flatten() {
                Some(id) => {
                    *archetype = id;
                    true
                }
                None => false,
            }
        });

        self.queries.invalidate_all();
        self.systems.invalidate();
        true
    }

    /// Destroys every entity at once, without notifications, and drops every queued command,
    /// event and tracked change.
    pub fn clear(&mut self) {
        log::debug!("clearing world with {} entities", self.entities.get_mut().len());

        self.commands.get_mut().clear();
        self.events.get_mut().clear();
        self.tracker.clear();
        self.resources.clear();
        self.archetypes.clear();
        self.entities.get_mut().clear();
        self.template_archetypes.clear();
        self.singletons.clear();
        self.queries.invalidate_all();
        self.systems.invalidate();
    }

    pub fn num_entities(&self) -> usize {
        self.entities.read().len()
    }

    /// True from creation until the destruction has been flushed, including while loading.
    pub fn does_entity_exist(&self, eid: EntityId) -> bool {
        self.entities.read().exists(eid)
    }

    pub fn is_loading_entity(&self, eid: EntityId) -> bool {
        self.entities
            .read()
            .get(eid)
            .is_some_and(|desc| desc.state == EntityState::Loading)
    }

    pub fn entity_state(&self, eid: EntityId) -> EntityState {
        self.entities
            .read()
            .get(eid)
            .map_or(EntityState::Free, |desc| desc.state)
    }

    pub fn get_entity_template_name(&self, eid: EntityId) -> Option<String> {
        let template = self.entities.read().get(eid)?.template;
        self.templates.name(template).map(str::to_string)
    }
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}
