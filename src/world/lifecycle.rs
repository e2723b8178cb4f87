use crate::{
    archetype::Column,
    component::{ComponentID, ComponentValue, ComponentsInit, DataComponents, TypeHooks, EID_COMPONENT},
    entity::{EntityId, EntityState},
    error::ErrorCounters,
    event::{event_type, Event, EventComponentsAppear, EventComponentsDisappear, EventEntityCreated, EventEntityDestroyed, EventEntityRecreated},
    resource::PendingSpawn,
    system::Command,
    template::ResolvedTemplate,
};

use super::World;

/// The value a freshly initialised column gets: the creation override if it has the right type,
/// the template default otherwise.
fn initial_value<'v>(
    components: &DataComponents,
    errors: &ErrorCounters,
    template: &'v ResolvedTemplate,
    overrides: &'v ComponentsInit,
    component: ComponentID,
    hooks: &TypeHooks,
) -> Option<&'v ComponentValue> {
    if let Some(value) = overrides.get(components.name(component)) {
        if value.type_id() == hooks.type_id {
            return Some(value);
        }
        log::error!(
            "override of `{}` is `{}`, the component is `{}`",
            components.name(component),
            value.type_name(),
            hooks.name
        );
        errors.type_mismatch();
    }
    template.default(component)
}

/// # Safety
/// - `ptr` must be valid for writes of the type described by `hooks`, and uninitialised.
unsafe fn write_initial(value: Option<&ComponentValue>, hooks: &TypeHooks, ptr: *mut u8) {
    unsafe {
        match value {
            Some(value) => (hooks.clone_into)(value.as_ptr(), ptr),
            None => (hooks.write_default)(ptr),
        }
    }
}

impl World {
    /// Allocates an entity and queues its creation for the next [World::tick]. The returned id
    /// can be compared and stored right away, but the entity is not queryable until spawned.
    pub fn create_entity_async(&self, template: &str, overrides: ComponentsInit) -> EntityId {
        let eid = {
            let mut entities = self.entities.write();
            let Some(eid) = entities.allocate() else {
                log::error!("out of entity indices, cannot create `{}`", template);
                self.errors.access();
                return EntityId::INVALID;
            };
            if let (Some(desc), Some(id)) = (entities.get_mut(eid), self.templates.find(template)) {
                desc.template = id;
            }
            eid
        };

        self.commands.lock().create(eid, template, overrides);
        log::trace!("queued creation of {} from `{}`", eid, template);
        eid
    }

    /// Creates and spawns an entity immediately. Templates whose values need external resources
    /// must be created asynchronously.
    pub fn create_entity_sync(&mut self, template: &str, overrides: ComponentsInit) -> EntityId {
        if self.refuse_constrained("create_entity_sync") {
            return EntityId::INVALID;
        }

        let resolved = match self.build_template(template) {
            Ok(resolved) => resolved,
            Err(err) => {
                log::error!("cannot create entity: {}", err);
                self.errors.template_failure();
                return EntityId::INVALID;
            }
        };

        let resources = requested_resources(&self.components, &resolved, &overrides);
        if !resources.is_empty() {
            log::error!(
                "`{}` needs resources {:?} and cannot be created synchronously",
                template,
                resources
            );
            self.errors.resource_failure();
            return EntityId::INVALID;
        }

        let Some(eid) = self.entities.get_mut().allocate() else {
            log::error!("out of entity indices, cannot create `{}`", template);
            self.errors.access();
            return EntityId::INVALID;
        };

        self.spawn(eid, &resolved, &overrides);
        eid
    }

    /// Queues the destruction of an entity, returning false if it does not exist or is already
    /// being destroyed. The entity stays readable until the next [World::tick].
    pub fn destroy_entity_async(&self, eid: EntityId) -> bool {
        {
            let mut entities = self.entities.write();
            let Some(desc) = entities.get_mut(eid) else {
                return false;
            };
            if desc.state == EntityState::Destroying {
                return false;
            }
            desc.state = EntityState::Destroying;
        }

        self.commands.lock().destroy(eid);
        log::trace!("queued destruction of {}", eid);
        true
    }

    /// Queues switching an entity to another template. Values still equal to the old template's
    /// defaults take the new defaults, instance specific values survive.
    pub fn recreate_entity_async(&self, eid: EntityId, template: &str, overrides: ComponentsInit) -> EntityId {
        if !self.does_entity_exist(eid) {
            log::warn!("cannot recreate {} as `{}`, the entity does not exist", eid, template);
            return EntityId::INVALID;
        }

        self.commands.lock().recreate(eid, template, overrides);
        log::trace!("queued recreation of {} as `{}`", eid, template);
        eid
    }

    /// Applies queued commands. Commands queued by the notifications of a pass are applied by
    /// the next pass, up to `passes` passes.
    pub(crate) fn flush_commands(&mut self, passes: usize) {
        let mut deferred = Vec::new();

        for _ in 0..passes.max(1) {
            let batch = self.commands.get_mut().take();
            if batch.is_empty() {
                break;
            }

            for command in batch {
                if let Command::Recreate { eid, .. } = &command {
                    if self.is_loading_entity(*eid) {
                        deferred.push(command);
                        continue;
                    }
                }

                match command {
                    Command::Create { eid, template, overrides } => self.handle_create(eid, &template, overrides),
                    Command::Recreate { eid, template, overrides } => self.handle_recreate(eid, &template, &overrides),
                    Command::Destroy { eid } => self.destroy_now(eid),
                }
            }
        }

        let queue = self.commands.get_mut();
        for command in deferred {
            queue.requeue(command);
        }

        self.resources.submit();
        self.process_load_results();
    }

    /// Spawns entities whose resources finished loading.
    pub(crate) fn process_load_results(&mut self) {
        for result in self.resources.receive() {
            for eid in result.entities {
                let Some(pending) = self.resources.take(eid) else {
                    log::debug!("discarding load result for {}, no longer waiting", eid);
                    continue;
                };

                if !result.success {
                    log::error!("resources of {} failed to load, it stays loading", eid);
                    self.errors.resource_failure();
                    continue;
                }
                if !self.is_loading_entity(eid) {
                    continue;
                }

                self.spawn(eid, &pending.template, &pending.overrides);
            }
        }
    }

    fn handle_create(&mut self, eid: EntityId, template: &str, overrides: ComponentsInit) {
        if !self.is_loading_entity(eid) {
            log::trace!("skipping creation of {}, destroyed before spawning", eid);
            return;
        }

        let resolved = match self.build_template(template) {
            Ok(resolved) => resolved,
            Err(err) => {
                log::error!("cannot create {}: {}", eid, err);
                self.errors.template_failure();
                self.entities.get_mut().free(eid);
                return;
            }
        };
        if let Some(desc) = self.entities.get_mut().get_mut(eid) {
            desc.template = resolved.id;
        }

        let resources = requested_resources(&self.components, &resolved, &overrides);
        if resources.is_empty() {
            self.spawn(eid, &resolved, &overrides);
        } else {
            log::trace!("{} waits on {} resources", eid, resources.len());
            let spawn = PendingSpawn {
                template: resolved,
                overrides,
            };
            self.resources.request(eid, spawn, resources);
        }
    }

    /// Gives a loading entity its archetype slot and fires the creation event.
    fn spawn(&mut self, eid: EntityId, template: &ResolvedTemplate, overrides: &ComponentsInit) {
        if !self.is_loading_entity(eid) {
            return;
        }

        let archetype_id = self.archetype_for_template(template);
        self.check_overrides(template, overrides);

        // SAFETY: The id was just handed out by the archetype manager.
        let archetype = unsafe { self.archetypes.get_unchecked_mut(archetype_id) };
        let (chunk, slot) = archetype.allocate_slot();

        for (index, column) in archetype.columns().iter().enumerate() {
            // SAFETY: The slot was just allocated, so the row is in bounds and uninitialised.
            unsafe {
                let ptr = archetype.component_ptr(chunk, index, slot);
                if column.component == EID_COMPONENT {
                    ptr.cast::<EntityId>().write(eid);
                    continue;
                }
                let value = initial_value(
                    &self.components,
                    &self.errors,
                    template,
                    overrides,
                    column.component,
                    &column.hooks,
                );
                write_initial(value, &column.hooks, ptr);
            }
        }

        if let Some(desc) = self.entities.get_mut().get_mut(eid) {
            desc.archetype = archetype_id;
            desc.chunk = chunk;
            desc.slot = slot;
            desc.template = template.id;
            desc.state = EntityState::Alive;
        }
        self.register_singleton(template, eid);
        log::trace!("spawned {} from `{}` in archetype {}", eid, template.name, archetype_id);

        self.dispatch_entity_event(eid, &Event::new(EventEntityCreated));
    }

    fn check_overrides(&self, template: &ResolvedTemplate, overrides: &ComponentsInit) {
        for (name, _) in overrides.iter() {
            let known = self
                .components
                .find(name)
                .is_some_and(|component| template.has(component));
            if !known {
                log::warn!("override `{}` is not a component of `{}`, ignoring", name, template.name);
                self.errors.access();
            }
        }
    }

    fn handle_recreate(&mut self, eid: EntityId, template: &str, overrides: &ComponentsInit) {
        let Some(desc) = self.entities.get_mut().get(eid).copied() else {
            log::warn!("cannot recreate {}, the entity no longer exists", eid);
            return;
        };
        if desc.state != EntityState::Alive {
            log::debug!("skipping recreation of {}, it is being destroyed", eid);
            return;
        }

        let new = match self.build_template(template) {
            Ok(new) => new,
            Err(err) => {
                log::error!("cannot recreate {}: {}", eid, err);
                self.errors.template_failure();
                return;
            }
        };
        let old = self
            .templates
            .build(desc.template, &mut self.components, &mut self.types)
            .ok();

        if self.migrate_entity(eid, &new, old.as_deref(), overrides) {
            self.dispatch_entity_event(eid, &Event::new(EventEntityRecreated));
        }
    }

    /// Moves an alive entity to the archetype of `new`.
    ///
    /// Components only in the new archetype get their override or the new default. Carried over
    /// components whose value equals the `old` default get the new default, then overrides are
    /// applied. Systems that stop or start matching see disappear and appear events.
    pub(crate) fn migrate_entity(
        &mut self,
        eid: EntityId,
        new: &ResolvedTemplate,
        old: Option<&ResolvedTemplate>,
        overrides: &ComponentsInit,
    ) -> bool {
        let Some(desc) = self.entities.get_mut().get(eid).copied().filter(|desc| desc.has_slot()) else {
            return false;
        };
        let source = desc.archetype;
        let target = self.archetype_for_template(new);
        self.check_overrides(new, overrides);

        let (mut chunk, mut slot) = (desc.chunk, desc.slot);
        let mut appeared = None;

        if target != source {
            self.sync_systems();
            let (gone, came) = self.systems.recreate_systems(
                source,
                target,
                event_type::<EventComponentsDisappear>(),
                event_type::<EventComponentsAppear>(),
            );
            self.run_systems_on_row(&gone, source, chunk, slot, &Event::new(EventComponentsDisappear));

            let components = &self.components;
            let errors = &self.errors;
            // SAFETY: Both archetypes exist and differ, and the descriptor points at the entity's
            //         initialised row.
            (chunk, slot) = unsafe {
                self.archetypes.move_entity(
                    source,
                    chunk,
                    slot,
                    target,
                    |component, hooks, ptr| {
                        let value = initial_value(components, errors, new, overrides, component, hooks);
                        write_initial(value, hooks, ptr);
                    },
                    self.entities.get_mut(),
                )
            };
            appeared = Some(came);
        }

        if let Some(desc) = self.entities.get_mut().get_mut(eid) {
            desc.archetype = target;
            desc.chunk = chunk;
            desc.slot = slot;
            desc.template = new.id;
        }

        let Some(archetype) = self.archetypes.get(target) else {
            return false;
        };
        let carried_from = self.archetypes.get(source);
        let columns: Vec<(usize, Column)> = archetype
            .columns()
            .iter()
            .copied()
            .enumerate()
            .skip(1)
            .filter(|(_, column)| carried_from.is_some_and(|from| from.has_component(column.component)))
            .collect();

        for (index, column) in columns {
            // SAFETY: The entity's row is initialised and the column belongs to its archetype.
            let ptr = unsafe { archetype.component_ptr(chunk, index, slot) };
            let name = self.components.name(column.component);

            let mut replacement = None;
            let untouched = old
                .and_then(|old| old.default(column.component))
                // SAFETY: Defaults of a component have the column's type.
                .is_some_and(|default| unsafe { default.eq_raw(ptr) });
            if untouched {
                replacement = new.default(column.component);
            }
            match overrides.get(name) {
                Some(value) if value.type_id() == column.hooks.type_id => replacement = Some(value),
                Some(value) => {
                    log::error!("override of `{}` is `{}`, the component is `{}`", name, value.type_name(), column.hooks.name);
                    self.errors.type_mismatch();
                }
                None => {}
            }

            let Some(value) = replacement else {
                continue;
            };
            // SAFETY: Same type as the column, checked above or guaranteed by the template.
            if unsafe { value.eq_raw(ptr) } {
                continue;
            }
            unsafe { (column.hooks.assign)(value.as_ptr(), ptr) };

            if self.components.get(column.component).flags.tracked {
                self.tracker.schedule(target, eid, column.component);
            }
        }

        if let Some(came) = appeared {
            self.run_systems_on_row(&came, target, chunk, slot, &Event::new(EventComponentsAppear));
        }
        log::trace!("migrated {} to `{}` (archetype {} -> {})", eid, new.name, source, target);

        true
    }

    /// Fires the destruction event and frees the entity's slot and index.
    fn destroy_now(&mut self, eid: EntityId) {
        let Some(desc) = self.entities.get_mut().get(eid).copied() else {
            log::trace!("{} was already destroyed", eid);
            return;
        };

        if desc.has_slot() {
            self.dispatch_entity_event(eid, &Event::new(EventEntityDestroyed));

            if let Some(desc) = self.entities.get_mut().get(eid).copied() {
                // SAFETY: The descriptor of an entity with a slot points at an initialised row of
                //         an existing archetype, whose stored ids index valid descriptors.
                unsafe {
                    self.archetypes.get_unchecked_mut(desc.archetype).remove_slot(
                        desc.chunk,
                        desc.slot,
                        |_| true,
                        self.entities.get_mut(),
                    )
                };
            }
        } else if self.resources.cancel(eid) {
            log::debug!("cancelled resource loading of {}", eid);
        }

        self.unregister_singleton(eid);
        self.entities.get_mut().free(eid);
        log::trace!("destroyed {}", eid);
    }
}

/// Resources named by the values the entity will be spawned with. An override replaces the
/// template default of its component.
fn requested_resources(components: &DataComponents, template: &ResolvedTemplate, overrides: &ComponentsInit) -> Vec<String> {
    let mut requested = Vec::new();
    for (component, value) in template.defaults() {
        if overrides.get(components.name(component)).is_none() {
            value.resources(&mut requested);
        }
    }
    for (name, value) in overrides.iter() {
        if components.find(name).is_some_and(|component| template.has(component)) {
            value.resources(&mut requested);
        }
    }

    let mut resources: Vec<String> = Vec::with_capacity(requested.len());
    for resource in requested {
        if !resources.contains(&resource) {
            resources.push(resource);
        }
    }
    resources
}
