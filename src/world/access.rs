use core::{any::TypeId, marker::PhantomData};

use crate::{
    component::{Component, ComponentID, ComponentTypeID, ComponentValue, TypeHooks},
    entity::{EntityDesc, EntityId},
    error::AccessError,
};

use super::World;

/// Something that names a component: its string name, or a [ComponentHandle] resolved once
/// up front.
pub trait ComponentKey<T: Component>: Copy {
    fn resolve(self, world: &World) -> Option<ComponentID>;

    /// For log lines.
    fn describe(self, world: &World) -> String;
}

impl<T: Component> ComponentKey<T> for &str {
    fn resolve(self, world: &World) -> Option<ComponentID> {
        world.components.find(self)
    }

    fn describe(self, _world: &World) -> String {
        self.to_string()
    }
}

/// A component id whose payload type was checked to be `T`.
pub struct ComponentHandle<T> {
    id: ComponentID,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ComponentHandle<T> {
    pub fn id(self) -> ComponentID {
        self.id
    }
}

impl<T> Clone for ComponentHandle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ComponentHandle<T> {}

impl<T> core::fmt::Debug for ComponentHandle<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "ComponentHandle({})", self.id)
    }
}

impl<T: Component> ComponentKey<T> for ComponentHandle<T> {
    fn resolve(self, _world: &World) -> Option<ComponentID> {
        Some(self.id)
    }

    fn describe(self, world: &World) -> String {
        world.component_name(self.id).to_string()
    }
}

/// One component of an entity, as listed by [World::entity_components].
pub struct ComponentEntry<'a> {
    pub name: &'a str,
    pub component: ComponentID,
    pub type_id: ComponentTypeID,
    hooks: &'a TypeHooks,
    ptr: *const u8,
}

impl<'a> ComponentEntry<'a> {
    pub fn type_name(&self) -> &'static str {
        self.hooks.name
    }

    /// Copies the value out.
    pub fn value(&self) -> ComponentValue {
        // SAFETY: The pointer was taken from an initialised row of a column holding this type.
        unsafe { ComponentValue::from_raw(self.ptr, *self.hooks) }
    }

    pub fn downcast_ref<T: 'static>(&self) -> Option<&'a T> {
        // SAFETY: Type checked, and the row outlives the entry's borrow of the world.
        self.hooks.is::<T>().then(|| unsafe { &*self.ptr.cast::<T>() })
    }
}

impl core::fmt::Debug for ComponentEntry<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ComponentEntry")
            .field("name", &self.name)
            .field("component", &self.component)
            .field("type", &self.hooks.name)
            .finish()
    }
}

#[cold]
#[inline(never)]
#[track_caller]
fn scratch_type_mismatch(type_name: &str) -> ! {
    panic!("scratch value of `{type_name}` has the wrong type")
}

/// How much of a failed access is reported.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Strictness {
    /// Missing entities and components are expected, only type mismatches are errors.
    Optional,
    Read,
    Write,
}

impl World {
    /// Resolves `name` to a typed handle, or `None` if unknown or registered with another type.
    pub fn component_handle<T: Component>(&self, name: &str) -> Option<ComponentHandle<T>> {
        let id = self.components.find(name)?;
        let type_id = self.components.get(id).type_id;
        if !self.types.hooks(type_id).is::<T>() {
            log::error!(
                "component `{}` is `{}`, requested as `{}`",
                name,
                self.types.name(type_id),
                T::type_name()
            );
            self.errors.type_mismatch();
            return None;
        }
        Some(ComponentHandle {
            id,
            _marker: PhantomData,
        })
    }

    /// Whether `name` is registered with payload type `T`.
    pub fn is<T: Component>(&self, name: &str) -> bool {
        self.components
            .find(name)
            .is_some_and(|id| self.types.hooks(self.components.get(id).type_id).is::<T>())
    }

    fn locate<T: Component>(
        &self,
        eid: EntityId,
        key: impl ComponentKey<T>,
    ) -> Result<(EntityDesc, ComponentID, usize), AccessError> {
        let desc = self
            .entities
            .read()
            .get(eid)
            .copied()
            .filter(EntityDesc::has_slot)
            .ok_or(AccessError::DeadEntity)?;
        let component = key.resolve(self).ok_or(AccessError::UnknownComponent)?;
        let archetype = self.archetypes.get(desc.archetype).ok_or(AccessError::DeadEntity)?;
        let column = archetype
            .column_index(component)
            .ok_or(AccessError::MissingComponent(component))?;
        if !archetype.columns()[column].hooks.is::<T>() {
            return Err(AccessError::TypeMismatch(component));
        }
        Ok((desc, component, column))
    }

    fn report<T: Component>(&self, eid: EntityId, key: impl ComponentKey<T>, error: AccessError, strictness: Strictness) {
        match error {
            AccessError::TypeMismatch(component) => {
                let type_id = self.components.get(component).type_id;
                log::error!(
                    "component `{}` is `{}`, accessed as `{}`",
                    self.components.name(component),
                    self.types.name(type_id),
                    T::type_name()
                );
                self.errors.type_mismatch();
            }
            _ if strictness == Strictness::Optional => {}
            AccessError::DeadEntity if strictness == Strictness::Write => {
                log::warn!("write to `{}` of {}, which is not alive", key.describe(self), eid);
                self.errors.dead_entity_write();
            }
            AccessError::DeadEntity => {}
            AccessError::UnknownComponent => {
                log::error!("unknown component `{}`", key.describe(self));
                self.errors.access();
            }
            AccessError::MissingComponent(component) => {
                log::error!("{} has no component `{}`", eid, self.components.name(component));
                self.errors.access();
            }
        }
    }

    /// Pointer to the entity's value, after reporting failures.
    fn value_ptr<T: Component>(&self, eid: EntityId, key: impl ComponentKey<T>, strictness: Strictness) -> Option<(EntityDesc, ComponentID, *mut T)> {
        match self.locate(eid, key) {
            Ok((desc, component, column)) => {
                let archetype = self.archetypes.get(desc.archetype)?;
                // SAFETY: `locate` checked that the row is alive and the column holds `T`.
                let ptr = unsafe { archetype.component_ptr(desc.chunk, column, desc.slot) };
                Some((desc, component, ptr.cast()))
            }
            Err(error) => {
                self.report(eid, key, error, strictness);
                None
            }
        }
    }

    fn notify_write(&self, desc: &EntityDesc, eid: EntityId, component: ComponentID) {
        let flags = self.components.get(component).flags;
        if flags.tracked {
            self.tracker.schedule(desc.archetype, eid, component);
        }
        if flags.replicated {
            if let Some(hook) = &self.replication_hook {
                hook(eid, component);
            }
        }
    }

    /// The entity's value, or `None` if the entity is not alive. A missing component is an
    /// access error.
    pub fn get<T: Component>(&self, eid: EntityId, key: impl ComponentKey<T>) -> Option<&T> {
        let (_, _, ptr) = self.value_ptr(eid, key, Strictness::Read)?;
        // SAFETY: Rows only move through `&mut self`.
        Some(unsafe { &*ptr })
    }

    /// Like [World::get], but entities without the component quietly yield `default`.
    pub fn get_or<'a, T: Component>(&'a self, eid: EntityId, key: impl ComponentKey<T>, default: &'a T) -> &'a T {
        match self.value_ptr(eid, key, Strictness::Optional) {
            // SAFETY: Rows only move through `&mut self`.
            Some((_, _, ptr)) => unsafe { &*ptr },
            None => default,
        }
    }

    /// Mutable access to the entity's value. Tracked and replicated components are flagged as
    /// written even if the value ends up unchanged.
    ///
    /// Writes to missing entities or components go to a per-type scratch value, so the caller
    /// always gets a reference. The failure is logged and counted.
    pub fn get_rw<T: Component>(&mut self, eid: EntityId, key: impl ComponentKey<T>) -> &mut T {
        match self.value_ptr(eid, key, Strictness::Write) {
            Some((desc, component, ptr)) => {
                self.notify_write(&desc, eid, component);
                // SAFETY: `&mut self` excludes every other reference into the row.
                unsafe { &mut *ptr }
            }
            None => self.scratch(),
        }
    }

    /// Like [World::get_rw], but entities without the component yield `None` without an error.
    pub fn get_rw_opt<T: Component>(&mut self, eid: EntityId, key: impl ComponentKey<T>) -> Option<&mut T> {
        let (desc, component, ptr) = self.value_ptr(eid, key, Strictness::Optional)?;
        self.notify_write(&desc, eid, component);
        // SAFETY: `&mut self` excludes every other reference into the row.
        Some(unsafe { &mut *ptr })
    }

    /// Stores `value`, flagging the component as written only if the value differs. Returns
    /// false if the entity or component is missing.
    pub fn set<T: Component>(&mut self, eid: EntityId, key: impl ComponentKey<T>, value: T) -> bool {
        self.store(eid, key, value, Strictness::Write)
    }

    /// Like [World::set], but a missing component is not an error.
    pub fn set_optional<T: Component>(&mut self, eid: EntityId, key: impl ComponentKey<T>, value: T) -> bool {
        self.store(eid, key, value, Strictness::Optional)
    }

    fn store<T: Component>(&mut self, eid: EntityId, key: impl ComponentKey<T>, value: T, strictness: Strictness) -> bool {
        let Some((desc, component, ptr)) = self.value_ptr(eid, key, strictness) else {
            return false;
        };
        // SAFETY: `&mut self` excludes every other reference into the row.
        let slot = unsafe { &mut *ptr };
        if *slot != value {
            *slot = value;
            self.notify_write(&desc, eid, component);
        }
        true
    }

    fn scratch<T: Component>(&mut self) -> &mut T {
        let value = self
            .scratch
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Box::new(T::default()));
        match value.downcast_mut::<T>() {
            Some(value) => {
                *value = T::default();
                value
            }
            None => scratch_type_mismatch(T::type_name()),
        }
    }

    /// Whether the alive entity has the component, whatever its type.
    pub fn has(&self, eid: EntityId, name: &str) -> bool {
        let Some(desc) = self.entities.read().get(eid).copied().filter(EntityDesc::has_slot) else {
            return false;
        };
        let Some(component) = self.components.find(name) else {
            return false;
        };
        self.archetypes
            .get(desc.archetype)
            .is_some_and(|archetype| archetype.has_component(component))
    }

    /// Number of components of the alive entity, not counting its id.
    pub fn entity_component_count(&self, eid: EntityId) -> usize {
        let Some(desc) = self.entities.read().get(eid).copied().filter(EntityDesc::has_slot) else {
            return 0;
        };
        self.archetypes
            .get(desc.archetype)
            .map_or(0, |archetype| archetype.components().len().saturating_sub(1))
    }

    /// Every component of the alive entity, in component id order.
    pub fn entity_components(&self, eid: EntityId) -> Vec<ComponentEntry<'_>> {
        let Some(desc) = self.entities.read().get(eid).copied().filter(EntityDesc::has_slot) else {
            return Vec::new();
        };
        let Some(archetype) = self.archetypes.get(desc.archetype) else {
            return Vec::new();
        };

        archetype
            .columns()
            .iter()
            .enumerate()
            .map(|(index, column)| ComponentEntry {
                name: self.components.name(column.component),
                component: column.component,
                type_id: column.type_id,
                hooks: &column.hooks,
                // SAFETY: The row of an entity with a slot is initialised.
                ptr: unsafe { archetype.component_ptr(desc.chunk, index, desc.slot) },
            })
            .collect()
    }

    /// Whether the entity's value of `name` still equals its template's default.
    pub fn is_entity_component_same_as_template(&self, eid: EntityId, name: &str) -> bool {
        let Some(desc) = self.entities.read().get(eid).copied().filter(EntityDesc::has_slot) else {
            return false;
        };
        let Some(component) = self.components.find(name) else {
            return false;
        };
        let Some(archetype) = self.archetypes.get(desc.archetype) else {
            return false;
        };
        let Some(column) = archetype.column_index(component) else {
            return false;
        };
        let Some(template) = self.templates.cached(desc.template) else {
            return false;
        };

        template.default(component).is_some_and(|default| {
            // SAFETY: The row is initialised and the default has the column's type.
            unsafe { default.eq_raw(archetype.component_ptr(desc.chunk, column, desc.slot)) }
        })
    }
}
