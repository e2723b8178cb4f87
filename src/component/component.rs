use crate::{
    error::SchemaError,
    util::{hash_name, id_map, IdMap, NameHash},
};

use super::{Component, ComponentKind, ComponentTypeID, ComponentTypes};

/// Unique sequential integer
pub type ComponentID = u16;

/// Every archetype stores the entity id of each row in this column.
pub const EID_COMPONENT: ComponentID = 0;
pub const EID_COMPONENT_NAME: &str = "eid";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ComponentFlags {
    pub tracked: bool,
    pub replicated: bool,
    /// May be missing from an entity without that being an access error.
    pub optional: bool,
}

impl ComponentFlags {
    pub const NONE: Self = Self {
        tracked: false,
        replicated: false,
        optional: false,
    };

    pub fn merge(&mut self, other: Self) {
        self.tracked |= other.tracked;
        self.replicated |= other.replicated;
        self.optional |= other.optional;
    }
}

#[derive(Debug, Clone)]
pub struct DataComponent {
    pub name: String,
    pub hash: NameHash,
    pub type_id: ComponentTypeID,
    pub flags: ComponentFlags,
    pub dependencies: Vec<ComponentID>,
}

/// Maps component names to component ids, their payload type and flags
pub struct DataComponents {
    components: Vec<DataComponent>,
    ids: IdMap<NameHash, ComponentID>,
}

impl DataComponents {
    pub fn new(types: &mut ComponentTypes) -> Self {
        let mut components = Self {
            components: Vec::with_capacity(64),
            ids: id_map(64),
        };

        let eid_type = types.register::<crate::EntityId>();
        components.components.push(DataComponent {
            name: EID_COMPONENT_NAME.to_string(),
            hash: hash_name(EID_COMPONENT_NAME),
            type_id: eid_type,
            flags: ComponentFlags::NONE,
            dependencies: Vec::new(),
        });
        components.ids.insert(hash_name(EID_COMPONENT_NAME), EID_COMPONENT);

        components
    }

    /// Registers a component name with its payload type, or merges the flags if the name is
    /// already known with the same type.
    pub fn register(
        &mut self,
        name: &str,
        type_id: ComponentTypeID,
        flags: ComponentFlags,
        types: &ComponentTypes,
    ) -> Result<ComponentID, SchemaError> {
        let hash = hash_name(name);

        if let Some(&id) = self.ids.get(&hash) {
            let existing = &mut self.components[id as usize];
            if existing.name != name {
                return Err(SchemaError::HashCollision {
                    name: name.to_string(),
                    existing: existing.name.clone(),
                    hash,
                });
            }
            if existing.type_id != type_id {
                return Err(SchemaError::TypeMismatch {
                    name: name.to_string(),
                    registered: types.name(existing.type_id),
                    requested: types.name(type_id),
                });
            }
            existing.flags.merge(flags);
            return Ok(id);
        }

        if self.components.len() > ComponentID::MAX as usize {
            return Err(SchemaError::TooManyComponents);
        }

        let id = self.components.len() as ComponentID;
        self.components.push(DataComponent {
            name: name.to_string(),
            hash,
            type_id,
            flags,
            dependencies: Vec::new(),
        });
        self.ids.insert(hash, id);
        log::debug!("registered component `{}` ({}) as {}", name, types.name(type_id), id);

        Ok(id)
    }

    pub fn find(&self, name: &str) -> Option<ComponentID> {
        self.find_hash(hash_name(name))
    }

    #[inline]
    pub fn find_hash(&self, hash: NameHash) -> Option<ComponentID> {
        self.ids.get(&hash).copied()
    }

    /// # Panics
    /// - If the id was not handed out by this table
    #[inline]
    pub fn get(&self, id: ComponentID) -> &DataComponent {
        &self.components[id as usize]
    }

    pub fn name(&self, id: ComponentID) -> &str {
        self.components
            .get(id as usize)
            .map(|component| component.name.as_str())
            .unwrap_or("<unknown>")
    }

    pub fn kind(&self, id: ComponentID, types: &ComponentTypes) -> ComponentKind {
        let component = self.get(id);
        if component.flags.tracked {
            ComponentKind::Tracked
        } else {
            types.hooks(component.type_id).kind()
        }
    }

    pub fn mark_tracked(&mut self, id: ComponentID) {
        self.components[id as usize].flags.tracked = true;
    }

    pub fn add_dependency(&mut self, id: ComponentID, dependency: ComponentID) {
        let dependencies = &mut self.components[id as usize].dependencies;
        if !dependencies.contains(&dependency) {
            dependencies.push(dependency);
        }
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ComponentID, &DataComponent)> + '_ {
        self.components
            .iter()
            .enumerate()
            .map(|(id, component)| (id as ComponentID, component))
    }
}

/// One row of an explicit component registration table.
///
/// Tables are registered in order with [World::register_components](crate::World::register_components),
/// dependencies may refer to names declared later in the same table.
#[derive(Clone)]
pub struct ComponentDecl {
    pub name: String,
    pub(crate) register_type: fn(&mut ComponentTypes) -> ComponentTypeID,
    pub flags: ComponentFlags,
    pub dependencies: Vec<String>,
}

impl ComponentDecl {
    pub fn of<T: Component>(name: &str) -> Self {
        Self {
            name: name.to_string(),
            register_type: |types| types.register::<T>(),
            flags: ComponentFlags::NONE,
            dependencies: Vec::new(),
        }
    }

    pub fn tracked(mut self) -> Self {
        self.flags.tracked = true;
        self
    }

    pub fn replicated(mut self) -> Self {
        self.flags.replicated = true;
        self
    }

    pub fn optional(mut self) -> Self {
        self.flags.optional = true;
        self
    }

    pub fn depends_on(mut self, name: &str) -> Self {
        self.dependencies.push(name.to_string());
        self
    }
}

impl core::fmt::Debug for ComponentDecl {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ComponentDecl")
            .field("name", &self.name)
            .field("flags", &self.flags)
            .field("dependencies", &self.dependencies)
            .finish()
    }
}
