use core::{
    alloc::Layout,
    any::{Any, TypeId},
};
use std::collections::HashMap;

use crate::entity::EntityId;

/// Unique sequential integer assigned to each registered payload type
pub type ComponentTypeID = u16;

/// Payload of a component. Values are stored type-erased in chunk columns, so everything the
/// engine needs to do with them goes through [TypeHooks] built from this trait.
pub trait Component: Clone + PartialEq + Default + Send + Sync + 'static {
    fn type_name() -> &'static str {
        core::any::type_name::<Self>()
    }

    /// External resources (asset names) this value needs before its entity can be spawned.
    fn request_resources(&self, _resources: &mut Vec<String>) {}
}

macro_rules! impl_component {
    ($($ty:ty),* $(,)?) => {
        $(impl Component for $ty {})*
    };
}

impl_component!(bool, u8, u16, u32, u64, i8, i16, i32, i64, f32, f64, usize, String);
impl_component!([f32; 2], [f32; 3], [f32; 4]);

impl Component for EntityId {
    fn type_name() -> &'static str {
        "EntityId"
    }
}

/// How a component is copied and destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentKind {
    /// Plain bytes, no destructor.
    Trivial,
    /// Needs its destructor run and clones through its type.
    NonTrivial,
    /// Writes are monitored and trigger change notifications.
    Tracked,
}

/// Type-erased operations on a component payload, the equivalent of a custom type manager.
///
/// All pointer arguments must point to properly aligned memory holding (or, for destinations of
/// `clone_into` and `write_default`, ready to hold) a value of the hooked type.
#[derive(Clone, Copy)]
pub struct TypeHooks {
    pub type_id: TypeId,
    pub name: &'static str,
    pub layout: Layout,
    pub needs_drop: bool,
    pub drop: unsafe fn(*mut u8),
    /// Clones `src` into uninitialised `dst`.
    pub clone_into: unsafe fn(src: *const u8, dst: *mut u8),
    /// Clones `src` over the initialised `dst`, dropping the previous value.
    pub assign: unsafe fn(src: *const u8, dst: *mut u8),
    pub write_default: unsafe fn(dst: *mut u8),
    pub eq: unsafe fn(*const u8, *const u8) -> bool,
    pub clone_boxed: unsafe fn(*const u8) -> Box<dyn Any + Send + Sync>,
    pub request_resources: unsafe fn(*const u8, &mut Vec<String>),
}

impl TypeHooks {
    pub fn of<T: Component>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            name: T::type_name(),
            layout: Layout::new::<T>(),
            needs_drop: core::mem::needs_drop::<T>(),
            drop: |ptr| unsafe { ptr.cast::<T>().drop_in_place() },
            clone_into: |src, dst| unsafe { dst.cast::<T>().write((*src.cast::<T>()).clone()) },
            assign: |src, dst| unsafe { *dst.cast::<T>() = (*src.cast::<T>()).clone() },
            write_default: |dst| unsafe { dst.cast::<T>().write(T::default()) },
            eq: |a, b| unsafe { *a.cast::<T>() == *b.cast::<T>() },
            clone_boxed: |src| unsafe {
                Box::new((*src.cast::<T>()).clone()) as Box<dyn Any + Send + Sync>
            },
            request_resources: |src, out| unsafe { (*src.cast::<T>()).request_resources(out) },
        }
    }

    pub fn kind(&self) -> ComponentKind {
        if self.needs_drop {
            ComponentKind::NonTrivial
        } else {
            ComponentKind::Trivial
        }
    }

    #[inline]
    pub fn is<T: 'static>(&self) -> bool {
        self.type_id == TypeId::of::<T>()
    }
}

impl core::fmt::Debug for TypeHooks {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TypeHooks")
            .field("name", &self.name)
            .field("size", &self.layout.size())
            .field("align", &self.layout.align())
            .field("kind", &self.kind())
            .finish()
    }
}

/// Registry of payload types, assigning each a [ComponentTypeID]
pub struct ComponentTypes {
    /// Used to translate rust type ids to component type ids
    ids: HashMap<TypeId, ComponentTypeID, nohash_hasher::BuildNoHashHasher<u64>>,

    /// Hooks for each registered type, indexed by the component type id
    hooks: Vec<TypeHooks>,
}

impl ComponentTypes {
    pub fn new() -> Self {
        let mut types = Self {
            ids: HashMap::with_capacity_and_hasher(32, nohash_hasher::BuildNoHashHasher::default()),
            hooks: Vec::with_capacity(32),
        };
        types.register::<EntityId>();
        types
    }

    pub fn register<T: Component>(&mut self) -> ComponentTypeID {
        self.register_hooks(TypeHooks::of::<T>())
    }

    /// Registers a type from its hooks. Registering the same rust type twice returns the existing id.
    pub fn register_hooks(&mut self, hooks: TypeHooks) -> ComponentTypeID {
        if let Some(&id) = self.ids.get(&hooks.type_id) {
            return id;
        }

        let id = self.hooks.len() as ComponentTypeID;
        self.ids.insert(hooks.type_id, id);
        self.hooks.push(hooks);
        log::trace!("registered component type `{}` as {}", hooks.name, id);

        id
    }

    pub fn get_id<T: 'static>(&self) -> Option<ComponentTypeID> {
        self.ids.get(&TypeId::of::<T>()).copied()
    }

    /// # Panics
    /// - If the type id was not handed out by this registry
    pub fn hooks(&self, id: ComponentTypeID) -> &TypeHooks {
        &self.hooks[id as usize]
    }

    pub fn name(&self, id: ComponentTypeID) -> &'static str {
        self.hooks(id).name
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

impl Default for ComponentTypes {
    fn default() -> Self {
        Self::new()
    }
}
