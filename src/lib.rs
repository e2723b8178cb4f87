mod archetype;
mod component;
mod config;
mod diagnostics;
mod entity;
mod error;
mod event;
mod executor;
mod query;
mod resource;
mod system;
mod template;
mod util;
mod world;

pub use archetype::{Archetype, ArchetypeID, ArchetypeManager, Column};
pub use component::{
    ChangeTracker, Component, ComponentDecl, ComponentFlags, ComponentID, ComponentKind, ComponentTypeID,
    ComponentTypes, ComponentValue, ComponentsInit, DataComponent, DataComponents, TrackedChange, TypeHooks,
    EID_COMPONENT, EID_COMPONENT_NAME,
};
pub use config::EcsConfig;
pub use diagnostics::{MemoryUsage, PendingWork};
pub use entity::{EntityDesc, EntityId, EntityManager, EntityState, MAX_ENTITY_INDEX};
pub use error::{ConfigError, ErrorCounters, ErrorCountersSnapshot, SchemaError, TemplateError};
pub use event::{
    event_type, EcsEvent, Event, EventComponentChanged, EventComponentsAppear, EventComponentsDisappear,
    EventEntityCreated, EventEntityDestroyed, EventEntityRecreated, EventTarget, EventsDb,
};
pub use executor::{Executor, ScopedExecutor};
pub use query::{
    ComponentRef, NamedQueryDesc, QueryArchetype, QueryContext, QueryDesc, QueryID, QueryManager, QueryView,
    MAX_RW_COMPONENTS,
};
pub use resource::{LoadNotifier, LoadResult, ResourceLoader};
pub use system::{stages, EntitySystem, EntitySystemDesc, EsFn, EsPayload, Schedule, SystemManager, UpdateStageInfo};
pub use template::{AddTemplateResult, RemoveTemplateResult, ResolvedTemplate, TemplateDb, TemplateDesc, TemplateID};
pub use util::{hash_name, NameHash};
pub use world::{ComponentEntry, ComponentHandle, ComponentKey, World};
