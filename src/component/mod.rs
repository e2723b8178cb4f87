mod component;
mod tracking;
mod types;
mod value;

pub use component::{
    ComponentDecl, ComponentFlags, ComponentID, DataComponent, DataComponents, EID_COMPONENT,
    EID_COMPONENT_NAME,
};
pub(crate) use tracking::dedup_in_order;
pub use tracking::{ChangeTracker, ColumnSnapshot, TrackedChange};
pub use types::{Component, ComponentKind, ComponentTypeID, ComponentTypes, TypeHooks};
pub use value::{ComponentValue, ComponentsInit};
