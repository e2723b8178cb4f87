use core::{
    any::TypeId,
    hash::{BuildHasher, Hash, Hasher},
};

use crate::{
    component::{Component, EID_COMPONENT_NAME},
    error::SchemaError,
    util::{fixed_state, hash_name, NameHash},
};

/// Maximum number of write slots a single query may declare.
pub const MAX_RW_COMPONENTS: usize = 64;

/// A component named by a query, with the payload type the query expects.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ComponentRef {
    pub name: String,
    pub hash: NameHash,
    /// `None` for presence-only references (`rq`, `no`).
    pub type_id: Option<TypeId>,
    pub type_name: &'static str,
    /// Absent columns don't exclude an archetype, the view yields `None` for them instead.
    pub optional: bool,
}

impl ComponentRef {
    pub fn of<T: Component>(name: &str) -> Self {
        Self {
            name: name.to_string(),
            hash: hash_name(name),
            type_id: Some(TypeId::of::<T>()),
            type_name: T::type_name(),
            optional: false,
        }
    }

    pub fn untyped(name: &str) -> Self {
        Self {
            name: name.to_string(),
            hash: hash_name(name),
            type_id: None,
            type_name: "",
            optional: false,
        }
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

/// The four component lists of a query.
///
/// Read and write slots are addressed by their position in `ro` and `rw` respectively.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct QueryDesc {
    pub rw: Vec<ComponentRef>,
    pub ro: Vec<ComponentRef>,
    pub rq: Vec<ComponentRef>,
    pub no: Vec<ComponentRef>,
}

impl QueryDesc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rw<T: Component>(mut self, name: &str) -> Self {
        self.rw.push(ComponentRef::of::<T>(name));
        self
    }

    pub fn rw_optional<T: Component>(mut self, name: &str) -> Self {
        self.rw.push(ComponentRef::of::<T>(name).optional());
        self
    }

    pub fn ro<T: Component>(mut self, name: &str) -> Self {
        self.ro.push(ComponentRef::of::<T>(name));
        self
    }

    pub fn ro_optional<T: Component>(mut self, name: &str) -> Self {
        self.ro.push(ComponentRef::of::<T>(name).optional());
        self
    }

    pub fn rq(mut self, name: &str) -> Self {
        self.rq.push(ComponentRef::untyped(name));
        self
    }

    pub fn no(mut self, name: &str) -> Self {
        self.no.push(ComponentRef::untyped(name));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.rw.is_empty() && self.ro.is_empty() && self.rq.is_empty() && self.no.is_empty()
    }

    /// Hash of the four lists, used to share identical queries.
    pub fn content_hash(&self) -> u64 {
        let mut hasher = fixed_state().build_hasher();
        self.hash(&mut hasher);
        hasher.finish()
    }

    pub fn validate(&self, name: &str) -> Result<(), SchemaError> {
        let invalid = |reason: String| SchemaError::InvalidQuery {
            name: name.to_string(),
            reason,
        };

        if self.rw.len() > MAX_RW_COMPONENTS {
            return Err(invalid(format!(
                "{} write components, at most {} are supported",
                self.rw.len(),
                MAX_RW_COMPONENTS
            )));
        }

        if self.rw.iter().any(|component| component.name == EID_COMPONENT_NAME) {
            return Err(invalid("the entity id column is read only".to_string()));
        }

        let all = self.rw.iter().chain(&self.ro).chain(&self.rq).chain(&self.no);
        for (index, component) in all.clone().enumerate() {
            if all.clone().skip(index + 1).any(|other| other.hash == component.hash) {
                return Err(invalid(format!("component `{}` is listed twice", component.name)));
            }
        }

        Ok(())
    }
}

/// A query description with a human readable name for diagnostics.
#[derive(Debug, Clone)]
pub struct NamedQueryDesc {
    pub name: String,
    pub desc: QueryDesc,
}

impl NamedQueryDesc {
    pub fn new(name: &str, desc: QueryDesc) -> Self {
        Self {
            name: name.to_string(),
            desc,
        }
    }
}
