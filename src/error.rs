use core::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;

use crate::component::ComponentID;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchemaError {
    #[error("component `{name}` is registered as `{registered}`, not `{requested}`")]
    TypeMismatch {
        name: String,
        registered: &'static str,
        requested: &'static str,
    },
    #[error("component name `{name}` collides with `{existing}` (hash {hash:#010x})")]
    HashCollision {
        name: String,
        existing: String,
        hash: u32,
    },
    #[error("component `{component}` depends on unknown component `{dependency}`")]
    UnknownDependency { component: String, dependency: String },
    #[error("too many components registered")]
    TooManyComponents,
    #[error("entity system `{0}` is already registered")]
    DuplicateSystem(String),
    #[error("entity system `{0}` has no function")]
    MissingSystemFunction(String),
    #[error("invalid query `{name}`: {reason}")]
    InvalidQuery { name: String, reason: String },
    #[error("registration is not allowed in constrained multithreaded mode")]
    ConstrainedMode,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("template `{0}` does not exist")]
    UnknownTemplate(String),
    #[error("template `{template}` references missing parent `{parent}`")]
    MissingParent { template: String, parent: String },
    #[error("template `{0}` has a cyclic parent chain")]
    Cycle(String),
    #[error("template `{template}`: component `{component}` requires `{dependency}`")]
    MissingDependency {
        template: String,
        component: String,
        dependency: String,
    },
    #[error("template `{template}`: {source}")]
    Schema {
        template: String,
        #[source]
        source: SchemaError,
    },
    #[error("templates cannot change in constrained multithreaded mode")]
    ConstrainedMode,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Why a component access failed. Never returned to callers directly, it only selects the
/// counter and the log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AccessError {
    DeadEntity,
    UnknownComponent,
    MissingComponent(ComponentID),
    TypeMismatch(ComponentID),
}

/// Counters for recoverable errors. Errors in this engine are counted and logged rather than
/// propagated, so these are the only trace a caller can assert on.
#[derive(Default, Debug)]
pub struct ErrorCounters {
    access: AtomicU64,
    dead_entity_writes: AtomicU64,
    type_mismatches: AtomicU64,
    contract_violations: AtomicU64,
    resource_failures: AtomicU64,
    template_failures: AtomicU64,
}

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorCountersSnapshot {
    pub access: u64,
    pub dead_entity_writes: u64,
    pub type_mismatches: u64,
    pub contract_violations: u64,
    pub resource_failures: u64,
    pub template_failures: u64,
}

impl ErrorCounters {
    pub(crate) fn access(&self) {
        self.access.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dead_entity_write(&self) {
        self.dead_entity_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn type_mismatch(&self) {
        self.type_mismatches.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn contract_violation(&self) {
        self.contract_violations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn resource_failure(&self) {
        self.resource_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn template_failure(&self) {
        self.template_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ErrorCountersSnapshot {
        ErrorCountersSnapshot {
            access: self.access.load(Ordering::Relaxed),
            dead_entity_writes: self.dead_entity_writes.load(Ordering::Relaxed),
            type_mismatches: self.type_mismatches.load(Ordering::Relaxed),
            contract_violations: self.contract_violations.load(Ordering::Relaxed),
            resource_failures: self.resource_failures.load(Ordering::Relaxed),
            template_failures: self.template_failures.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.access.store(0, Ordering::Relaxed);
        self.dead_entity_writes.store(0, Ordering::Relaxed);
        self.type_mismatches.store(0, Ordering::Relaxed);
        self.contract_violations.store(0, Ordering::Relaxed);
        self.resource_failures.store(0, Ordering::Relaxed);
        self.template_failures.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let counters = ErrorCounters::default();
        counters.access();
        counters.access();
        counters.type_mismatch();

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.access, 2);
        assert_eq!(snapshot.type_mismatches, 1);
        assert_eq!(snapshot.resource_failures, 0);

        counters.reset();
        assert_eq!(counters.snapshot(), ErrorCountersSnapshot::default());
    }

    #[test]
    fn error_messages() {
        let err = TemplateError::MissingParent {
            template: "child".into(),
            parent: "base".into(),
        };
        assert_eq!(err.to_string(), "template `child` references missing parent `base`");
    }
}
