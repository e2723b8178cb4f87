use fixedbitset::FixedBitSet;

use crate::{archetype::Archetype, component::ComponentID};

pub struct FilterBuilder {
    and: Vec<ComponentID>,
    not: Vec<ComponentID>,
    unresolved: bool,
}

impl FilterBuilder {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            and: Vec::with_capacity(capacity),
            not: Vec::new(),
            unresolved: false,
        }
    }

    pub fn and(mut self, component: ComponentID) -> Self {
        self.and.push(component);
        self
    }

    pub fn not(mut self, component: ComponentID) -> Self {
        self.not.push(component);
        self
    }

    /// A required component is unknown (or has the wrong type), so no archetype can match.
    pub fn unresolved(mut self) -> Self {
        self.unresolved = true;
        self
    }

    pub fn build(self) -> Filter {
        let bitset = |components: &[ComponentID]| {
            let len = components.iter().max().map_or(0, |&max| max as usize + 1);
            let mut bitset = FixedBitSet::with_capacity(len);
            for &component in components {
                bitset.insert(component as usize);
            }
            bitset
        };

        Filter {
            and_bitset: bitset(&self.and),
            not_bitset: bitset(&self.not),
            unresolved: self.unresolved,
        }
    }
}

impl Default for FilterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Archetype membership test of a query: every `and` component present, no `not` component.
#[derive(Clone)]
pub struct Filter {
    unresolved: bool,
    and_bitset: FixedBitSet,
    not_bitset: FixedBitSet,
}

impl Filter {
    pub fn matches_archetype(&self, archetype: &Archetype) -> bool {
        !self.unresolved
            && self.and_bitset.is_subset(&archetype.component_bitset)
            && self.not_bitset.is_disjoint(&archetype.component_bitset)
    }
}
