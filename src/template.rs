use std::sync::Arc;

use crate::{
    component::{
        Component, ComponentFlags, ComponentID, ComponentTypes, ComponentValue, DataComponents,
        EID_COMPONENT,
    },
    error::{SchemaError, TemplateError},
    util::{ahash_map, AHashMap},
};

/// Unique sequential integer
pub type TemplateID = u32;

#[derive(Debug, Clone)]
struct TemplateComponent {
    name: String,
    value: ComponentValue,
    tag: Option<String>,
}

/// Declaration of a template: default component values, parents and tracked components.
#[derive(Debug, Clone)]
pub struct TemplateDesc {
    pub name: String,
    components: Vec<TemplateComponent>,
    tracked: Vec<String>,
    parents: Vec<String>,
    singleton: bool,
}

impl TemplateDesc {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            components: Vec::new(),
            tracked: Vec::new(),
            parents: Vec::new(),
            singleton: false,
        }
    }

    pub fn component<T: Component>(self, name: &str, value: T) -> Self {
        self.with_value(name, ComponentValue::new(value), None)
    }

    /// A component that is only instantiated while `tag` is one of the database's filter tags.
    pub fn tagged_component<T: Component>(self, name: &str, value: T, tag: &str) -> Self {
        self.with_value(name, ComponentValue::new(value), Some(tag.to_string()))
    }

    pub fn with_value(mut self, name: &str, value: ComponentValue, tag: Option<String>) -> Self {
        self.components.retain(|component| component.name != name);
        self.components.push(TemplateComponent {
            name: name.to_string(),
            value,
            tag,
        });
        self
    }

    /// Writes to this component on entities of the template trigger change notifications.
    pub fn tracked(mut self, name: &str) -> Self {
        self.tracked.push(name.to_string());
        self
    }

    /// Parents are applied in order, later parents override earlier ones.
    pub fn parent(mut self, name: &str) -> Self {
        self.parents.push(name.to_string());
        self
    }

    pub fn singleton(mut self) -> Self {
        self.singleton = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddTemplateResult {
    Added(TemplateID),
    Duplicate,
    InvalidParents,
    /// A default value's type conflicts with an already registered component.
    InvalidComponentType,
    /// Templates are frozen while constrained multithreaded mode is active.
    Refused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveTemplateResult {
    Removed,
    HasEntities,
    /// Another template names this one as a parent.
    HasDependents,
    NotFound,
    Refused,
}

struct Template {
    name: String,
    components: Vec<TemplateComponent>,
    tracked: Vec<String>,
    parents: Vec<TemplateID>,
    singleton: bool,
}

/// A template with its parent chain flattened, ready to instantiate.
#[derive(Debug)]
pub struct ResolvedTemplate {
    pub id: TemplateID,
    pub name: String,
    /// Sorted component ids, starting with [EID_COMPONENT].
    components: Vec<ComponentID>,
    /// Default value for each component; `None` only for the entity id column.
    values: Vec<Option<ComponentValue>>,
    pub singleton: bool,
}

impl ResolvedTemplate {
    #[inline]
    pub fn components(&self) -> &[ComponentID] {
        &self.components
    }

    #[inline]
    pub fn has(&self, component: ComponentID) -> bool {
        self.components.binary_search(&component).is_ok()
    }

    pub fn default(&self, component: ComponentID) -> Option<&ComponentValue> {
        let index = self.components.binary_search(&component).ok()?;
        self.values[index].as_ref()
    }

    /// Iterates `(component, default)` for every component except the entity id.
    pub fn defaults(&self) -> impl Iterator<Item = (ComponentID, &ComponentValue)> + '_ {
        self.components
            .iter()
            .zip(self.values.iter())
            .filter_map(|(&component, value)| Some((component, value.as_ref()?)))
    }

    /// External resources requested by the default values.
    pub fn resources(&self) -> Vec<String> {
        let mut resources = Vec::new();
        for (_, value) in self.defaults() {
            value.resources(&mut resources);
        }
        resources
    }
}

/// Named entity prototypes, composed from parents.
///
/// # Implementation
/// Resolution is memoized per template and dropped whenever the template, one of its ancestors or
/// the filter tags change. Resolving registers any component name it has not seen yet, using the
/// type of its default value.
pub struct TemplateDb {
    templates: Vec<Option<Template>>,
    ids: AHashMap<String, TemplateID>,
    resolved: Vec<Option<Arc<ResolvedTemplate>>>,
    filter_tags: Option<Vec<String>>,
}

impl TemplateDb {
    pub fn new() -> Self {
        Self {
            templates: Vec::new(),
            ids: ahash_map(64),
            resolved: Vec::new(),
            filter_tags: None,
        }
    }

    pub fn add(&mut self, desc: TemplateDesc, components: &DataComponents, types: &ComponentTypes) -> AddTemplateResult {
        if self.ids.contains_key(&desc.name) {
            log::warn!("template `{}` is already registered", desc.name);
            return AddTemplateResult::Duplicate;
        }

        let Some(parents) = self.parent_ids(&desc) else {
            return AddTemplateResult::InvalidParents;
        };

        if let Err(err) = Self::check_types(&desc, components, types) {
            log::error!("template `{}`: {}", desc.name, err);
            return AddTemplateResult::InvalidComponentType;
        }

        let id = self.templates.len() as TemplateID;
        self.ids.insert(desc.name.clone(), id);
        self.templates.push(Some(Template {
            name: desc.name,
            components: desc.components,
            tracked: desc.tracked,
            parents,
            singleton: desc.singleton,
        }));
        self.resolved.push(None);

        AddTemplateResult::Added(id)
    }

    /// Replaces an existing template's declaration and drops the resolution of it and of every
    /// template that inherits from it.
    pub fn update(&mut self, desc: TemplateDesc, components: &DataComponents, types: &ComponentTypes) -> Result<TemplateID, TemplateError> {
        let id = self
            .find(&desc.name)
            .ok_or_else(|| TemplateError::UnknownTemplate(desc.name.clone()))?;

        let parents = self.parent_ids(&desc).ok_or_else(|| TemplateError::MissingParent {
            template: desc.name.clone(),
            parent: desc
                .parents
                .iter()
                .find(|parent| !self.ids.contains_key(*parent))
                .cloned()
                .unwrap_or_default(),
        })?;

        if parents.iter().any(|&parent| parent == id || self.inherits_from(parent, id)) {
            return Err(TemplateError::Cycle(desc.name));
        }

        Self::check_types(&desc, components, types).map_err(|source| TemplateError::Schema {
            template: desc.name.clone(),
            source,
        })?;

        let affected = self.dependents(id);
        self.templates[id as usize] = Some(Template {
            name: desc.name,
            components: desc.components,
            tracked: desc.tracked,
            parents,
            singleton: desc.singleton,
        });
        for affected in affected {
            self.resolved[affected as usize] = None;
        }

        Ok(id)
    }

    pub fn remove(&mut self, name: &str, has_entities: impl Fn(TemplateID) -> bool) -> RemoveTemplateResult {
        let Some(id) = self.find(name) else {
            return RemoveTemplateResult::NotFound;
        };

        if has_entities(id) {
            return RemoveTemplateResult::HasEntities;
        }

        let has_dependents = self
            .templates
            .iter()
            .flatten()
            .any(|template| template.parents.contains(&id));
        if has_dependents {
            return RemoveTemplateResult::HasDependents;
        }

        self.templates[id as usize] = None;
        self.resolved[id as usize] = None;
        self.ids.remove(name);
        log::debug!("removed template `{}`", name);

        RemoveTemplateResult::Removed
    }

    #[inline]
    pub fn find(&self, name: &str) -> Option<TemplateID> {
        self.ids.get(name).copied()
    }

    pub fn name(&self, id: TemplateID) -> Option<&str> {
        self.templates
            .get(id as usize)?
            .as_ref()
            .map(|template| template.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.templates
            .iter()
            .flatten()
            .map(|template| template.name.as_str())
    }

    /// The memoized resolution, if the template has been built since its last change.
    pub fn cached(&self, id: TemplateID) -> Option<Arc<ResolvedTemplate>> {
        self.resolved.get(id as usize)?.clone()
    }

    pub fn filter_tags(&self) -> Option<&[String]> {
        self.filter_tags.as_deref()
    }

    /// Restricts tagged components to those whose tag is listed; `None` instantiates all of them.
    pub fn set_filter_tags(&mut self, tags: Option<Vec<String>>) {
        self.filter_tags = tags;
        self.invalidate_all();
    }

    pub fn invalidate_all(&mut self) {
        for resolved in self.resolved.iter_mut() {
            *resolved = None;
        }
    }

    /// The template itself and every template that inherits from it, directly or not.
    pub fn dependents(&self, id: TemplateID) -> Vec<TemplateID> {
        let mut out = vec![id];
        for (index, template) in self.templates.iter().enumerate() {
            if template.is_some() && index as TemplateID != id && self.inherits_from(index as TemplateID, id) {
                out.push(index as TemplateID);
            }
        }
        out
    }

    pub fn build_by_name(
        &mut self,
        name: &str,
        components: &mut DataComponents,
        types: &mut ComponentTypes,
    ) -> Result<Arc<ResolvedTemplate>, TemplateError> {
        let id = self
            .find(name)
            .ok_or_else(|| TemplateError::UnknownTemplate(name.to_string()))?;
        self.build(id, components, types)
    }

    /// Resolves the template's parent chain into a flat, sorted component set.
    pub fn build(
        &mut self,
        id: TemplateID,
        components: &mut DataComponents,
        types: &mut ComponentTypes,
    ) -> Result<Arc<ResolvedTemplate>, TemplateError> {
        if let Some(resolved) = self.cached(id) {
            return Ok(resolved);
        }

        let Some(template) = self.templates.get(id as usize).and_then(Option::as_ref) else {
            return Err(TemplateError::UnknownTemplate(format!("#{id}")));
        };
        let name = template.name.clone();
        let singleton = template.singleton;

        let mut values: Vec<(String, ComponentValue)> = Vec::new();
        let mut tracked: Vec<String> = Vec::new();
        self.collect(id, &mut Vec::new(), &mut values, &mut tracked)?;

        let mut entries: Vec<(ComponentID, Option<ComponentValue>)> = Vec::with_capacity(values.len() + 1);
        entries.push((EID_COMPONENT, None));
        for (component_name, value) in values {
            let type_id = types.register_hooks(*value.hooks());
            let component = components
                .register(&component_name, type_id, ComponentFlags::NONE, types)
                .map_err(|source| TemplateError::Schema {
                    template: name.clone(),
                    source,
                })?;
            if component == EID_COMPONENT {
                log::warn!("template `{}` declares the reserved `eid` component, ignoring", name);
                continue;
            }
            entries.push((component, Some(value)));
        }
        entries.sort_unstable_by_key(|(component, _)| *component);

        for tracked_name in tracked.iter() {
            match components.find(tracked_name) {
                Some(component) => components.mark_tracked(component),
                None => log::warn!(
                    "template `{}` tracks `{}`, which has no value in the template",
                    name,
                    tracked_name
                ),
            }
        }

        for &(component, _) in entries.iter() {
            for &dependency in components.get(component).dependencies.iter() {
                if entries.binary_search_by_key(&dependency, |(id, _)| *id).is_err() {
                    return Err(TemplateError::MissingDependency {
                        template: name,
                        component: components.name(component).to_string(),
                        dependency: components.name(dependency).to_string(),
                    });
                }
            }
        }

        let (component_ids, values) = entries.into_iter().unzip();
        let resolved = Arc::new(ResolvedTemplate {
            id,
            name,
            components: component_ids,
            values,
            singleton,
        });
        log::trace!(
            "resolved template `{}` with {} components",
            resolved.name,
            resolved.components.len()
        );

        self.resolved[id as usize] = Some(resolved.clone());
        Ok(resolved)
    }

    fn collect(
        &self,
        id: TemplateID,
        stack: &mut Vec<TemplateID>,
        values: &mut Vec<(String, ComponentValue)>,
        tracked: &mut Vec<String>,
    ) -> Result<(), TemplateError> {
        let Some(template) = self.templates.get(id as usize).and_then(Option::as_ref) else {
            let child = stack
                .last()
                .and_then(|&child| self.name(child))
                .unwrap_or_default()
                .to_string();
            return Err(TemplateError::MissingParent {
                template: child,
                parent: format!("#{id}"),
            });
        };

        if stack.contains(&id) {
            return Err(TemplateError::Cycle(template.name.clone()));
        }

        stack.push(id);
        for &parent in template.parents.iter() {
            self.collect(parent, stack, values, tracked)?;
        }
        stack.pop();

        for component in template.components.iter() {
            if !self.passes_filter(component.tag.as_deref()) {
                continue;
            }

            match values.iter_mut().find(|(name, _)| *name == component.name) {
                Some((_, value)) => *value = component.value.clone(),
                None => values.push((component.name.clone(), component.value.clone())),
            }
        }

        for name in template.tracked.iter() {
            if !tracked.contains(name) {
                tracked.push(name.clone());
            }
        }

        Ok(())
    }

    fn passes_filter(&self, tag: Option<&str>) -> bool {
        match (tag, &self.filter_tags) {
            (None, _) | (_, None) => true,
            (Some(tag), Some(filter)) => filter.iter().any(|allowed| allowed == tag),
        }
    }

    fn parent_ids(&self, desc: &TemplateDesc) -> Option<Vec<TemplateID>> {
        let mut parents = Vec::with_capacity(desc.parents.len());
        for parent in desc.parents.iter() {
            match self.find(parent) {
                Some(id) => parents.push(id),
                None => {
                    log::error!("template `{}` references missing parent `{}`", desc.name, parent);
                    return None;
                }
            }
        }
        Some(parents)
    }

    /// Whether `id` has `ancestor` anywhere in its parent chain.
    fn inherits_from(&self, id: TemplateID, ancestor: TemplateID) -> bool {
        let mut stack = vec![id];
        let mut visited = Vec::new();

        while let Some(current) = stack.pop() {
            if visited.contains(&current) {
                continue;
            }
            visited.push(current);

            let Some(template) = self.templates.get(current as usize).and_then(Option::as_ref) else {
                continue;
            };
            for &parent in template.parents.iter() {
                if parent == ancestor {
                    return true;
                }
                stack.push(parent);
            }
        }

        false
    }

    fn check_types(desc: &TemplateDesc, components: &DataComponents, types: &ComponentTypes) -> Result<(), SchemaError> {
        for component in desc.components.iter() {
            let Some(id) = components.find(&component.name) else {
                continue;
            };

            let registered = components.get(id).type_id;
            let hooks = types.hooks(registered);
            if hooks.type_id != component.value.type_id() {
                return Err(SchemaError::TypeMismatch {
                    name: component.name.clone(),
                    registered: hooks.name,
                    requested: component.value.type_name(),
                });
            }
        }
        Ok(())
    }
}

impl Default for TemplateDb {
    fn default() -> Self {
        Self::new()
    }
}
