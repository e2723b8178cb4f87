use core::any::{Any, TypeId};

use super::{Component, TypeHooks};

/// An owned, type-erased component value, used for template defaults and creation overrides.
pub struct ComponentValue {
    value: Box<dyn Any + Send + Sync>,
    hooks: TypeHooks,
}

impl ComponentValue {
    pub fn new<T: Component>(value: T) -> Self {
        Self {
            value: Box::new(value),
            hooks: TypeHooks::of::<T>(),
        }
    }

    /// Clones a value out of column storage.
    ///
    /// # Safety
    /// - `ptr` must point to an initialised value of the type described by `hooks`.
    pub unsafe fn from_raw(ptr: *const u8, hooks: TypeHooks) -> Self {
        Self {
            value: unsafe { (hooks.clone_boxed)(ptr) },
            hooks,
        }
    }

    #[inline]
    pub fn hooks(&self) -> &TypeHooks {
        &self.hooks
    }

    #[inline]
    pub fn type_id(&self) -> TypeId {
        self.hooks.type_id
    }

    pub fn type_name(&self) -> &'static str {
        self.hooks.name
    }

    pub fn is<T: 'static>(&self) -> bool {
        self.hooks.is::<T>()
    }

    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    /// Pointer to the boxed payload, suitable for the [TypeHooks] functions.
    #[inline]
    pub(crate) fn as_ptr(&self) -> *const u8 {
        (&*self.value as *const (dyn Any + Send + Sync)).cast::<u8>()
    }

    /// # Safety
    /// - `ptr` must point to an initialised value of the same type as this value.
    #[inline]
    pub(crate) unsafe fn eq_raw(&self, ptr: *const u8) -> bool {
        unsafe { (self.hooks.eq)(self.as_ptr(), ptr) }
    }

    pub(crate) fn resources(&self, out: &mut Vec<String>) {
        // SAFETY: The pointer comes from our own box, which holds a value of the hooked type.
        unsafe { (self.hooks.request_resources)(self.as_ptr(), out) }
    }
}

impl Clone for ComponentValue {
    fn clone(&self) -> Self {
        // SAFETY: The pointer comes from our own box, which holds a value of the hooked type.
        unsafe { Self::from_raw(self.as_ptr(), self.hooks) }
    }
}

impl PartialEq for ComponentValue {
    fn eq(&self, other: &Self) -> bool {
        // SAFETY: Types are checked to match before comparing.
        self.type_id() == other.type_id() && unsafe { self.eq_raw(other.as_ptr()) }
    }
}

impl core::fmt::Debug for ComponentValue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "ComponentValue<{}>", self.hooks.name)
    }
}

/// Per-instance component values applied on top of template defaults at creation or recreation.
#[derive(Clone, Debug, Default)]
pub struct ComponentsInit {
    values: Vec<(String, ComponentValue)>,
}

impl ComponentsInit {
    pub fn new() -> Self {
        Self { values: Vec::new() }
    }

    pub fn with<T: Component>(mut self, name: &str, value: T) -> Self {
        self.insert(name, ComponentValue::new(value));
        self
    }

    /// Sets the value for `name`, replacing an earlier one.
    pub fn insert(&mut self, name: &str, value: ComponentValue) {
        match self.values.iter_mut().find(|(existing, _)| existing == name) {
            Some((_, slot)) => *slot = value,
            None => self.values.push((name.to_string(), value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ComponentValue> {
        self.values
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, value)| value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ComponentValue)> + '_ {
        self.values.iter().map(|(name, value)| (name.as_str(), value))
    }

    /// Folds `other` into this set, with `other` winning on conflicts.
    pub fn merge(&mut self, other: ComponentsInit) {
        for (name, value) in other.values {
            self.insert(&name, value);
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, PartialEq, Default, Debug)]
    struct Mesh(String);

    impl Component for Mesh {
        fn request_resources(&self, resources: &mut Vec<String>) {
            resources.push(self.0.clone());
        }
    }

    #[test]
    fn value_equality() {
        let a = ComponentValue::new(3.0f32);
        let b = ComponentValue::new(3.0f32);
        let c = ComponentValue::new(3u32);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.clone().downcast_ref::<f32>(), Some(&3.0));
        assert!(c.is::<u32>());
    }

    #[test]
    fn value_resources() {
        let value = ComponentValue::new(Mesh("tree.mesh".into()));
        let mut resources = Vec::new();
        value.resources(&mut resources);
        assert_eq!(resources, vec!["tree.mesh".to_string()]);
    }

    #[test]
    fn init_overrides_by_name() {
        let mut init = ComponentsInit::new().with("hp", 10u32).with("speed", 1.0f32);
        init.merge(ComponentsInit::new().with("hp", 20u32));

        assert_eq!(init.len(), 2);
        assert_eq!(init.get("hp").and_then(|v| v.downcast_ref::<u32>()), Some(&20));
    }
}
