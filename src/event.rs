use core::any::Any;
use std::sync::Arc;

use crate::{
    component::ComponentID,
    entity::EntityId,
    util::{hash_name, id_map, IdMap, NameHash},
};

/// An event payload. Events are identified by the hash of their name.
pub trait EcsEvent: Any + Send + Sync {
    const NAME: &'static str;
}

#[inline]
pub fn event_type<E: EcsEvent>() -> NameHash {
    hash_name(E::NAME)
}

/// A type-erased event, cheap to clone so broadcasts can be handed to many systems.
#[derive(Clone)]
pub struct Event {
    event_type: NameHash,
    name: &'static str,
    payload: Arc<dyn Any + Send + Sync>,
}

impl Event {
    pub fn new<E: EcsEvent>(event: E) -> Self {
        Self {
            event_type: event_type::<E>(),
            name: E::NAME,
            payload: Arc::new(event),
        }
    }

    #[inline]
    pub fn event_type(&self) -> NameHash {
        self.event_type
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is<E: EcsEvent>(&self) -> bool {
        self.event_type == event_type::<E>()
    }

    pub fn get<E: EcsEvent>(&self) -> Option<&E> {
        self.payload.downcast_ref::<E>()
    }
}

impl core::fmt::Debug for Event {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Event({})", self.name)
    }
}

macro_rules! lifecycle_event {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
        pub struct $name;

        impl EcsEvent for $name {
            const NAME: &'static str = stringify!($name);
        }
    };
}

lifecycle_event!(
    /// Sent to an entity right after it was spawned.
    EventEntityCreated
);
lifecycle_event!(
    /// Sent to an entity right before its slot is freed.
    EventEntityDestroyed
);
lifecycle_event!(
    /// Sent to an entity after it switched templates.
    EventEntityRecreated
);
lifecycle_event!(
    /// Sent by recreation to systems that match the new archetype but not the old one.
    EventComponentsAppear
);
lifecycle_event!(
    /// Sent by recreation to systems that match the old archetype but not the new one.
    EventComponentsDisappear
);

/// Sent to systems tracking `component` when its value changed since the last flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventComponentChanged {
    pub component: ComponentID,
}

impl EcsEvent for EventComponentChanged {
    const NAME: &'static str = "EventComponentChanged";
}

/// Registry of known event types, for diagnostics.
pub struct EventsDb {
    names: IdMap<NameHash, &'static str>,
}

impl EventsDb {
    pub fn new() -> Self {
        let mut db = Self { names: id_map(16) };
        db.register::<EventEntityCreated>();
        db.register::<EventEntityDestroyed>();
        db.register::<EventEntityRecreated>();
        db.register::<EventComponentsAppear>();
        db.register::<EventComponentsDisappear>();
        db.register::<EventComponentChanged>();
        db
    }

    pub fn register<E: EcsEvent>(&mut self) -> NameHash {
        let hash = event_type::<E>();
        if let Some(existing) = self.names.insert(hash, E::NAME) {
            if existing != E::NAME {
                log::error!("event `{}` collides with `{}`", E::NAME, existing);
            }
        }
        hash
    }

    pub fn name(&self, event_type: NameHash) -> Option<&'static str> {
        self.names.get(&event_type).copied()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl Default for EventsDb {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventTarget {
    Entity(EntityId),
    Broadcast,
}

/// Double buffered event storage: events pushed while a batch is being delivered land in the
/// next batch.
pub struct Events<T> {
    read: Vec<T>,
    write: Vec<T>,
}

impl<T> Events<T> {
    pub fn new() -> Self {
        Self {
            read: Vec::new(),
            write: Vec::new(),
        }
    }

    pub fn push(&mut self, event: T) {
        self.write.push(event);
    }

    /// Events waiting for the next swap.
    pub(crate) fn len(&self) -> usize {
        self.write.len()
    }

    /// Swaps the buffers and hands out everything written so far, in order.
    pub fn swap(&mut self) -> Vec<T> {
        self.read.clear();
        std::mem::swap(&mut self.read, &mut self.write);
        std::mem::take(&mut self.read)
    }

    pub fn clear(&mut self) {
        self.read.clear();
        self.write.clear();
    }
}

impl<T> Default for Events<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Deferred events, delivered by the world on tick.
pub type EventQueue = Events<(EventTarget, Event)>;

#[cfg(test)]
mod tests {
    use super::*;

    struct Damage(u32);
    impl EcsEvent for Damage {
        const NAME: &'static str = "Damage";
    }

    #[test]
    fn event_downcast() {
        let event = Event::new(Damage(5));
        assert!(event.is::<Damage>());
        assert!(!event.is::<EventEntityCreated>());
        assert_eq!(event.get::<Damage>().map(|damage| damage.0), Some(5));
        assert_eq!(event.name(), "Damage");
    }

    #[test]
    fn events_swap_keeps_order() {
        let mut events = Events::new();
        events.push(1);
        events.push(2);

        let batch = events.swap();
        events.push(3);
        assert_eq!(batch, vec![1, 2]);
        assert_eq!(events.swap(), vec![3]);
        assert!(events.swap().is_empty());
    }

    #[test]
    fn builtins_registered() {
        let db = EventsDb::new();
        assert_eq!(db.name(event_type::<EventEntityCreated>()), Some("EventEntityCreated"));
        assert_eq!(db.len(), 6);
    }
}
