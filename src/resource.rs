use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};

use crate::{
    component::ComponentsInit,
    entity::EntityId,
    template::ResolvedTemplate,
    util::{id_map, IdMap},
};

/// Outcome of a batch of resource loads, reported back to the world.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadResult {
    pub entities: Vec<EntityId>,
    pub success: bool,
}

/// Handed to a [ResourceLoader] with every request. May be cloned and moved to any thread.
#[derive(Clone)]
pub struct LoadNotifier {
    sender: Sender<LoadResult>,
}

impl LoadNotifier {
    pub fn on_entities_loaded(&self, entities: Vec<EntityId>, success: bool) {
        // The receiver lives as long as the world; a send error only means it is gone.
        if self.sender.send(LoadResult { entities, success }).is_err() {
            log::debug!("load result dropped, the world no longer exists");
        }
    }
}

/// Loads the external resources that component values ask for before their entity spawns.
pub trait ResourceLoader: Send + Sync {
    /// Starts loading `resources` for `entities`. Completion is reported through the notifier,
    /// from any thread and at any later time.
    fn async_load_resources(&self, entities: &[EntityId], resources: &[String], notifier: LoadNotifier);

    /// The entity was destroyed while loading. Best effort, late results are discarded anyway.
    fn cancel(&self, _entity: EntityId) {}
}

/// Everything needed to spawn an entity once its resources arrived.
pub(crate) struct PendingSpawn {
    pub template: Arc<ResolvedTemplate>,
    pub overrides: ComponentsInit,
}

/// Entities waiting on resources, and the channel results come back on.
pub struct ResourceManager {
    loader: Option<Box<dyn ResourceLoader>>,
    sender: Sender<LoadResult>,
    receiver: Receiver<LoadResult>,
    pending: IdMap<EntityId, PendingSpawn>,

    /// Requests collected during a flush, sent to the loader as one batch.
    batch_entities: Vec<EntityId>,
    batch_resources: Vec<String>,
}

impl ResourceManager {
    pub fn new() -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        Self {
            loader: None,
            sender,
            receiver,
            pending: id_map(64),
            batch_entities: Vec::new(),
            batch_resources: Vec::new(),
        }
    }

    pub fn set_loader(&mut self, loader: Option<Box<dyn ResourceLoader>>) {
        self.loader = loader;
    }

    pub(crate) fn has_loader(&self) -> bool {
        self.loader.is_some()
    }

    pub(crate) fn request(&mut self, eid: EntityId, spawn: PendingSpawn, resources: Vec<String>) {
        self.pending.insert(eid, spawn);
        self.batch_entities.push(eid);
        for resource in resources {
            if !self.batch_resources.contains(&resource) {
                self.batch_resources.push(resource);
            }
        }
    }

    /// Sends the collected requests to the loader in a single call.
    pub fn submit(&mut self) {
        if self.batch_entities.is_empty() {
            return;
        }

        let entities = core::mem::take(&mut self.batch_entities);
        let resources = core::mem::take(&mut self.batch_resources);
        match self.loader.as_ref() {
            Some(loader) => {
                log::trace!("requesting {} resources for {} entities", resources.len(), entities.len());
                loader.async_load_resources(&entities, &resources, LoadNotifier { sender: self.sender.clone() });
            }
            None => {
                // Without a loader every resource counts as resolved
                let _ = self.sender.send(LoadResult { entities, success: true });
            }
        }
    }

    /// Results that arrived since the last call.
    pub fn receive(&self) -> Vec<LoadResult> {
        self.receiver.try_iter().collect()
    }

    pub(crate) fn take(&mut self, eid: EntityId) -> Option<PendingSpawn> {
        self.pending.remove(&eid)
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Forgets a pending entity and tells the loader, returning whether it was waiting.
    pub fn cancel(&mut self, eid: EntityId) -> bool {
        if self.pending.remove(&eid).is_none() {
            return false;
        }

        self.batch_entities.retain(|&pending| pending != eid);
        if let Some(loader) = self.loader.as_ref() {
            loader.cancel(eid);
        }
        true
    }

    pub fn clear(&mut self) {
        for eid in self.pending.keys().copied().collect::<Vec<_>>() {
            self.cancel(eid);
        }
        self.batch_entities.clear();
        self.batch_resources.clear();
        while self.receiver.try_recv().is_ok() {}
    }
}

impl Default for ResourceManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use crate::template::{TemplateDb, TemplateDesc};
    use crate::component::{ComponentTypes, DataComponents};

    use super::*;

    #[derive(Default)]
    struct RecordingLoader {
        calls: Mutex<Vec<(Vec<EntityId>, Vec<String>)>>,
        cancelled: Mutex<Vec<EntityId>>,
    }

    impl ResourceLoader for Arc<RecordingLoader> {
        fn async_load_resources(&self, entities: &[EntityId], resources: &[String], notifier: LoadNotifier) {
            self.calls.lock().push((entities.to_vec(), resources.to_vec()));
            notifier.on_entities_loaded(entities.to_vec(), true);
        }

        fn cancel(&self, entity: EntityId) {
            self.cancelled.lock().push(entity);
        }
    }

    fn spawn() -> PendingSpawn {
        let mut types = ComponentTypes::new();
        let mut components = DataComponents::new(&mut types);
        let mut db = TemplateDb::new();
        db.add(TemplateDesc::new("t"), &components, &types);
        PendingSpawn {
            template: db.build_by_name("t", &mut components, &mut types).unwrap(),
            overrides: ComponentsInit::new(),
        }
    }

    #[test]
    fn requests_are_batched() {
        let loader = Arc::new(RecordingLoader::default());
        let mut manager = ResourceManager::new();
        manager.set_loader(Some(Box::new(loader.clone())));

        let a = EntityId::new(1, 0);
        let b = EntityId::new(2, 0);
        manager.request(a, spawn(), vec!["tree.mesh".into()]);
        manager.request(b, spawn(), vec!["tree.mesh".into(), "rock.mesh".into()]);
        manager.submit();

        let calls = loader.calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, vec![a, b]);
        assert_eq!(calls[0].1, vec!["tree.mesh".to_string(), "rock.mesh".to_string()]);
        drop(calls);

        let results = manager.receive();
        assert_eq!(results, vec![LoadResult { entities: vec![a, b], success: true }]);
        assert!(manager.take(a).is_some());
    }

    #[test]
    fn missing_loader_resolves_immediately() {
        let mut manager = ResourceManager::new();
        let eid = EntityId::new(1, 0);
        manager.request(eid, spawn(), vec!["x".into()]);
        manager.submit();

        assert_eq!(manager.receive()[0].entities, vec![eid]);
    }

    #[test]
    fn cancel_forgets_entity() {
        let loader = Arc::new(RecordingLoader::default());
        let mut manager = ResourceManager::new();
        manager.set_loader(Some(Box::new(loader.clone())));

        let eid = EntityId::new(3, 1);
        manager.request(eid, spawn(), Vec::new());
        assert_eq!(manager.pending_len(), 1);
        assert!(manager.cancel(eid));
        assert_eq!(manager.pending_len(), 0);
        assert!(!manager.cancel(eid));
        assert_eq!(*loader.cancelled.lock(), vec![eid]);

        manager.submit();
        assert!(loader.calls.lock().is_empty());
    }
}
