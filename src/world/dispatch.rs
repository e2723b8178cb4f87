use core::ops::Range;

use crate::{
    archetype::{Archetype, ArchetypeID},
    component::{dedup_in_order, ColumnSnapshot, ComponentID, ComponentValue, TrackedChange},
    entity::{EntityDesc, EntityId},
    event::{EcsEvent, Event, EventComponentChanged, EventTarget},
    query::{QueryContext, QueryID, QueryView},
    system::{EsPayload, UpdateStageInfo},
};

use super::World;

/// Rows of one chunk handed to a single job.
struct Slice<'a> {
    archetype: &'a Archetype,
    columns: &'a [Option<u16>],
    chunk: u32,
    rows: Range<usize>,
}

/// Cuts every chunk of `archetype` into row ranges of at most `quant` rows.
fn push_slices<'a>(archetype: &'a Archetype, columns: &'a [Option<u16>], quant: usize, out: &mut Vec<Slice<'a>>) {
    for chunk in 0..archetype.chunk_count() as u32 {
        let len = archetype.chunk_len(chunk);
        let mut start = 0;
        while start < len {
            let end = (start + quant.max(1)).min(len);
            out.push(Slice {
                archetype,
                columns,
                chunk,
                rows: start..end,
            });
            start = end;
        }
    }
}

impl World {
    /// Runs the systems of every stage in `info`'s mask, in system order, over every matching
    /// archetype. Systems without components run once, before the archetype passes.
    pub fn update(&mut self, info: UpdateStageInfo) {
        self.sync_systems();

        let this = &*self;
        let mask = info.mask();
        let payload = EsPayload::Stage(&info);

        for &index in this.systems.global_stages() {
            if this.systems.get(index).stages & mask != 0 {
                this.run_global(index, &payload);
            }
        }

        for archetype in this.archetypes.iter() {
            if archetype.is_empty() {
                continue;
            }
            let Some(lists) = this.systems.archetype(archetype.id) else {
                continue;
            };
            for entry in &lists.stages {
                if this.systems.get(entry.system).stages & mask != 0 {
                    this.run_system(entry.system, &entry.columns, archetype, &payload, None);
                }
            }
        }
    }

    /// Queues an event for one entity, delivered on the next [World::tick].
    pub fn send_event<E: EcsEvent>(&self, eid: EntityId, event: E) {
        self.queue_event(EventTarget::Entity(eid), Event::new(event));
    }

    /// Queues an event for every system handling it, delivered on the next [World::tick].
    pub fn broadcast_event<E: EcsEvent>(&self, event: E) {
        self.queue_event(EventTarget::Broadcast, Event::new(event));
    }

    /// Delivers an event to one entity right away. In constrained multithreaded mode the event
    /// is queued instead.
    pub fn send_event_immediate<E: EcsEvent>(&mut self, eid: EntityId, event: E) {
        if self.is_constrained_mt_mode() {
            log::warn!("`{}` queued, immediate events are unavailable in constrained mode", E::NAME);
            self.send_event(eid, event);
            return;
        }
        self.dispatch_entity_event(eid, &Event::new(event));
    }

    /// Delivers an event to every system handling it right away. In constrained multithreaded
    /// mode the event is queued instead.
    pub fn broadcast_event_immediate<E: EcsEvent>(&mut self, event: E) {
        if self.is_constrained_mt_mode() {
            log::warn!("`{}` queued, immediate events are unavailable in constrained mode", E::NAME);
            self.broadcast_event(event);
            return;
        }
        self.dispatch_broadcast(&Event::new(event));
    }

    pub(crate) fn queue_event(&self, target: EventTarget, event: Event) {
        self.events.lock().push((target, event));
    }

    fn flush_events(&mut self) {
        let batch = self.events.get_mut().swap();
        if !batch.is_empty() {
            log::trace!("delivering {} queued events", batch.len());
        }

        for (target, event) in batch {
            match target {
                EventTarget::Entity(eid) => self.dispatch_entity_event(eid, &event),
                EventTarget::Broadcast => self.dispatch_broadcast(&event),
            }
        }
    }

    /// Runs the systems handling `event` on the entity's row. Entities that are not alive
    /// don't receive events.
    pub(crate) fn dispatch_entity_event(&mut self, eid: EntityId, event: &Event) {
        self.sync_systems();

        let Some(desc) = self.entities.get_mut().get(eid).copied().filter(EntityDesc::has_slot) else {
            log::debug!("dropping `{}` sent to {}, which is not alive", event.name(), eid);
            return;
        };

        let this = &*self;
        let Some(archetype) = this.archetypes.get(desc.archetype) else {
            return;
        };
        let Some(entries) = this
            .systems
            .archetype(desc.archetype)
            .and_then(|lists| lists.events.get(&event.event_type()))
        else {
            return;
        };

        let payload = EsPayload::Event(event);
        for entry in entries {
            this.run_system(entry.system, &entry.columns, archetype, &payload, Some((desc.chunk, desc.slot)));
        }
    }

    fn dispatch_broadcast(&mut self, event: &Event) {
        self.sync_systems();

        let this = &*self;
        let event_type = event.event_type();
        let payload = EsPayload::Event(event);

        for &index in this.systems.order() {
            let system = this.systems.get(index);
            if !system.handles_event(event_type) {
                continue;
            }
            if system.is_global() {
                this.run_global(index, &payload);
                continue;
            }

            for archetype in this.archetypes.iter() {
                if archetype.is_empty() {
                    continue;
                }
                let entry = this
                    .systems
                    .archetype(archetype.id)
                    .and_then(|lists| lists.events.get(&event_type))
                    .and_then(|entries| entries.iter().find(|entry| entry.system == index));
                if let Some(entry) = entry {
                    this.run_system(index, &entry.columns, archetype, &payload, None);
                }
            }
        }
    }

    /// Runs `systems` (all handling `event`) on one row, in the given order.
    pub(crate) fn run_systems_on_row(&self, systems: &[usize], archetype: ArchetypeID, chunk: u32, slot: u16, event: &Event) {
        let Some(found) = self.archetypes.get(archetype) else {
            return;
        };
        let Some(entries) = self
            .systems
            .archetype(archetype)
            .and_then(|lists| lists.events.get(&event.event_type()))
        else {
            return;
        };

        let payload = EsPayload::Event(event);
        for &system in systems {
            if let Some(entry) = entries.iter().find(|entry| entry.system == system) {
                self.run_system(system, &entry.columns, found, &payload, Some((chunk, slot)));
            }
        }
    }

    fn run_global(&self, index: usize, payload: &EsPayload) {
        let view = QueryView::empty(&self.errors);
        let context = QueryContext::new(self, &[]);
        (self.systems.get(index).function())(payload, &view, &context);
    }

    /// Runs one system over an archetype, or over one of its rows.
    fn run_system(
        &self,
        index: usize,
        columns: &[Option<u16>],
        archetype: &Archetype,
        payload: &EsPayload,
        row: Option<(u32, u16)>,
    ) {
        let system = self.systems.get(index);
        let function = system.function();
        let rw = system.rw_components();
        self.prepare_tracked_writes(rw, archetype);

        let context = QueryContext::new(self, rw);
        if row.is_none() && self.parallel_allowed(system.quant, archetype.len()) {
            let mut slices = Vec::new();
            push_slices(archetype, columns, system.quant, &mut slices);
            self.run_slices(&slices, system.rw_count(), &|view| function(payload, view, &context));
        } else {
            self.run_views(archetype, columns, system.rw_count(), true, row, &mut |view| {
                function(payload, view, &context)
            });
        }
    }

    fn parallel_allowed(&self, quant: usize, rows: usize) -> bool {
        quant > 0
            && self.is_constrained_mt_mode()
            && self.executor.worker_count() > 1
            && rows > quant.max(self.config.min_parallel_rows)
    }

    /// Calls `f` for every non-empty chunk of the archetype, or just for one row.
    fn run_views(
        &self,
        archetype: &Archetype,
        columns: &[Option<u16>],
        rw_count: usize,
        writable: bool,
        row: Option<(u32, u16)>,
        f: &mut dyn FnMut(&QueryView),
    ) {
        if let Some((chunk, slot)) = row {
            let slot = slot as usize;
            let view = QueryView::new(archetype, columns, rw_count, chunk, slot..slot + 1, writable, &self.errors);
            f(&view);
            return;
        }

        for chunk in 0..archetype.chunk_count() as u32 {
            let len = archetype.chunk_len(chunk);
            if len == 0 {
                continue;
            }
            let view = QueryView::new(archetype, columns, rw_count, chunk, 0..len, writable, &self.errors);
            f(&view);
        }
    }

    /// Hands every slice to the executor as its own job.
    fn run_slices(&self, slices: &[Slice], rw_count: usize, f: &(dyn Fn(&QueryView) + Sync)) {
        let errors = &self.errors;
        self.executor.for_each(slices.len(), &|job| {
            let slice = &slices[job];
            let view = QueryView::new(
                slice.archetype,
                slice.columns,
                rw_count,
                slice.chunk,
                slice.rows.clone(),
                true,
                errors,
            );
            f(&view);
        });
    }

    /// Snapshots tracked columns about to be written by a query, so the flush can tell which
    /// rows actually changed.
    fn prepare_tracked_writes(&self, rw: &[ComponentID], archetype: &Archetype) {
        if archetype.is_empty() {
            return;
        }

        for &component in rw {
            if !self.components.get(component).flags.tracked {
                continue;
            }
            let Some(column) = archetype.column_index(component) else {
                continue;
            };

            if !self.tracker.has_snapshot(archetype.id, component) {
                let hooks = archetype.columns()[column].hooks;
                let mut snapshot = ColumnSnapshot::with_capacity(archetype.len());
                for chunk in 0..archetype.chunk_count() as u32 {
                    for (slot, &eid) in archetype.entities(chunk).iter().enumerate() {
                        // SAFETY: In bounds row of a column holding `hooks`' type.
                        let value = unsafe {
                            ComponentValue::from_raw(archetype.component_ptr(chunk, column, slot as u16), hooks)
                        };
                        snapshot.insert(eid, value);
                    }
                }
                self.tracker.store_snapshot(archetype.id, component, snapshot);
            }
            self.tracker.mark_archetype(archetype.id, component);
        }
    }

    /// Notifies systems tracking components written since the last flush, once per entity and
    /// component. Returns the number of notifications. Postponed in constrained mode.
    ///
    /// Without `flush_all`, only columns written by queries since the last flush are diffed.
    /// With it, every stored snapshot is.
    pub fn perform_track_changes(&mut self, flush_all: bool) -> usize {
        if self.is_constrained_mt_mode() {
            log::debug!("tracked changes postponed, constrained multithreaded mode is active");
            return 0;
        }
        self.sync_systems();

        let mut changes = self.tracker.drain_pending();
        let mut marked = self.tracker.drain_archetype_marks();
        if flush_all {
            for key in self.tracker.snapshot_keys() {
                if !marked.contains(&key) {
                    marked.push(key);
                }
            }
        }

        for (archetype_id, component) in marked {
            let Some(snapshot) = self.tracker.take_snapshot(archetype_id, component) else {
                continue;
            };
            let Some(archetype) = self.archetypes.get(archetype_id) else {
                continue;
            };
            let Some(column) = archetype.column_index(component) else {
                continue;
            };

            let entities = self.entities.read();
            for chunk in 0..archetype.chunk_count() as u32 {
                for (slot, &eid) in archetype.entities(chunk).iter().enumerate() {
                    let template = entities.get(eid).and_then(|desc| self.templates.cached(desc.template));
                    let fallback = template.as_ref().and_then(|template| template.default(component));
                    // SAFETY: In bounds row; the snapshot holds values of this column's type.
                    let changed = unsafe {
                        snapshot.differs(eid, archetype.component_ptr(chunk, column, slot as u16), fallback)
                    };
                    if changed {
                        changes.push(TrackedChange { eid, component });
                    }
                }
            }
        }

        let changes = dedup_in_order(changes);

        let this = &*self;
        let mut notified = 0;
        for change in changes {
            let Some(desc) = this.entities.read().get(change.eid).copied().filter(EntityDesc::has_slot) else {
                continue;
            };
            let Some(archetype) = this.archetypes.get(desc.archetype) else {
                continue;
            };
            let Some(entries) = this
                .systems
                .archetype(desc.archetype)
                .and_then(|lists| lists.tracked.get(&change.component))
            else {
                continue;
            };

            let event = Event::new(EventComponentChanged {
                component: change.component,
            });
            let payload = EsPayload::Event(&event);
            for entry in entries {
                this.run_system(entry.system, &entry.columns, archetype, &payload, Some((desc.chunk, desc.slot)));
                notified += 1;
            }
        }

        if notified > 0 {
            log::trace!("{} tracked change notifications", notified);
        }
        notified
    }

    /// Runs `f` over every chunk matched by the query. Returns false for unknown queries.
    pub fn perform_query(&mut self, query: QueryID, mut f: impl FnMut(&QueryView, &QueryContext)) -> bool {
        if !self.resolve_query(query) {
            return false;
        }

        let this = &*self;
        let Some((plan, matched)) = this.queries.resolved(query) else {
            return false;
        };
        let rw: Vec<ComponentID> = plan.rw_components().collect();
        let context = QueryContext::new(this, &rw);

        for found in matched {
            let Some(archetype) = this.archetypes.get(found.archetype) else {
                continue;
            };
            if archetype.is_empty() {
                continue;
            }
            this.prepare_tracked_writes(&rw, archetype);
            this.run_views(archetype, &found.columns, plan.rw_count, true, None, &mut |view| {
                f(view, &context)
            });
        }
        true
    }

    /// Like [World::perform_query], but in constrained multithreaded mode the matched rows are
    /// split into slices of `min_quantum` rows run concurrently by the executor.
    pub fn perform_query_quantized(
        &mut self,
        query: QueryID,
        min_quantum: usize,
        f: impl Fn(&QueryView, &QueryContext) + Sync,
    ) -> bool {
        if !self.resolve_query(query) {
            return false;
        }

        let this = &*self;
        let Some((plan, matched)) = this.queries.resolved(query) else {
            return false;
        };
        let rw: Vec<ComponentID> = plan.rw_components().collect();
        let context = QueryContext::new(this, &rw);

        let archetypes: Vec<(&Archetype, &[Option<u16>])> = matched
            .iter()
            .filter_map(|found| {
                let archetype = this.archetypes.get(found.archetype)?;
                (!archetype.is_empty()).then_some((archetype, found.columns.as_slice()))
            })
            .collect();
        for &(archetype, _) in &archetypes {
            this.prepare_tracked_writes(&rw, archetype);
        }

        let rows: usize = archetypes.iter().map(|(archetype, _)| archetype.len()).sum();
        if this.parallel_allowed(min_quantum, rows) {
            let mut slices = Vec::new();
            for &(archetype, columns) in &archetypes {
                push_slices(archetype, columns, min_quantum, &mut slices);
            }
            this.run_slices(&slices, plan.rw_count, &|view| f(view, &context));
        } else {
            for &(archetype, columns) in &archetypes {
                this.run_views(archetype, columns, plan.rw_count, true, None, &mut |view| f(view, &context));
            }
        }
        true
    }

    /// Runs `f` on the entity's row if the query matches it. Returns whether `f` ran.
    pub fn perform_eid_query(
        &mut self,
        eid: EntityId,
        query: QueryID,
        f: impl FnOnce(&QueryView, &QueryContext),
    ) -> bool {
        if !self.resolve_query(query) {
            return false;
        }
        let Some(desc) = self.entities.get_mut().get(eid).copied().filter(EntityDesc::has_slot) else {
            return false;
        };

        let this = &*self;
        let Some((plan, matched)) = this.queries.resolved(query) else {
            return false;
        };
        let Some(found) = matched.iter().find(|found| found.archetype == desc.archetype) else {
            return false;
        };
        let Some(archetype) = this.archetypes.get(desc.archetype) else {
            return false;
        };

        let rw: Vec<ComponentID> = plan.rw_components().collect();
        this.prepare_tracked_writes(&rw, archetype);
        let context = QueryContext::new(this, &rw);
        let slot = desc.slot as usize;
        let view = QueryView::new(archetype, &found.columns, plan.rw_count, desc.chunk, slot..slot + 1, true, &this.errors);
        f(&view, &context);
        true
    }

    /// Read-only query through `&self`, e.g. from inside another query's callback. Write slots
    /// of the query cannot be borrowed.
    pub fn perform_query_shared(&self, query: QueryID, f: impl FnMut(&QueryView, &QueryContext)) -> bool {
        self.perform_query_guarded(query, &[], f)
    }

    /// Shared query that refuses to read any component in `guard`, which a running query may
    /// be writing.
    pub(crate) fn perform_query_guarded(
        &self,
        query: QueryID,
        guard: &[ComponentID],
        mut f: impl FnMut(&QueryView, &QueryContext),
    ) -> bool {
        let Some((plan, matched)) =
            self.queries
                .resolved_shared(query, &self.archetypes, &self.components, &self.types, &self.errors)
        else {
            return false;
        };

        if let Some(component) = plan.slots.iter().flatten().find(|component| guard.contains(component)) {
            log::error!(
                "query `{}` reads `{}`, which the running query writes",
                self.queries.name(query).unwrap_or_default(),
                self.components.name(*component)
            );
            self.errors.contract_violation();
            return false;
        }

        let context = QueryContext::new(self, guard);
        for found in matched.iter() {
            let Some(archetype) = self.archetypes.get(found.archetype) else {
                continue;
            };
            self.run_views(archetype, &found.columns, plan.rw_count, false, None, &mut |view| {
                f(view, &context)
            });
        }
        true
    }

    fn resolve_query(&mut self, query: QueryID) -> bool {
        let resolved = self
            .queries
            .resolve(query, &self.archetypes, &self.components, &self.types, &self.errors);
        if !resolved {
            log::warn!("query {:?} does not exist", query);
        }
        resolved
    }

    /// Applies everything queued since the last tick: finished resource loads, commands,
    /// tracked change notifications and queued events. Refused in constrained mode.
    pub fn tick(&mut self) -> bool {
        self.tick_with(false)
    }

    /// [World::tick], optionally repeating the command flush until nothing new is queued (up
    /// to the configured pass limit) and diffing every tracked snapshot.
    pub fn tick_with(&mut self, flush_all: bool) -> bool {
        if self.refuse_constrained("tick") {
            return false;
        }

        self.process_load_results();
        let passes = if flush_all { self.config.max_flush_iterations } else { 1 };
        self.flush_commands(passes);
        self.perform_track_changes(flush_all);
        self.flush_events();

        self.tick += 1;
        true
    }
}
