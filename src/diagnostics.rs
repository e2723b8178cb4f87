use core::fmt::Write;

use crate::{entity::EntityDesc, World};

/// Storage footprint of a [World].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryUsage {
    pub archetypes: usize,
    pub chunks: usize,
    /// Bytes reserved by chunk columns.
    pub chunk_bytes: usize,
    pub entity_table_bytes: usize,
    pub entities: usize,
    pub queries: usize,
}

impl MemoryUsage {
    pub fn total_bytes(&self) -> usize {
        self.chunk_bytes + self.entity_table_bytes
    }
}

/// Work waiting for the next [World::tick].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingWork {
    pub commands: usize,
    pub events: usize,
    /// Entities waiting for their resources.
    pub loading_entities: usize,
    pub has_resource_loader: bool,
}

impl PendingWork {
    pub fn is_idle(&self) -> bool {
        self.commands == 0 && self.events == 0 && self.loading_entities == 0
    }
}

impl World {
    /// One line per archetype with its components, entity count and chunk usage.
    pub fn dump_archetypes(&self) -> String {
        let mut out = String::new();
        for archetype in self.archetypes.iter() {
            let names: Vec<&str> = archetype
                .components()
                .iter()
                .map(|&component| self.components.name(component))
                .collect();
            let _ = writeln!(
                out,
                "archetype {}: {} entities in {} chunks of {} bytes [{}]",
                archetype.id,
                archetype.len(),
                archetype.chunk_count(),
                archetype.chunk_byte_size(),
                names.join(", ")
            );
        }

        log::info!("{} archetypes\n{}", self.archetypes.len(), out);
        out
    }

    /// One line per live query with its name, refcount, matched archetypes and entity count.
    pub fn dump_queries(&self) -> String {
        let mut out = String::new();
        for query in self.queries.ids() {
            let matched = self
                .queries
                .resolved_shared(query, &self.archetypes, &self.components, &self.types, &self.errors)
                .map_or(0, |(_, matched)| matched.len());
            let _ = writeln!(
                out,
                "query `{}`: refcount {}, {} archetypes, {} entities",
                self.queries.name(query).unwrap_or_default(),
                self.queries.refcount(query),
                matched,
                self.query_size(query)
            );
        }

        log::info!("{} queries\n{}", self.queries.len(), out);
        out
    }

    pub fn memory_usage(&self) -> MemoryUsage {
        let entities = self.entities.read();
        let usage = MemoryUsage {
            archetypes: self.archetypes.len(),
            chunks: self.archetypes.iter().map(|archetype| archetype.chunk_count()).sum(),
            chunk_bytes: self.archetypes.memory_usage(),
            entity_table_bytes: entities.capacity() * core::mem::size_of::<EntityDesc>(),
            entities: entities.len(),
            queries: self.queries.len(),
        };

        log::info!("memory usage: {:?}", usage);
        usage
    }

    pub fn pending_work(&self) -> PendingWork {
        let pending = PendingWork {
            commands: self.commands.lock().len(),
            events: self.events.lock().len(),
            loading_entities: self.resources.pending_len(),
            has_resource_loader: self.resources.has_loader(),
        };

        log::debug!("pending work: {:?}", pending);
        pending
    }
}
