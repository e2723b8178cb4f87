mod archetype;
mod chunk;

pub use archetype::{Archetype, ArchetypeID, ArchetypeManager, Column};
