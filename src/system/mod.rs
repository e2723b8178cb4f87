mod command;
mod schedule;
mod system;

pub use command::{Command, CommandQueue};
pub use schedule::{stages, Schedule, UpdateStageInfo};
pub use system::{EntitySystem, EntitySystemDesc, EsFn, EsPayload, SystemManager};
