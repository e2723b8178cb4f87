use std::collections::VecDeque;

use crate::{component::ComponentsInit, entity::EntityId};

/// A deferred structural change, applied by the world on tick.
#[derive(Debug)]
pub enum Command {
    Create {
        eid: EntityId,
        template: String,
        overrides: ComponentsInit,
    },
    Recreate {
        eid: EntityId,
        template: String,
        overrides: ComponentsInit,
    },
    Destroy {
        eid: EntityId,
    },
}

/// Stores structural changes requested from anywhere (including query callbacks) until the
/// world flushes them, in request order.
#[derive(Debug, Default)]
pub struct CommandQueue {
    commands: VecDeque<Command>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self {
            commands: VecDeque::new(),
        }
    }

    pub fn create(&mut self, eid: EntityId, template: &str, overrides: ComponentsInit) {
        self.commands.push_back(Command::Create {
            eid,
            template: template.to_string(),
            overrides,
        });
    }

    pub fn recreate(&mut self, eid: EntityId, template: &str, overrides: ComponentsInit) {
        self.commands.push_back(Command::Recreate {
            eid,
            template: template.to_string(),
            overrides,
        });
    }

    pub fn destroy(&mut self, eid: EntityId) {
        self.commands.push_back(Command::Destroy { eid });
    }

    /// Puts a command back for the next flush.
    pub fn requeue(&mut self, command: Command) {
        self.commands.push_back(command);
    }

    /// Takes every queued command, leaving the queue empty for commands issued while they run.
    pub fn take(&mut self) -> VecDeque<Command> {
        core::mem::take(&mut self.commands)
    }

    pub(crate) fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn clear(&mut self) {
        self.commands.clear();
    }
}
