use std::collections::VecDeque;
use tracing::debug;

use crate::model::Command;

pub const DEFAULT_PENDING_CAPACITY: usize = 32;

/// Sent commands waiting for a correlated response, oldest first
#[derive(Debug, Clone)]
pub struct PendingCommands {
    capacity: usize,
    commands: VecDeque<Command>,
}

impl Default for PendingCommands {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_PENDING_CAPACITY)
    }
}

impl PendingCommands {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            commands: VecDeque::new(),
        }
    }

    pub fn track(&mut self, command: Command) {
        if self.commands.len() == self.capacity {
            if let Some(evicted) = self.commands.pop_front() {
                debug!("Evicting unanswered command {}", evicted.id());
            }
        }
        self.commands.push_back(command);
    }

    /// Records `payload` as the response to command `id` and stops tracking it
    pub fn resolve(&mut self, id: &str, payload: &str) -> Option<Command> {
        let index = self.commands.iter().position(|c| c.id() == id)?;
        let mut command = self.commands.remove(index)?;
        command.record_response(payload.to_string());
        Some(command)
    }

    /// Stops tracking command `id` without a response
    pub fn forget(&mut self, id: &str) -> Option<Command> {
        let index = self.commands.iter().position(|c| c.id() == id)?;
        self.commands.remove(index)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.commands.iter().any(|c| c.id() == id)
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}
