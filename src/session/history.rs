use std::collections::VecDeque;

use crate::model::InboundMessage;

pub const DEFAULT_HISTORY_CAPACITY: usize = 50;

/// Most-recent-first ring of inbound messages
#[derive(Debug, Clone)]
pub struct MessageHistory {
    capacity: usize,
    messages: VecDeque<InboundMessage>,
}

impl Default for MessageHistory {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_HISTORY_CAPACITY)
    }
}

impl MessageHistory {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            messages: VecDeque::with_capacity(capacity),
        }
    }

    /// Inserts at the front, evicting the oldest message when full
    pub fn push(&mut self, message: InboundMessage) {
        self.messages.push_front(message);
        self.messages.truncate(self.capacity);
    }

    pub fn iter(&self) -> impl Iterator<Item = &InboundMessage> {
        self.messages.iter()
    }

    pub fn to_vec(&self) -> Vec<InboundMessage> {
        self.messages.iter().cloned().collect()
    }

    pub fn unread_count(&self) -> usize {
        self.messages.iter().filter(|m| !m.read).count()
    }

    pub fn mark_all_read(&mut self) {
        self.messages.iter_mut().for_each(InboundMessage::mark_read);
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
