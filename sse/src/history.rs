//! Bounded record of recently received events.

use events::{EventEnvelope, EventType};
use std::collections::VecDeque;
use std::sync::Arc;

pub const MAX_STORED_EVENTS: usize = 100;

/// Most-recent-first ring of received events. Pushing beyond the capacity
/// evicts the oldest entry.
#[derive(Debug, Clone)]
pub struct EventHistory {
    events: VecDeque<Arc<EventEnvelope>>,
    capacity: usize,
}

impl EventHistory {
    pub fn new() -> Self {
        Self::with_capacity(MAX_STORED_EVENTS)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, envelope: Arc<EventEnvelope>) {
        if self.capacity == 0 {
            return;
        }
        while self.events.len() >= self.capacity {
            self.events.pop_back();
        }
        self.events.push_front(envelope);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn latest(&self) -> Option<&Arc<EventEnvelope>> {
        self.events.front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<EventEnvelope>> {
        self.events.iter()
    }

    /// Copy of the buffer, most recent first.
    pub fn snapshot(&self) -> Vec<Arc<EventEnvelope>> {
        self.events.iter().cloned().collect()
    }

    pub fn by_type(&self, event_type: EventType) -> Vec<Arc<EventEnvelope>> {
        self.events
            .iter()
            .filter(|envelope| envelope.event_type == event_type)
            .cloned()
            .collect()
    }

    pub fn for_ticket(&self, ticket_id: &str) -> Vec<Arc<EventEnvelope>> {
        self.events
            .iter()
            .filter(|envelope| envelope.concerns_ticket(ticket_id))
            .cloned()
            .collect()
    }
}

impl Default for EventHistory {
    fn default() -> Self {
        Self::new()
    }
}
