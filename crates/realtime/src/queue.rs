//! Inbound event queue for events received while disconnected.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use tunedeck_protocol::WorkflowEvent;

/// An inbound event waiting for (re)delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMessage {
    pub id: Uuid,
    pub data: WorkflowEvent,
    pub queued_at: DateTime<Utc>,
    pub attempts: u32,
}

/// Bounded FIFO. When full, the oldest entry is evicted on each push;
/// new writes are never rejected.
#[derive(Debug)]
pub(crate) struct MessageQueue {
    items: VecDeque<QueuedMessage>,
    capacity: usize,
}

impl MessageQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Appends `event`, returning the evicted entry if the queue was full.
    pub(crate) fn enqueue(&mut self, event: WorkflowEvent) -> Option<QueuedMessage> {
        let evicted = if self.items.len() >= self.capacity {
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(QueuedMessage {
            id: Uuid::new_v4(),
            data: event,
            queued_at: Utc::now(),
            attempts: 0,
        });
        evicted
    }

    /// Takes the whole queue at once, oldest first. The queue is empty
    /// afterwards, so anything enqueued during the flush is a new batch.
    pub(crate) fn drain_all(&mut self) -> Vec<QueuedMessage> {
        std::mem::take(&mut self.items).into()
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.items.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tunedeck_protocol::Phase;

    fn event(id: &str) -> WorkflowEvent {
        WorkflowEvent::new(id, "run-1", "2024-01-01T00:00:00Z", Phase::Info)
    }

    fn ids(batch: &[QueuedMessage]) -> Vec<&str> {
        batch.iter().map(|m| m.data.event_id.as_str()).collect()
    }

    #[test]
    fn fifo_order() {
        let mut q = MessageQueue::new(10);
        q.enqueue(event("a"));
        q.enqueue(event("b"));
        q.enqueue(event("c"));
        let batch = q.drain_all();
        assert_eq!(ids(&batch), vec!["a", "b", "c"]);
        assert!(q.is_empty());
    }

    #[test]
    fn full_queue_evicts_oldest() {
        let mut q = MessageQueue::new(2);
        assert!(q.enqueue(event("a")).is_none());
        assert!(q.enqueue(event("b")).is_none());
        let evicted = q.enqueue(event("c")).unwrap();
        assert_eq!(evicted.data.event_id, "a");
        assert_eq!(q.len(), 2);
        assert_eq!(ids(&q.drain_all()), vec!["b", "c"]);
    }

    #[test]
    fn drained_batch_is_separate_from_new_arrivals() {
        let mut q = MessageQueue::new(10);
        q.enqueue(event("a"));
        let batch = q.drain_all();
        q.enqueue(event("b"));
        assert_eq!(ids(&batch), vec!["a"]);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn entries_get_unique_ids() {
        let mut q = MessageQueue::new(10);
        q.enqueue(event("a"));
        q.enqueue(event("a"));
        let batch = q.drain_all();
        assert_ne!(batch[0].id, batch[1].id);
        assert_eq!(batch[0].attempts, 0);
    }

    #[test]
    fn clear_empties() {
        let mut q = MessageQueue::new(10);
        q.enqueue(event("a"));
        q.clear();
        assert_eq!(q.len(), 0);
    }
}
