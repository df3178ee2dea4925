//! Event-id deduplication.

use std::collections::{HashSet, VecDeque};

/// Bounded, insertion-ordered set of recently seen event ids.
///
/// When over capacity the oldest inserted ids are evicted first; looking
/// an id up does not refresh it.
#[derive(Debug)]
pub(crate) struct EventDeduplicator {
    enabled: bool,
    capacity: usize,
    seen: HashSet<String>,
    order: VecDeque<String>,
}

impl EventDeduplicator {
    pub(crate) fn new(enabled: bool, capacity: usize) -> Self {
        Self {
            enabled,
            capacity: capacity.max(1),
            seen: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    /// Records `event_id`. Returns `true` if the event is new and should be
    /// dispatched, `false` for a duplicate.
    pub(crate) fn accept(&mut self, event_id: &str) -> bool {
        if !self.enabled {
            return true;
        }
        if self.seen.contains(event_id) {
            return false;
        }
        self.seen.insert(event_id.to_string());
        self.order.push_back(event_id.to_string());
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.order.len()
    }

    pub(crate) fn clear(&mut self) {
        self.seen.clear();
        self.order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drops_repeats() {
        let mut d = EventDeduplicator::new(true, 10);
        assert!(d.accept("a"));
        assert!(!d.accept("a"));
        assert!(!d.accept("a"));
        assert!(d.accept("b"));
        assert_eq!(d.len(), 2);
    }

    #[test]
    fn disabled_accepts_everything() {
        let mut d = EventDeduplicator::new(false, 10);
        assert!(d.accept("a"));
        assert!(d.accept("a"));
        assert_eq!(d.len(), 0);
    }

    #[test]
    fn evicts_in_insertion_order() {
        let mut d = EventDeduplicator::new(true, 3);
        for id in ["a", "b", "c"] {
            assert!(d.accept(id));
        }
        // Looking up "a" must not refresh it.
        assert!(!d.accept("a"));
        assert!(d.accept("d"));
        assert_eq!(d.len(), 3);

        // "a" was the oldest insertion and is gone; "b" is still remembered.
        assert!(d.accept("a"));
        assert!(!d.accept("c"));
    }

    #[test]
    fn clear_forgets_history() {
        let mut d = EventDeduplicator::new(true, 3);
        d.accept("a");
        d.clear();
        assert_eq!(d.len(), 0);
        assert!(d.accept("a"));
    }
}
