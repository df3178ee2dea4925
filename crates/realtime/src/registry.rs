//! Run subscriptions and lifecycle listeners.
//!
//! Both registries hand out snapshots of `(id, callback)` pairs so the
//! client can invoke callbacks without holding its lock. Callbacks may
//! therefore subscribe or unsubscribe re-entrantly.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::warn;

use tunedeck_protocol::WorkflowEvent;

use crate::types::{ConnectionEvent, ConnectionEventKind};

/// Callback invoked for every event of a subscribed run.
pub type EventCallback = Arc<dyn Fn(&WorkflowEvent) + Send + Sync>;

/// Callback invoked for lifecycle notifications.
pub type ListenerCallback = Arc<dyn Fn(&ConnectionEvent) + Send + Sync>;

/// Unique subscription id. Ids are assigned in increasing order, so
/// iteration order equals registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

/// A registered interest in one run.
pub struct Subscription {
    pub id: SubscriptionId,
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub events_received: u64,
    callback: EventCallback,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("run_id", &self.run_id)
            .field("created_at", &self.created_at)
            .field("events_received", &self.events_received)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    subscriptions: BTreeMap<SubscriptionId, Subscription>,
    by_run: HashMap<String, BTreeSet<SubscriptionId>>,
    next_id: u64,
}

impl SubscriptionRegistry {
    pub(crate) fn subscribe(&mut self, run_id: &str, callback: EventCallback) -> SubscriptionId {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        self.subscriptions.insert(
            id,
            Subscription {
                id,
                run_id: run_id.to_string(),
                created_at: Utc::now(),
                events_received: 0,
                callback,
            },
        );
        self.by_run
            .entry(run_id.to_string())
            .or_default()
            .insert(id);
        id
    }

    /// Removes one subscription. Returns `false` if it was already gone.
    pub(crate) fn remove(&mut self, id: SubscriptionId) -> bool {
        let Some(sub) = self.subscriptions.remove(&id) else {
            return false;
        };
        if let Some(ids) = self.by_run.get_mut(&sub.run_id) {
            ids.remove(&id);
            if ids.is_empty() {
                self.by_run.remove(&sub.run_id);
            }
        }
        true
    }

    /// Removes every subscription for `run_id`. Returns how many were removed.
    pub(crate) fn remove_run(&mut self, run_id: &str) -> usize {
        let Some(ids) = self.by_run.remove(run_id) else {
            return 0;
        };
        for id in &ids {
            self.subscriptions.remove(id);
        }
        ids.len()
    }

    /// Callbacks subscribed to `run_id`, in registration order.
    pub(crate) fn targets(&self, run_id: &str) -> Vec<(SubscriptionId, EventCallback)> {
        self.by_run
            .get(run_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.subscriptions.get(id))
                    .map(|s| (s.id, s.callback.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Counts a delivery attempt. No-op if the subscription was removed
    /// while the callback ran.
    pub(crate) fn record_delivery(&mut self, id: SubscriptionId) {
        if let Some(sub) = self.subscriptions.get_mut(&id) {
            sub.events_received += 1;
        }
    }

    #[cfg(test)]
    pub(crate) fn get(&self, id: SubscriptionId) -> Option<&Subscription> {
        self.subscriptions.get(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.subscriptions.len()
    }

    #[cfg(test)]
    pub(crate) fn run_count(&self) -> usize {
        self.by_run.len()
    }

    pub(crate) fn clear(&mut self) {
        self.subscriptions.clear();
        self.by_run.clear();
    }
}

/// Unique lifecycle listener id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
pub(crate) struct ListenerRegistry {
    listeners: BTreeMap<ListenerId, (ConnectionEventKind, ListenerCallback)>,
    next_id: u64,
}

impl ListenerRegistry {
    pub(crate) fn add(
        &mut self,
        kind: ConnectionEventKind,
        callback: ListenerCallback,
    ) -> ListenerId {
        self.next_id += 1;
        let id = ListenerId(self.next_id);
        self.listeners.insert(id, (kind, callback));
        id
    }

    pub(crate) fn remove(&mut self, id: ListenerId) -> bool {
        self.listeners.remove(&id).is_some()
    }

    pub(crate) fn targets(&self, kind: ConnectionEventKind) -> Vec<ListenerCallback> {
        self.listeners
            .values()
            .filter(|(k, _)| *k == kind)
            .map(|(_, cb)| cb.clone())
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.listeners.len()
    }

    pub(crate) fn clear(&mut self) {
        self.listeners.clear();
    }
}

/// Invokes `f`, containing a panic. Returns `false` if it panicked.
pub(crate) fn invoke_isolated(what: &str, f: impl FnOnce()) -> bool {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => true,
        Err(panic) => {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".into());
            warn!(callback = what, %reason, "callback panicked");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tunedeck_protocol::Phase;

    fn noop() -> EventCallback {
        Arc::new(|_| {})
    }

    fn event(run: &str) -> WorkflowEvent {
        WorkflowEvent::new("e1", run, "2024-01-01T00:00:00Z", Phase::Info)
    }

    #[test]
    fn subscribe_assigns_increasing_ids() {
        let mut reg = SubscriptionRegistry::default();
        let a = reg.subscribe("run-1", noop());
        let b = reg.subscribe("run-1", noop());
        assert!(a < b);
        assert_eq!(reg.len(), 2);
        assert_eq!(reg.run_count(), 1);
        assert_eq!(reg.get(a).unwrap().run_id, "run-1");
    }

    #[test]
    fn targets_only_match_run() {
        let mut reg = SubscriptionRegistry::default();
        let a = reg.subscribe("run-123", noop());
        reg.subscribe("run-456", noop());

        let targets = reg.targets("run-123");
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].0, a);
        assert!(reg.targets("run-789").is_empty());
    }

    #[test]
    fn remove_is_exact_and_idempotent() {
        let mut reg = SubscriptionRegistry::default();
        let a = reg.subscribe("run-1", noop());
        let b = reg.subscribe("run-1", noop());

        assert!(reg.remove(a));
        assert!(!reg.remove(a));
        let targets = reg.targets("run-1");
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].0, b);

        assert!(reg.remove(b));
        assert_eq!(reg.run_count(), 0);
    }

    #[test]
    fn remove_run_drops_all_callbacks() {
        let mut reg = SubscriptionRegistry::default();
        reg.subscribe("run-1", noop());
        reg.subscribe("run-1", noop());
        let other = reg.subscribe("run-2", noop());

        assert_eq!(reg.remove_run("run-1"), 2);
        assert_eq!(reg.remove_run("run-1"), 0);
        assert_eq!(reg.len(), 1);
        assert!(reg.get(other).is_some());
    }

    #[test]
    fn record_delivery_counts() {
        let mut reg = SubscriptionRegistry::default();
        let a = reg.subscribe("run-1", noop());
        reg.record_delivery(a);
        reg.record_delivery(a);
        assert_eq!(reg.get(a).unwrap().events_received, 2);

        reg.remove(a);
        reg.record_delivery(a);
    }

    #[test]
    fn snapshot_survives_removal() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let mut reg = SubscriptionRegistry::default();
        let a = reg.subscribe(
            "run-1",
            Arc::new(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let targets = reg.targets("run-1");
        reg.remove(a);
        for (_, cb) in targets {
            cb(&event("run-1"));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn listeners_filter_by_kind() {
        let mut reg = ListenerRegistry::default();
        let id = reg.add(ConnectionEventKind::Connected, Arc::new(|_| {}));
        reg.add(ConnectionEventKind::Error, Arc::new(|_| {}));

        assert_eq!(reg.targets(ConnectionEventKind::Connected).len(), 1);
        assert!(reg.targets(ConnectionEventKind::Message).is_empty());
        assert!(reg.remove(id));
        assert!(!reg.remove(id));
        assert_eq!(reg.len(), 1);
        reg.clear();
        assert_eq!(reg.len(), 0);
    }

    #[test]
    fn invoke_isolated_contains_panics() {
        assert!(invoke_isolated("ok", || {}));
        assert!(!invoke_isolated("boom", || panic!("subscriber failed")));
    }
}
