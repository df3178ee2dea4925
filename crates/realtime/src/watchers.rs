//! Consumer helpers built on the client.
//!
//! [`WorkflowEventFeed`] follows one run; [`StatusWatcher`] keeps a
//! [`ConnectionStatus`] snapshot current. Both release what they registered
//! when dropped.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use tunedeck_protocol::WorkflowEvent;

use crate::client::{RealtimeClient, Unsubscribe};
use crate::error::ClientError;
use crate::types::{ConnectionEvent, ConnectionEventKind, ConnectionState};

/// Options for [`WorkflowEventFeed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedOptions {
    /// Start a connection attempt if the client is not connected.
    pub auto_connect: bool,
    /// Events kept in the history; the oldest are dropped beyond this.
    pub max_events: usize,
}

impl Default for FeedOptions {
    fn default() -> Self {
        Self {
            auto_connect: true,
            max_events: 100,
        }
    }
}

#[derive(Debug)]
struct FeedState {
    events: VecDeque<WorkflowEvent>,
    latest: Option<WorkflowEvent>,
    max_events: usize,
}

/// Events of one run, as a bounded history plus an async stream.
pub struct WorkflowEventFeed {
    client: RealtimeClient,
    run_id: String,
    state: Arc<Mutex<FeedState>>,
    rx: mpsc::Receiver<WorkflowEvent>,
    subscription: Unsubscribe,
}

impl WorkflowEventFeed {
    pub fn new(client: RealtimeClient, run_id: impl Into<String>, options: FeedOptions) -> Self {
        let run_id = run_id.into();
        let max_events = options.max_events.max(1);
        let state = Arc::new(Mutex::new(FeedState {
            events: VecDeque::with_capacity(max_events),
            latest: None,
            max_events,
        }));
        let (tx, rx) = mpsc::channel(max_events);

        let feed_state = state.clone();
        let subscription = client.subscribe(&run_id, move |event| {
            {
                let mut s = feed_state.lock();
                if s.events.len() >= s.max_events {
                    s.events.pop_front();
                }
                s.events.push_back(event.clone());
                s.latest = Some(event.clone());
            }
            if tx.try_send(event.clone()).is_err() {
                trace!(event_id = %event.event_id, "feed stream full, event kept in history only");
            }
        });

        if options.auto_connect && !client.is_connected() {
            if let Err(e) = client.begin_connect() {
                warn!(run_id = %run_id, error = %e, "feed auto-connect failed");
            }
        }
        debug!(run_id = %run_id, max_events, "workflow event feed started");

        Self {
            client,
            run_id,
            state,
            rx,
            subscription,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Received events, oldest first.
    pub fn events(&self) -> Vec<WorkflowEvent> {
        self.state.lock().events.iter().cloned().collect()
    }

    pub fn latest(&self) -> Option<WorkflowEvent> {
        self.state.lock().latest.clone()
    }

    pub fn len(&self) -> usize {
        self.state.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forgets the history and the latest event.
    pub fn clear(&self) {
        let mut s = self.state.lock();
        s.events.clear();
        s.latest = None;
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    /// Waits for the next event of this run.
    ///
    /// Events that arrive while nobody is awaiting are buffered up to
    /// `max_events`; beyond that they only reach the history.
    pub async fn next(&mut self) -> Option<WorkflowEvent> {
        self.rx.recv().await
    }
}

impl Drop for WorkflowEventFeed {
    fn drop(&mut self) {
        self.subscription.unsubscribe();
        debug!(run_id = %self.run_id, "workflow event feed stopped");
    }
}

impl std::fmt::Debug for WorkflowEventFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEventFeed")
            .field("run_id", &self.run_id)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

/// Connection status as a UI would render it.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub is_connected: bool,
    pub reconnect_attempt: u32,
    /// Delay of the pending retry, while `Reconnecting`.
    pub next_retry_delay: Option<Duration>,
    pub last_error: Option<String>,
}

/// Publishes [`ConnectionStatus`] updates from lifecycle notifications.
pub struct StatusWatcher {
    client: RealtimeClient,
    rx: watch::Receiver<ConnectionStatus>,
    listeners: Vec<Unsubscribe>,
}

impl StatusWatcher {
    pub fn new(client: RealtimeClient) -> Self {
        let stats = client.stats();
        let (tx, rx) = watch::channel(ConnectionStatus {
            state: stats.state,
            is_connected: stats.state == ConnectionState::Connected,
            reconnect_attempt: stats.reconnect_attempt,
            next_retry_delay: None,
            last_error: stats.last_error,
        });
        let tx = Arc::new(tx);

        let listeners = [
            ConnectionEventKind::StateChange,
            ConnectionEventKind::Connected,
            ConnectionEventKind::Reconnecting,
            ConnectionEventKind::Error,
        ]
        .into_iter()
        .map(|kind| {
            let tx = tx.clone();
            client.on(kind, move |event| tx.send_modify(|s| apply(s, event)))
        })
        .collect();

        Self {
            client,
            rx,
            listeners,
        }
    }

    pub fn current(&self) -> ConnectionStatus {
        self.rx.borrow().clone()
    }

    /// Waits for the next update and returns it.
    ///
    /// Returns `None` once the client has been destroyed and every pending
    /// update was seen.
    pub async fn changed(&mut self) -> Option<ConnectionStatus> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    /// A receiver for consumers that want to select on updates themselves.
    pub fn receiver(&self) -> watch::Receiver<ConnectionStatus> {
        self.rx.clone()
    }

    /// Drops the current connection and starts over.
    pub async fn reconnect(&self) -> Result<(), ClientError> {
        self.client.disconnect();
        self.client.connect().await
    }
}

fn apply(status: &mut ConnectionStatus, event: &ConnectionEvent) {
    match event {
        ConnectionEvent::StateChange { current, .. } => {
            status.state = *current;
            status.is_connected = *current == ConnectionState::Connected;
            if *current != ConnectionState::Reconnecting {
                status.next_retry_delay = None;
            }
        }
        ConnectionEvent::Connected => {
            status.reconnect_attempt = 0;
            status.last_error = None;
        }
        ConnectionEvent::Reconnecting { attempt, delay } => {
            status.reconnect_attempt = *attempt;
            status.next_retry_delay = Some(*delay);
        }
        ConnectionEvent::Error { message } => {
            status.last_error = Some(message.clone());
        }
        ConnectionEvent::Disconnected { .. } | ConnectionEvent::Message(_) => {}
    }
}

impl Drop for StatusWatcher {
    fn drop(&mut self) {
        for listener in &self.listeners {
            listener.unsubscribe();
        }
    }
}

impl std::fmt::Debug for StatusWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusWatcher")
            .field("status", &*self.rx.borrow())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClientConfig, ReconnectConfig};
    use crate::testing::{MockTransport, connect_open, event, settle};

    fn client() -> (RealtimeClient, Arc<MockTransport>) {
        let transport = MockTransport::new();
        let config = ClientConfig {
            reconnection: ReconnectConfig {
                jitter: 0.0,
                ..ReconnectConfig::default()
            },
            ..ClientConfig::default()
        }
        .with_url("ws://mock/ws/events");
        (
            RealtimeClient::with_transport(config, transport.clone()),
            transport,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn feed_collects_run_events() {
        let (client, transport) = client();
        let mut feed = WorkflowEventFeed::new(
            client.clone(),
            "run-1",
            FeedOptions {
                auto_connect: false,
                max_events: 2,
            },
        );
        assert!(feed.is_empty());
        let socket = connect_open(&client, &transport).await;
        assert!(feed.is_connected());

        socket.deliver(&event("e1", "run-1"));
        socket.deliver(&event("other", "run-2"));
        socket.deliver(&event("e2", "run-1"));
        socket.deliver(&event("e3", "run-1"));
        settle().await;

        let ids: Vec<String> = feed.events().into_iter().map(|e| e.event_id).collect();
        assert_eq!(ids, vec!["e2", "e3"]);
        assert_eq!(feed.latest().unwrap().event_id, "e3");

        // The stream buffered the first two; e3 only reached the history.
        assert_eq!(feed.next().await.unwrap().event_id, "e1");
        assert_eq!(feed.next().await.unwrap().event_id, "e2");

        feed.clear();
        assert!(feed.is_empty());
        assert!(feed.latest().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn feed_auto_connects() {
        let (client, transport) = client();
        let _feed = WorkflowEventFeed::new(client.clone(), "run-1", FeedOptions::default());
        assert_eq!(transport.opened(), 1);
        assert_eq!(client.connection_state(), ConnectionState::Connecting);

        let (client, transport) = self::client();
        let _feed = WorkflowEventFeed::new(
            client,
            "run-1",
            FeedOptions {
                auto_connect: false,
                ..FeedOptions::default()
            },
        );
        assert_eq!(transport.opened(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_feed_unsubscribes() {
        let (client, _transport) = client();
        let feed = WorkflowEventFeed::new(
            client.clone(),
            "run-1",
            FeedOptions {
                auto_connect: false,
                ..FeedOptions::default()
            },
        );
        assert_eq!(client.stats().subscription_count, 1);
        drop(feed);
        assert_eq!(client.stats().subscription_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn status_follows_lifecycle() {
        let (client, transport) = client();
        let mut watcher = StatusWatcher::new(client.clone());
        assert_eq!(watcher.current().state, ConnectionState::Disconnected);
        assert!(!watcher.current().is_connected);

        let socket = connect_open(&client, &transport).await;
        let status = watcher.changed().await.unwrap();
        assert!(status.is_connected);
        assert_eq!(status.state, ConnectionState::Connected);

        socket.error("reset by peer");
        socket.close(1006, false);
        settle().await;

        let status = watcher.current();
        assert_eq!(status.state, ConnectionState::Reconnecting);
        assert_eq!(status.reconnect_attempt, 1);
        assert_eq!(status.next_retry_delay, Some(Duration::from_secs(1)));
        assert_eq!(status.last_error.as_deref(), Some("reset by peer"));

        tokio::time::advance(Duration::from_millis(1001)).await;
        settle().await;
        transport.last().open();
        settle().await;

        let status = watcher.current();
        assert!(status.is_connected);
        assert_eq!(status.reconnect_attempt, 0);
        assert_eq!(status.next_retry_delay, None);
        assert_eq!(status.last_error, None);
    }

    #[tokio::test(start_paused = true)]
    async fn status_updates_end_after_destroy() {
        let (client, transport) = client();
        let mut watcher = StatusWatcher::new(client.clone());
        connect_open(&client, &transport).await;

        client.destroy();
        let drained = tokio::time::timeout(Duration::from_secs(1), async {
            let mut updates = 0;
            while watcher.changed().await.is_some() {
                updates += 1;
            }
            updates
        })
        .await
        .expect("updates should end");
        assert!(drained <= 2, "{drained} updates after destroy");
        assert!(watcher.changed().await.is_none());
        assert_eq!(watcher.current().state, ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_replaces_socket() {
        let (client, transport) = client();
        let watcher = StatusWatcher::new(client.clone());
        connect_open(&client, &transport).await;

        let w = tokio::spawn(async move {
            let result = watcher.reconnect().await;
            (watcher, result)
        });
        settle().await;
        assert_eq!(transport.opened(), 2);
        transport.last().open();
        let (watcher, result) = w.await.unwrap();
        result.unwrap();
        assert!(watcher.current().is_connected);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_watcher_removes_listeners() {
        let (client, _transport) = client();
        let before = client.listener_count();
        let watcher = StatusWatcher::new(client.clone());
        assert_eq!(client.listener_count(), before + 4);
        drop(watcher);
        assert_eq!(client.listener_count(), before);
    }
}
