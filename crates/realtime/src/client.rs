//! The realtime client facade.
//!
//! Owns the state machine, reconnect scheduler, subscription and listener
//! registries, deduplicator, inbound queue and the active socket. All of
//! it sits behind one `parking_lot::Mutex`; handlers mutate under the lock,
//! collect the notifications they produced, release the lock and only then
//! invoke callbacks. Callbacks may therefore call back into the client.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use tunedeck_protocol::constants::CLOSE_NORMAL;
use tunedeck_protocol::{WorkflowEvent, parse_event};

use crate::config::ClientConfig;
use crate::dedup::EventDeduplicator;
use crate::error::ClientError;
use crate::queue::MessageQueue;
use crate::reconnection::{ReconnectScheduler, RetryDecision, spawn_timer};
use crate::registry::{
    ListenerId, ListenerRegistry, SubscriptionId, SubscriptionRegistry, invoke_isolated,
};
use crate::state::StateMachine;
use crate::transport::{
    CloseInfo, Outgoing, Transport, TransportError, TransportEvent, TungsteniteTransport,
};
use crate::types::{
    ClientStats, ConnectionEvent, ConnectionEventKind, ConnectionState, NetworkStatus,
};

const EXHAUSTED: &str = "reconnection attempts exhausted";

/// Handle to a realtime client. Clones share the same connection.
#[derive(Clone)]
pub struct RealtimeClient {
    shared: Arc<Shared>,
}

struct Shared {
    config: ClientConfig,
    url: String,
    transport: Arc<dyn Transport>,
    inner: Mutex<Inner>,
}

struct ActiveSocket {
    generation: u64,
    outgoing: mpsc::UnboundedSender<Outgoing>,
    driver: JoinHandle<()>,
}

struct Inner {
    machine: StateMachine,
    scheduler: ReconnectScheduler,
    subscriptions: SubscriptionRegistry,
    listeners: ListenerRegistry,
    dedup: EventDeduplicator,
    queue: MessageQueue,
    socket: Option<ActiveSocket>,
    generation: u64,
    /// Pending `connect()` calls; resolved `true` on open.
    waiters: Vec<oneshot::Sender<bool>>,
    network_task: Option<JoinHandle<()>>,
    last_connected_at: Option<DateTime<Utc>>,
    last_opened: Option<Instant>,
    last_disconnected_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    total_events_processed: u64,
    total_reconnections: u64,
}

impl Inner {
    /// Applies a transition, queueing the `StateChange` notification when
    /// the state actually changed.
    fn transition(&mut self, next: ConnectionState, out: &mut Vec<ConnectionEvent>) -> bool {
        match self.machine.transition(next) {
            Ok(Some(t)) => {
                debug!(from = %t.previous, to = %t.current, "connection state changed");
                out.push(ConnectionEvent::StateChange {
                    previous: t.previous,
                    current: t.current,
                });
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!("{e}");
                false
            }
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.socket
            .as_ref()
            .is_some_and(|s| s.generation == generation)
    }

    fn take_waiters(&mut self) -> Vec<oneshot::Sender<bool>> {
        std::mem::take(&mut self.waiters)
    }
}

impl RealtimeClient {
    /// Creates a client that connects over tokio-tungstenite.
    pub fn new(config: ClientConfig) -> Self {
        Self::with_transport(config, Arc::new(TungsteniteTransport))
    }

    /// Creates a client over an arbitrary transport.
    ///
    /// Values that fail [`ClientConfig::validate`] are replaced by their
    /// defaults.
    pub fn with_transport(config: ClientConfig, transport: Arc<dyn Transport>) -> Self {
        let config = match config.validate() {
            Ok(()) => config,
            Err(e) => {
                warn!(error = %e, "invalid client configuration, falling back to defaults");
                config.sanitized()
            }
        };
        let url = config.resolved_url();
        let inner = Inner {
            machine: StateMachine::new(),
            scheduler: ReconnectScheduler::new(config.reconnection.clone()),
            subscriptions: SubscriptionRegistry::default(),
            listeners: ListenerRegistry::default(),
            dedup: EventDeduplicator::new(config.enable_deduplication, config.max_event_history),
            queue: MessageQueue::new(config.max_queue_size),
            socket: None,
            generation: 0,
            waiters: Vec::new(),
            network_task: None,
            last_connected_at: None,
            last_opened: None,
            last_disconnected_at: None,
            last_error: None,
            total_events_processed: 0,
            total_reconnections: 0,
        };
        debug!(url = %url, "realtime client created");
        Self {
            shared: Arc::new(Shared {
                config,
                url,
                transport,
                inner: Mutex::new(inner),
            }),
        }
    }

    /// The socket URL this client connects to.
    pub fn url(&self) -> &str {
        &self.shared.url
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    /// Connects, resolving once the socket is open.
    ///
    /// Returns immediately when already connected. While an attempt is in
    /// flight no new socket is created; the call waits for that attempt.
    pub async fn connect(&self) -> Result<(), ClientError> {
        match self.begin_connect()? {
            None => Ok(()),
            Some(opened) => match opened.await {
                Ok(true) => Ok(()),
                _ => Err(ClientError::ClosedBeforeOpen),
            },
        }
    }

    /// Starts a connection attempt without waiting for it to open.
    pub(crate) fn begin_connect(&self) -> Result<Option<oneshot::Receiver<bool>>, ClientError> {
        let mut out = Vec::new();
        let result = {
            let mut inner = self.shared.inner.lock();
            match inner.machine.state() {
                ConnectionState::Connected => {
                    debug!("connect ignored: already connected");
                    Ok(None)
                }
                ConnectionState::Connecting => {
                    debug!("connect joined the attempt in flight");
                    let (tx, rx) = oneshot::channel();
                    inner.waiters.push(tx);
                    Ok(Some(rx))
                }
                state => {
                    inner.scheduler.cancel();
                    if state == ConnectionState::Failed {
                        inner.scheduler.reset();
                    }
                    match self.shared.open_socket(&mut inner, &mut out) {
                        Ok(()) => {
                            let (tx, rx) = oneshot::channel();
                            inner.waiters.push(tx);
                            Ok(Some(rx))
                        }
                        Err(e) => Err(ClientError::Transport(e)),
                    }
                }
            }
        };
        self.shared.emit(out);
        result
    }

    /// Cancels any pending retry, closes the socket and moves to
    /// `Disconnected`. Safe to call in any state.
    pub fn disconnect(&self) {
        self.shared.disconnect("client disconnect");
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.shared.inner.lock().machine.state()
    }

    /// Registers `callback` for every event of `run_id`.
    pub fn subscribe<F>(&self, run_id: &str, callback: F) -> Unsubscribe
    where
        F: Fn(&WorkflowEvent) + Send + Sync + 'static,
    {
        let id = self
            .shared
            .inner
            .lock()
            .subscriptions
            .subscribe(run_id, Arc::new(callback));
        debug!(run_id, subscription = ?id, "subscribed");
        Unsubscribe::new(&self.shared, Target::Subscription(id))
    }

    /// Removes every subscription for `run_id`.
    pub fn unsubscribe(&self, run_id: &str) {
        let removed = self.shared.inner.lock().subscriptions.remove_run(run_id);
        debug!(run_id, removed, "unsubscribed run");
    }

    /// Registers a lifecycle listener for one kind of notification.
    pub fn on<F>(&self, kind: ConnectionEventKind, callback: F) -> Unsubscribe
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        let id = self
            .shared
            .inner
            .lock()
            .listeners
            .add(kind, Arc::new(callback));
        Unsubscribe::new(&self.shared, Target::Listener(id))
    }

    /// Writes `text` if connected. Returns `false` when it was dropped.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        let inner = self.shared.inner.lock();
        if inner.machine.state() != ConnectionState::Connected {
            warn!(state = %inner.machine.state(), "send dropped: not connected");
            return false;
        }
        match &inner.socket {
            Some(socket) => socket.outgoing.send(Outgoing::Text(text.into())).is_ok(),
            None => false,
        }
    }

    /// JSON-encodes `message` and writes it if connected.
    pub fn send<T: Serialize + ?Sized>(&self, message: &T) -> Result<bool, ClientError> {
        let text = serde_json::to_string(message)?;
        Ok(self.send_text(text))
    }

    pub fn stats(&self) -> ClientStats {
        let inner = self.shared.inner.lock();
        let uptime_ms = inner
            .last_opened
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0);
        ClientStats {
            state: inner.machine.state(),
            subscription_count: inner.subscriptions.len(),
            queued_messages: inner.queue.len(),
            reconnect_attempt: inner.scheduler.attempt(),
            last_connected_at: inner.last_connected_at,
            last_disconnected_at: inner.last_disconnected_at,
            last_error: inner.last_error.clone(),
            total_events_processed: inner.total_events_processed,
            total_reconnections: inner.total_reconnections,
            uptime_ms,
        }
    }

    /// Number of listeners currently registered.
    pub fn listener_count(&self) -> usize {
        self.shared.inner.lock().listeners.len()
    }

    /// Accepts an event obtained out of band (e.g. a backfill).
    ///
    /// Processed right away when connected, otherwise queued and delivered
    /// on the next open.
    pub fn queue_event(&self, event: WorkflowEvent) {
        {
            let mut inner = self.shared.inner.lock();
            if inner.machine.state() != ConnectionState::Connected {
                if let Some(evicted) = inner.queue.enqueue(event) {
                    debug!(event_id = %evicted.data.event_id, "queue full, evicted oldest event");
                }
                return;
            }
        }
        self.shared.process_event(event);
    }

    pub fn clear_queue(&self) {
        self.shared.inner.lock().queue.clear();
    }

    /// Applies the network policy: going online while disconnected starts a
    /// fresh attempt, going offline forces a disconnect.
    pub fn handle_network_change(&self, status: NetworkStatus) {
        match status {
            NetworkStatus::Online => {
                if self.connection_state() == ConnectionState::Disconnected {
                    info!("network online, reconnecting");
                    if let Err(e) = self.begin_connect() {
                        warn!(error = %e, "reconnect after network online failed");
                    }
                }
            }
            NetworkStatus::Offline => {
                info!("network offline, disconnecting");
                self.shared.disconnect("network offline");
            }
        }
    }

    /// Follows `status` until the client is destroyed, replacing any
    /// previous watcher.
    pub fn watch_network(&self, mut status: watch::Receiver<NetworkStatus>) {
        let weak = Arc::downgrade(&self.shared);
        let task = tokio::spawn(async move {
            while status.changed().await.is_ok() {
                let current = *status.borrow_and_update();
                let Some(shared) = weak.upgrade() else { break };
                RealtimeClient { shared }.handle_network_change(current);
            }
        });
        if let Some(previous) = self.shared.inner.lock().network_task.replace(task) {
            previous.abort();
        }
    }

    /// Disconnects and drops every subscription, listener, queued event and
    /// remembered event id. Affects every holder of this client.
    pub fn destroy(&self) {
        self.shared.disconnect("client destroyed");
        let mut inner = self.shared.inner.lock();
        if let Some(task) = inner.network_task.take() {
            task.abort();
        }
        inner.subscriptions.clear();
        inner.listeners.clear();
        inner.queue.clear();
        inner.dedup.clear();
        info!("realtime client destroyed");
    }

    /// Whether both handles refer to the same client.
    pub fn same_client(&self, other: &RealtimeClient) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl std::fmt::Debug for RealtimeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeClient")
            .field("url", &self.shared.url)
            .field("state", &self.connection_state())
            .finish_non_exhaustive()
    }
}

impl Shared {
    /// Creates a socket for a new attempt. On failure the client is moved to
    /// `Failed` and an `Error` notification is queued.
    fn open_socket(
        self: &Arc<Self>,
        inner: &mut Inner,
        out: &mut Vec<ConnectionEvent>,
    ) -> Result<(), TransportError> {
        inner.transition(ConnectionState::Connecting, out);

        let opened = tokio::runtime::Handle::try_current()
            .map_err(|_| TransportError::NoRuntime)
            .and_then(|handle| self.transport.open(&self.url).map(|conn| (handle, conn)));

        match opened {
            Ok((handle, conn)) => {
                inner.generation += 1;
                let generation = inner.generation;
                info!(url = %self.url, generation, "connecting");
                let driver =
                    handle.spawn(drive_socket(Arc::downgrade(self), generation, conn.events));
                inner.socket = Some(ActiveSocket {
                    generation,
                    outgoing: conn.outgoing,
                    driver,
                });
                Ok(())
            }
            Err(e) => {
                warn!(url = %self.url, error = %e, "failed to create socket");
                let message = e.to_string();
                inner.last_error = Some(message.clone());
                inner.transition(ConnectionState::Failed, out);
                out.push(ConnectionEvent::Error { message });
                Err(e)
            }
        }
    }

    fn disconnect(&self, reason: &str) {
        let mut out = Vec::new();
        let waiters = {
            let mut inner = self.inner.lock();
            inner.scheduler.cancel();
            let detached = inner.socket.take();
            if inner.transition(ConnectionState::Disconnected, &mut out) {
                info!(reason, "disconnected");
            }
            if let Some(socket) = detached {
                let _ = socket.outgoing.send(Outgoing::Close);
                socket.driver.abort();
                inner.last_disconnected_at = Some(Utc::now());
                out.push(ConnectionEvent::Disconnected {
                    code: CLOSE_NORMAL,
                    reason: reason.to_string(),
                    was_clean: true,
                });
            }
            inner.take_waiters()
        };
        self.emit(out);
        for waiter in waiters {
            let _ = waiter.send(false);
        }
    }

    fn handle_transport_event(self: &Arc<Self>, generation: u64, event: TransportEvent) {
        match event {
            TransportEvent::Open => self.on_open(generation),
            TransportEvent::Text(text) => self.on_text(generation, &text),
            TransportEvent::Error(message) => self.on_error(generation, message),
            TransportEvent::Closed(close) => self.on_close(generation, close),
        }
    }

    fn on_open(&self, generation: u64) {
        let mut out = Vec::new();
        let (waiters, batch) = {
            let mut inner = self.inner.lock();
            if !inner.is_current(generation) {
                trace!(generation, "ignoring open from stale socket");
                return;
            }
            inner.transition(ConnectionState::Connected, &mut out);
            if inner.scheduler.attempt() > 0 {
                inner.total_reconnections += 1;
            }
            inner.scheduler.reset();
            inner.last_error = None;
            inner.last_connected_at = Some(Utc::now());
            inner.last_opened = Some(Instant::now());
            out.push(ConnectionEvent::Connected);
            (inner.take_waiters(), inner.queue.drain_all())
        };
        info!(url = %self.url, "connected");

        self.emit(out);
        for waiter in waiters {
            let _ = waiter.send(true);
        }

        if !batch.is_empty() {
            debug!(count = batch.len(), "flushing queued events");
        }
        for mut item in batch {
            item.attempts += 1;
            trace!(id = %item.id, attempts = item.attempts, "redelivering queued event");
            self.process_event(item.data);
        }
    }

    fn on_text(&self, generation: u64, text: &str) {
        if !self.inner.lock().is_current(generation) {
            return;
        }
        match parse_event(text) {
            Ok(event) => {
                if self.config.debug {
                    debug!(
                        event_id = %event.event_id,
                        run_id = %event.run_id,
                        phase = %event.phase,
                        "event received"
                    );
                }
                self.process_event(event);
            }
            Err(e) => warn!(error = %e, "dropping invalid event frame"),
        }
    }

    /// Dedup, count, fan out to the run's subscribers, then notify
    /// `Message` listeners.
    fn process_event(&self, event: WorkflowEvent) {
        let targets = {
            let mut inner = self.inner.lock();
            if !inner.dedup.accept(&event.event_id) {
                debug!(event_id = %event.event_id, "duplicate event dropped");
                return;
            }
            inner.total_events_processed += 1;
            inner.subscriptions.targets(&event.run_id)
        };

        if targets.is_empty() {
            trace!(run_id = %event.run_id, "no subscribers for run");
        } else if self.config.debug {
            debug!(run_id = %event.run_id, subscribers = targets.len(), "dispatching event");
        }
        for (id, callback) in targets {
            invoke_isolated("subscription", || callback(&event));
            self.inner.lock().subscriptions.record_delivery(id);
        }

        self.emit(vec![ConnectionEvent::Message(event)]);
    }

    fn on_error(&self, generation: u64, message: String) {
        {
            let mut inner = self.inner.lock();
            if !inner.is_current(generation) {
                return;
            }
            inner.last_error = Some(message.clone());
        }
        warn!(error = %message, "transport error");
        self.emit(vec![ConnectionEvent::Error { message }]);
    }

    fn on_close(self: &Arc<Self>, generation: u64, close: CloseInfo) {
        let mut out = Vec::new();
        let (should_reconnect, waiters) = {
            let mut inner = self.inner.lock();
            if !inner.is_current(generation) {
                trace!(generation, "ignoring close from stale socket");
                return;
            }
            inner.socket = None;
            inner.last_disconnected_at = Some(Utc::now());
            let should_reconnect = !close.was_clean
                && matches!(
                    inner.machine.state(),
                    ConnectionState::Connected
                        | ConnectionState::Connecting
                        | ConnectionState::Reconnecting
                );
            inner.transition(ConnectionState::Disconnected, &mut out);
            out.push(ConnectionEvent::Disconnected {
                code: close.code,
                reason: close.reason.clone(),
                was_clean: close.was_clean,
            });
            (should_reconnect, inner.take_waiters())
        };
        info!(
            code = close.code,
            clean = close.was_clean,
            reason = %close.reason,
            "socket closed"
        );

        self.emit(out);
        for waiter in waiters {
            let _ = waiter.send(false);
        }
        if should_reconnect {
            self.schedule_reconnect();
        }
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        let mut out = Vec::new();
        {
            let mut inner = self.inner.lock();
            // A listener may have reconnected or disconnected in the meantime.
            if inner.machine.state() != ConnectionState::Disconnected || inner.socket.is_some() {
                debug!(state = %inner.machine.state(), "reconnect skipped");
                return;
            }
            match inner.scheduler.next_retry() {
                RetryDecision::Exhausted => {
                    warn!(attempts = inner.scheduler.attempt(), "{EXHAUSTED}");
                    inner.last_error = Some(EXHAUSTED.to_string());
                    inner.transition(ConnectionState::Failed, &mut out);
                    out.push(ConnectionEvent::Error {
                        message: EXHAUSTED.to_string(),
                    });
                }
                RetryDecision::Retry { attempt, delay } => {
                    inner.transition(ConnectionState::Reconnecting, &mut out);
                    out.push(ConnectionEvent::Reconnecting { attempt, delay });
                    let (timer_id, token) = inner.scheduler.arm();
                    let weak = Arc::downgrade(self);
                    spawn_timer(delay, token, move || {
                        if let Some(shared) = weak.upgrade() {
                            shared.on_timer(timer_id);
                        }
                    });
                    info!(attempt, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
                }
            }
        }
        self.emit(out);
    }

    fn on_timer(self: &Arc<Self>, timer_id: u64) {
        let mut out = Vec::new();
        {
            let mut inner = self.inner.lock();
            if !inner.scheduler.take_fired(timer_id)
                || inner.machine.state() != ConnectionState::Reconnecting
            {
                return;
            }
            debug!(attempt = inner.scheduler.attempt(), "reconnect timer fired");
            // Failure is already recorded and queued as an Error notification.
            let _ = self.open_socket(&mut inner, &mut out);
        }
        self.emit(out);
    }

    /// Delivers notifications in order, outside the lock.
    fn emit(&self, events: Vec<ConnectionEvent>) {
        for event in events {
            let targets = self.inner.lock().listeners.targets(event.kind());
            for callback in targets {
                invoke_isolated("connection listener", || callback(&event));
            }
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        inner.scheduler.cancel();
        if let Some(task) = inner.network_task.take() {
            task.abort();
        }
        if let Some(socket) = inner.socket.take() {
            let _ = socket.outgoing.send(Outgoing::Close);
            socket.driver.abort();
        }
    }
}

/// Feeds one socket's events into the client until it closes.
async fn drive_socket(
    shared: Weak<Shared>,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        let closed = matches!(event, TransportEvent::Closed(_));
        shared.handle_transport_event(generation, event);
        if closed {
            break;
        }
    }
    trace!(generation, "socket driver finished");
}

enum Target {
    Subscription(SubscriptionId),
    Listener(ListenerId),
}

/// Removes one subscription or listener. Repeat calls are no-ops.
///
/// Dropping the handle does not unsubscribe.
pub struct Unsubscribe {
    shared: Weak<Shared>,
    target: Target,
    done: AtomicBool,
}

impl Unsubscribe {
    fn new(shared: &Arc<Shared>, target: Target) -> Self {
        Self {
            shared: Arc::downgrade(shared),
            target,
            done: AtomicBool::new(false),
        }
    }

    pub fn unsubscribe(&self) {
        if self.done.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let mut inner = shared.inner.lock();
        match self.target {
            Target::Subscription(id) => {
                inner.subscriptions.remove(id);
            }
            Target::Listener(id) => {
                inner.listeners.remove(id);
            }
        }
    }
}

impl std::fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Unsubscribe")
            .field("done", &self.done.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}
