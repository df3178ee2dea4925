//! In-memory transport for driving the client from tests.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use tunedeck_protocol::{Phase, WorkflowEvent};

use crate::client::RealtimeClient;
use crate::transport::{CloseInfo, Connection, Outgoing, Transport, TransportError, TransportEvent};

/// Records every socket the client opens. Tests push lifecycle events
/// into a socket by hand.
#[derive(Default)]
pub(crate) struct MockTransport {
    sockets: Mutex<Vec<MockSocket>>,
    fail_next: Mutex<Option<TransportError>>,
    urls: Mutex<Vec<String>>,
}

impl MockTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of sockets created so far.
    pub(crate) fn opened(&self) -> usize {
        self.sockets.lock().len()
    }

    pub(crate) fn last(&self) -> MockSocket {
        self.sockets
            .lock()
            .last()
            .cloned()
            .expect("no socket opened yet")
    }

    pub(crate) fn last_url(&self) -> Option<String> {
        self.urls.lock().last().cloned()
    }

    /// Makes the next `open` fail synchronously.
    pub(crate) fn fail_next(&self, error: TransportError) {
        *self.fail_next.lock() = Some(error);
    }
}

impl Transport for MockTransport {
    fn open(&self, url: &str) -> Result<Connection, TransportError> {
        self.urls.lock().push(url.to_string());
        if let Some(error) = self.fail_next.lock().take() {
            return Err(error);
        }
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        self.sockets.lock().push(MockSocket {
            events: events_tx,
            outgoing: Arc::new(Mutex::new(outgoing_rx)),
        });
        Ok(Connection {
            events: events_rx,
            outgoing: outgoing_tx,
        })
    }
}

#[derive(Clone)]
pub(crate) struct MockSocket {
    events: mpsc::UnboundedSender<TransportEvent>,
    outgoing: Arc<Mutex<mpsc::UnboundedReceiver<Outgoing>>>,
}

impl MockSocket {
    pub(crate) fn open(&self) {
        let _ = self.events.send(TransportEvent::Open);
    }

    pub(crate) fn text(&self, text: impl Into<String>) {
        let _ = self.events.send(TransportEvent::Text(text.into()));
    }

    pub(crate) fn deliver(&self, event: &WorkflowEvent) {
        self.text(serde_json::to_string(event).expect("serialize event"));
    }

    pub(crate) fn error(&self, message: &str) {
        let _ = self.events.send(TransportEvent::Error(message.to_string()));
    }

    pub(crate) fn close(&self, code: u16, was_clean: bool) {
        let _ = self.events.send(TransportEvent::Closed(CloseInfo {
            code,
            reason: String::new(),
            was_clean,
        }));
    }

    /// Everything the client wrote since the last call.
    pub(crate) fn sent(&self) -> Vec<Outgoing> {
        let mut rx = self.outgoing.lock();
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }
}

pub(crate) fn event(event_id: &str, run_id: &str) -> WorkflowEvent {
    WorkflowEvent::new(event_id, run_id, "2024-01-01T00:00:00Z", Phase::Info)
}

/// Lets spawned tasks (socket drivers, timers) run to quiescence.
pub(crate) async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

/// Connects `client`, opens the socket it created and returns that socket.
pub(crate) async fn connect_open(client: &RealtimeClient, transport: &MockTransport) -> MockSocket {
    let c = client.clone();
    let pending = tokio::spawn(async move { c.connect().await });
    settle().await;
    let socket = transport.last();
    socket.open();
    pending.await.unwrap().unwrap();
    socket
}
