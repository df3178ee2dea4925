//! Socket transport.
//!
//! [`Transport::open`] mirrors constructing a browser `WebSocket`: it
//! returns immediately with a [`Connection`] (or fails synchronously on a
//! bad URL), and the lifecycle arrives later as [`TransportEvent`]s.

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tunedeck_protocol::constants::{CLOSE_ABNORMAL, WS_MAX_MESSAGE_SIZE, WS_PING_PERIOD};

use crate::pumps::{ping::ping_pump, read::read_pump, write::write_pump};

/// Errors raised synchronously while creating a socket.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    #[error("invalid WebSocket URL: {0}")]
    InvalidUrl(String),

    #[error("no tokio runtime available to drive the socket")]
    NoRuntime,
}

/// How a socket closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
    /// `true` only if the close handshake completed.
    pub was_clean: bool,
}

impl CloseInfo {
    /// A close without handshake (code 1006).
    pub fn abnormal(reason: impl Into<String>) -> Self {
        Self {
            code: CLOSE_ABNORMAL,
            reason: reason.into(),
            was_clean: false,
        }
    }
}

/// Lifecycle of one socket, in the order the transport observed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Open,
    Text(String),
    Error(String),
    Closed(CloseInfo),
}

/// Frames the client asks the transport to write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    Text(String),
    /// Start a normal close handshake.
    Close,
}

/// Both directions of one socket.
#[derive(Debug)]
pub struct Connection {
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
    pub outgoing: mpsc::UnboundedSender<Outgoing>,
}

/// Creates sockets.
pub trait Transport: Send + Sync + 'static {
    fn open(&self, url: &str) -> Result<Connection, TransportError>;
}

/// Production transport over tokio-tungstenite.
#[derive(Debug, Clone, Default)]
pub struct TungsteniteTransport;

impl Transport for TungsteniteTransport {
    fn open(&self, url: &str) -> Result<Connection, TransportError> {
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(TransportError::InvalidUrl(url.to_string()));
        }
        let request = url
            .into_client_request()
            .map_err(|e| TransportError::InvalidUrl(format!("{url}: {e}")))?;
        let handle =
            tokio::runtime::Handle::try_current().map_err(|_| TransportError::NoRuntime)?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        handle.spawn(run_socket(url.to_string(), request, events_tx, outgoing_rx));

        Ok(Connection {
            events: events_rx,
            outgoing: outgoing_tx,
        })
    }
}

/// Performs the handshake, then runs the pumps until the socket closes.
async fn run_socket(
    url: String,
    request: tungstenite::handshake::client::Request,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    outgoing_rx: mpsc::UnboundedReceiver<Outgoing>,
) {
    let mut ws_config = tungstenite::protocol::WebSocketConfig::default();
    ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
    ws_config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);

    let ws_stream =
        match tokio_tungstenite::connect_async_with_config(request, Some(ws_config), false).await {
            Ok((stream, _)) => stream,
            Err(e) => {
                warn!(url = %url, error = %e, "WebSocket handshake failed");
                let _ = events_tx.send(TransportEvent::Error(e.to_string()));
                let _ = events_tx.send(TransportEvent::Closed(CloseInfo::abnormal(
                    "handshake failed",
                )));
                return;
            }
        };

    info!(url = %url, "WebSocket open");
    let _ = events_tx.send(TransportEvent::Open);

    let (write, read) = ws_stream.split();
    let (control_tx, control_rx) = mpsc::channel::<tungstenite::Message>(64);
    let cancel = CancellationToken::new();

    let write_handle = tokio::spawn(write_pump(write, outgoing_rx, control_rx, cancel.clone()));
    let ping_handle = tokio::spawn(ping_pump(control_tx.clone(), WS_PING_PERIOD, cancel.clone()));

    let close = read_pump(read, events_tx.clone(), control_tx, cancel.clone()).await;

    cancel.cancel();
    let _ = write_handle.await;
    ping_handle.abort();

    debug!(url = %url, code = close.code, clean = close.was_clean, "WebSocket closed");
    let _ = events_tx.send(TransportEvent::Closed(close));
}
