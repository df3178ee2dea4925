//! Public types for the realtime client.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use tunedeck_protocol::WorkflowEvent;

/// Connection state of the client. Exactly one holds at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No socket and no pending retry.
    Disconnected,
    /// Socket created, handshake in progress.
    Connecting,
    /// Socket open.
    Connected,
    /// Connection lost, a retry timer is pending.
    Reconnecting,
    /// Gave up. Only an explicit `connect()` leaves this state.
    Failed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Lifecycle notifications, independent of per-run subscriptions.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// The socket opened.
    Connected,
    /// The socket closed or was detached by `disconnect()`.
    Disconnected {
        code: u16,
        reason: String,
        was_clean: bool,
    },
    /// A retry was scheduled.
    Reconnecting { attempt: u32, delay: Duration },
    /// A connection-level fault.
    Error { message: String },
    /// An inbound event was accepted and dispatched.
    Message(WorkflowEvent),
    /// The connection state changed.
    StateChange {
        previous: ConnectionState,
        current: ConnectionState,
    },
}

impl ConnectionEvent {
    pub fn kind(&self) -> ConnectionEventKind {
        match self {
            Self::Connected => ConnectionEventKind::Connected,
            Self::Disconnected { .. } => ConnectionEventKind::Disconnected,
            Self::Reconnecting { .. } => ConnectionEventKind::Reconnecting,
            Self::Error { .. } => ConnectionEventKind::Error,
            Self::Message(_) => ConnectionEventKind::Message,
            Self::StateChange { .. } => ConnectionEventKind::StateChange,
        }
    }
}

/// Discriminant of [`ConnectionEvent`], used to register listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionEventKind {
    Connected,
    Disconnected,
    Reconnecting,
    Error,
    Message,
    StateChange,
}

/// Host network reachability, fed by the embedding application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkStatus {
    Online,
    Offline,
}

/// Point-in-time statistics, recomputed on every call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientStats {
    pub state: ConnectionState,
    pub subscription_count: usize,
    pub queued_messages: usize,
    pub reconnect_attempt: u32,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub last_disconnected_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub total_events_processed: u64,
    pub total_reconnections: u64,
    pub uptime_ms: u64,
}
