//! Real-time workflow event client.
//!
//! Keeps one WebSocket to the workflow backend open with exponential
//! backoff reconnection, drops duplicate events, and fans events out to
//! per-run subscribers. Lifecycle changes are published to connection
//! listeners and, through [`StatusWatcher`], as a watchable snapshot.

pub mod client;
pub mod config;
pub(crate) mod dedup;
pub mod error;
mod pumps;
pub(crate) mod queue;
pub mod reconnection;
pub mod registry;
pub mod shared;
pub mod state;
pub mod transport;
pub mod types;
pub mod watchers;

#[cfg(test)]
pub(crate) mod testing;

pub use client::{RealtimeClient, Unsubscribe};
pub use config::{ClientConfig, ConfigError, ReconnectConfig};
pub use error::ClientError;
pub use queue::QueuedMessage;
pub use shared::{init_shared, reset_shared, shared};
pub use transport::{Transport, TransportError, TungsteniteTransport};
pub use types::{
    ClientStats, ConnectionEvent, ConnectionEventKind, ConnectionState, NetworkStatus,
};
pub use watchers::{ConnectionStatus, FeedOptions, StatusWatcher, WorkflowEventFeed};

pub use tunedeck_protocol::{Phase, WorkflowEvent};
