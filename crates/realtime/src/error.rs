use crate::transport::TransportError;

/// Errors surfaced by [`RealtimeClient`](crate::RealtimeClient) calls.
///
/// Lifecycle faults after a connection opened are reported through
/// [`ConnectionEvent`](crate::ConnectionEvent) notifications, not here.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The socket could not be created.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The attempt ended (closed or superseded) before the socket opened.
    #[error("connection closed before it opened")]
    ClosedBeforeOpen,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
