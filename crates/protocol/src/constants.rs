use std::time::Duration;

/// Time to wait for a pong response (or any incoming frame).
///
/// Acts as a read deadline: if nothing arrives within this window the
/// connection is considered dead and closed as abnormal.
pub const WS_PONG_WAIT: Duration = Duration::from_secs(60);

/// How often to send pings (must be well below [`WS_PONG_WAIT`]).
pub const WS_PING_PERIOD: Duration = Duration::from_secs(20);

/// Maximum inbound message size in bytes (4 MB).
pub const WS_MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Close code for a normal, intentional shutdown.
pub const CLOSE_NORMAL: u16 = 1000;

/// Close code reported when a close frame carried no status.
pub const CLOSE_NO_STATUS: u16 = 1005;

/// Close code reported when the connection dropped without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Event stream endpoint of a locally running backend.
pub const DEFAULT_LOCAL_WS_URL: &str = "ws://localhost:8000/ws/events";

/// Event stream endpoint of the hosted backend.
pub const DEFAULT_REMOTE_WS_URL: &str = "wss://api.tunedeck.app/ws/events";
