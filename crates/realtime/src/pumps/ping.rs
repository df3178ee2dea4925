//! WebSocket ping pump: periodic keepalive pings.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Queues a ping every `period` so the server's replies keep the read
/// deadline alive on quiet runs. Each ping carries its sequence number as a
/// big-endian `u64`.
///
/// A ping is skipped, not awaited, while the control channel is full.
/// Returns the number of pings queued.
pub(crate) async fn ping_pump(
    control_tx: mpsc::Sender<tungstenite::Message>,
    period: Duration,
    cancel: CancellationToken,
) -> u64 {
    let mut ticks = tokio::time::interval_at(Instant::now() + period, period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut seq: u64 = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticks.tick() => {
                let ping = tungstenite::Message::Ping(seq.to_be_bytes().to_vec().into());
                match control_tx.try_send(ping) {
                    Ok(()) => seq += 1,
                    Err(TrySendError::Full(_)) => trace!(seq, "control channel full, ping skipped"),
                    Err(TrySendError::Closed(_)) => break,
                }
            }
        }
    }
    seq
}
