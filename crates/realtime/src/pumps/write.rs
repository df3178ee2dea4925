//! WebSocket write pump: serialises outbound frames.

use futures_util::SinkExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::transport::Outgoing;

/// Writes client frames and transport control frames (pings, pongs).
///
/// Ends with a normal-closure frame when the client asks for it, when the
/// client side of the channel is dropped, or on cancellation.
pub(crate) async fn write_pump<S>(
    mut write: S,
    mut outgoing_rx: mpsc::UnboundedReceiver<Outgoing>,
    mut control_rx: mpsc::Receiver<tungstenite::Message>,
    cancel: CancellationToken,
) where
    S: SinkExt<tungstenite::Message, Error = tungstenite::Error> + Unpin,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            Some(frame) = control_rx.recv() => {
                if let Err(e) = write.send(frame).await {
                    error!("WebSocket write error: {e}");
                    return;
                }
            }

            msg = outgoing_rx.recv() => {
                match msg {
                    Some(Outgoing::Text(text)) => {
                        if let Err(e) = write.send(tungstenite::Message::Text(text.into())).await {
                            error!("WebSocket write error: {e}");
                            return;
                        }
                    }
                    Some(Outgoing::Close) | None => {
                        debug!("closing WebSocket");
                        break;
                    }
                }
            }
        }
    }

    let close = CloseFrame {
        code: CloseCode::Normal,
        reason: String::new().into(),
    };
    let _ = write.send(tungstenite::Message::Close(Some(close))).await;
}
