//! WebSocket read pump: forwards inbound frames as transport events.

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use tunedeck_protocol::constants::{CLOSE_NO_STATUS, WS_PONG_WAIT};

use crate::transport::{CloseInfo, TransportEvent};

/// Reads frames until the socket closes and reports how it closed.
///
/// Uses a read deadline to detect dead connections: any inbound frame
/// resets it, and if nothing arrives within [`WS_PONG_WAIT`] the socket is
/// treated as dropped (abnormal close).
pub(crate) async fn read_pump<S>(
    mut read: S,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    control_tx: mpsc::Sender<tungstenite::Message>,
    cancel: CancellationToken,
) -> CloseInfo
where
    S: StreamExt<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    let deadline = tokio::time::sleep(WS_PONG_WAIT);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                return CloseInfo::abnormal("cancelled");
            }

            () = &mut deadline => {
                warn!("read deadline expired, connection dead");
                return CloseInfo::abnormal("read timeout");
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(msg)) => {
                        deadline
                            .as_mut()
                            .reset(tokio::time::Instant::now() + WS_PONG_WAIT);

                        match msg {
                            tungstenite::Message::Text(text) => {
                                trace!(bytes = text.len(), "received text frame");
                                let _ = events_tx.send(TransportEvent::Text(text.to_string()));
                            }
                            tungstenite::Message::Ping(data) => {
                                trace!("received ping, sending pong");
                                let _ = control_tx.send(tungstenite::Message::Pong(data)).await;
                            }
                            tungstenite::Message::Pong(_) => {
                                trace!("received pong");
                            }
                            tungstenite::Message::Close(frame) => {
                                let info = match frame {
                                    Some(f) => CloseInfo {
                                        code: u16::from(f.code),
                                        reason: f.reason.to_string(),
                                        was_clean: true,
                                    },
                                    None => CloseInfo {
                                        code: CLOSE_NO_STATUS,
                                        reason: String::new(),
                                        was_clean: true,
                                    },
                                };
                                debug!(code = info.code, "received close frame");
                                return info;
                            }
                            _ => {} // Binary frames are not part of the event protocol.
                        }
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket read error: {e}");
                        let _ = events_tx.send(TransportEvent::Error(e.to_string()));
                        return CloseInfo::abnormal(e.to_string());
                    }
                    None => {
                        debug!("WebSocket stream ended without close frame");
                        return CloseInfo::abnormal("stream ended");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use tokio_tungstenite::tungstenite::protocol::CloseFrame;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

    type Item = Result<tungstenite::Message, tungstenite::Error>;

    fn channels() -> (
        mpsc::UnboundedSender<TransportEvent>,
        mpsc::UnboundedReceiver<TransportEvent>,
        mpsc::Sender<tungstenite::Message>,
        mpsc::Receiver<tungstenite::Message>,
    ) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::channel(16);
        (events_tx, events_rx, control_tx, control_rx)
    }

    #[tokio::test]
    async fn forwards_text_then_reports_clean_close() {
        let (events_tx, mut events_rx, control_tx, _control_rx) = channels();
        let frames: Vec<Item> = vec![
            Ok(tungstenite::Message::Text("one".into())),
            Ok(tungstenite::Message::Text("two".into())),
            Ok(tungstenite::Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: String::from("bye").into(),
            }))),
        ];

        let close = read_pump(
            stream::iter(frames),
            events_tx,
            control_tx,
            CancellationToken::new(),
        )
        .await;

        assert_eq!(close.code, 1000);
        assert_eq!(close.reason, "bye");
        assert!(close.was_clean);
        assert_eq!(events_rx.recv().await, Some(TransportEvent::Text("one".into())));
        assert_eq!(events_rx.recv().await, Some(TransportEvent::Text("two".into())));
    }

    #[tokio::test]
    async fn stream_end_is_abnormal() {
        let (events_tx, _events_rx, control_tx, _control_rx) = channels();
        let close = read_pump(
            stream::empty::<Item>(),
            events_tx,
            control_tx,
            CancellationToken::new(),
        )
        .await;
        assert_eq!(close.code, 1006);
        assert!(!close.was_clean);
    }

    #[tokio::test]
    async fn read_error_reports_error_event() {
        let (events_tx, mut events_rx, control_tx, _control_rx) = channels();
        let frames: Vec<Item> = vec![Err(tungstenite::Error::ConnectionClosed)];
        let close = read_pump(
            stream::iter(frames),
            events_tx,
            control_tx,
            CancellationToken::new(),
        )
        .await;
        assert!(!close.was_clean);
        assert!(matches!(
            events_rx.recv().await,
            Some(TransportEvent::Error(_))
        ));
    }

    #[tokio::test]
    async fn answers_ping_with_pong() {
        let (events_tx, _events_rx, control_tx, mut control_rx) = channels();
        let frames: Vec<Item> = vec![Ok(tungstenite::Message::Ping(vec![1, 2].into()))];
        read_pump(
            stream::iter(frames),
            events_tx,
            control_tx,
            CancellationToken::new(),
        )
        .await;
        assert!(matches!(
            control_rx.recv().await,
            Some(tungstenite::Message::Pong(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn silence_hits_read_deadline() {
        let (events_tx, _events_rx, control_tx, _control_rx) = channels();
        let close = read_pump(
            stream::pending::<Item>(),
            events_tx,
            control_tx,
            CancellationToken::new(),
        )
        .await;
        assert_eq!(close.reason, "read timeout");
        assert!(!close.was_clean);
    }

    #[tokio::test]
    async fn stops_on_cancel() {
        let (events_tx, _events_rx, control_tx, _control_rx) = channels();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let close = read_pump(stream::pending::<Item>(), events_tx, control_tx, cancel).await;
        assert_eq!(close.reason, "cancelled");
    }
}
