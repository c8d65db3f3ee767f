//! WebSocket transport over `tokio-tungstenite`.
//!
//! Each open spawns one task that owns the socket: it writes queued frames,
//! reads inbound messages into the event stream and performs the close
//! handshake. Frames that are valid UTF-8 go out as text, everything else as
//! binary. Ping/pong control frames are answered by tungstenite itself.
//!
//! After sending a close frame the task waits at most the close grace for the
//! peer's reply, then drops the socket either way.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, Stream, StreamExt};
use lifeline_core::TransportError;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::transport::{Transport, TransportEvent, TransportEvents, TransportHandle};

const DEFAULT_OUTBOUND_QUEUE: usize = 256;
const DEFAULT_CLOSE_GRACE: Duration = Duration::from_secs(5);

/// [`Transport`] speaking WebSocket.
#[derive(Clone, Debug)]
pub struct WsTransport {
    outbound_queue: usize,
    close_grace: Duration,
}

impl Default for WsTransport {
    fn default() -> Self {
        Self {
            outbound_queue: DEFAULT_OUTBOUND_QUEUE,
            close_grace: DEFAULT_CLOSE_GRACE,
        }
    }
}

impl WsTransport {
    /// Transport with the default outbound queue depth.
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport whose handles queue at most `depth` unsent frames.
    pub fn with_outbound_queue(depth: usize) -> Self {
        Self {
            outbound_queue: depth.max(1),
            ..Self::default()
        }
    }

    /// How long a closing socket waits for the peer's close reply.
    #[must_use]
    pub fn with_close_grace(mut self, grace: Duration) -> Self {
        self.close_grace = grace;
        self
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn open(
        &self,
        endpoint: &str,
    ) -> Result<(Arc<dyn TransportHandle>, TransportEvents), TransportError> {
        let (stream, _response) = tokio_tungstenite::connect_async(endpoint)
            .await
            .map_err(|e| TransportError::Open(e.to_string()))?;
        debug!(endpoint, "websocket open");

        let (mut write, mut read) = stream.split();
        let (frame_tx, mut frame_rx) = mpsc::channel::<Vec<u8>>(self.outbound_queue);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let close = CancellationToken::new();
        let close_requested = close.clone();
        let close_grace = self.close_grace;

        drop(tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = close_requested.cancelled() => {
                        let frame = CloseFrame {
                            code: CloseCode::Normal,
                            reason: String::new().into(),
                        };
                        if write.send(Message::Close(Some(frame))).await.is_err() {
                            let _ = event_tx.send(TransportEvent::Closed(None));
                        } else {
                            await_close_reply(&mut read, &event_tx, close_grace).await;
                        }
                        break;
                    }
                    frame = frame_rx.recv() => {
                        let Some(frame) = frame else {
                            // every handle dropped
                            close_requested.cancel();
                            continue;
                        };
                        if let Err(e) = write.send(to_message(frame)).await {
                            let _ = event_tx.send(TransportEvent::Error(TransportError::Send(e.to_string())));
                            break;
                        }
                    }
                    msg = read.next() => match msg {
                        Some(Ok(Message::Text(text))) => {
                            let _ = event_tx.send(TransportEvent::Message(text.as_bytes().to_vec()));
                        }
                        Some(Ok(Message::Binary(data))) => {
                            let _ = event_tx.send(TransportEvent::Message(data.to_vec()));
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let code = frame.map(|f| u16::from(f.code));
                            trace!(?code, "websocket close frame");
                            let _ = event_tx.send(TransportEvent::Closed(code));
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            let _ = event_tx.send(TransportEvent::Error(TransportError::Protocol(e.to_string())));
                            break;
                        }
                        None => {
                            let _ = event_tx.send(TransportEvent::Closed(None));
                            break;
                        }
                    },
                }
            }
        }));

        let handle: Arc<dyn TransportHandle> = Arc::new(WsHandle {
            frames: frame_tx,
            close,
        });
        Ok((handle, event_rx))
    }
}

/// Wait up to `grace` for the peer's close frame and report the close.
/// Inbound data arriving meanwhile is discarded.
async fn await_close_reply<S>(
    read: &mut S,
    events: &mpsc::UnboundedSender<TransportEvent>,
    grace: Duration,
) where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let reply = tokio::time::timeout(grace, async {
        loop {
            match read.next().await {
                Some(Ok(Message::Close(frame))) => return frame.map(|f| u16::from(f.code)),
                Some(Ok(_)) => {}
                Some(Err(_)) | None => return None,
            }
        }
    })
    .await;
    let code = match reply {
        Ok(code) => code,
        Err(_) => {
            debug!(grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX), "no close reply, dropping socket");
            None
        }
    };
    let _ = events.send(TransportEvent::Closed(code));
}

fn to_message(frame: Vec<u8>) -> Message {
    match String::from_utf8(frame) {
        Ok(text) => Message::Text(text.into()),
        Err(e) => Message::Binary(e.into_bytes().into()),
    }
}

struct WsHandle {
    frames: mpsc::Sender<Vec<u8>>,
    close: CancellationToken,
}

impl TransportHandle for WsHandle {
    fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        if self.close.is_cancelled() {
            return Err(TransportError::Closed);
        }
        self.frames.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::Send("outbound queue full".into()),
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })
    }

    fn close(&self) {
        self.close.cancel();
    }
}

impl Drop for WsHandle {
    fn drop(&mut self) {
        self.close.cancel();
    }
}
