//! `WebSocket` session lifecycle: one connected client from upgrade through
//! disconnect or eviction.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use futures::{SinkExt, StreamExt};
use lifeline_core::{ConnectionId, FrameKind, MessageCodec};
use lifeline_core::metrics::CONNECTIONS_TOTAL;
use metrics::counter;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::connection::MonitoredConnection;
use super::heartbeat::HeartbeatMonitor;
use super::registry::ConnectionRegistry;

/// An application frame received from a client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundFrame {
    /// Sending connection.
    pub connection_id: ConnectionId,
    /// Raw frame bytes.
    pub payload: Vec<u8>,
}

/// Shared state every session needs.
#[derive(Clone)]
pub struct SessionContext {
    /// Liveness monitor the session registers with.
    pub monitor: Arc<HeartbeatMonitor>,
    /// Live connections.
    pub registry: Arc<ConnectionRegistry>,
    /// Codec for classifying inbound frames.
    pub codec: Arc<dyn MessageCodec>,
    /// Where non-control frames are delivered.
    pub inbound: mpsc::Sender<InboundFrame>,
    /// Outbound queue depth per connection.
    pub outbound_queue: usize,
    /// Server-wide shutdown signal.
    pub shutdown: CancellationToken,
}

/// Why the reader loop ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Exit {
    ClientClosed,
    Evicted,
    Shutdown,
}

/// Run a session for an upgraded socket.
///
/// 1. Registers the connection and starts heartbeat tracking
/// 2. Forwards queued frames (including probes) to the socket
/// 3. Routes probe acknowledgments to the monitor and everything else to the
///    application channel
/// 4. On eviction drops the socket without a close handshake; on shutdown
///    sends a `1001` close frame
/// 5. Untracks and unregisters before returning
#[instrument(skip_all, fields(connection_id = %id))]
pub async fn run_session(ws: WebSocket, id: ConnectionId, ctx: SessionContext) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (send_tx, mut send_rx) = mpsc::channel::<Vec<u8>>(ctx.outbound_queue.max(1));
    let connection = Arc::new(MonitoredConnection::new(id.clone(), send_tx));

    ctx.registry.add(connection.clone());
    ctx.monitor.track(id.clone(), connection.clone());
    counter!(CONNECTIONS_TOTAL).increment(1);
    info!(connections = ctx.registry.len(), "client connected");

    let evicted = connection.eviction();
    let done = CancellationToken::new();

    let writer = {
        let evicted = evicted.clone();
        let shutdown = ctx.shutdown.clone();
        let done = done.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = evicted.cancelled() => break,
                    () = shutdown.cancelled() => {
                        let frame = CloseFrame {
                            code: close_code::AWAY,
                            reason: "server shutting down".into(),
                        };
                        let _ = ws_tx.send(Message::Close(Some(frame))).await;
                        break;
                    }
                    () = done.cancelled() => break,
                    frame = send_rx.recv() => {
                        let Some(frame) = frame else { break };
                        if ws_tx.send(to_message(frame)).await.is_err() {
                            break;
                        }
                    }
                }
            }
        })
    };

    let exit = loop {
        tokio::select! {
            biased;
            () = evicted.cancelled() => break Exit::Evicted,
            () = ctx.shutdown.cancelled() => break Exit::Shutdown,
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => handle_frame(&ctx, &connection, text.as_bytes().to_vec()),
                Some(Ok(Message::Binary(data))) => handle_frame(&ctx, &connection, data.to_vec()),
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) | None => break Exit::ClientClosed,
                Some(Err(e)) => {
                    debug!(error = %e, "websocket read failed");
                    break Exit::ClientClosed;
                }
            },
        }
    };

    let _ = ctx.monitor.untrack(&id);
    let _ = ctx.registry.remove(&id);
    done.cancel();
    let _ = writer.await;

    match exit {
        Exit::Evicted => warn!(age_ms = connection.age().as_millis(), "client evicted"),
        Exit::Shutdown => info!("session closed for shutdown"),
        Exit::ClientClosed => info!(
            age_ms = connection.age().as_millis(),
            dropped = connection.drop_count(),
            "client disconnected"
        ),
    }
}

fn handle_frame(ctx: &SessionContext, connection: &MonitoredConnection, frame: Vec<u8>) {
    match ctx.codec.classify(&frame) {
        FrameKind::ProbeAck => {
            let _ = ctx.monitor.record_ack(connection.id());
        }
        FrameKind::Probe => {
            let _ = connection.send(ctx.codec.encode_probe_ack());
        }
        FrameKind::Data => {
            let inbound = InboundFrame {
                connection_id: connection.id().clone(),
                payload: frame,
            };
            match ctx.inbound.try_send(inbound) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("inbound queue full, dropping frame");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("no inbound consumer, dropping frame");
                }
            }
        }
    }
}

fn to_message(frame: Vec<u8>) -> Message {
    match String::from_utf8(frame) {
        Ok(text) => Message::Text(text.into()),
        Err(e) => Message::Binary(e.into_bytes().into()),
    }
}
