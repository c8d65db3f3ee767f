//! Server-side handle for one `WebSocket` client.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use lifeline_core::ConnectionId;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::heartbeat::Peer;

/// A connected client as seen by the registry and the heartbeat monitor.
///
/// Outbound frames go through a bounded queue drained by the session's writer
/// task; a full queue drops the frame rather than blocking the caller.
pub struct MonitoredConnection {
    id: ConnectionId,
    tx: mpsc::Sender<Vec<u8>>,
    evicted: CancellationToken,
    connected_at: Instant,
    dropped_frames: AtomicU64,
}

impl MonitoredConnection {
    /// Wrap the sending half of a session's outbound queue.
    pub fn new(id: ConnectionId, tx: mpsc::Sender<Vec<u8>>) -> Self {
        Self {
            id,
            tx,
            evicted: CancellationToken::new(),
            connected_at: Instant::now(),
            dropped_frames: AtomicU64::new(0),
        }
    }

    /// Connection ID.
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Queue a frame for the client.
    ///
    /// Returns `false` if the queue is full or the session has ended, and
    /// bumps the dropped-frame counter.
    pub fn send(&self, frame: Vec<u8>) -> bool {
        if self.tx.try_send(frame).is_ok() {
            true
        } else {
            let _ = self.dropped_frames.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Frames dropped so far.
    pub fn drop_count(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    /// Token cancelled when the monitor evicts this connection.
    pub fn eviction(&self) -> CancellationToken {
        self.evicted.clone()
    }

    /// Whether the monitor has evicted this connection.
    pub fn is_evicted(&self) -> bool {
        self.evicted.is_cancelled()
    }

    /// Time since the socket was accepted.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

impl Peer for MonitoredConnection {
    fn send_probe(&self, frame: &[u8]) -> bool {
        self.send(frame.to_vec())
    }

    fn force_close(&self) {
        self.evicted.cancel();
    }
}
