//! Transport adapter seam.
//!
//! The state machine drives a [`Transport`] to open raw connections and
//! consumes the [`TransportEvent`] stream each open yields. Implementations:
//! [`WsTransport`](crate::ws::WsTransport) over `tokio-tungstenite` and
//! [`MockTransport`](crate::mock::MockTransport) for tests.

use std::sync::Arc;

use async_trait::async_trait;
use lifeline_core::TransportError;
use tokio::sync::mpsc;

/// Low-level event emitted by an open transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// The connection finished opening.
    Opened,
    /// An inbound frame.
    Message(Vec<u8>),
    /// The connection closed, with the peer's close code if one was sent.
    Closed(Option<u16>),
    /// A read or protocol failure. The connection is unusable afterwards.
    Error(TransportError),
}

/// Receiving half of a transport's event stream.
///
/// The stream ending without a [`TransportEvent::Closed`] is treated as a
/// close without a code.
pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

/// A live connection produced by [`Transport::open`].
pub trait TransportHandle: Send + Sync {
    /// Queue a frame for delivery. Must not block on network I/O.
    fn send(&self, frame: Vec<u8>) -> Result<(), TransportError>;

    /// Request a close. Completion is reported through the event stream.
    fn close(&self);
}

impl std::fmt::Debug for dyn TransportHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportHandle").finish_non_exhaustive()
    }
}

/// Opens raw bidirectional connections.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a connection to `endpoint`.
    async fn open(
        &self,
        endpoint: &str,
    ) -> Result<(Arc<dyn TransportHandle>, TransportEvents), TransportError>;
}
