//! Error taxonomy for managed connections.
//!
//! - [`TransportError`]: failures reported by a transport adapter
//! - [`ConnectionError`]: failures surfaced by the connection state machine
//!
//! Transport failures never escape `connect()`; the state machine turns them
//! into transitions and reports them through error observers. Only `send()`
//! returns a [`ConnectionError`] directly.

use thiserror::Error;

use crate::state::ConnectionState;

/// Error reported by a transport adapter.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The connection could not be established.
    #[error("failed to open transport: {0}")]
    Open(String),
    /// A frame could not be queued or written.
    #[error("failed to send frame: {0}")]
    Send(String),
    /// The transport is already closed.
    #[error("transport closed")]
    Closed,
    /// The peer violated the framing protocol.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Error surfaced by a managed connection.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// A send was attempted while the connection was not open.
    #[error("not connected (state: {state})")]
    NotConnected {
        /// State at the time of the call.
        state: ConnectionState,
    },
    /// The transport failed to open. Feeds reconnection.
    #[error("connect failed: {0}")]
    ConnectFailure(#[source] TransportError),
    /// The transport closed while the connection was open. Feeds reconnection.
    #[error("connection closed unexpectedly (code: {code:?})")]
    UnexpectedClose {
        /// Close code reported by the transport, if any.
        code: Option<u16>,
    },
    /// The transport closed after the application asked to disconnect.
    #[error("connection closed gracefully")]
    GracefulClose,
    /// Retries were exhausted.
    #[error("gave up after {attempts} reconnect attempts")]
    MaxAttemptsExceeded {
        /// Number of retries performed in the episode.
        attempts: u32,
    },
    /// A subscription could not be replayed after a reconnect.
    #[error("failed to restore subscription {channel}: {source}")]
    RestoreSendFailure {
        /// Channel whose subscribe request failed.
        channel: String,
        /// Underlying transport failure.
        #[source]
        source: TransportError,
    },
    /// Any other transport failure (e.g. a send on an open connection).
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl ConnectionError {
    /// Whether the state machine recovers from this error on its own.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::ConnectFailure(_)
            | Self::UnexpectedClose { .. }
            | Self::RestoreSendFailure { .. }
            | Self::Transport(_) => true,
            Self::NotConnected { .. } | Self::GracefulClose | Self::MaxAttemptsExceeded { .. } => {
                false
            }
        }
    }

    /// Stable machine-readable code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotConnected { .. } => "NOT_CONNECTED",
            Self::ConnectFailure(_) => "CONNECT_FAILURE",
            Self::UnexpectedClose { .. } => "UNEXPECTED_CLOSE",
            Self::GracefulClose => "GRACEFUL_CLOSE",
            Self::MaxAttemptsExceeded { .. } => "MAX_ATTEMPTS_EXCEEDED",
            Self::RestoreSendFailure { .. } => "RESTORE_SEND_FAILURE",
            Self::Transport(_) => "TRANSPORT",
        }
    }
}
