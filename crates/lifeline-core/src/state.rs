//! Connection lifecycle states and the transition table.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a managed connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Initial state, and the terminal state after a graceful disconnect.
    #[default]
    Closed,
    /// A transport open is in flight.
    Connecting,
    /// The transport is open and usable.
    Open,
    /// The application asked to disconnect; waiting for the transport to close.
    Closing,
    /// The connection was lost; a retry is scheduled.
    Reconnecting,
    /// Retries were exhausted. Only an explicit `connect()` leaves this state.
    Failed,
}

impl ConnectionState {
    /// Whether a connection attempt is in flight or established.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Connecting | Self::Open)
    }

    /// Whether the state only changes on an explicit application call.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }

    /// Whether `self -> next` is a legal lifecycle transition.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use ConnectionState::{Closed, Closing, Connecting, Failed, Open, Reconnecting};
        matches!(
            (self, next),
            (Closed | Failed | Reconnecting | Closing, Connecting)
                | (Connecting, Open | Reconnecting | Failed | Closing)
                | (Open, Closing | Reconnecting | Closed)
                | (Closing, Closed)
                | (Reconnecting, Failed | Closing)
        )
    }

    /// Lowercase name used in logs and metrics labels.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single observed transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    /// State before the transition.
    pub old: ConnectionState,
    /// State after the transition.
    pub new: ConnectionState,
}

impl StateChange {
    /// Create a transition record.
    #[must_use]
    pub fn new(old: ConnectionState, new: ConnectionState) -> Self {
        Self { old, new }
    }
}

impl fmt::Display for StateChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.old, self.new)
    }
}
