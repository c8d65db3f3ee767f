//! Immutable client configuration snapshot.

use std::time::Duration;

use lifeline_settings::{HeartbeatPolicy, LifelineSettings, ReconnectPolicy};

/// Configuration captured when a [`Connection`](crate::Connection) is created.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Endpoint handed to the transport on every attempt.
    pub endpoint: String,
    /// Reconnection policy.
    pub reconnect: ReconnectPolicy,
    /// Probe handling policy. Only `auto_respond` applies to clients.
    pub heartbeat: HeartbeatPolicy,
    /// Pause between subscribe requests while restoring.
    pub restore_pacing: Duration,
    /// How long `closing` may last before the close is forced.
    pub close_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::from_settings(&LifelineSettings::default())
    }
}

impl ClientConfig {
    /// Build a client snapshot from loaded settings.
    pub fn from_settings(settings: &LifelineSettings) -> Self {
        Self {
            endpoint: settings.endpoint.clone(),
            reconnect: settings.reconnect.clone(),
            heartbeat: settings.heartbeat.clone(),
            restore_pacing: Duration::from_millis(settings.subscriptions.restore_pacing_ms),
            close_timeout: Duration::from_millis(settings.connection.close_timeout_ms),
        }
    }

    /// Replace the endpoint.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Replace the reconnection policy.
    #[must_use]
    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Replace the restore pacing.
    #[must_use]
    pub fn with_restore_pacing(mut self, pacing: Duration) -> Self {
        self.restore_pacing = pacing;
        self
    }

    /// Toggle automatic probe acknowledgment.
    #[must_use]
    pub fn with_auto_respond(mut self, auto_respond: bool) -> Self {
        self.heartbeat.auto_respond = auto_respond;
        self
    }
}
