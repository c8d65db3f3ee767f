//! Server configuration.

use std::time::Duration;

use lifeline_settings::LifelineSettings;

/// Runtime configuration for [`LifelineServer`](crate::LifelineServer).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    /// Host to bind.
    pub host: String,
    /// Port to bind (`0` picks an ephemeral port).
    pub port: u16,
    /// Maximum concurrent `WebSocket` connections.
    pub max_connections: usize,
    /// Frames queued per connection before sends are dropped.
    pub outbound_queue: usize,
    /// Time between heartbeat ticks.
    pub heartbeat_interval: Duration,
    /// Silence after which a connection is evicted.
    pub heartbeat_timeout: Duration,
    /// Grace period for in-flight sessions during shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_settings(&LifelineSettings::default())
    }
}

impl ServerConfig {
    /// Snapshot the server-relevant parts of loaded settings.
    pub fn from_settings(settings: &LifelineSettings) -> Self {
        Self {
            host: settings.server.host.clone(),
            port: settings.server.port,
            max_connections: settings.server.max_connections,
            outbound_queue: settings.server.outbound_queue.max(1),
            heartbeat_interval: settings.heartbeat.interval(),
            heartbeat_timeout: settings.heartbeat.timeout(),
            shutdown_timeout: Duration::from_secs(5),
        }
    }

    /// Same configuration bound to an ephemeral localhost port.
    #[must_use]
    pub fn ephemeral(mut self) -> Self {
        self.host = "127.0.0.1".into();
        self.port = 0;
        self
    }

    /// Override the heartbeat cadence.
    #[must_use]
    pub fn with_heartbeat(mut self, interval: Duration, timeout: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.heartbeat_timeout = timeout;
        self
    }

    /// Override the connection limit.
    #[must_use]
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// `host:port` as passed to the listener.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
