//! Settings types.
//!
//! Every struct uses `#[serde(default)]` so a settings file only needs the
//! keys it overrides. Field names are camelCase on the wire.

use std::time::Duration;

use lifeline_core::Backoff;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LifelineSettings {
    /// Endpoint the client connects to.
    pub endpoint: String,
    /// Reconnection policy.
    pub reconnect: ReconnectPolicy,
    /// Liveness probing policy.
    pub heartbeat: HeartbeatPolicy,
    /// Subscription replay settings.
    pub subscriptions: SubscriptionSettings,
    /// Client connection settings.
    pub connection: ConnectionSettings,
    /// Server bind and capacity settings.
    pub server: ServerSettings,
    /// Logging settings.
    pub logging: LoggingSettings,
}

impl Default for LifelineSettings {
    fn default() -> Self {
        Self {
            endpoint: "ws://127.0.0.1:8080/ws".to_string(),
            reconnect: ReconnectPolicy::default(),
            heartbeat: HeartbeatPolicy::default(),
            subscriptions: SubscriptionSettings::default(),
            connection: ConnectionSettings::default(),
            server: ServerSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl LifelineSettings {
    /// Reject combinations the connection layer cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.endpoint.trim().is_empty() {
            return Err(invalid("endpoint must not be empty"));
        }
        self.reconnect.validate()?;
        self.heartbeat.validate()?;
        if self.server.max_connections == 0 {
            return Err(invalid("server.maxConnections must be at least 1"));
        }
        if self.server.outbound_queue == 0 {
            return Err(invalid("server.outboundQueue must be at least 1"));
        }
        Ok(())
    }
}

fn invalid(message: &str) -> SettingsError {
    SettingsError::InvalidValue(message.to_string())
}

/// Reconnection policy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconnectPolicy {
    /// Whether unexpected closes trigger reconnection.
    pub enabled: bool,
    /// Retries allowed per loss episode.
    pub max_attempts: u32,
    /// Delay before the first retry in milliseconds.
    pub initial_delay_ms: u64,
    /// Cap on the pre-jitter delay in milliseconds.
    pub max_delay_ms: u64,
    /// Growth factor per attempt.
    pub backoff_multiplier: f64,
    /// Jitter span as a fraction of the delay.
    pub jitter_ratio: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 10,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter_ratio: 0.25,
        }
    }
}

impl ReconnectPolicy {
    /// Backoff parameters for the scheduler.
    #[must_use]
    pub fn backoff(&self) -> Backoff {
        Backoff {
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            multiplier: self.backoff_multiplier,
            jitter_ratio: self.jitter_ratio,
        }
    }

    /// Policy with reconnection turned off.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    fn validate(&self) -> Result<()> {
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(invalid("reconnect.backoffMultiplier must be >= 1"));
        }
        if !(0.0..=1.0).contains(&self.jitter_ratio) {
            return Err(invalid("reconnect.jitterRatio must be within [0, 1]"));
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return Err(invalid("reconnect.initialDelayMs must not exceed maxDelayMs"));
        }
        Ok(())
    }
}

/// Liveness probing policy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeartbeatPolicy {
    /// Client: answer inbound probes automatically.
    pub auto_respond: bool,
    /// Server: probe interval in milliseconds.
    pub interval_ms: u64,
    /// Server: evict peers silent for longer than this, in milliseconds.
    pub timeout_ms: u64,
}

impl Default for HeartbeatPolicy {
    fn default() -> Self {
        Self {
            auto_respond: true,
            interval_ms: 30_000,
            timeout_ms: 90_000,
        }
    }
}

impl HeartbeatPolicy {
    /// Probe interval.
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Eviction timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.interval_ms == 0 {
            return Err(invalid("heartbeat.intervalMs must be at least 1"));
        }
        if self.timeout_ms < self.interval_ms {
            return Err(invalid("heartbeat.timeoutMs must be >= intervalMs"));
        }
        Ok(())
    }
}

/// Subscription replay settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubscriptionSettings {
    /// Pause between subscribe requests during a replay, in milliseconds.
    pub restore_pacing_ms: u64,
}

impl Default for SubscriptionSettings {
    fn default() -> Self {
        Self {
            restore_pacing_ms: 10,
        }
    }
}

/// Client connection settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionSettings {
    /// Force `closing -> closed` if the transport has not confirmed by then.
    pub close_timeout_ms: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            close_timeout_ms: 5000,
        }
    }
}

/// Server bind and capacity settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port (`0` picks an ephemeral port).
    pub port: u16,
    /// Maximum concurrent monitored connections.
    pub max_connections: usize,
    /// Per-connection outbound queue depth.
    pub outbound_queue: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            max_connections: 1024,
            outbound_queue: 256,
        }
    }
}

/// Logging settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
