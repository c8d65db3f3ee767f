//! Metric name constants shared by client and server.
//!
//! Recording goes through the `metrics` facade; no exporter is installed by
//! the library, so these are no-ops until the host application installs one.

/// State transitions (counter, labels: from, to).
pub const STATE_TRANSITIONS_TOTAL: &str = "lifeline_state_transitions_total";
/// Reconnect attempts scheduled (counter).
pub const RECONNECT_ATTEMPTS_TOTAL: &str = "lifeline_reconnect_attempts_total";
/// Subscription restorations run after a reconnect (counter).
pub const SUBSCRIPTION_RESTORES_TOTAL: &str = "lifeline_subscription_restores_total";
/// Connections evicted by the heartbeat monitor (counter).
pub const HEARTBEAT_EVICTIONS_TOTAL: &str = "lifeline_heartbeat_evictions_total";
/// Liveness probes sent (counter).
pub const HEARTBEAT_PROBES_TOTAL: &str = "lifeline_heartbeat_probes_total";
/// `WebSocket` connections accepted by the server (counter).
pub const CONNECTIONS_TOTAL: &str = "lifeline_connections_total";
/// Connections currently tracked by the server (gauge).
pub const CONNECTIONS_ACTIVE: &str = "lifeline_connections_active";
