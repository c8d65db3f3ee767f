//! # lifeline-server
//!
//! Axum `WebSocket` server whose connections are kept honest by a heartbeat.
//!
//! - **[`HeartbeatMonitor`]**: probes every tracked connection on a fixed
//!   interval and force-closes the ones whose acknowledgment is overdue
//! - **Sessions**: one task per socket, registered with the monitor for its
//!   whole lifetime; probe-acks feed the monitor, everything else goes to the
//!   application as [`InboundFrame`]s
//! - **HTTP**: `/ws` upgrade (refused with 503 past `maxConnections`) and
//!   `/health`
//! - **Shutdown**: one `CancellationToken` stops the monitor, every session and
//!   the listener

#![deny(unsafe_code)]

pub mod config;
pub mod errors;
pub mod health;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use config::ServerConfig;
pub use errors::ServerError;
pub use server::{LifelineServer, ServerHandle};
pub use shutdown::ShutdownCoordinator;
pub use websocket::connection::MonitoredConnection;
pub use websocket::heartbeat::{HeartbeatMonitor, HeartbeatRecord, Peer, TickReport};
pub use websocket::registry::ConnectionRegistry;
pub use websocket::session::InboundFrame;
