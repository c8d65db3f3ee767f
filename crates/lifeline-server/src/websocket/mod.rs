//! `WebSocket` plumbing: per-socket sessions, the connection registry and the
//! heartbeat monitor.

pub mod connection;
pub mod heartbeat;
pub mod registry;
pub mod session;
