//! # lifeline-client
//!
//! Managed client connection over a pluggable transport.
//!
//! - **[`Connection`]**: the state machine (`closed`, `connecting`, `open`,
//!   `closing`, `reconnecting`, `failed`) with ordered observer delivery
//! - **Scheduler**: exponential backoff with jitter behind a cancellable timer
//! - **Registry**: tracked subscriptions replayed after every reconnect
//! - **Transports**: [`WsTransport`] for real sockets, [`MockTransport`] for tests
//!
//! Transport failures never surface as errors from `connect()`; they show up
//! as transitions and through `on_error` observers.

#![deny(unsafe_code)]

pub mod config;
pub mod connection;
pub mod mock;
pub mod observers;
pub mod registry;
pub mod scheduler;
pub mod transport;
pub mod ws;

pub use config::ClientConfig;
pub use connection::{Connection, WeakConnection};
pub use mock::{MockSession, MockTransport, OpenOutcome};
pub use observers::Notification;
pub use registry::SubscriptionRegistry;
pub use scheduler::{Plan, ReconnectScheduler, Timer};
pub use transport::{Transport, TransportEvent, TransportEvents, TransportHandle};
pub use ws::WsTransport;

pub use lifeline_core::{ConnectionError, ConnectionState, ObserverId, TransportError};
