//! # lifeline-core
//!
//! Foundation types shared by the lifeline client and server.
//!
//! - **States**: [`ConnectionState`] and the legal transition table
//! - **Errors**: [`ConnectionError`] / [`TransportError`] via `thiserror`
//! - **IDs**: [`ConnectionId`] and [`ObserverId`] newtypes
//! - **Backoff**: exponential backoff with centered jitter
//! - **Codec**: [`MessageCodec`] plus the default [`JsonCodec`]
//! - **Logging**: `tracing` subscriber setup and log capture for tests
//! - **Metrics**: shared metric names for the `metrics` facade

#![deny(unsafe_code)]

pub mod backoff;
pub mod codec;
pub mod errors;
pub mod ids;
pub mod logging;
pub mod metrics;
pub mod state;

pub use backoff::Backoff;
pub use codec::{FrameKind, JsonCodec, MessageCodec};
pub use errors::{ConnectionError, TransportError};
pub use ids::{ConnectionId, ObserverId};
pub use state::{ConnectionState, StateChange};
