//! # lib_engagement
//!
//! Client-side engine that keeps per-resource like and comment state in sync
//! between a shared push connection, optimistic local mutations and REST
//! snapshots.
//!
//! The engine itself lives in [`core`]. Concrete collaborators are feature gated
//! the same way as the rest of the workspace:
//!
//! - `retrieve`: HTTP client with retries and the REST engagement adapter.
//! - `transport`: the WebSocket hub transport (implies `retrieve`).
//! - `loggers`: console + file logging setup.
//! - `testkit`: in-memory fakes used by the test suites.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

/// Engine components: connection, registry, dispatcher, reconciler and the facade.
pub mod core;
/// Engine configuration.
pub mod configs;
/// Error taxonomy shared by all components.
pub mod error;

/// Logging setup for binaries embedding the engine.
#[cfg(feature = "loggers")]
pub mod loggers;
/// HTTP retrieval and the REST engagement adapter.
#[cfg(feature = "retrieve")]
pub mod retrieve;
/// SignalR JSON hub transport over WebSocket.
#[cfg(feature = "transport")]
pub mod transport;

/// In-memory fakes for tests.
#[cfg(any(test, feature = "testkit"))]
pub mod testkit;

// --- Public API Re-exports ---
pub use crate::configs::EngineConfig;
pub use crate::core::{
    ConnectionState, EngagementEngine, EngagementSnapshot, EngagementState, MutationKind,
    MutationOutcome, PushEvent, ResourceId,
};
pub use crate::error::{
    ApiError, ConfigError, GroupOperationError, MutationError, QueryError, TransportError,
};
