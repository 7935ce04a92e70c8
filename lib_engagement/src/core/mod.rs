//! # Core Engine Module
//!
//! The components that keep engagement state consistent across the push channel,
//! local optimistic mutations and REST snapshots.
//!
//! ## Core Components:
//!
//! - **`connection`**: Owns the single push connection of an engine, its state
//!   signal and the automatic reconnect schedule.
//!
//! - **`registry`**: Reference-counts local interest in per-resource groups and
//!   issues join/leave requests only on 0→1 and 1→0 transitions.
//!
//! - **`dispatcher`**: Typed publish/subscribe routing of push events to local
//!   listeners.
//!
//! - **`reconciler`**: The single writer of engagement state. Applies optimistic
//!   mutations and merges late-arriving pushes and snapshots.
//!
//! - **`engine`**: The facade wiring the four together with explicit
//!   `init`/`teardown`.

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Logical timestamps ordering mutations, snapshots and pushes.
pub mod clock;
/// Push connection lifecycle and the transport contract.
pub mod connection;
/// Typed routing of push events to listeners.
pub mod dispatcher;
/// UI-facing facade.
pub mod engine;
/// Identifiers, push events and hub commands.
pub mod events;
/// Optimistic state and merge rules.
pub mod reconciler;
/// Reference-counted group membership.
pub mod registry;

// --- Public API Re-exports ---
pub use clock::{LogicalClock, LogicalTime};
pub use connection::{
    ConnectionManager, ConnectionState, EventStream, ObserverId, PushTransport, ReconnectPolicy,
    TransitionObserver,
};
pub use dispatcher::{EventDispatcher, Listener, ListenerId};
pub use engine::EngagementEngine;
pub use events::{
    Comment, EventKind, GroupOp, HubCommand, LikesUpdate, MutationKind, PushEvent, ResourceId,
};
pub use reconciler::{
    EngagementApi, EngagementSnapshot, EngagementState, MutationOutcome, PendingMutation,
    Reconciler, SnapshotListener, Unsubscribe,
};
pub use registry::{GroupChannel, JoinState, Registry, Subscription};

/// Locks a std mutex, recovering the data if a panicking thread poisoned it.
/// Every critical section in the engine leaves its map consistent before any
/// call that could panic.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
