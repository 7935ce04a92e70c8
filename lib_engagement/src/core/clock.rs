//! Logical clock ordering local mutations, REST snapshots and push updates.

use std::sync::atomic::{AtomicU64, Ordering};

/// A point on the engine's logical timeline. Later ticks compare greater.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct LogicalTime(u64);

impl LogicalTime {
    /// The origin; earlier than every issued tick.
    pub const ZERO: LogicalTime = LogicalTime(0);

    pub fn get(self) -> u64 {
        self.0
    }
}

/// Monotonic tick source shared by one engine.
#[derive(Debug, Default)]
pub struct LogicalClock {
    last: AtomicU64,
}

impl LogicalClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issues the next tick.
    pub fn tick(&self) -> LogicalTime {
        LogicalTime(self.last.fetch_add(1, Ordering::Relaxed) + 1)
    }
}
