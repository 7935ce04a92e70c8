//! # Typed Push Event Dispatcher
//!
//! The `EventDispatcher` routes every event read from the push connection to the
//! local listeners registered for its [`EventKind`].
//!
//! ## Core Design Principles:
//!
//! 1.  **Typed Routing**: Listeners register per event kind, so a likes listener never
//!     sees comment traffic.
//! 2.  **Idempotent Registration**: Registering the same `Arc` listener twice for the
//!     same kind returns the original [`ListenerId`]; delivery is never duplicated.
//! 3.  **Two Sink Flavours**: Synchronous callbacks for in-process consumers (the
//!     reconciler), and unbounded channels for consumers living in their own task.
//!     Channels whose receiver was dropped are pruned on the next dispatch.
//! 4.  **Re-entrancy**: The listener table is snapshotted under the lock and callbacks
//!     run after it is released, so a callback may register or unregister listeners.
//! 5.  **No Buffering**: An event of a kind with no listeners is dropped. Freshly
//!     observed resources are re-fetched by the reconciler instead.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::core::events::{EventKind, PushEvent};
use crate::core::lock;

/// A synchronous event callback.
pub type Listener = Arc<dyn Fn(&PushEvent) + Send + Sync>;

/// Token identifying one registration, used to unregister it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

enum Sink {
    Callback(Listener),
    Channel(mpsc::UnboundedSender<Arc<PushEvent>>),
}

/// # Registration
///
/// One listener slot in the routing table.
struct Registration {
    id: ListenerId,
    sink: Sink,
}

/// # Core Dispatcher
///
/// Holds the routing table and fans events out to it.
#[derive(Default)]
pub struct EventDispatcher {
    /// Registrations per event kind, in registration order.
    listeners: Mutex<HashMap<EventKind, Vec<Registration>>>,
    next_id: AtomicU64,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_id(&self) -> ListenerId {
        ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// # On
    ///
    /// Registers a callback for `kind`. If this exact `Arc` is already registered for
    /// `kind`, the existing id is returned and nothing changes.
    pub fn on(&self, kind: EventKind, listener: Listener) -> ListenerId {
        let mut table = lock(&self.listeners);
        let slots = table.entry(kind).or_default();

        let existing = slots.iter().find_map(|reg| match &reg.sink {
            Sink::Callback(current) if Arc::ptr_eq(current, &listener) => Some(reg.id),
            _ => None,
        });
        if let Some(id) = existing {
            log::debug!("Listener {:?} already registered for {:?}", id, kind);
            return id;
        }

        let id = self.allocate_id();
        slots.push(Registration {
            id,
            sink: Sink::Callback(listener),
        });
        log::debug!("Listener {:?} registered for {:?}", id, kind);
        id
    }

    /// # Channel
    ///
    /// Registers a channel sink for `kind` and returns its receiving half. Each event
    /// is shared as an `Arc`, so fan-out never clones the payload.
    pub fn channel(&self, kind: EventKind) -> (ListenerId, mpsc::UnboundedReceiver<Arc<PushEvent>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.allocate_id();
        lock(&self.listeners).entry(kind).or_default().push(Registration {
            id,
            sink: Sink::Channel(tx),
        });
        log::debug!("Channel listener {:?} registered for {:?}", id, kind);
        (id, rx)
    }

    /// # Off
    ///
    /// Unregisters one listener, or every listener of `kind` when `listener` is `None`.
    /// Returns how many registrations were removed.
    pub fn off(&self, kind: EventKind, listener: Option<ListenerId>) -> usize {
        let mut table = lock(&self.listeners);
        let Some(slots) = table.get_mut(&kind) else {
            return 0;
        };

        let before = slots.len();
        match listener {
            Some(id) => slots.retain(|reg| reg.id != id),
            None => slots.clear(),
        }
        let removed = before - slots.len();
        if slots.is_empty() {
            table.remove(&kind);
        }
        removed
    }

    /// Unregisters everything.
    pub fn clear(&self) {
        lock(&self.listeners).clear();
    }

    /// Number of live registrations for `kind`.
    pub fn listener_count(&self, kind: EventKind) -> usize {
        lock(&self.listeners).get(&kind).map_or(0, Vec::len)
    }

    /// # Dispatch
    ///
    /// Delivers `event` to every listener of its kind exactly once and returns the
    /// number of deliveries.
    ///
    /// ## Logic:
    /// 1.  Under the lock, channel sinks are fed directly; `retain` drops the ones whose
    ///     receiver has gone away.
    /// 2.  Callback sinks are cloned out of the table.
    /// 3.  The lock is released and the callbacks are invoked.
    pub fn dispatch(&self, event: PushEvent) -> usize {
        let kind = event.kind();
        let shared = Arc::new(event);
        let mut delivered = 0;

        let callbacks: Vec<Listener> = {
            let mut table = lock(&self.listeners);
            let Some(slots) = table.get_mut(&kind) else {
                log::trace!("No listeners for {:?}; event dropped", kind);
                return 0;
            };

            let mut callbacks = Vec::new();
            slots.retain(|reg| match &reg.sink {
                Sink::Callback(cb) => {
                    callbacks.push(Arc::clone(cb));
                    true
                }
                Sink::Channel(tx) => match tx.send(Arc::clone(&shared)) {
                    Ok(()) => {
                        delivered += 1;
                        true
                    }
                    Err(_) => {
                        log::info!("Channel listener {:?} for {:?} closed; removing", reg.id, kind);
                        false
                    }
                },
            });
            if slots.is_empty() {
                table.remove(&kind);
            }
            callbacks
        };

        for callback in &callbacks {
            callback(&shared);
        }
        delivered + callbacks.len()
    }
}
