//! # Engagement Engine
//!
//! The UI-facing facade. One engine owns one push connection, one registry, one
//! dispatcher and one reconciler, created by [`EngagementEngine::init`] and released
//! by [`EngagementEngine::teardown`].
//!
//! Every time the connection (re-)enters `Connected` the engine replays the group
//! joins of all observed resources and re-fetches their state, since pushes sent
//! while disconnected are lost.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::task::TaskTracker;

use crate::configs::EngineConfig;
use crate::core::connection::{ConnectionManager, ConnectionState, PushTransport};
use crate::core::dispatcher::{EventDispatcher, Listener};
use crate::core::events::{EventKind, PushEvent, ResourceId};
use crate::core::reconciler::{
    EngagementApi, EngagementSnapshot, MutationOutcome, Reconciler, SnapshotListener, Unsubscribe,
};
use crate::core::registry::Registry;
use crate::error::{MutationError, QueryError, TransportError};

pub struct EngagementEngine {
    config: EngineConfig,
    connection: Arc<ConnectionManager>,
    registry: Registry,
    dispatcher: Arc<EventDispatcher>,
    reconciler: Arc<Reconciler>,
    /// Resync work spawned on connection transitions.
    tasks: TaskTracker,
    torn_down: AtomicBool,
}

impl EngagementEngine {
    /// Builds and wires the engine. Nothing touches the network until [`start`].
    ///
    /// [`start`]: EngagementEngine::start
    pub fn init(
        config: EngineConfig,
        transport: Arc<dyn PushTransport>,
        api: Arc<dyn EngagementApi>,
    ) -> Self {
        let dispatcher = Arc::new(EventDispatcher::new());
        let connection = Arc::new(ConnectionManager::new(
            transport,
            Arc::clone(&dispatcher),
            config.reconnect_policy(),
        ));
        let registry = Registry::new(connection.clone());
        let reconciler = Arc::new(Reconciler::new(api, config.authenticated));
        let tasks = TaskTracker::new();

        let merge: Listener = {
            let reconciler = Arc::clone(&reconciler);
            Arc::new(move |event: &PushEvent| reconciler.apply_event(event))
        };
        for kind in EventKind::ALL {
            dispatcher.on(kind, Arc::clone(&merge));
        }

        {
            let registry = registry.clone();
            let reconciler = Arc::clone(&reconciler);
            let tasks = tasks.clone();
            connection.on_transition(Arc::new(move |previous: ConnectionState, current: ConnectionState| {
                if current != ConnectionState::Connected {
                    return;
                }
                let replayed = registry.resync();
                log::info!(
                    "Connected (was {:?}); replayed {} group join(s)",
                    previous,
                    replayed
                );
                let reconciler = Arc::clone(&reconciler);
                tasks.spawn(async move {
                    reconciler.refresh_all().await;
                });
            }));
        }

        Self {
            config,
            connection,
            registry,
            dispatcher,
            reconciler,
            tasks,
            torn_down: AtomicBool::new(false),
        }
    }

    /// Connects the push channel.
    pub async fn start(&self) -> Result<(), TransportError> {
        self.connection.start().await
    }

    /// Unregisters all listeners, waits for outstanding group and resync work, and
    /// closes the connection. Later calls do nothing.
    pub async fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        log::info!("Tearing down engagement engine");

        self.dispatcher.clear();
        self.connection.clear_transition_observers();
        self.reconciler.clear_watchers();

        self.registry.quiesce().await;
        self.tasks.close();
        self.tasks.wait().await;
        self.connection.stop().await;
    }

    /// Starts observing `resource_id`: joins its group (a failed join is logged and
    /// retried on the next acquire or reconnect) while loading its state.
    ///
    /// # Errors
    /// `QueryError::Fetch` when the state could not be loaded. The observation is
    /// undone, so each failed acquire needs no matching release and the caller may
    /// simply acquire again. `QueryError::Abandoned` when the resource was released
    /// while loading.
    pub async fn acquire_resource(
        &self,
        resource_id: &ResourceId,
    ) -> Result<EngagementSnapshot, QueryError> {
        let (joined, observed) = tokio::join!(
            self.registry.acquire(resource_id),
            self.reconciler.observe(resource_id)
        );
        if let Err(e) = joined {
            log::warn!("{}", e);
        }
        if let Err(e @ QueryError::Fetch { .. }) = &observed {
            log::warn!("{}; releasing {}", e, resource_id);
            self.release_resource(resource_id);
        }
        observed
    }

    pub fn release_resource(&self, resource_id: &ResourceId) {
        self.reconciler.unobserve(resource_id);
        self.registry.release(resource_id);
    }

    pub async fn toggle_like(&self, resource_id: &ResourceId) -> Result<MutationOutcome, MutationError> {
        self.reconciler.toggle_like(resource_id).await
    }

    /// Calls `listener` after every change to `resource_id` until the returned
    /// handle is unsubscribed or dropped.
    pub fn subscribe(&self, resource_id: &ResourceId, listener: SnapshotListener) -> Unsubscribe {
        self.reconciler.subscribe(resource_id, listener)
    }

    pub fn snapshot(&self, resource_id: &ResourceId) -> Option<EngagementSnapshot> {
        self.reconciler.snapshot(resource_id)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn watch_connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.watch_state()
    }

    /// Switches the session's authentication. Signing in re-fetches every observed
    /// resource so the per-user flags become known.
    pub fn set_authenticated(&self, authenticated: bool) {
        let was = self.reconciler.set_authenticated(authenticated);
        if authenticated && !was && !self.tasks.is_closed() {
            let reconciler = Arc::clone(&self.reconciler);
            self.tasks.spawn(async move {
                reconciler.refresh_all().await;
            });
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }
}

impl Drop for EngagementEngine {
    fn drop(&mut self) {
        // The transition observer holds the registry, which holds the connection.
        self.connection.clear_transition_observers();
        self.dispatcher.clear();
    }
}
