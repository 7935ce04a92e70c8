//! # Connection Manager
//!
//! Owns the lifecycle of the single push connection of an engine.
//!
//! `start()` negotiates a connection and spawns the run loop that feeds every received
//! event to the [`EventDispatcher`]. When the transport drops unexpectedly the run
//! loop reconnects on its own, walking the [`ReconnectPolicy`] schedule
//! (`Connected → Reconnecting → Connected`, or `Disconnected` once the schedule is
//! exhausted).
//!
//! The manager never replays group joins itself. Components that need to react to a
//! fresh connection register a transition observer; the engine uses one to trigger the
//! registry replay and the reconciler re-fetch.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::dispatcher::EventDispatcher;
use crate::core::events::{GroupOp, HubCommand, PushEvent, ResourceId};
use crate::core::lock;
use crate::core::registry::GroupChannel;
use crate::error::{GroupOperationError, TransportError};

/// Events of one live connection. The stream ends when the connection drops.
pub type EventStream = mpsc::UnboundedReceiver<PushEvent>;

/// The push transport collaborator.
#[async_trait]
pub trait PushTransport: Send + Sync {
    /// Negotiates a new connection and returns its event stream.
    async fn connect(&self) -> Result<EventStream, TransportError>;
    /// Sends a command on the live connection and waits for the server's completion.
    async fn invoke(&self, command: HubCommand) -> Result<(), TransportError>;
    /// Closes the live connection, if any.
    async fn disconnect(&self);
}

/// State of the push connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Delays before each automatic reconnect attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    delays: Vec<Duration>,
}

impl Default for ReconnectPolicy {
    /// 0 s, 2 s, 10 s, 30 s, then give up.
    fn default() -> Self {
        Self::from_millis(&[0, 2_000, 10_000, 30_000])
    }
}

impl ReconnectPolicy {
    pub fn new(delays: Vec<Duration>) -> Self {
        Self { delays }
    }

    pub fn from_millis(delays_ms: &[u64]) -> Self {
        Self::new(delays_ms.iter().copied().map(Duration::from_millis).collect())
    }

    /// Never reconnect automatically.
    pub fn disabled() -> Self {
        Self::new(Vec::new())
    }

    pub fn delays(&self) -> &[Duration] {
        &self.delays
    }
}

/// Callback receiving `(previous, current)` on every state change.
pub type TransitionObserver = Arc<dyn Fn(ConnectionState, ConnectionState) + Send + Sync>;

/// Token identifying a transition observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// State shared between the manager and its run loop.
struct Link {
    transport: Arc<dyn PushTransport>,
    dispatcher: Arc<EventDispatcher>,
    policy: ReconnectPolicy,
    state: watch::Sender<ConnectionState>,
    observers: Mutex<Vec<(ObserverId, TransitionObserver)>>,
    next_observer: AtomicU64,
}

impl Link {
    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous == next {
            return;
        }
        log::debug!("Connection state {:?} -> {:?}", previous, next);

        let observers: Vec<TransitionObserver> = lock(&self.observers)
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect();
        for observer in observers {
            observer(previous, next);
        }
    }
}

/// A started connection: the run loop and the token stopping it.
struct Session {
    cancel: CancellationToken,
    run: JoinHandle<()>,
}

pub struct ConnectionManager {
    link: Arc<Link>,
    /// Serializes start/stop.
    session: tokio::sync::Mutex<Option<Session>>,
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn PushTransport>,
        dispatcher: Arc<EventDispatcher>,
        policy: ReconnectPolicy,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            link: Arc::new(Link {
                transport,
                dispatcher,
                policy,
                state,
                observers: Mutex::new(Vec::new()),
                next_observer: AtomicU64::new(0),
            }),
            session: tokio::sync::Mutex::new(None),
        }
    }

    /// Establishes the push connection. A no-op when the manager is already running.
    ///
    /// # Errors
    /// Returns the transport's error when negotiation or handshake fails; the state is
    /// back to `Disconnected` and the caller may retry.
    pub async fn start(&self) -> Result<(), TransportError> {
        let mut session = self.session.lock().await;
        if session.as_ref().is_some_and(|s| !s.run.is_finished()) {
            log::debug!("Push connection already started");
            return Ok(());
        }
        *session = None;

        self.link.set_state(ConnectionState::Connecting);
        match self.link.transport.connect().await {
            Ok(events) => {
                log::info!("Push connection established");
                self.link.set_state(ConnectionState::Connected);
                let cancel = CancellationToken::new();
                let run = tokio::spawn(run_connection(
                    Arc::clone(&self.link),
                    events,
                    cancel.clone(),
                ));
                *session = Some(Session { cancel, run });
                Ok(())
            }
            Err(e) => {
                log::error!("Push connection failed: {}", e);
                self.link.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Tears the connection down, cancelling any reconnect in progress. Safe to call
    /// repeatedly.
    pub async fn stop(&self) {
        let mut session = self.session.lock().await;
        if let Some(Session { cancel, run }) = session.take() {
            cancel.cancel();
            if let Err(e) = run.await {
                log::warn!("Connection task ended abnormally: {}", e);
            }
            self.link.transport.disconnect().await;
            log::info!("Push connection stopped");
        }
        self.link.set_state(ConnectionState::Disconnected);
    }

    pub fn state(&self) -> ConnectionState {
        *self.link.state.borrow()
    }

    /// A receiver that always holds the current state.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.link.state.subscribe()
    }

    /// Registers a callback for every state transition. It runs synchronously on the
    /// task performing the transition and must not block.
    pub fn on_transition(&self, observer: TransitionObserver) -> ObserverId {
        let id = ObserverId(self.link.next_observer.fetch_add(1, Ordering::Relaxed) + 1);
        lock(&self.link.observers).push((id, observer));
        id
    }

    pub fn remove_transition_observer(&self, id: ObserverId) -> bool {
        let mut observers = lock(&self.link.observers);
        let before = observers.len();
        observers.retain(|(current, _)| *current != id);
        observers.len() != before
    }

    pub fn clear_transition_observers(&self) {
        lock(&self.link.observers).clear();
    }

    async fn group_op(&self, op: GroupOp, resource_id: &ResourceId) -> Result<(), GroupOperationError> {
        if self.state() != ConnectionState::Connected {
            return Err(GroupOperationError::NotConnected {
                op,
                resource_id: resource_id.clone(),
            });
        }
        self.link
            .transport
            .invoke(HubCommand::for_op(op, resource_id.clone()))
            .await
            .map_err(|source| GroupOperationError::Transport {
                op,
                resource_id: resource_id.clone(),
                source,
            })
    }
}

#[async_trait]
impl GroupChannel for ConnectionManager {
    async fn join_group(&self, resource_id: &ResourceId) -> Result<(), GroupOperationError> {
        self.group_op(GroupOp::Join, resource_id).await
    }

    async fn leave_group(&self, resource_id: &ResourceId) -> Result<(), GroupOperationError> {
        self.group_op(GroupOp::Leave, resource_id).await
    }
}

/// Dispatches events in receive order until cancelled, reconnecting after drops.
async fn run_connection(link: Arc<Link>, mut events: EventStream, cancel: CancellationToken) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            next = events.recv() => match next {
                Some(event) => {
                    link.dispatcher.dispatch(event);
                }
                None => {
                    log::warn!("Push connection dropped unexpectedly");
                    link.set_state(ConnectionState::Reconnecting);
                    match reconnect(&link, &cancel).await {
                        Some(fresh) => {
                            events = fresh;
                            link.set_state(ConnectionState::Connected);
                        }
                        None => {
                            if !cancel.is_cancelled() {
                                link.set_state(ConnectionState::Disconnected);
                            }
                            return;
                        }
                    }
                }
            }
        }
    }
}

async fn reconnect(link: &Link, cancel: &CancellationToken) -> Option<EventStream> {
    let attempts = link.policy.delays().len();
    for (attempt, delay) in link.policy.delays().iter().enumerate() {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(*delay) => {}
        }

        log::info!("Reconnect attempt {}/{}", attempt + 1, attempts);
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            result = link.transport.connect() => result,
        };
        match result {
            Ok(events) => {
                log::info!("Push connection re-established");
                return Some(events);
            }
            Err(e) => log::warn!("Reconnect attempt {}/{} failed: {}", attempt + 1, attempts, e),
        }
    }

    log::error!("Reconnect schedule exhausted after {} attempt(s); giving up", attempts);
    None
}
