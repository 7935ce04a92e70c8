//! In-memory collaborators for exercising the engine without a network.
//!
//! Every fake records what it was asked to do before it waits on its [`Gate`], so a
//! test can hold an operation in flight, observe that it was issued, and release it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use crate::core::connection::{EventStream, PushTransport};
use crate::core::events::{GroupOp, HubCommand, PushEvent, ResourceId};
use crate::core::lock;
use crate::core::reconciler::EngagementApi;
use crate::core::registry::GroupChannel;
use crate::error::{ApiError, GroupOperationError, TransportError};

const WAIT_LIMIT: Duration = Duration::from_secs(5);

/// Polls `condition` until it holds. Panics after five seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let reached = tokio::time::timeout(WAIT_LIMIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    if reached.is_err() {
        panic!("condition not reached within {:?}", WAIT_LIMIT);
    }
}

/// An open/closed barrier. Open by default.
#[derive(Clone)]
pub struct Gate {
    open: Arc<watch::Sender<bool>>,
}

impl Default for Gate {
    fn default() -> Self {
        let (open, _) = watch::channel(true);
        Self { open: Arc::new(open) }
    }
}

impl Gate {
    pub fn hold(&self) {
        self.open.send_replace(false);
    }

    pub fn open(&self) {
        self.open.send_replace(true);
    }

    pub fn is_open(&self) -> bool {
        *self.open.borrow()
    }

    /// Waits until the gate is open.
    pub async fn pass(&self) {
        let mut rx = self.open.subscribe();
        let _ = rx.wait_for(|open| *open).await;
    }
}

/// Decrements a failure budget, reporting whether this call should fail.
fn take_failure(budget: &AtomicUsize) -> bool {
    budget
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

fn count_commands(commands: &[HubCommand], wanted: &HubCommand) -> usize {
    commands.iter().filter(|c| *c == wanted).count()
}

/// A [`GroupChannel`] that records every join and leave.
#[derive(Default)]
pub struct RecordingGroups {
    commands: Mutex<Vec<HubCommand>>,
    join_gate: Gate,
    leave_gate: Gate,
    fail_joins: AtomicUsize,
    fail_leaves: AtomicUsize,
}

impl RecordingGroups {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commands(&self) -> Vec<HubCommand> {
        lock(&self.commands).clone()
    }

    pub fn joins(&self, resource_id: &ResourceId) -> usize {
        count_commands(&lock(&self.commands), &HubCommand::JoinGroup(resource_id.clone()))
    }

    pub fn leaves(&self, resource_id: &ResourceId) -> usize {
        count_commands(&lock(&self.commands), &HubCommand::LeaveGroup(resource_id.clone()))
    }

    pub fn join_gate(&self) -> &Gate {
        &self.join_gate
    }

    pub fn leave_gate(&self) -> &Gate {
        &self.leave_gate
    }

    pub fn fail_next_joins(&self, n: usize) {
        self.fail_joins.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_leaves(&self, n: usize) {
        self.fail_leaves.store(n, Ordering::SeqCst);
    }

    async fn run(&self, op: GroupOp, resource_id: &ResourceId) -> Result<(), GroupOperationError> {
        lock(&self.commands).push(HubCommand::for_op(op, resource_id.clone()));
        let (gate, budget) = match op {
            GroupOp::Join => (&self.join_gate, &self.fail_joins),
            GroupOp::Leave => (&self.leave_gate, &self.fail_leaves),
        };
        gate.pass().await;
        if take_failure(budget) {
            return Err(GroupOperationError::Transport {
                op,
                resource_id: resource_id.clone(),
                source: TransportError::Invocation {
                    method: HubCommand::for_op(op, resource_id.clone()).method().to_string(),
                    message: "simulated failure".to_string(),
                },
            });
        }
        Ok(())
    }
}

#[async_trait]
impl GroupChannel for RecordingGroups {
    async fn join_group(&self, resource_id: &ResourceId) -> Result<(), GroupOperationError> {
        self.run(GroupOp::Join, resource_id).await
    }

    async fn leave_group(&self, resource_id: &ResourceId) -> Result<(), GroupOperationError> {
        self.run(GroupOp::Leave, resource_id).await
    }
}

/// A [`PushTransport`] whose connection is an in-memory channel.
#[derive(Default)]
pub struct MockTransport {
    live: Mutex<Option<mpsc::UnboundedSender<PushEvent>>>,
    commands: Mutex<Vec<HubCommand>>,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    fail_connects: AtomicUsize,
    fail_invokes: AtomicUsize,
    invoke_gate: Gate,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sends `event` on the live connection. Returns `false` when not connected.
    pub fn push(&self, event: PushEvent) -> bool {
        lock(&self.live)
            .as_ref()
            .is_some_and(|tx| tx.send(event).is_ok())
    }

    /// Ends the live connection as if the network dropped it.
    pub fn drop_connection(&self) {
        lock(&self.live).take();
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.live).is_some()
    }

    /// Makes the next `n` connection attempts fail. Replaces any remaining budget.
    pub fn fail_next_connects(&self, n: usize) {
        self.fail_connects.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_invokes(&self, n: usize) {
        self.fail_invokes.store(n, Ordering::SeqCst);
    }

    /// Connection attempts so far, failed ones included.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn commands(&self) -> Vec<HubCommand> {
        lock(&self.commands).clone()
    }

    pub fn joins(&self, resource_id: &ResourceId) -> usize {
        count_commands(&lock(&self.commands), &HubCommand::JoinGroup(resource_id.clone()))
    }

    pub fn leaves(&self, resource_id: &ResourceId) -> usize {
        count_commands(&lock(&self.commands), &HubCommand::LeaveGroup(resource_id.clone()))
    }

    pub fn invoke_gate(&self) -> &Gate {
        &self.invoke_gate
    }
}

#[async_trait]
impl PushTransport for MockTransport {
    async fn connect(&self) -> Result<EventStream, TransportError> {
        let attempt = self.connects.fetch_add(1, Ordering::SeqCst) + 1;
        if take_failure(&self.fail_connects) {
            return Err(TransportError::Negotiation(format!(
                "simulated failure of attempt {}",
                attempt
            )));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.live) = Some(tx);
        Ok(rx)
    }

    async fn invoke(&self, command: HubCommand) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let method = command.method();
        lock(&self.commands).push(command);
        self.invoke_gate.pass().await;
        if take_failure(&self.fail_invokes) {
            return Err(TransportError::Invocation {
                method: method.to_string(),
                message: "simulated failure".to_string(),
            });
        }
        Ok(())
    }

    async fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        lock(&self.live).take();
    }
}

/// A REST call received by [`MockEngagementApi`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiCall {
    GetCount(ResourceId),
    GetStatus(ResourceId),
    Like(ResourceId),
    Unlike(ResourceId),
}

#[derive(Debug, Clone, Copy, Default)]
struct ServerLikes {
    count: i64,
    liked: bool,
}

/// An [`EngagementApi`] backed by an in-memory server state for a single user.
#[derive(Default)]
pub struct MockEngagementApi {
    server: Mutex<HashMap<ResourceId, ServerLikes>>,
    calls: Mutex<Vec<ApiCall>>,
    fail_mutations: AtomicUsize,
    fail_queries: AtomicUsize,
    mutation_gate: Gate,
    query_gate: Gate,
}

impl MockEngagementApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_count(&self, resource_id: &ResourceId, count: i64) {
        lock(&self.server).entry(resource_id.clone()).or_default().count = count;
    }

    pub fn set_liked(&self, resource_id: &ResourceId, liked: bool) {
        lock(&self.server).entry(resource_id.clone()).or_default().liked = liked;
    }

    /// Server-side count.
    pub fn count(&self, resource_id: &ResourceId) -> i64 {
        lock(&self.server).get(resource_id).map_or(0, |s| s.count)
    }

    /// Server-side flag.
    pub fn liked(&self, resource_id: &ResourceId) -> bool {
        lock(&self.server).get(resource_id).is_some_and(|s| s.liked)
    }

    pub fn calls(&self) -> Vec<ApiCall> {
        lock(&self.calls).clone()
    }

    pub fn fail_next_mutations(&self, n: usize) {
        self.fail_mutations.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_queries(&self, n: usize) {
        self.fail_queries.store(n, Ordering::SeqCst);
    }

    pub fn mutation_gate(&self) -> &Gate {
        &self.mutation_gate
    }

    pub fn query_gate(&self) -> &Gate {
        &self.query_gate
    }

    async fn enter(&self, call: ApiCall, gate: &Gate, budget: &AtomicUsize) -> Result<(), ApiError> {
        lock(&self.calls).push(call);
        gate.pass().await;
        if take_failure(budget) {
            return Err(ApiError::Status {
                status: 503,
                body: Some("simulated failure".to_string()),
            });
        }
        Ok(())
    }

    fn set_server_liked(&self, resource_id: &ResourceId, liked: bool) {
        let mut server = lock(&self.server);
        let likes = server.entry(resource_id.clone()).or_default();
        if likes.liked != liked {
            likes.liked = liked;
            likes.count += if liked { 1 } else { -1 };
        }
    }
}

#[async_trait]
impl EngagementApi for MockEngagementApi {
    async fn get_likes_count(&self, resource_id: &ResourceId) -> Result<i64, ApiError> {
        self.enter(ApiCall::GetCount(resource_id.clone()), &self.query_gate, &self.fail_queries)
            .await?;
        Ok(self.count(resource_id))
    }

    async fn get_like_status(&self, resource_id: &ResourceId) -> Result<bool, ApiError> {
        self.enter(ApiCall::GetStatus(resource_id.clone()), &self.query_gate, &self.fail_queries)
            .await?;
        Ok(self.liked(resource_id))
    }

    async fn like_template(&self, resource_id: &ResourceId) -> Result<(), ApiError> {
        self.enter(ApiCall::Like(resource_id.clone()), &self.mutation_gate, &self.fail_mutations)
            .await?;
        self.set_server_liked(resource_id, true);
        Ok(())
    }

    async fn unlike_template(&self, resource_id: &ResourceId) -> Result<(), ApiError> {
        self.enter(ApiCall::Unlike(resource_id.clone()), &self.mutation_gate, &self.fail_mutations)
            .await?;
        self.set_server_liked(resource_id, false);
        Ok(())
    }
}
