//! # Subscription Registry
//!
//! Reference-counts local interest in per-resource push groups. Join and leave
//! requests go out only on 0→1 and 1→0 transitions, and per resource there is never
//! more than one group operation in flight.
//!
//! Membership follows `Idle → JoinPending → Joined → LeavePending → Idle`:
//! - a failed join returns to `Idle` but keeps the refcount; the join is retried on
//!   the next `acquire` or on reconnection,
//! - a release to zero while a join is in flight leaves once the join succeeds,
//! - an acquire while a leave is in flight joins again once the leave resolves.
//!
//! Every group operation runs on a tracked background task, so callers dropping
//! their future never strand a subscription in a pending state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio_util::task::TaskTracker;

use crate::core::events::{GroupOp, ResourceId};
use crate::core::lock;
use crate::error::GroupOperationError;

/// Server-side group membership, as seen by the registry.
#[async_trait]
pub trait GroupChannel: Send + Sync {
    async fn join_group(&self, resource_id: &ResourceId) -> Result<(), GroupOperationError>;
    async fn leave_group(&self, resource_id: &ResourceId) -> Result<(), GroupOperationError>;
}

/// Membership state of one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinState {
    Idle,
    JoinPending,
    Joined,
    LeavePending,
}

/// Read-only copy of a registry entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub resource_id: ResourceId,
    pub refcount: usize,
    pub join_state: JoinState,
}

struct Entry {
    refcount: usize,
    join_state: JoinState,
    /// The in-flight join was issued on a connection that has since been replaced.
    replay: bool,
}

impl Entry {
    fn new() -> Self {
        Self {
            refcount: 0,
            join_state: JoinState::Idle,
            replay: false,
        }
    }
}

/// What to do once a group operation has resolved.
enum Next {
    Done,
    Issue(GroupOp),
    Forget,
}

struct Shared {
    entries: Mutex<HashMap<ResourceId, Entry>>,
    groups: Arc<dyn GroupChannel>,
    tasks: TaskTracker,
}

/// Cheaply cloneable handle to the registry.
#[derive(Clone)]
pub struct Registry {
    shared: Arc<Shared>,
}

impl Registry {
    pub fn new(groups: Arc<dyn GroupChannel>) -> Self {
        Self {
            shared: Arc::new(Shared {
                entries: Mutex::new(HashMap::new()),
                groups,
                tasks: TaskTracker::new(),
            }),
        }
    }

    /// Adds one observer of `resource_id`.
    ///
    /// If the subscription is `Idle` a join is issued and its outcome returned. A
    /// failed join keeps the refcount; it is retried lazily. When a join or leave is
    /// already in flight this returns `Ok(())` immediately.
    pub async fn acquire(&self, resource_id: &ResourceId) -> Result<(), GroupOperationError> {
        let issue_join = {
            let mut entries = lock(&self.shared.entries);
            let entry = entries.entry(resource_id.clone()).or_insert_with(Entry::new);
            entry.refcount += 1;
            log::debug!(
                "Acquire {}: refcount {} ({:?})",
                resource_id,
                entry.refcount,
                entry.join_state
            );
            if entry.join_state == JoinState::Idle {
                entry.join_state = JoinState::JoinPending;
                true
            } else {
                false
            }
        };

        if !issue_join {
            return Ok(());
        }

        let (tx, rx) = oneshot::channel();
        self.spawn_op(resource_id.clone(), GroupOp::Join, Some(tx));
        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => {
                log::debug!("Join task for {} ended without reporting", resource_id);
                Ok(())
            }
        }
    }

    /// Removes one observer of `resource_id` without waiting for the group leave.
    /// Releasing a resource nobody observes is a no-op.
    pub fn release(&self, resource_id: &ResourceId) {
        let mut entries = lock(&self.shared.entries);
        let Some(entry) = entries.get_mut(resource_id) else {
            log::debug!("Release of unobserved {} ignored", resource_id);
            return;
        };
        if entry.refcount == 0 {
            log::debug!("Release of {} at refcount 0 ignored", resource_id);
            return;
        }

        entry.refcount -= 1;
        log::debug!(
            "Release {}: refcount {} ({:?})",
            resource_id,
            entry.refcount,
            entry.join_state
        );
        if entry.refcount > 0 {
            return;
        }

        let state = entry.join_state;
        match state {
            JoinState::Joined => {
                entry.join_state = JoinState::LeavePending;
                drop(entries);
                self.spawn_op(resource_id.clone(), GroupOp::Leave, None);
            }
            JoinState::Idle => {
                entries.remove(resource_id);
            }
            // The in-flight operation settles the entry when it completes.
            JoinState::JoinPending | JoinState::LeavePending => {}
        }
    }

    /// Replays group membership after the connection was (re)established.
    ///
    /// Returns the number of joins issued immediately. Joins still in flight on the
    /// previous connection are repeated once they complete.
    pub fn resync(&self) -> usize {
        let to_join: Vec<ResourceId> = {
            let mut entries = lock(&self.shared.entries);
            entries
                .iter_mut()
                .filter(|(_, entry)| entry.refcount > 0)
                .filter_map(|(id, entry)| match entry.join_state {
                    JoinState::Joined | JoinState::Idle => {
                        entry.join_state = JoinState::JoinPending;
                        Some(id.clone())
                    }
                    JoinState::JoinPending => {
                        entry.replay = true;
                        None
                    }
                    JoinState::LeavePending => None,
                })
                .collect()
        };

        if !to_join.is_empty() {
            log::info!("Replaying {} group join(s) after reconnect", to_join.len());
        }
        for resource_id in &to_join {
            self.spawn_op(resource_id.clone(), GroupOp::Join, None);
        }
        to_join.len()
    }

    /// Waits until every background join/leave issued so far has settled.
    pub async fn quiesce(&self) {
        self.shared.tasks.close();
        self.shared.tasks.wait().await;
        self.shared.tasks.reopen();
    }

    pub fn subscription(&self, resource_id: &ResourceId) -> Option<Subscription> {
        lock(&self.shared.entries)
            .get(resource_id)
            .map(|entry| Subscription {
                resource_id: resource_id.clone(),
                refcount: entry.refcount,
                join_state: entry.join_state,
            })
    }

    pub fn refcount(&self, resource_id: &ResourceId) -> usize {
        self.subscription(resource_id).map_or(0, |sub| sub.refcount)
    }

    /// Whether any local observer still wants events for `resource_id`.
    pub fn is_subscribed(&self, resource_id: &ResourceId) -> bool {
        self.refcount(resource_id) > 0
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        let mut all: Vec<Subscription> = lock(&self.shared.entries)
            .iter()
            .map(|(id, entry)| Subscription {
                resource_id: id.clone(),
                refcount: entry.refcount,
                join_state: entry.join_state,
            })
            .collect();
        all.sort_by(|a, b| a.resource_id.cmp(&b.resource_id));
        all
    }

    fn spawn_op(
        &self,
        resource_id: ResourceId,
        op: GroupOp,
        report: Option<oneshot::Sender<Result<(), GroupOperationError>>>,
    ) {
        let shared = Arc::clone(&self.shared);
        self.shared
            .tasks
            .spawn(run_group_ops(shared, resource_id, op, report));
    }
}

/// Runs `op` and whatever follow-up operations its completion calls for, one at a
/// time. `report` receives the outcome of the first operation.
async fn run_group_ops(
    shared: Arc<Shared>,
    resource_id: ResourceId,
    mut op: GroupOp,
    mut report: Option<oneshot::Sender<Result<(), GroupOperationError>>>,
) {
    loop {
        let outcome = match op {
            GroupOp::Join => shared.groups.join_group(&resource_id).await,
            GroupOp::Leave => shared.groups.leave_group(&resource_id).await,
        };
        let next = shared.complete(&resource_id, op, &outcome);
        if let Some(tx) = report.take() {
            let _ = tx.send(outcome);
        }
        match next {
            Some(follow_up) => op = follow_up,
            None => break,
        }
    }
}

impl Shared {
    fn complete(
        &self,
        resource_id: &ResourceId,
        op: GroupOp,
        outcome: &Result<(), GroupOperationError>,
    ) -> Option<GroupOp> {
        let mut entries = lock(&self.entries);
        let Some(entry) = entries.get_mut(resource_id) else {
            return None;
        };

        let next = match (op, outcome) {
            (GroupOp::Join, Ok(())) => {
                if entry.replay {
                    entry.replay = false;
                    log::debug!("Join of {} landed on a replaced connection; joining again", resource_id);
                    Next::Issue(GroupOp::Join)
                } else if entry.refcount == 0 {
                    entry.join_state = JoinState::LeavePending;
                    Next::Issue(GroupOp::Leave)
                } else {
                    entry.join_state = JoinState::Joined;
                    log::debug!("Joined group {}", resource_id);
                    Next::Done
                }
            }
            (GroupOp::Join, Err(e)) => {
                log::warn!("Join of group {} failed: {}", resource_id, e);
                if entry.refcount == 0 {
                    Next::Forget
                } else if entry.replay {
                    entry.replay = false;
                    Next::Issue(GroupOp::Join)
                } else {
                    entry.join_state = JoinState::Idle;
                    Next::Done
                }
            }
            (GroupOp::Leave, outcome) => {
                if let Err(e) = outcome {
                    log::warn!("Leave of group {} failed; treating it as left: {}", resource_id, e);
                } else {
                    log::debug!("Left group {}", resource_id);
                }
                entry.replay = false;
                if entry.refcount > 0 {
                    entry.join_state = JoinState::JoinPending;
                    Next::Issue(GroupOp::Join)
                } else {
                    Next::Forget
                }
            }
        };

        match next {
            Next::Done => None,
            Next::Issue(follow_up) => Some(follow_up),
            Next::Forget => {
                entries.remove(resource_id);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::events::HubCommand;
    use crate::testkit::{wait_until, RecordingGroups};

    fn setup() -> (Registry, Arc<RecordingGroups>, ResourceId) {
        let groups = Arc::new(RecordingGroups::new());
        let registry = Registry::new(groups.clone());
        (registry, groups, ResourceId::from("r1"))
    }

    #[tokio::test]
    async fn two_observers_share_one_join_and_one_leave() {
        let (registry, groups, r1) = setup();

        registry.acquire(&r1).await.unwrap();
        registry.acquire(&r1).await.unwrap();
        assert_eq!(groups.joins(&r1), 1);
        assert_eq!(registry.refcount(&r1), 2);

        registry.release(&r1);
        registry.quiesce().await;
        assert_eq!(groups.leaves(&r1), 0);

        registry.release(&r1);
        registry.quiesce().await;
        assert_eq!(groups.leaves(&r1), 1);
        assert_eq!(registry.subscription(&r1), None);
    }

    #[tokio::test]
    async fn release_at_zero_is_a_noop() {
        let (registry, groups, r1) = setup();

        registry.release(&r1);
        registry.acquire(&r1).await.unwrap();
        registry.release(&r1);
        registry.release(&r1);
        registry.quiesce().await;

        assert_eq!(groups.leaves(&r1), 1);
        assert_eq!(registry.refcount(&r1), 0);
    }

    #[tokio::test]
    async fn acquire_while_join_pending_does_not_join_twice() {
        let (registry, groups, r1) = setup();
        groups.join_gate().hold();

        let first = {
            let registry = registry.clone();
            let r1 = r1.clone();
            tokio::spawn(async move { registry.acquire(&r1).await })
        };
        wait_until(|| groups.joins(&r1) == 1).await;

        registry.acquire(&r1).await.unwrap();
        assert_eq!(
            registry.subscription(&r1).map(|s| s.join_state),
            Some(JoinState::JoinPending)
        );

        groups.join_gate().open();
        first.await.unwrap().unwrap();
        assert_eq!(groups.joins(&r1), 1);
        assert_eq!(registry.refcount(&r1), 2);
        assert_eq!(
            registry.subscription(&r1).map(|s| s.join_state),
            Some(JoinState::Joined)
        );
    }

    #[tokio::test]
    async fn failed_join_keeps_refcount_and_retries_on_next_acquire() {
        let (registry, groups, r1) = setup();
        groups.fail_next_joins(1);

        assert!(registry.acquire(&r1).await.is_err());
        let sub = registry.subscription(&r1).unwrap();
        assert_eq!(sub.refcount, 1);
        assert_eq!(sub.join_state, JoinState::Idle);

        registry.acquire(&r1).await.unwrap();
        assert_eq!(groups.joins(&r1), 2);
        assert_eq!(registry.subscription(&r1).unwrap().join_state, JoinState::Joined);
    }

    #[tokio::test]
    async fn acquire_during_leave_rejoins_after_the_leave() {
        let (registry, groups, r1) = setup();
        registry.acquire(&r1).await.unwrap();

        groups.leave_gate().hold();
        registry.release(&r1);
        wait_until(|| groups.leaves(&r1) == 1).await;

        registry.acquire(&r1).await.unwrap();
        assert_eq!(groups.joins(&r1), 1);
        assert_eq!(
            registry.subscription(&r1).unwrap().join_state,
            JoinState::LeavePending
        );

        groups.leave_gate().open();
        registry.quiesce().await;
        assert_eq!(
            groups.commands(),
            vec![
                HubCommand::JoinGroup(r1.clone()),
                HubCommand::LeaveGroup(r1.clone()),
                HubCommand::JoinGroup(r1.clone()),
            ]
        );
        assert_eq!(registry.subscription(&r1).unwrap().join_state, JoinState::Joined);
    }

    #[tokio::test]
    async fn release_during_join_leaves_once_joined() {
        let (registry, groups, r1) = setup();
        groups.join_gate().hold();

        let pending = {
            let registry = registry.clone();
            let r1 = r1.clone();
            tokio::spawn(async move { registry.acquire(&r1).await })
        };
        wait_until(|| groups.joins(&r1) == 1).await;
        registry.release(&r1);
        assert_eq!(groups.leaves(&r1), 0);

        groups.join_gate().open();
        pending.await.unwrap().unwrap();
        registry.quiesce().await;
        assert_eq!(groups.leaves(&r1), 1);
        assert_eq!(registry.subscription(&r1), None);
    }

    #[tokio::test]
    async fn failed_leave_is_not_retried() {
        let (registry, groups, r1) = setup();
        registry.acquire(&r1).await.unwrap();
        groups.fail_next_leaves(1);

        registry.release(&r1);
        registry.quiesce().await;

        assert_eq!(groups.leaves(&r1), 1);
        assert_eq!(registry.subscription(&r1), None);
    }

    #[tokio::test]
    async fn resync_rejoins_observed_groups_only() {
        let (registry, groups, r1) = setup();
        let r2 = ResourceId::from("r2");
        registry.acquire(&r1).await.unwrap();
        registry.acquire(&r2).await.unwrap();
        registry.release(&r2);
        registry.quiesce().await;

        assert_eq!(registry.resync(), 1);
        registry.quiesce().await;

        assert_eq!(groups.joins(&r1), 2);
        assert_eq!(groups.joins(&r2), 1);
        assert_eq!(registry.subscription(&r1).unwrap().join_state, JoinState::Joined);
    }

    #[tokio::test]
    async fn resync_during_pending_join_joins_again_afterwards() {
        let (registry, groups, r1) = setup();
        groups.join_gate().hold();

        let pending = {
            let registry = registry.clone();
            let r1 = r1.clone();
            tokio::spawn(async move { registry.acquire(&r1).await })
        };
        wait_until(|| groups.joins(&r1) == 1).await;
        assert_eq!(registry.resync(), 0);

        groups.join_gate().open();
        pending.await.unwrap().unwrap();
        registry.quiesce().await;
        assert_eq!(groups.joins(&r1), 2);
        assert_eq!(registry.subscription(&r1).unwrap().join_state, JoinState::Joined);
    }

    #[tokio::test]
    async fn joins_and_leaves_match_refcount_transitions() {
        let (registry, groups, r1) = setup();
        // true acquires, false releases
        let script = [true, true, false, false, false, true, false, true, true, false, false];
        let mut refcount = 0usize;
        let mut rises = 0;
        let mut falls = 0;

        for acquire in script {
            if acquire {
                if refcount == 0 {
                    rises += 1;
                }
                refcount += 1;
                registry.acquire(&r1).await.unwrap();
            } else {
                if refcount == 1 {
                    falls += 1;
                }
                refcount = refcount.saturating_sub(1);
                registry.release(&r1);
            }
            registry.quiesce().await;
            assert_eq!(registry.refcount(&r1), refcount);
        }

        assert_eq!(groups.joins(&r1), rises);
        assert_eq!(groups.leaves(&r1), falls);
    }
}
