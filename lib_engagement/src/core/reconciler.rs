//! # Optimistic State Reconciler
//!
//! The single writer of engagement state. Three sources feed it:
//!
//! 1.  **REST snapshots** (`observe`, `refresh_all`): seed or refresh a resource.
//!     A snapshot whose request was issued before a pushed count was applied does
//!     not overwrite that count, and a snapshot for a resource that was released in
//!     the meantime is discarded.
//! 2.  **Local mutations** (`toggle_like`): applied immediately, then confirmed or
//!     rolled back once the REST call resolves. A newer toggle supersedes an older
//!     one; the superseded response never re-applies its delta.
//! 3.  **Push events** (`apply_event`): a pushed count always wins, the pushed
//!     flag only when nothing is pending.
//!
//! Critical sections never span an `.await`. Every async result is validated
//! against the entry's incarnation and the current pending mutation when it
//! lands.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use futures_util::future::join_all;

use crate::core::clock::{LogicalClock, LogicalTime};
use crate::core::events::{Comment, LikesUpdate, MutationKind, PushEvent, ResourceId};
use crate::core::lock;
use crate::error::{ApiError, MutationError, QueryError};

/// REST collaborators of the reconciler.
#[async_trait]
pub trait EngagementApi: Send + Sync {
    async fn get_likes_count(&self, resource_id: &ResourceId) -> Result<i64, ApiError>;
    async fn get_like_status(&self, resource_id: &ResourceId) -> Result<bool, ApiError>;
    async fn like_template(&self, resource_id: &ResourceId) -> Result<(), ApiError>;
    async fn unlike_template(&self, resource_id: &ResourceId) -> Result<(), ApiError>;
}

/// Like state of one resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngagementState {
    pub resource_id: ResourceId,
    pub like_count: u64,
    pub liked_by_current_user: bool,
    pub last_authoritative_at: LogicalTime,
}

/// A like/unlike awaiting its REST response. Only the latest one per resource is
/// reported as pending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMutation {
    pub resource_id: ResourceId,
    pub kind: MutationKind,
    pub submitted_at: LogicalTime,
    /// Flag to restore if this mutation is rolled back.
    prior_liked: bool,
    /// Count change still to undo on rollback. Zeroed once a pushed count lands.
    unconfirmed_delta: i64,
}

/// Result of a `toggle_like` that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOutcome {
    /// The server accepted the mutation and it was still the latest intent.
    Confirmed,
    /// A newer toggle replaced this one before its response arrived.
    Superseded,
    /// The resource was released before the response arrived.
    Discarded,
}

/// What a UI consumer sees for one resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngagementSnapshot {
    pub resource_id: ResourceId,
    /// `None` until the first authoritative value arrived.
    pub state: Option<EngagementState>,
    pub pending: Option<MutationKind>,
    pub comments: Vec<Comment>,
}

impl EngagementSnapshot {
    pub fn like_count(&self) -> Option<u64> {
        self.state.as_ref().map(|s| s.like_count)
    }

    pub fn liked(&self) -> Option<bool> {
        self.state.as_ref().map(|s| s.liked_by_current_user)
    }

    pub fn is_seeded(&self) -> bool {
        self.state.is_some()
    }
}

/// Per-resource change callback.
pub type SnapshotListener = Arc<dyn Fn(&EngagementSnapshot) + Send + Sync>;

/// One observation lifetime of a resource.
struct Tracked {
    observers: usize,
    incarnation: u64,
    state: Option<EngagementState>,
    /// When the like count last took a server value.
    count_synced_at: LogicalTime,
    /// A pushed count received before the first snapshot landed.
    early_count: Option<u64>,
    /// The latest intent. Its optimistic effect is what the state shows.
    pending: Option<PendingMutation>,
    /// Older mutations still awaiting their response, oldest first.
    superseded: Vec<PendingMutation>,
    comments: Vec<Comment>,
}

impl Tracked {
    fn new(incarnation: u64) -> Self {
        Self {
            observers: 0,
            incarnation,
            state: None,
            count_synced_at: LogicalTime::ZERO,
            early_count: None,
            pending: None,
            superseded: Vec::new(),
            comments: Vec::new(),
        }
    }

    fn in_flight_mut(&mut self) -> impl Iterator<Item = &mut PendingMutation> {
        self.superseded.iter_mut().chain(self.pending.iter_mut())
    }

    fn snapshot(&self, resource_id: &ResourceId) -> EngagementSnapshot {
        EngagementSnapshot {
            resource_id: resource_id.clone(),
            state: self.state.clone(),
            pending: self.pending.as_ref().map(|p| p.kind),
            comments: self.comments.clone(),
        }
    }
}

pub struct Reconciler {
    api: Arc<dyn EngagementApi>,
    clock: LogicalClock,
    entries: Mutex<HashMap<ResourceId, Tracked>>,
    watchers: Mutex<HashMap<ResourceId, Vec<(u64, SnapshotListener)>>>,
    next_watcher: AtomicU64,
    next_incarnation: AtomicU64,
    authenticated: AtomicBool,
}

impl Reconciler {
    pub fn new(api: Arc<dyn EngagementApi>, authenticated: bool) -> Self {
        Self {
            api,
            clock: LogicalClock::new(),
            entries: Mutex::new(HashMap::new()),
            watchers: Mutex::new(HashMap::new()),
            next_watcher: AtomicU64::new(0),
            next_incarnation: AtomicU64::new(0),
            authenticated: AtomicBool::new(authenticated),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    /// Returns the previous value.
    pub fn set_authenticated(&self, authenticated: bool) -> bool {
        self.authenticated.swap(authenticated, Ordering::AcqRel)
    }

    /// Adds one observer of `resource_id` and, on the first observation or while the
    /// resource is still unseeded, fetches its authoritative state.
    ///
    /// # Errors
    /// `QueryError::Fetch` when the REST call fails (the resource stays observed and
    /// unseeded), `QueryError::Abandoned` when it was released before the snapshot
    /// landed.
    pub async fn observe(&self, resource_id: &ResourceId) -> Result<EngagementSnapshot, QueryError> {
        let (incarnation, needs_fetch) = {
            let mut entries = lock(&self.entries);
            let entry = entries
                .entry(resource_id.clone())
                .or_insert_with(|| Tracked::new(self.next_incarnation.fetch_add(1, Ordering::Relaxed)));
            entry.observers += 1;
            (entry.incarnation, entry.observers == 1 || entry.state.is_none())
        };

        if needs_fetch {
            self.load(resource_id, incarnation).await?;
        }
        self.snapshot(resource_id)
            .ok_or_else(|| QueryError::Abandoned(resource_id.clone()))
    }

    /// Removes one observer. The last one drops the resource's state; results still
    /// in flight for it are discarded when they land.
    pub fn unobserve(&self, resource_id: &ResourceId) {
        let mut entries = lock(&self.entries);
        let Some(entry) = entries.get_mut(resource_id) else {
            return;
        };
        entry.observers = entry.observers.saturating_sub(1);
        if entry.observers == 0 {
            entries.remove(resource_id);
            log::debug!("Stopped tracking {}", resource_id);
        }
    }

    pub fn is_observed(&self, resource_id: &ResourceId) -> bool {
        lock(&self.entries).contains_key(resource_id)
    }

    pub fn snapshot(&self, resource_id: &ResourceId) -> Option<EngagementSnapshot> {
        lock(&self.entries)
            .get(resource_id)
            .map(|entry| entry.snapshot(resource_id))
    }

    /// Re-fetches every observed resource. Returns how many refreshes succeeded.
    pub async fn refresh_all(&self) -> usize {
        let targets: Vec<(ResourceId, u64)> = lock(&self.entries)
            .iter()
            .map(|(id, entry)| (id.clone(), entry.incarnation))
            .collect();
        if targets.is_empty() {
            return 0;
        }

        log::info!("Refreshing {} observed resource(s)", targets.len());
        let results = join_all(
            targets
                .iter()
                .map(|(id, incarnation)| self.load(id, *incarnation)),
        )
        .await;

        let mut refreshed = 0;
        for result in results {
            match result {
                Ok(()) => refreshed += 1,
                Err(QueryError::Abandoned(id)) => log::debug!("Refresh of {} abandoned", id),
                Err(e) => log::warn!("{}", e),
            }
        }
        refreshed
    }

    /// Fetches the authoritative state and merges it into the given incarnation.
    async fn load(&self, resource_id: &ResourceId, incarnation: u64) -> Result<(), QueryError> {
        let issued_at = self.clock.tick();
        let fetch_error = |source| QueryError::Fetch {
            resource_id: resource_id.clone(),
            source,
        };
        let count = self
            .api
            .get_likes_count(resource_id)
            .await
            .map_err(fetch_error)?;
        let liked = if self.is_authenticated() {
            Some(
                self.api
                    .get_like_status(resource_id)
                    .await
                    .map_err(fetch_error)?,
            )
        } else {
            None
        };

        let snapshot = {
            let mut entries = lock(&self.entries);
            let Some(entry) = entries
                .get_mut(resource_id)
                .filter(|entry| entry.incarnation == incarnation)
            else {
                log::debug!("Snapshot of {} arrived after release; discarded", resource_id);
                return Err(QueryError::Abandoned(resource_id.clone()));
            };
            self.merge_snapshot(entry, resource_id, issued_at, clamp(count), liked);
            entry.snapshot(resource_id)
        };
        self.notify(&snapshot);
        Ok(())
    }

    fn merge_snapshot(
        &self,
        entry: &mut Tracked,
        resource_id: &ResourceId,
        issued_at: LogicalTime,
        count: u64,
        liked: Option<bool>,
    ) {
        let now = self.clock.tick();
        let count_is_stale = entry.count_synced_at > issued_at;

        let state = entry.state.get_or_insert_with(|| {
            let seed = match entry.early_count.take() {
                Some(pushed) if count_is_stale => pushed,
                _ => count,
            };
            EngagementState {
                resource_id: resource_id.clone(),
                like_count: seed,
                liked_by_current_user: false,
                last_authoritative_at: now,
            }
        });

        if count_is_stale {
            log::debug!("Snapshot count for {} predates a pushed count; kept the push", resource_id);
        } else {
            // Mutations sent before the request are reflected in the count; later ones
            // are re-applied on top of it.
            let mut outstanding = 0;
            for mutation in entry.superseded.iter_mut().chain(entry.pending.iter_mut()) {
                if mutation.submitted_at < issued_at {
                    mutation.unconfirmed_delta = 0;
                } else {
                    outstanding += mutation.unconfirmed_delta;
                }
            }
            state.like_count = apply_delta(count, outstanding);
            entry.count_synced_at = now;
        }

        if entry.pending.is_none() {
            if let Some(liked) = liked {
                state.liked_by_current_user = liked;
            }
        }
        state.last_authoritative_at = now;
    }

    /// Flips the current user's like on `resource_id`: optimistic apply, REST call,
    /// then confirm or roll back.
    ///
    /// # Errors
    /// `NotAuthenticated`, `NotObserved` or `NotSeeded` before anything changes;
    /// `Rejected` when the server refused the mutation and it was rolled back.
    pub async fn toggle_like(&self, resource_id: &ResourceId) -> Result<MutationOutcome, MutationError> {
        if !self.is_authenticated() {
            return Err(MutationError::NotAuthenticated);
        }

        let (mine, incarnation, snapshot) = {
            let mut entries = lock(&self.entries);
            let entry = entries
                .get_mut(resource_id)
                .ok_or_else(|| MutationError::NotObserved(resource_id.clone()))?;
            let state = entry
                .state
                .as_mut()
                .ok_or_else(|| MutationError::NotSeeded(resource_id.clone()))?;

            let kind = if state.liked_by_current_user {
                MutationKind::Unlike
            } else {
                MutationKind::Like
            };
            let prior_liked = state.liked_by_current_user;
            let before = state.like_count;
            state.like_count = apply_delta(before, kind.delta());
            state.liked_by_current_user = kind.liked();
            let applied = state.like_count as i64 - before as i64;

            let mine = PendingMutation {
                resource_id: resource_id.clone(),
                kind,
                submitted_at: self.clock.tick(),
                prior_liked,
                unconfirmed_delta: applied,
            };
            if let Some(previous) = entry.pending.replace(mine.clone()) {
                log::debug!(
                    "{} of {} supersedes the pending {}",
                    mine.kind,
                    resource_id,
                    previous.kind
                );
                entry.superseded.push(previous);
            }
            (mine, entry.incarnation, entry.snapshot(resource_id))
        };
        self.notify(&snapshot);

        let result = match mine.kind {
            MutationKind::Like => self.api.like_template(resource_id).await,
            MutationKind::Unlike => self.api.unlike_template(resource_id).await,
        };
        self.settle(mine, incarnation, result)
    }

    fn settle(
        &self,
        mine: PendingMutation,
        incarnation: u64,
        result: Result<(), ApiError>,
    ) -> Result<MutationOutcome, MutationError> {
        let resource_id = mine.resource_id.clone();
        let (outcome, snapshot) = {
            let mut entries = lock(&self.entries);
            let Some(entry) = entries
                .get_mut(&resource_id)
                .filter(|entry| entry.incarnation == incarnation)
            else {
                log::debug!("{} of {} resolved after release; discarded", mine.kind, resource_id);
                return Ok(MutationOutcome::Discarded);
            };

            let is_current = entry
                .pending
                .as_ref()
                .is_some_and(|p| p.submitted_at == mine.submitted_at);

            let outcome = if is_current {
                match result {
                    Ok(()) => {
                        entry.pending = None;
                        entry.superseded.clear();
                        if let Some(state) = entry.state.as_mut() {
                            state.last_authoritative_at = self.clock.tick();
                        }
                        Ok(MutationOutcome::Confirmed)
                    }
                    Err(source) => {
                        let rolled_back = entry.pending.take().unwrap_or(mine);
                        if let Some(state) = entry.state.as_mut() {
                            state.like_count =
                                apply_delta(state.like_count, -rolled_back.unconfirmed_delta);
                            state.liked_by_current_user = rolled_back.prior_liked;
                        }
                        log::warn!(
                            "{} of {} rejected; rolled back: {}",
                            rolled_back.kind,
                            resource_id,
                            source
                        );
                        // The state now shows the previous intent, which is still in flight.
                        entry.pending = entry.superseded.pop();
                        Err(MutationError::Rejected {
                            resource_id: resource_id.clone(),
                            kind: rolled_back.kind,
                            source,
                        })
                    }
                }
            } else {
                let position = entry
                    .superseded
                    .iter()
                    .position(|p| p.submitted_at == mine.submitted_at);
                match (position, result) {
                    (Some(index), Err(source)) => {
                        let failed = entry.superseded.remove(index);
                        log::warn!(
                            "Superseded {} of {} failed: {}",
                            failed.kind,
                            resource_id,
                            source
                        );
                        // The successor was applied on top of this one; undoing it must
                        // now undo both.
                        let successor = match entry.superseded.get_mut(index) {
                            Some(next) => Some(next),
                            None => entry.pending.as_mut(),
                        };
                        if let Some(successor) = successor {
                            successor.prior_liked = failed.prior_liked;
                            successor.unconfirmed_delta += failed.unconfirmed_delta;
                        }
                    }
                    (Some(index), Ok(())) => {
                        entry.superseded.remove(index);
                    }
                    (None, _) => {}
                }
                Ok(MutationOutcome::Superseded)
            };
            (outcome, entry.snapshot(&resource_id))
        };

        self.notify(&snapshot);
        outcome
    }

    /// Merges one push event. Events for resources nobody observes are ignored.
    pub fn apply_event(&self, event: &PushEvent) {
        match event {
            PushEvent::UpdateLikes(update) => self.apply_likes(update),
            PushEvent::ReceiveComment(comment) => self.apply_comment(comment, true),
            PushEvent::UpdateComment(comment) => self.apply_comment(comment, false),
            PushEvent::DeleteComment { comment_id } => self.delete_comment(comment_id),
        }
    }

    fn apply_likes(&self, update: &LikesUpdate) {
        let resource_id = &update.resource_id;
        let snapshot = {
            let mut entries = lock(&self.entries);
            let Some(entry) = entries.get_mut(resource_id) else {
                log::trace!("Likes update for unobserved {} ignored", resource_id);
                return;
            };
            let now = self.clock.tick();
            let count = clamp(update.count);
            entry.count_synced_at = now;

            let Some(state) = entry.state.as_mut() else {
                entry.early_count = Some(count);
                return;
            };
            state.like_count = count;
            state.last_authoritative_at = now;
            if entry.pending.is_none() {
                if let Some(liked) = update.liked_by_current_user {
                    state.liked_by_current_user = liked;
                }
            }
            for mutation in entry.in_flight_mut() {
                mutation.unconfirmed_delta = 0;
            }
            entry.snapshot(resource_id)
        };
        self.notify(&snapshot);
    }

    fn apply_comment(&self, comment: &Comment, insert: bool) {
        let resource_id = &comment.resource_id;
        let snapshot = {
            let mut entries = lock(&self.entries);
            let Some(entry) = entries.get_mut(resource_id) else {
                return;
            };
            match entry.comments.iter_mut().find(|c| c.id == comment.id) {
                Some(existing) => *existing = comment.clone(),
                None if insert => entry.comments.push(comment.clone()),
                None => {
                    log::debug!("Update for unknown comment {} on {} ignored", comment.id, resource_id);
                    return;
                }
            }
            entry.snapshot(resource_id)
        };
        self.notify(&snapshot);
    }

    fn delete_comment(&self, comment_id: &str) {
        let changed: Vec<EngagementSnapshot> = {
            let mut entries = lock(&self.entries);
            entries
                .iter_mut()
                .filter_map(|(id, entry)| {
                    let before = entry.comments.len();
                    entry.comments.retain(|c| c.id != comment_id);
                    (entry.comments.len() != before).then(|| entry.snapshot(id))
                })
                .collect()
        };
        for snapshot in &changed {
            self.notify(snapshot);
        }
    }

    /// Registers a callback invoked with a fresh snapshot after every change to
    /// `resource_id`. The callback stays registered until the returned handle is
    /// unsubscribed or dropped.
    pub fn subscribe(self: &Arc<Self>, resource_id: &ResourceId, listener: SnapshotListener) -> Unsubscribe {
        let id = self.next_watcher.fetch_add(1, Ordering::Relaxed) + 1;
        lock(&self.watchers)
            .entry(resource_id.clone())
            .or_default()
            .push((id, listener));
        Unsubscribe {
            reconciler: Arc::downgrade(self),
            resource_id: resource_id.clone(),
            id,
            done: AtomicBool::new(false),
        }
    }

    pub fn watcher_count(&self, resource_id: &ResourceId) -> usize {
        lock(&self.watchers).get(resource_id).map_or(0, Vec::len)
    }

    fn remove_watcher(&self, resource_id: &ResourceId, id: u64) {
        let mut watchers = lock(&self.watchers);
        if let Some(list) = watchers.get_mut(resource_id) {
            list.retain(|(current, _)| *current != id);
            if list.is_empty() {
                watchers.remove(resource_id);
            }
        }
    }

    /// Drops every watcher.
    pub fn clear_watchers(&self) {
        lock(&self.watchers).clear();
    }

    fn notify(&self, snapshot: &EngagementSnapshot) {
        let listeners: Vec<SnapshotListener> = lock(&self.watchers)
            .get(&snapshot.resource_id)
            .map(|list| list.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default();
        for listener in listeners {
            listener(snapshot);
        }
    }
}

/// Handle returned by [`Reconciler::subscribe`].
pub struct Unsubscribe {
    reconciler: Weak<Reconciler>,
    resource_id: ResourceId,
    id: u64,
    done: AtomicBool,
}

impl Unsubscribe {
    /// Removes the callback. Calling it again does nothing.
    pub fn unsubscribe(&self) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(reconciler) = self.reconciler.upgrade() {
            reconciler.remove_watcher(&self.resource_id, self.id);
        }
    }
}

impl Drop for Unsubscribe {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

fn clamp(count: i64) -> u64 {
    u64::try_from(count).unwrap_or(0)
}

fn apply_delta(count: u64, delta: i64) -> u64 {
    if delta >= 0 {
        count.saturating_add(delta.unsigned_abs())
    } else {
        count.saturating_sub(delta.unsigned_abs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{wait_until, ApiCall, MockEngagementApi};
    use chrono::Utc;

    fn setup(count: i64, liked: bool) -> (Arc<Reconciler>, Arc<MockEngagementApi>, ResourceId) {
        let r1 = ResourceId::from("r1");
        let api = Arc::new(MockEngagementApi::new());
        api.set_count(&r1, count);
        api.set_liked(&r1, liked);
        let reconciler = Arc::new(Reconciler::new(api.clone(), true));
        (reconciler, api, r1)
    }

    fn comment(id: &str, resource: &str, content: &str) -> Comment {
        Comment {
            id: id.into(),
            resource_id: resource.into(),
            author_id: Some("u1".into()),
            author_name: Some("Ann".into()),
            content: content.into(),
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    fn counts(reconciler: &Reconciler, id: &ResourceId) -> (Option<u64>, Option<bool>) {
        let snapshot = reconciler.snapshot(id).unwrap();
        (snapshot.like_count(), snapshot.liked())
    }

    #[tokio::test]
    async fn observe_seeds_state_from_rest() {
        let (reconciler, api, r1) = setup(5, true);

        let snapshot = reconciler.observe(&r1).await.unwrap();
        assert_eq!(snapshot.like_count(), Some(5));
        assert_eq!(snapshot.liked(), Some(true));
        assert_eq!(snapshot.pending, None);
        assert_eq!(
            api.calls(),
            vec![ApiCall::GetCount(r1.clone()), ApiCall::GetStatus(r1.clone())]
        );

        // A second observer reuses the seeded state.
        reconciler.observe(&r1).await.unwrap();
        assert_eq!(api.calls().len(), 2);
    }

    #[tokio::test]
    async fn anonymous_observer_skips_the_status_call() {
        let (reconciler, api, r1) = setup(3, true);
        reconciler.set_authenticated(false);

        let snapshot = reconciler.observe(&r1).await.unwrap();
        assert_eq!(snapshot.like_count(), Some(3));
        assert_eq!(snapshot.liked(), Some(false));
        assert_eq!(api.calls(), vec![ApiCall::GetCount(r1)]);
    }

    #[tokio::test]
    async fn failed_fetch_keeps_the_resource_unseeded_until_retried() {
        let (reconciler, api, r1) = setup(2, false);
        api.fail_next_queries(1);

        assert!(matches!(reconciler.observe(&r1).await, Err(QueryError::Fetch { .. })));
        assert!(!reconciler.snapshot(&r1).unwrap().is_seeded());
        assert!(matches!(
            reconciler.toggle_like(&r1).await,
            Err(MutationError::NotSeeded(_))
        ));

        let snapshot = reconciler.observe(&r1).await.unwrap();
        assert_eq!(snapshot.like_count(), Some(2));
    }

    #[tokio::test]
    async fn push_without_pending_sets_count_exactly() {
        let (reconciler, _api, r1) = setup(5, false);
        reconciler.observe(&r1).await.unwrap();

        reconciler.apply_event(&PushEvent::UpdateLikes(LikesUpdate {
            resource_id: r1.clone(),
            count: 9,
            liked_by_current_user: Some(true),
        }));
        assert_eq!(counts(&reconciler, &r1), (Some(9), Some(true)));

        reconciler.apply_event(&PushEvent::likes("r1", -4));
        assert_eq!(counts(&reconciler, &r1), (Some(0), Some(true)));
    }

    #[tokio::test]
    async fn push_while_pending_updates_count_and_keeps_flag() {
        let (reconciler, api, r1) = setup(5, false);
        reconciler.observe(&r1).await.unwrap();
        api.mutation_gate().hold();

        let toggle = {
            let reconciler = Arc::clone(&reconciler);
            let r1 = r1.clone();
            tokio::spawn(async move { reconciler.toggle_like(&r1).await })
        };
        wait_until(|| api.calls().contains(&ApiCall::Like(ResourceId::from("r1")))).await;
        assert_eq!(counts(&reconciler, &r1), (Some(6), Some(true)));

        reconciler.apply_event(&PushEvent::UpdateLikes(LikesUpdate {
            resource_id: r1.clone(),
            count: 10,
            liked_by_current_user: Some(false),
        }));
        assert_eq!(counts(&reconciler, &r1), (Some(10), Some(true)));

        api.mutation_gate().open();
        assert_eq!(toggle.await.unwrap().unwrap(), MutationOutcome::Confirmed);
        assert_eq!(counts(&reconciler, &r1), (Some(10), Some(true)));
    }

    #[tokio::test]
    async fn failed_unlike_reverts_count_and_flag() {
        let (reconciler, api, r1) = setup(5, true);
        reconciler.observe(&r1).await.unwrap();
        api.fail_next_mutations(1);

        let err = reconciler.toggle_like(&r1).await.unwrap_err();
        assert!(matches!(
            err,
            MutationError::Rejected { kind: MutationKind::Unlike, .. }
        ));
        let snapshot = reconciler.snapshot(&r1).unwrap();
        assert_eq!((snapshot.like_count(), snapshot.liked()), (Some(5), Some(true)));
        assert_eq!(snapshot.pending, None);
    }

    #[tokio::test]
    async fn rollback_after_a_pushed_count_keeps_the_pushed_count() {
        let (reconciler, api, r1) = setup(5, false);
        reconciler.observe(&r1).await.unwrap();
        api.fail_next_mutations(1);
        api.mutation_gate().hold();

        let toggle = {
            let reconciler = Arc::clone(&reconciler);
            let r1 = r1.clone();
            tokio::spawn(async move { reconciler.toggle_like(&r1).await })
        };
        wait_until(|| api.calls().len() == 3).await;
        reconciler.apply_event(&PushEvent::likes("r1", 8));

        api.mutation_gate().open();
        assert!(toggle.await.unwrap().is_err());
        assert_eq!(counts(&reconciler, &r1), (Some(8), Some(false)));
    }

    #[tokio::test]
    async fn like_confirm_then_push_converges() {
        let (reconciler, _api, r1) = setup(5, false);
        reconciler.observe(&r1).await.unwrap();

        assert_eq!(reconciler.toggle_like(&r1).await.unwrap(), MutationOutcome::Confirmed);
        assert_eq!(counts(&reconciler, &r1), (Some(6), Some(true)));

        reconciler.apply_event(&PushEvent::likes("r1", 7));
        assert_eq!(counts(&reconciler, &r1), (Some(7), Some(true)));
    }

    #[tokio::test]
    async fn superseded_response_never_reapplies_its_delta() {
        let (reconciler, api, r1) = setup(5, false);
        reconciler.observe(&r1).await.unwrap();
        api.mutation_gate().hold();

        let like = {
            let reconciler = Arc::clone(&reconciler);
            let r1 = r1.clone();
            tokio::spawn(async move { reconciler.toggle_like(&r1).await })
        };
        wait_until(|| api.calls().len() == 3).await;
        let unlike = {
            let reconciler = Arc::clone(&reconciler);
            let r1 = r1.clone();
            tokio::spawn(async move { reconciler.toggle_like(&r1).await })
        };
        wait_until(|| api.calls().len() == 4).await;
        assert_eq!(counts(&reconciler, &r1), (Some(5), Some(false)));
        assert_eq!(reconciler.snapshot(&r1).unwrap().pending, Some(MutationKind::Unlike));

        api.mutation_gate().open();
        let outcomes = [like.await.unwrap().unwrap(), unlike.await.unwrap().unwrap()];
        assert!(outcomes.contains(&MutationOutcome::Superseded));
        assert_eq!(counts(&reconciler, &r1), (Some(5), Some(false)));
        assert_eq!(reconciler.snapshot(&r1).unwrap().pending, None);
    }

    #[tokio::test]
    async fn failed_superseded_toggle_is_folded_into_the_rollback() {
        let (reconciler, api, r1) = setup(5, false);
        reconciler.observe(&r1).await.unwrap();
        api.fail_next_mutations(2);
        api.mutation_gate().hold();

        let like = {
            let reconciler = Arc::clone(&reconciler);
            let r1 = r1.clone();
            tokio::spawn(async move { reconciler.toggle_like(&r1).await })
        };
        wait_until(|| api.calls().len() == 3).await;
        let unlike = {
            let reconciler = Arc::clone(&reconciler);
            let r1 = r1.clone();
            tokio::spawn(async move { reconciler.toggle_like(&r1).await })
        };
        wait_until(|| api.calls().len() == 4).await;

        api.mutation_gate().open();
        let first = like.await.unwrap();
        let second = unlike.await.unwrap();
        assert!(first.is_err() || second.is_err());
        assert_eq!(counts(&reconciler, &r1), (Some(5), Some(false)));
        assert_eq!(reconciler.snapshot(&r1).unwrap().pending, None);
    }

    #[tokio::test]
    async fn snapshot_after_release_is_discarded() {
        let (reconciler, api, r1) = setup(5, false);
        api.query_gate().hold();

        let observe = {
            let reconciler = Arc::clone(&reconciler);
            let r1 = r1.clone();
            tokio::spawn(async move { reconciler.observe(&r1).await })
        };
        wait_until(|| !api.calls().is_empty()).await;
        reconciler.unobserve(&r1);

        api.query_gate().open();
        assert!(matches!(observe.await.unwrap(), Err(QueryError::Abandoned(_))));
        assert_eq!(reconciler.snapshot(&r1), None);
    }

    #[tokio::test]
    async fn snapshot_issued_before_a_push_keeps_the_pushed_count() {
        let (reconciler, api, r1) = setup(5, false);
        reconciler.observe(&r1).await.unwrap();
        api.query_gate().hold();

        let refresh = {
            let reconciler = Arc::clone(&reconciler);
            tokio::spawn(async move { reconciler.refresh_all().await })
        };
        wait_until(|| api.calls().len() == 3).await;
        reconciler.apply_event(&PushEvent::likes("r1", 12));

        api.query_gate().open();
        assert_eq!(refresh.await.unwrap(), 1);
        assert_eq!(counts(&reconciler, &r1), (Some(12), Some(false)));
    }

    #[tokio::test]
    async fn push_before_the_first_snapshot_wins_over_it() {
        let (reconciler, api, r1) = setup(5, false);
        api.query_gate().hold();

        let observe = {
            let reconciler = Arc::clone(&reconciler);
            let r1 = r1.clone();
            tokio::spawn(async move { reconciler.observe(&r1).await })
        };
        wait_until(|| !api.calls().is_empty()).await;
        reconciler.apply_event(&PushEvent::likes("r1", 11));

        api.query_gate().open();
        let snapshot = observe.await.unwrap().unwrap();
        assert_eq!(snapshot.like_count(), Some(11));
    }

    #[tokio::test]
    async fn unlike_at_zero_saturates() {
        let (reconciler, _api, r1) = setup(0, true);
        reconciler.observe(&r1).await.unwrap();

        reconciler.toggle_like(&r1).await.unwrap();
        assert_eq!(counts(&reconciler, &r1), (Some(0), Some(false)));
    }

    #[tokio::test]
    async fn toggle_preconditions() {
        let (reconciler, api, r1) = setup(1, false);

        assert!(matches!(
            reconciler.toggle_like(&r1).await,
            Err(MutationError::NotObserved(_))
        ));

        reconciler.observe(&r1).await.unwrap();
        reconciler.set_authenticated(false);
        assert!(matches!(
            reconciler.toggle_like(&r1).await,
            Err(MutationError::NotAuthenticated)
        ));
        assert!(!api.calls().iter().any(|c| matches!(c, ApiCall::Like(_))));
    }

    #[tokio::test]
    async fn comments_follow_receive_update_and_delete() {
        let (reconciler, _api, r1) = setup(0, false);
        reconciler.observe(&r1).await.unwrap();

        reconciler.apply_event(&PushEvent::ReceiveComment(comment("c1", "r1", "hello")));
        reconciler.apply_event(&PushEvent::ReceiveComment(comment("c2", "r1", "second")));
        reconciler.apply_event(&PushEvent::ReceiveComment(comment("c9", "other", "unobserved")));
        reconciler.apply_event(&PushEvent::UpdateComment(comment("c1", "r1", "edited")));
        reconciler.apply_event(&PushEvent::UpdateComment(comment("c7", "r1", "unknown")));
        reconciler.apply_event(&PushEvent::DeleteComment { comment_id: "c2".into() });

        let comments = reconciler.snapshot(&r1).unwrap().comments;
        assert_eq!(comments.len(), 1);
        assert_eq!(comments[0].id, "c1");
        assert_eq!(comments[0].content, "edited");
    }

    #[tokio::test]
    async fn watchers_see_changes_until_unsubscribed() {
        let (reconciler, _api, r1) = setup(5, false);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handle = reconciler.subscribe(
            &r1,
            Arc::new(move |snapshot: &EngagementSnapshot| {
                sink.lock().unwrap().push(snapshot.like_count());
            }),
        );

        reconciler.observe(&r1).await.unwrap();
        reconciler.apply_event(&PushEvent::likes("r1", 6));
        assert_eq!(*seen.lock().unwrap(), vec![Some(5), Some(6)]);

        handle.unsubscribe();
        handle.unsubscribe();
        assert_eq!(reconciler.watcher_count(&r1), 0);
        reconciler.apply_event(&PushEvent::likes("r1", 7));
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn delta_arithmetic_saturates() {
        assert_eq!(apply_delta(0, -1), 0);
        assert_eq!(apply_delta(3, -1), 2);
        assert_eq!(apply_delta(u64::MAX, 1), u64::MAX);
        assert_eq!(clamp(-5), 0);
        assert_eq!(clamp(5), 5);
    }
}
