//! Shared fixture for the end-to-end engine scenarios under `tests/`.
//!
//! A [`Harness`] wires an [`EngagementEngine`] to the in-memory transport and REST
//! fakes so scenarios can push events, hold REST calls in flight and inspect the
//! commands sent to the hub.

use std::sync::Arc;

use lib_engagement::core::JoinState;
use lib_engagement::testkit::{wait_until, MockEngagementApi, MockTransport};
use lib_engagement::{EngagementEngine, EngagementSnapshot, EngineConfig, ResourceId};

pub struct Harness {
    pub engine: Arc<EngagementEngine>,
    pub transport: Arc<MockTransport>,
    pub api: Arc<MockEngagementApi>,
}

impl Harness {
    /// An authenticated engine with two immediate reconnect attempts. Not started.
    pub fn new() -> Self {
        Self::with_config(EngineConfig {
            authenticated: true,
            reconnect_delays_ms: vec![0, 0],
            ..EngineConfig::default()
        })
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let transport = Arc::new(MockTransport::new());
        let api = Arc::new(MockEngagementApi::new());
        let engine = Arc::new(EngagementEngine::init(config, transport.clone(), api.clone()));
        Self { engine, transport, api }
    }

    /// [`Harness::new`], already connected.
    pub async fn connected() -> Self {
        let harness = Self::new();
        harness
            .engine
            .start()
            .await
            .expect("mock transport connects");
        harness
    }

    /// Sets the server-side state of `resource_id`.
    pub fn seed(&self, resource_id: &str, count: i64, liked: bool) -> ResourceId {
        let id = ResourceId::from(resource_id);
        self.api.set_count(&id, count);
        self.api.set_liked(&id, liked);
        id
    }

    /// Seeds and acquires `resource_id`.
    pub async fn observe(&self, resource_id: &str, count: i64, liked: bool) -> ResourceId {
        let id = self.seed(resource_id, count, liked);
        self.engine
            .acquire_resource(&id)
            .await
            .expect("seeded resource loads");
        id
    }

    pub fn view(&self, resource_id: &ResourceId) -> Option<(u64, bool)> {
        self.engine
            .snapshot(resource_id)
            .and_then(|s| s.like_count().zip(s.liked()))
    }

    pub async fn wait_for_view(&self, resource_id: &ResourceId, count: u64, liked: bool) {
        wait_until(|| self.view(resource_id) == Some((count, liked))).await;
    }

    pub async fn wait_for_snapshot(
        &self,
        resource_id: &ResourceId,
        mut condition: impl FnMut(&EngagementSnapshot) -> bool,
    ) {
        wait_until(|| self.engine.snapshot(resource_id).is_some_and(|s| condition(&s))).await;
    }

    pub async fn wait_for_joined(&self, resource_id: &ResourceId) {
        wait_until(|| {
            self.engine
                .registry()
                .subscription(resource_id)
                .is_some_and(|s| s.join_state == JoinState::Joined)
        })
        .await;
    }

    pub async fn finish(self) {
        self.engine.teardown().await;
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}
