use std::sync::Arc;

use lib_engagement::core::{Comment, HubCommand, JoinState};
use lib_engagement::testkit::{wait_until, ApiCall};
use lib_engagement::{PushEvent, QueryError, ResourceId};
use project_tests::Harness;

fn comment(id: &str, resource_id: &str, content: &str) -> Comment {
    Comment {
        id: id.to_string(),
        resource_id: ResourceId::from(resource_id),
        author_id: None,
        author_name: Some("Ann".to_string()),
        content: content.to_string(),
        created_at: Default::default(),
        updated_at: None,
    }
}

#[tokio::test]
async fn a_snapshot_landing_after_release_is_dropped() {
    let h = Harness::connected().await;
    let r1 = h.seed("t1", 5, false);

    h.api.query_gate().hold();
    let engine = Arc::clone(&h.engine);
    let id = r1.clone();
    let acquire = tokio::spawn(async move { engine.acquire_resource(&id).await });
    wait_until(|| h.api.calls().contains(&ApiCall::GetCount(r1.clone()))).await;

    h.engine.release_resource(&r1);
    h.api.query_gate().open();

    assert!(matches!(
        acquire.await.unwrap(),
        Err(QueryError::Abandoned(_))
    ));
    assert_eq!(h.engine.snapshot(&r1), None);
    h.finish().await;
}

#[tokio::test]
async fn a_push_newer_than_the_snapshot_request_wins() {
    let h = Harness::connected().await;
    let r1 = h.seed("t1", 5, true);

    h.api.query_gate().hold();
    let engine = Arc::clone(&h.engine);
    let id = r1.clone();
    let acquire = tokio::spawn(async move { engine.acquire_resource(&id).await });
    wait_until(|| h.api.calls().contains(&ApiCall::GetCount(r1.clone()))).await;
    h.wait_for_joined(&r1).await;

    assert!(h.transport.push(PushEvent::likes("t1", 9)));
    // Events are merged in receive order; once the marker lands the count has too.
    h.transport.push(PushEvent::ReceiveComment(comment("marker", "t1", "-")));
    h.wait_for_snapshot(&r1, |s| !s.comments.is_empty()).await;
    h.api.query_gate().open();

    let snapshot = acquire.await.unwrap().unwrap();
    assert_eq!(snapshot.like_count(), Some(9));
    assert_eq!(snapshot.liked(), Some(true));
    h.finish().await;
}

#[tokio::test]
async fn comment_feed_follows_pushes() {
    let h = Harness::connected().await;
    let r1 = h.observe("t1", 0, false).await;

    h.transport.push(PushEvent::ReceiveComment(comment("c1", "t1", "first")));
    h.transport.push(PushEvent::ReceiveComment(comment("c2", "t1", "second")));
    h.transport.push(PushEvent::UpdateComment(comment("c1", "t1", "first, edited")));
    h.transport.push(PushEvent::ReceiveComment(comment("x1", "unobserved", "elsewhere")));
    h.wait_for_snapshot(&r1, |s| s.comments.len() == 2 && s.comments[0].content == "first, edited")
        .await;

    h.transport.push(PushEvent::DeleteComment { comment_id: "c2".to_string() });
    h.wait_for_snapshot(&r1, |s| s.comments.len() == 1).await;
    assert_eq!(h.engine.snapshot(&r1).unwrap().comments[0].id, "c1");
    assert_eq!(h.engine.snapshot(&ResourceId::from("unobserved")), None);
    h.finish().await;
}

#[tokio::test]
async fn a_failed_load_undoes_the_acquire() {
    let h = Harness::connected().await;
    let r1 = h.seed("t1", 3, false);

    h.api.fail_next_queries(1);
    assert!(matches!(
        h.engine.acquire_resource(&r1).await,
        Err(QueryError::Fetch { .. })
    ));
    h.engine.registry().quiesce().await;
    assert_eq!(h.engine.registry().refcount(&r1), 0);
    assert_eq!(h.engine.snapshot(&r1), None);

    // Retrying is a fresh acquire; one release balances it.
    let snapshot = h.engine.acquire_resource(&r1).await.unwrap();
    assert_eq!(snapshot.like_count(), Some(3));
    assert_eq!(h.engine.registry().refcount(&r1), 1);

    h.engine.release_resource(&r1);
    h.engine.registry().quiesce().await;
    assert_eq!(h.engine.registry().refcount(&r1), 0);
    assert_eq!(h.engine.snapshot(&r1), None);
    assert_eq!(h.transport.joins(&r1), 2);
    assert_eq!(h.transport.leaves(&r1), 2);
    assert_eq!(
        h.transport.commands().last(),
        Some(&HubCommand::LeaveGroup(r1.clone()))
    );
    h.finish().await;
}

#[tokio::test]
async fn a_slow_join_does_not_hold_back_the_first_snapshot() {
    let h = Harness::connected().await;
    let r1 = h.seed("t1", 4, true);

    h.transport.invoke_gate().hold();
    let engine = Arc::clone(&h.engine);
    let id = r1.clone();
    let acquire = tokio::spawn(async move { engine.acquire_resource(&id).await });

    h.wait_for_view(&r1, 4, true).await;
    assert_eq!(h.transport.joins(&r1), 1);
    assert_eq!(
        h.engine.registry().subscription(&r1).map(|s| s.join_state),
        Some(JoinState::JoinPending)
    );

    h.transport.invoke_gate().open();
    assert_eq!(acquire.await.unwrap().unwrap().like_count(), Some(4));
    h.wait_for_joined(&r1).await;
    h.finish().await;
}
