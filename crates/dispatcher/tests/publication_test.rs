mod common;

use std::sync::Arc;

use chrono::Duration;

use common::{dispatcher_config, Harness};
use taskhub_core::{RetryPolicy, SchedulerConfig};
use taskhub_dispatcher::{
    CompletionReport, FailureReport, PublicationTaskHook, PublicationWorkflow, Scheduler,
    PUBLISH_ARTICLE,
};
use taskhub_domain::{
    ErrorKind, ExecutionStatus, Principal, PublicationState, TaskError, TaskLifecycleHook, Tenant,
};
use taskhub_errors::HubError;

fn author() -> Principal {
    Principal::new("writer", "acme").with_role("author")
}

fn editor() -> Principal {
    Principal::new("desk", "acme").with_role("editor")
}

fn admin() -> Principal {
    Principal::new("chief", "acme").with_role("admin")
}

async fn harness() -> Harness {
    Harness::build(
        |repos, clock| {
            let hook: Arc<dyn TaskLifecycleHook> = Arc::new(PublicationTaskHook::new(
                repos.scheduled_publications.clone(),
                RetryPolicy::new(dispatcher_config().retry),
                clock,
            ));
            vec![hook]
        },
        |hub| hub,
    )
    .await
}

fn workflow(h: &Harness, max_retries: u32) -> PublicationWorkflow {
    PublicationWorkflow::new(
        h.repos.publications.clone(),
        h.repos.scheduled_publications.clone(),
        h.clock.clone(),
        max_retries,
    )
}

async fn approved(workflow: &PublicationWorkflow, content_id: &str) {
    workflow
        .create_draft(content_id, Tenant::company("acme"), &author())
        .await
        .unwrap();
    workflow
        .transition(content_id, PublicationState::PendingReview, &author())
        .await
        .unwrap();
    workflow
        .transition(content_id, PublicationState::Approved, &admin())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_transitions_enforce_roles() {
    let h = harness().await;
    let workflow = workflow(&h, 3);
    workflow
        .create_draft("post-1", Tenant::company("acme"), &author())
        .await
        .unwrap();
    workflow
        .transition("post-1", PublicationState::PendingReview, &author())
        .await
        .unwrap();

    let err = workflow
        .transition("post-1", PublicationState::Approved, &editor())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unauthorized);

    let err = workflow
        .transition("post-1", PublicationState::Published, &admin())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);

    workflow
        .transition("post-1", PublicationState::ChangesRequested, &editor())
        .await
        .unwrap();
    let status = workflow.status("post-1").await.unwrap();
    assert_eq!(status.state, PublicationState::ChangesRequested);
    assert!(!status.content_published);

    let outsider = Principal::new("intruder", "globex").with_role("admin");
    let err = workflow
        .transition("post-1", PublicationState::PendingReview, &outsider)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unauthorized);
}

#[tokio::test]
async fn test_schedule_requires_approved_content_and_future_time() {
    let h = harness().await;
    let workflow = workflow(&h, 3);
    workflow
        .create_draft("post-2", Tenant::company("acme"), &author())
        .await
        .unwrap();

    let err = workflow
        .schedule("post-2", h.now() + Duration::hours(1), &admin())
        .await
        .unwrap_err();
    assert!(matches!(err, HubError::Conflict(_)));

    workflow
        .transition("post-2", PublicationState::PendingReview, &author())
        .await
        .unwrap();
    workflow
        .transition("post-2", PublicationState::Approved, &admin())
        .await
        .unwrap();

    let err = workflow
        .schedule("post-2", h.now() - Duration::minutes(1), &admin())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);

    let err = workflow
        .transition("post-2", PublicationState::Scheduled, &admin())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
}

#[tokio::test]
async fn test_scheduled_publication_publishes_once() {
    let h = harness().await;
    let workflow = workflow(&h, 3);
    let scheduler = Scheduler::new(h.hub.clone(), SchedulerConfig::default(), "node-a");
    approved(&workflow, "post-3").await;

    let publication = workflow
        .schedule("post-3", h.now() + Duration::hours(1), &admin())
        .await
        .unwrap();
    assert_eq!(
        workflow.status("post-3").await.unwrap().state,
        PublicationState::Scheduled
    );
    assert!(!workflow.content_visible("post-3").await.unwrap());

    // 未到时间不物化
    assert_eq!(scheduler.tick().await.unwrap().publications_fired, 0);

    h.advance(3600);
    assert_eq!(scheduler.tick().await.unwrap().publications_fired, 1);
    assert_eq!(scheduler.tick().await.unwrap().publications_fired, 0);

    let row = h
        .repos
        .scheduled_publications
        .get(publication.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.execution_status, ExecutionStatus::Processing);

    let lease = h
        .hub
        .lease("worker-1", &[PUBLISH_ARTICLE.to_string()])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(Some(lease.task.id), row.task_id);
    assert_eq!(lease.task.input["content_id"], "post-3");

    workflow.publish("post-3", &row.principal).await.unwrap();
    h.hub
        .complete(lease.task.id, lease.token, CompletionReport::default())
        .await
        .unwrap();

    let status = workflow.status("post-3").await.unwrap();
    assert_eq!(status.state, PublicationState::Published);
    assert!(status.content_published);
    assert!(workflow.content_visible("post-3").await.unwrap());

    let row = h
        .repos
        .scheduled_publications
        .get(publication.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.execution_status, ExecutionStatus::Completed);
    assert_eq!(row.retry_count, 0);
}

#[tokio::test]
async fn test_failed_publication_retries_then_fails() {
    let h = harness().await;
    let workflow = workflow(&h, 2);
    let scheduler = Scheduler::new(h.hub.clone(), SchedulerConfig::default(), "node-a");
    approved(&workflow, "post-4").await;
    let publication = workflow
        .schedule("post-4", h.now() + Duration::minutes(5), &admin())
        .await
        .unwrap();
    let types = [PUBLISH_ARTICLE.to_string()];

    h.advance(300);
    scheduler.tick().await.unwrap();
    let lease = h.hub.lease("worker-1", &types).await.unwrap().unwrap();
    h.hub
        .fail(
            lease.task.id,
            lease.token,
            FailureReport::new(TaskError::new(ErrorKind::Fatal, "CMS不可用")),
        )
        .await
        .unwrap();

    let row = h
        .repos
        .scheduled_publications
        .get(publication.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.execution_status, ExecutionStatus::Pending);
    assert_eq!(row.retry_count, 1);
    assert_eq!(row.task_id, None);
    assert_eq!(row.last_error.as_deref(), Some("CMS不可用"));
    let retry_delay = RetryPolicy::new(dispatcher_config().retry).delay(1);
    assert_eq!(row.scheduled_for, h.now() + retry_delay);

    h.advance(retry_delay.num_seconds() + 1);
    assert_eq!(scheduler.tick().await.unwrap().publications_fired, 1);
    let lease = h.hub.lease("worker-1", &types).await.unwrap().unwrap();
    assert_eq!(
        lease.task.idempotency_key,
        Some(format!("publication:{}:1", publication.id))
    );
    h.hub
        .fail(
            lease.task.id,
            lease.token,
            FailureReport::new(TaskError::new(ErrorKind::Fatal, "CMS不可用")),
        )
        .await
        .unwrap();

    let row = h
        .repos
        .scheduled_publications
        .get(publication.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.execution_status, ExecutionStatus::Failed);
    assert_eq!(row.retry_count, 2);
    assert!(!workflow.content_visible("post-4").await.unwrap());
}

#[tokio::test]
async fn test_cancel_schedule_returns_content_to_approved() {
    let h = harness().await;
    let workflow = workflow(&h, 3);
    approved(&workflow, "post-5").await;
    let publication = workflow
        .schedule("post-5", h.now() + Duration::hours(2), &admin())
        .await
        .unwrap();

    let err = workflow
        .cancel_schedule(publication.id, &editor())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unauthorized);

    let cancelled = workflow
        .cancel_schedule(publication.id, &admin())
        .await
        .unwrap();
    assert_eq!(cancelled.execution_status, ExecutionStatus::Cancelled);
    assert_eq!(
        workflow.status("post-5").await.unwrap().state,
        PublicationState::Approved
    );

    // 再次取消无副作用
    let again = workflow
        .cancel_schedule(publication.id, &admin())
        .await
        .unwrap();
    assert_eq!(again.version, cancelled.version);

    let scheduler = Scheduler::new(h.hub.clone(), SchedulerConfig::default(), "node-a");
    h.advance(3 * 3600);
    assert_eq!(scheduler.tick().await.unwrap().publications_fired, 0);
}
