mod common;

use std::sync::Arc;

use common::{dispatcher_config, registry, Harness};
use taskhub_dispatcher::{CompletionReport, RecoveryReport, RecoveryService, TaskHub};
use taskhub_domain::{event_reasons, ErrorKind, QueueKey, TaskPriority, TaskQueue, TaskStatus};
use taskhub_errors::HubError;
use taskhub_infrastructure::testing::TaskDescriptorBuilder;
use taskhub_infrastructure::InMemoryTaskQueue;

fn recovery(h: &Harness) -> RecoveryService {
    RecoveryService::new(h.hub.clone(), dispatcher_config())
}

#[tokio::test]
async fn test_expired_lease_is_reclaimed_and_retried() {
    let h = Harness::new().await;
    let types = ["noop".to_string()];
    let task = h
        .hub
        .submit(TaskDescriptorBuilder::new("noop").build())
        .await
        .unwrap();
    let first = h.hub.lease("worker-1", &types).await.unwrap().unwrap();

    // 超时20秒内没有心跳
    h.advance(21);
    let report = recovery(&h).run_once().await.unwrap();
    assert_eq!(report, RecoveryReport { reclaimed: 1, expired: 0 });

    let reclaimed = h.hub.get(task.id).await.unwrap();
    assert_eq!(reclaimed.status, TaskStatus::Pending);
    assert_eq!(reclaimed.attempts, 1);
    assert_eq!(reclaimed.lease_token, None);
    assert_eq!(reclaimed.error.as_ref().map(|e| e.kind), Some(ErrorKind::Timeout));
    let events = h.hub.events(task.id).await.unwrap();
    assert_eq!(events.last().unwrap().reason, event_reasons::LEASE_EXPIRED);

    // 原Worker迟到的完成上报被拒绝
    let err = h
        .hub
        .complete(task.id, first.token, CompletionReport::default())
        .await
        .unwrap_err();
    assert!(matches!(err, HubError::Conflict(_)));

    assert!(h.hub.lease("worker-2", &types).await.unwrap().is_none());
    h.advance(5);
    let second = h.hub.lease("worker-2", &types).await.unwrap().unwrap();
    assert_eq!(second.task.id, task.id);
    assert_eq!(second.task.attempts, 2);
    assert_ne!(second.token, first.token);

    h.hub
        .complete(task.id, second.token, CompletionReport::default())
        .await
        .unwrap();
    assert_eq!(h.hub.get(task.id).await.unwrap().status, TaskStatus::Completed);
}

#[tokio::test]
async fn test_heartbeat_keeps_lease_alive() {
    let h = Harness::new().await;
    let types = ["noop".to_string()];
    let task = h
        .hub
        .submit(TaskDescriptorBuilder::new("noop").build())
        .await
        .unwrap();
    let lease = h.hub.lease("worker-1", &types).await.unwrap().unwrap();

    for _ in 0..5 {
        h.advance(10);
        h.hub.heartbeat(task.id, lease.token).await.unwrap();
        assert_eq!(recovery(&h).run_once().await.unwrap().reclaimed, 0);
    }
    assert_eq!(h.hub.get(task.id).await.unwrap().status, TaskStatus::Processing);
}

#[tokio::test]
async fn test_exhausted_attempts_fail_on_reclaim() {
    let h = Harness::new().await;
    let types = ["noop".to_string()];
    let task = h
        .hub
        .submit(TaskDescriptorBuilder::new("noop").max_attempts(1).build())
        .await
        .unwrap();
    h.hub.lease("worker-1", &types).await.unwrap().unwrap();

    h.advance(21);
    recovery(&h).reclaim_expired_leases().await.unwrap();
    let failed = h.hub.get(task.id).await.unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);
    assert!(failed.completed_at.is_some());
}

#[tokio::test]
async fn test_pending_tasks_expire_after_ttl() {
    let h = Harness::new().await;
    let task = h
        .hub
        .submit(
            TaskDescriptorBuilder::new("import_csv")
                .input(serde_json::json!({"url": "s3://bucket/a.csv"}))
                .build(),
        )
        .await
        .unwrap();
    assert_eq!(task.expires_at, Some(h.now() + chrono::Duration::hours(1)));

    h.advance(3599);
    assert_eq!(recovery(&h).expire_pending().await.unwrap(), 0);

    h.advance(1);
    assert_eq!(recovery(&h).expire_pending().await.unwrap(), 1);
    let expired = h.hub.get(task.id).await.unwrap();
    assert_eq!(expired.status, TaskStatus::Expired);
    assert_eq!(
        h.queue
            .depth(&QueueKey::new("import_csv", TaskPriority::Normal))
            .await
            .unwrap(),
        0
    );
    assert!(h
        .hub
        .lease("worker-1", &["import_csv".to_string()])
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_rebuild_queue_after_restart() {
    let h = Harness::new().await;
    for _ in 0..2 {
        h.hub
            .submit(TaskDescriptorBuilder::new("noop").build())
            .await
            .unwrap();
    }

    // 新进程使用空队列，但共享同一存储
    let hub = Arc::new(
        TaskHub::new(
            h.repos.clone(),
            Arc::new(InMemoryTaskQueue::new(100)),
            Arc::new(registry()),
            h.clock.clone(),
        )
        .with_dispatcher_config(dispatcher_config()),
    );
    let types = ["noop".to_string()];
    assert!(hub.lease("worker-1", &types).await.unwrap().is_none());

    let rebuilt = RecoveryService::new(hub.clone(), dispatcher_config())
        .rebuild_queue()
        .await
        .unwrap();
    assert_eq!(rebuilt, 2);
    assert!(hub.lease("worker-1", &types).await.unwrap().is_some());
    assert!(hub.lease("worker-1", &types).await.unwrap().is_some());
    assert!(hub.lease("worker-1", &types).await.unwrap().is_none());
}
