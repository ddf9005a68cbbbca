mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::json;

use common::Harness;
use taskhub_dispatcher::{CompletionReport, FailureReport, ReclaimCause};
use taskhub_domain::{
    event_reasons, Principal, QueueKey, QuotaDelta, QuotaPeriod, QuotaResource, Task, TaskError,
    TaskEvent, TaskFilter, TaskId, TaskPriority, TaskQueue, TaskRepository, TaskStatus, Tenant,
    WARNING_CANCEL_AFTER_COMPLETE,
};
use taskhub_errors::{ErrorKind, HubError, HubResult};
use taskhub_infrastructure::testing::TaskDescriptorBuilder;

fn types(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn test_submit_persists_pending_task_and_enqueues() {
    let h = Harness::new().await;
    let task = h
        .hub
        .submit(TaskDescriptorBuilder::new("noop").input(json!({"n": 1})).build())
        .await
        .unwrap();

    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.attempts, 0);
    assert_eq!(task.max_attempts, 3);
    assert_eq!(task.priority, TaskPriority::Normal);
    assert_eq!(task.expires_at, Some(h.now() + Duration::hours(24)));

    let depth = h
        .queue
        .depth(&QueueKey::new("noop", TaskPriority::Normal))
        .await
        .unwrap();
    assert_eq!(depth, 1);

    let events = h.hub.events(task.id).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].from, None);
    assert_eq!(events[0].to, TaskStatus::Pending);
}

#[tokio::test]
async fn test_submit_rejections() {
    let h = Harness::new().await;

    let err = h
        .hub
        .submit(TaskDescriptorBuilder::new("render_video").build())
        .await
        .unwrap_err();
    assert!(matches!(err, HubError::UnknownTaskType { .. }));

    let err = h
        .hub
        .submit(TaskDescriptorBuilder::new("import_csv").input(json!({"url": 5})).build())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);

    let err = h
        .hub
        .submit(
            TaskDescriptorBuilder::new("noop")
                .principal(Principal::new("intruder", "globex"))
                .build(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unauthorized);

    // 没有订阅的公司
    let err = h
        .hub
        .submit(
            TaskDescriptorBuilder::new("noop")
                .tenant(Tenant::company("globex"))
                .build(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unauthorized);

    // 任务类型要求的角色
    let err = h
        .hub
        .submit(TaskDescriptorBuilder::new("publish_article").build())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unauthorized);
}

#[tokio::test]
async fn test_idempotency_key_returns_existing_task() {
    let h = Harness::new().await;
    let first = h
        .hub
        .submit(TaskDescriptorBuilder::new("noop").idempotency_key("k-1").build())
        .await
        .unwrap();
    let second = h
        .hub
        .submit(TaskDescriptorBuilder::new("noop").idempotency_key("k-1").build())
        .await
        .unwrap();
    assert_eq!(first.id, second.id);

    let a = h.hub.submit(TaskDescriptorBuilder::new("noop").build()).await.unwrap();
    let b = h.hub.submit(TaskDescriptorBuilder::new("noop").build()).await.unwrap();
    assert_ne!(a.id, b.id);

    let all = h.hub.list(&TaskFilter::default()).await.unwrap();
    assert_eq!(all.len(), 3);
}

#[tokio::test]
async fn test_lease_order_priority_then_fifo() {
    let h = Harness::new().await;
    let old_normal = h.hub.submit(TaskDescriptorBuilder::new("noop").build()).await.unwrap();
    h.advance(1);
    let new_normal = h.hub.submit(TaskDescriptorBuilder::new("noop").build()).await.unwrap();
    h.advance(1);
    let high = h
        .hub
        .submit(TaskDescriptorBuilder::new("noop").priority(TaskPriority::High).build())
        .await
        .unwrap();

    let order: Vec<_> = [
        h.hub.lease("w1", &types(&["noop"])).await.unwrap().unwrap(),
        h.hub.lease("w1", &types(&["noop"])).await.unwrap().unwrap(),
        h.hub.lease("w1", &types(&["noop"])).await.unwrap().unwrap(),
    ]
    .iter()
    .map(|l| l.task.id)
    .collect();
    assert_eq!(order, vec![high.id, old_normal.id, new_normal.id]);
    assert!(h.hub.lease("w1", &types(&["noop"])).await.unwrap().is_none());
}

#[tokio::test]
async fn test_lease_and_heartbeat() {
    let h = Harness::new().await;
    let task = h.hub.submit(TaskDescriptorBuilder::new("noop").build()).await.unwrap();

    let lease = h.hub.lease("w1", &types(&["noop"])).await.unwrap().unwrap();
    assert_eq!(lease.task.id, task.id);
    assert_eq!(lease.task.status, TaskStatus::Processing);
    assert_eq!(lease.task.attempts, 1);
    assert_eq!(lease.task.leased_by.as_deref(), Some("w1"));
    assert_eq!(lease.deadline, h.now() + Duration::seconds(20));
    assert_eq!(lease.task.started_at, Some(h.now()));

    // H=10s, k=3
    h.advance(10);
    let ack = h.hub.heartbeat(task.id, lease.token).await.unwrap();
    assert_eq!(ack.deadline, h.now() + Duration::seconds(30));
    assert!(!ack.cancel_requested);

    let err = h.hub.heartbeat(task.id, uuid::Uuid::new_v4()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    h.advance(31);
    let err = h.hub.heartbeat(task.id, lease.token).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[tokio::test]
async fn test_complete_records_result_and_event_path() {
    let h = Harness::new().await;
    h.hub
        .quota()
        .set_limit("acme", QuotaResource::ConcurrentTasks, 5.0, QuotaPeriod::None, true)
        .await
        .unwrap();
    let task = h.hub.submit(TaskDescriptorBuilder::new("noop").build()).await.unwrap();
    let used = |q: Option<taskhub_domain::Quota>| q.map(|q| q.used).unwrap_or(-1.0);
    assert_eq!(
        used(h.hub.quota().usage("acme", QuotaResource::ConcurrentTasks).await.unwrap()),
        1.0
    );

    let lease = h.hub.lease("w1", &types(&["noop"])).await.unwrap().unwrap();
    let done = h
        .hub
        .complete(
            task.id,
            lease.token,
            CompletionReport {
                result: json!({"ok": true}),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.result, Some(json!({"ok": true})));
    assert!(done.lease_token.is_none());
    assert_eq!(
        used(h.hub.quota().usage("acme", QuotaResource::ConcurrentTasks).await.unwrap()),
        0.0
    );

    let path: Vec<_> = h
        .hub
        .events(task.id)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.to)
        .collect();
    assert_eq!(
        path,
        vec![TaskStatus::Pending, TaskStatus::Processing, TaskStatus::Completed]
    );

    // 终态后再次完成被拒绝
    let err = h
        .hub
        .complete(task.id, lease.token, CompletionReport::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[tokio::test]
async fn test_retryable_failure_backs_off_until_exhausted() {
    let h = Harness::new().await;
    let task = h
        .hub
        .submit(TaskDescriptorBuilder::new("noop").max_attempts(2).build())
        .await
        .unwrap();

    let lease = h.hub.lease("w1", &types(&["noop"])).await.unwrap().unwrap();
    let retried = h
        .hub
        .fail(
            task.id,
            lease.token,
            FailureReport::new(TaskError::new(ErrorKind::Retryable, "provider 503")),
        )
        .await
        .unwrap();
    assert_eq!(retried.status, TaskStatus::Pending);
    assert_eq!(retried.attempts, 1);
    assert_eq!(retried.available_at, h.now() + Duration::seconds(5));
    assert_eq!(retried.error.as_ref().map(|e| e.kind), Some(ErrorKind::Retryable));

    // 退避期内不可派发
    assert!(h.hub.lease("w1", &types(&["noop"])).await.unwrap().is_none());
    h.advance(6);
    let lease = h.hub.lease("w2", &types(&["noop"])).await.unwrap().unwrap();
    assert_eq!(lease.task.attempts, 2);

    let failed = h
        .hub
        .fail(
            task.id,
            lease.token,
            FailureReport::new(TaskError::new(ErrorKind::Retryable, "provider 503")),
        )
        .await
        .unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);
    assert!(failed.completed_at.is_some());
}

#[tokio::test]
async fn test_fatal_failure_is_not_retried() {
    let h = Harness::new().await;
    let task = h.hub.submit(TaskDescriptorBuilder::new("noop").build()).await.unwrap();
    let lease = h.hub.lease("w1", &types(&["noop"])).await.unwrap().unwrap();
    let failed = h
        .hub
        .fail(
            task.id,
            lease.token,
            FailureReport::new(TaskError::new(ErrorKind::Fatal, "bad payload")),
        )
        .await
        .unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);
    assert_eq!(failed.error.unwrap().message, "bad payload");
}

#[tokio::test]
async fn test_cancel_paths() {
    let h = Harness::new().await;

    let pending = h.hub.submit(TaskDescriptorBuilder::new("noop").build()).await.unwrap();
    let user = Principal::new("user-1", "acme");
    let cancelled = h.hub.cancel(pending.id, &user).await.unwrap();
    assert_eq!(cancelled.status, TaskStatus::Cancelled);
    assert_eq!(
        h.queue
            .depth(&QueueKey::new("noop", TaskPriority::Normal))
            .await
            .unwrap(),
        0
    );
    // 已是终态时为空操作
    let again = h.hub.cancel(pending.id, &user).await.unwrap();
    assert_eq!(again.version, cancelled.version);

    let err = h
        .hub
        .cancel(pending.id, &Principal::new("x", "globex"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unauthorized);

    let running = h.hub.submit(TaskDescriptorBuilder::new("noop").build()).await.unwrap();
    let lease = h.hub.lease("w1", &types(&["noop"])).await.unwrap().unwrap();
    let flagged = h.hub.cancel(running.id, &user).await.unwrap();
    assert_eq!(flagged.status, TaskStatus::Processing);
    assert!(flagged.cancel_requested);

    let ack = h.hub.heartbeat(running.id, lease.token).await.unwrap();
    assert!(ack.cancel_requested);

    // 处理器没有观察到取消意图而正常返回
    let finished = h
        .hub
        .complete(running.id, lease.token, CompletionReport::default())
        .await
        .unwrap();
    assert_eq!(finished.status, TaskStatus::Cancelled);
    assert!(finished
        .warnings
        .contains(&WARNING_CANCEL_AFTER_COMPLETE.to_string()));
    let last = h.hub.events(running.id).await.unwrap().pop().unwrap();
    assert_eq!(last.reason, event_reasons::CANCEL_AFTER_COMPLETE);
}

#[tokio::test]
async fn test_reset_creates_linked_task() {
    let h = Harness::new().await;
    let task = h.hub.submit(TaskDescriptorBuilder::new("noop").build()).await.unwrap();
    let admin = Principal::new("root", "acme").with_role("admin");

    let err = h.hub.reset(task.id, &admin).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    h.hub
        .cancel(task.id, &Principal::new("user-1", "acme"))
        .await
        .unwrap();
    let err = h
        .hub
        .reset(task.id, &Principal::new("user-1", "acme"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unauthorized);

    let reset = h.hub.reset(task.id, &admin).await.unwrap();
    assert_ne!(reset.id, task.id);
    assert_eq!(reset.parent_task_id, Some(task.id));
    assert_eq!(reset.status, TaskStatus::Pending);
    assert_eq!(reset.principal, "user-1");
    assert_eq!(h.hub.get(task.id).await.unwrap().status, TaskStatus::Cancelled);
}

#[tokio::test]
async fn test_concurrent_task_reservation_applies_backpressure() {
    let h = Harness::new().await;
    h.hub
        .quota()
        .set_limit("acme", QuotaResource::ConcurrentTasks, 1.0, QuotaPeriod::None, true)
        .await
        .unwrap();

    let first = h.hub.submit(TaskDescriptorBuilder::new("noop").build()).await.unwrap();
    let err = h
        .hub
        .submit(TaskDescriptorBuilder::new("noop").build())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::QuotaExceeded);

    h.hub
        .cancel(first.id, &Principal::new("user-1", "acme"))
        .await
        .unwrap();
    assert!(h.hub.submit(TaskDescriptorBuilder::new("noop").build()).await.is_ok());
}

#[tokio::test]
async fn test_queue_depth_bound_rejects_with_overloaded() {
    let h = Harness::build(|_, _| Vec::new(), |hub| hub.with_max_queue_depth(1)).await;
    h.hub.submit(TaskDescriptorBuilder::new("noop").build()).await.unwrap();
    let err = h
        .hub
        .submit(TaskDescriptorBuilder::new("noop").build())
        .await
        .unwrap_err();
    assert!(matches!(err, HubError::Overloaded { .. }));
    assert!(err.is_retryable());

    // 其他优先级是独立的队列
    assert!(h
        .hub
        .submit(TaskDescriptorBuilder::new("noop").priority(TaskPriority::Low).build())
        .await
        .is_ok());
}

#[tokio::test]
async fn test_lease_skips_tasks_without_quota_headroom() {
    let h = Harness::new().await;
    h.hub
        .quota()
        .set_limit("acme", QuotaResource::Tokens, 100.0, QuotaPeriod::Monthly, true)
        .await
        .unwrap();
    h.hub.quota().consume("acme", QuotaResource::Tokens, 100.0).await.unwrap();

    let task = h
        .hub
        .submit(TaskDescriptorBuilder::new("chat_completion").build())
        .await
        .unwrap();
    assert!(h
        .hub
        .lease("w1", &types(&["chat_completion"]))
        .await
        .unwrap()
        .is_none());
    assert_eq!(h.hub.get(task.id).await.unwrap().status, TaskStatus::Pending);

    h.hub
        .quota()
        .set_limit("acme", QuotaResource::Tokens, 1000.0, QuotaPeriod::Monthly, true)
        .await
        .unwrap();
    h.advance(10);
    let lease = h
        .hub
        .lease("w1", &types(&["chat_completion"]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(lease.task.id, task.id);
}

#[tokio::test]
async fn test_usage_over_hard_cap_fails_task_without_consuming() {
    let h = Harness::new().await;
    h.hub
        .quota()
        .set_limit("acme", QuotaResource::Tokens, 1000.0, QuotaPeriod::Monthly, true)
        .await
        .unwrap();
    h.hub.quota().consume("acme", QuotaResource::Tokens, 950.0).await.unwrap();

    let task = h
        .hub
        .submit(TaskDescriptorBuilder::new("chat_completion").build())
        .await
        .unwrap();
    let lease = h
        .hub
        .lease("w1", &types(&["chat_completion"]))
        .await
        .unwrap()
        .unwrap();
    let finished = h
        .hub
        .complete(
            task.id,
            lease.token,
            CompletionReport {
                result: json!({}),
                quota_usage: vec![taskhub_domain::QuotaDelta::new(QuotaResource::Tokens, 100.0)],
                warnings: vec![],
            },
        )
        .await
        .unwrap();
    assert_eq!(finished.status, TaskStatus::Failed);
    assert_eq!(
        finished.error.map(|e| e.kind),
        Some(ErrorKind::QuotaExceeded)
    );
    let tokens = h
        .hub
        .quota()
        .usage("acme", QuotaResource::Tokens)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tokens.used, 950.0);
}

#[tokio::test]
async fn test_reclaim_requires_expired_lease() {
    let h = Harness::new().await;
    let task = h.hub.submit(TaskDescriptorBuilder::new("noop").build()).await.unwrap();
    let lease = h.hub.lease("w1", &types(&["noop"])).await.unwrap().unwrap();

    assert!(h
        .hub
        .reclaim(task.id, ReclaimCause::LeaseExpired)
        .await
        .unwrap()
        .is_none());

    h.advance(21);
    let reclaimed = h
        .hub
        .reclaim(task.id, ReclaimCause::LeaseExpired)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reclaimed.status, TaskStatus::Pending);
    assert_eq!(reclaimed.error.map(|e| e.kind), Some(ErrorKind::Timeout));

    // 原Worker迟到的完成被拒绝
    let err = h
        .hub
        .complete(task.id, lease.token, CompletionReport::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

/// 第一次终态提交前先把任务行标记为待取消，模拟与 `cancel` 交错的写入
struct CancelBeforeFirstTerminalCommit {
    inner: Arc<dyn TaskRepository>,
    armed: AtomicBool,
}

#[async_trait]
impl TaskRepository for CancelBeforeFirstTerminalCommit {
    async fn insert(&self, task: &Task, reservations: &[QuotaDelta]) -> HubResult<Task> {
        self.inner.insert(task, reservations).await
    }

    async fn get(&self, id: TaskId) -> HubResult<Option<Task>> {
        self.inner.get(id).await
    }

    async fn find_by_idempotency_key(&self, company: &str, key: &str) -> HubResult<Option<Task>> {
        self.inner.find_by_idempotency_key(company, key).await
    }

    async fn list(&self, filter: &TaskFilter) -> HubResult<Vec<Task>> {
        self.inner.list(filter).await
    }

    async fn commit(
        &self,
        task: &Task,
        expected_version: i64,
        quota_deltas: &[QuotaDelta],
        event: Option<&TaskEvent>,
    ) -> HubResult<Task> {
        if task.is_terminal() && self.armed.swap(false, Ordering::SeqCst) {
            if let Some(current) = self.inner.get(task.id).await? {
                let mut flagged = current.clone();
                flagged.cancel_requested = true;
                self.inner.commit(&flagged, current.version, &[], None).await?;
            }
        }
        self.inner.commit(task, expected_version, quota_deltas, event).await
    }

    async fn find_expired_leases(&self, now: DateTime<Utc>, limit: usize) -> HubResult<Vec<Task>> {
        self.inner.find_expired_leases(now, limit).await
    }

    async fn find_expired_pending(&self, now: DateTime<Utc>, limit: usize) -> HubResult<Vec<Task>> {
        self.inner.find_expired_pending(now, limit).await
    }

    async fn find_leased_by(&self, worker_id: &str) -> HubResult<Vec<Task>> {
        self.inner.find_leased_by(worker_id).await
    }

    async fn events(&self, id: TaskId) -> HubResult<Vec<TaskEvent>> {
        self.inner.events(id).await
    }
}

fn cancel_racing_harness() -> impl std::future::Future<Output = Harness> {
    Harness::with_repositories(|mut repos| {
        repos.tasks = Arc::new(CancelBeforeFirstTerminalCommit {
            inner: repos.tasks.clone(),
            armed: AtomicBool::new(true),
        });
        repos
    })
}

#[tokio::test]
async fn test_complete_observes_cancel_set_while_completing() {
    let h = cancel_racing_harness().await;
    h.hub
        .quota()
        .set_limit("acme", QuotaResource::Tokens, 1000.0, QuotaPeriod::Monthly, true)
        .await
        .unwrap();
    let task = h
        .hub
        .submit(TaskDescriptorBuilder::new("chat_completion").build())
        .await
        .unwrap();
    let lease = h
        .hub
        .lease("w1", &types(&["chat_completion"]))
        .await
        .unwrap()
        .unwrap();

    let finished = h
        .hub
        .complete(
            task.id,
            lease.token,
            CompletionReport {
                result: json!({"text": "bonjour"}),
                quota_usage: vec![QuotaDelta::new(QuotaResource::Tokens, 100.0)],
                warnings: vec![],
            },
        )
        .await
        .unwrap();

    assert_eq!(finished.status, TaskStatus::Cancelled);
    assert!(finished
        .warnings
        .contains(&WARNING_CANCEL_AFTER_COMPLETE.to_string()));
    let last = h.hub.events(task.id).await.unwrap().pop().unwrap();
    assert_eq!(last.reason, event_reasons::CANCEL_AFTER_COMPLETE);
    let tokens = h
        .hub
        .quota()
        .usage("acme", QuotaResource::Tokens)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tokens.used, 100.0);
}

#[tokio::test]
async fn test_fail_observes_cancel_set_while_failing() {
    let h = cancel_racing_harness().await;
    let task = h.hub.submit(TaskDescriptorBuilder::new("noop").build()).await.unwrap();
    let lease = h.hub.lease("w1", &types(&["noop"])).await.unwrap().unwrap();

    let finished = h
        .hub
        .fail(
            task.id,
            lease.token,
            FailureReport::new(TaskError::new(ErrorKind::Fatal, "boom")),
        )
        .await
        .unwrap();
    assert_eq!(finished.status, TaskStatus::Cancelled);
    let last = h.hub.events(task.id).await.unwrap().pop().unwrap();
    assert_eq!(last.reason, event_reasons::CANCELLED);
}

#[tokio::test]
async fn test_usage_over_one_cap_keeps_other_usage() {
    let h = Harness::new().await;
    h.hub
        .quota()
        .set_limit("acme", QuotaResource::Tokens, 1000.0, QuotaPeriod::Monthly, true)
        .await
        .unwrap();
    h.hub
        .quota()
        .set_limit("acme", QuotaResource::Cost, 50.0, QuotaPeriod::Monthly, true)
        .await
        .unwrap();
    h.hub.quota().consume("acme", QuotaResource::Tokens, 950.0).await.unwrap();

    let task = h
        .hub
        .submit(TaskDescriptorBuilder::new("chat_completion").build())
        .await
        .unwrap();
    let lease = h
        .hub
        .lease("w1", &types(&["chat_completion"]))
        .await
        .unwrap()
        .unwrap();
    let finished = h
        .hub
        .complete(
            task.id,
            lease.token,
            CompletionReport {
                result: json!({}),
                quota_usage: vec![
                    QuotaDelta::new(QuotaResource::Tokens, 100.0),
                    QuotaDelta::new(QuotaResource::Cost, 2.5),
                ],
                warnings: vec![],
            },
        )
        .await
        .unwrap();

    assert_eq!(finished.status, TaskStatus::Failed);
    assert_eq!(
        finished.error.map(|e| e.kind),
        Some(ErrorKind::QuotaExceeded)
    );
    let tokens = h.hub.quota().usage("acme", QuotaResource::Tokens).await.unwrap().unwrap();
    let cost = h.hub.quota().usage("acme", QuotaResource::Cost).await.unwrap().unwrap();
    assert_eq!(tokens.used, 950.0);
    assert_eq!(cost.used, 2.5);
}

#[tokio::test]
async fn test_failure_usage_over_cap_keeps_other_usage() {
    let h = Harness::new().await;
    h.hub
        .quota()
        .set_limit("acme", QuotaResource::Tokens, 10.0, QuotaPeriod::Monthly, true)
        .await
        .unwrap();
    h.hub
        .quota()
        .set_limit("acme", QuotaResource::Cost, 50.0, QuotaPeriod::Monthly, true)
        .await
        .unwrap();

    let task = h.hub.submit(TaskDescriptorBuilder::new("noop").build()).await.unwrap();
    let lease = h.hub.lease("w1", &types(&["noop"])).await.unwrap().unwrap();
    let mut report = FailureReport::new(TaskError::new(ErrorKind::Fatal, "provider rejected"));
    report.quota_usage = vec![
        QuotaDelta::new(QuotaResource::Tokens, 40.0),
        QuotaDelta::new(QuotaResource::Cost, 1.0),
    ];
    let failed = h.hub.fail(task.id, lease.token, report).await.unwrap();

    assert_eq!(failed.status, TaskStatus::Failed);
    assert_eq!(failed.error.map(|e| e.kind), Some(ErrorKind::Fatal));
    let tokens = h.hub.quota().usage("acme", QuotaResource::Tokens).await.unwrap().unwrap();
    let cost = h.hub.quota().usage("acme", QuotaResource::Cost).await.unwrap().unwrap();
    assert_eq!(tokens.used, 0.0);
    assert_eq!(cost.used, 1.0);
}
