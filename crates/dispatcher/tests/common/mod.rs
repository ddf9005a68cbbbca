#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use taskhub_core::{
    DispatcherConfig, FieldKind, HandlerContext, HandlerOutput, InputSchema, RetryConfig,
    TaskHandler, TaskTypeRegistry, TaskTypeSpec,
};
use taskhub_dispatcher::TaskHub;
use taskhub_domain::{
    Clock, QuotaResource, Repositories, Subscription, SubscriptionRepository, TaskError,
    TaskLifecycleHook, TaskPriority,
};
use taskhub_infrastructure::testing::ManualClock;
use taskhub_infrastructure::{InMemoryStore, InMemoryTaskQueue};

pub struct EchoHandler;

#[async_trait]
impl TaskHandler for EchoHandler {
    async fn handle(&self, _ctx: &HandlerContext, input: Value) -> Result<HandlerOutput, TaskError> {
        Ok(HandlerOutput::new(input))
    }
}

/// 2024-03-04 是周一
pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 4, 8, 0, 0).unwrap()
}

pub fn registry() -> TaskTypeRegistry {
    let mut registry = TaskTypeRegistry::new();
    registry
        .register(
            TaskTypeSpec::new("noop").with_timeout(Duration::from_secs(20)),
            Arc::new(EchoHandler),
        )
        .unwrap();
    registry
        .register(
            TaskTypeSpec::new("import_csv")
                .with_schema(InputSchema::new().required("url", FieldKind::String))
                .with_ttl(chrono::Duration::hours(1)),
            Arc::new(EchoHandler),
        )
        .unwrap();
    registry
        .register(
            TaskTypeSpec::new("chat_completion")
                .with_priority(TaskPriority::High)
                .consumes(QuotaResource::Tokens),
            Arc::new(EchoHandler),
        )
        .unwrap();
    registry
        .register(
            TaskTypeSpec::new("publish_article").with_required_role("admin"),
            Arc::new(EchoHandler),
        )
        .unwrap();
    registry
}

/// 关闭抖动，使退避时间可预测
pub fn dispatcher_config() -> DispatcherConfig {
    DispatcherConfig {
        retry: RetryConfig {
            jitter_factor: 0.0,
            ..RetryConfig::default()
        },
        ..DispatcherConfig::default()
    }
}

pub struct Harness {
    pub store: Arc<InMemoryStore>,
    pub repos: Repositories,
    pub queue: Arc<InMemoryTaskQueue>,
    pub clock: Arc<ManualClock>,
    pub hub: Arc<TaskHub>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::build(|_, _| Vec::new(), |hub| hub).await
    }

    pub async fn build<H, C>(hooks: H, customize: C) -> Self
    where
        H: FnOnce(&Repositories, Arc<dyn Clock>) -> Vec<Arc<dyn TaskLifecycleHook>>,
        C: FnOnce(TaskHub) -> TaskHub,
    {
        Self::assemble(|repos| repos, hooks, customize).await
    }

    /// 替换部分仓储后再组装任务中心，用于注入并发写入
    pub async fn with_repositories(wrap: impl FnOnce(Repositories) -> Repositories) -> Self {
        Self::assemble(wrap, |_, _| Vec::new(), |hub| hub).await
    }

    async fn assemble<W, H, C>(wrap: W, hooks: H, customize: C) -> Self
    where
        W: FnOnce(Repositories) -> Repositories,
        H: FnOnce(&Repositories, Arc<dyn Clock>) -> Vec<Arc<dyn TaskLifecycleHook>>,
        C: FnOnce(TaskHub) -> TaskHub,
    {
        let store = Arc::new(InMemoryStore::new());
        let repos = wrap(Repositories::from_store(store.clone()));
        let queue = Arc::new(InMemoryTaskQueue::new(100));
        let clock = Arc::new(ManualClock::new(start_time()));

        SubscriptionRepository::upsert(
            store.as_ref(),
            &Subscription {
                company: "acme".into(),
                plan: "pro".into(),
                active: true,
                expires_at: None,
            },
        )
        .await
        .unwrap();

        let mut hub = TaskHub::new(repos.clone(), queue.clone(), Arc::new(registry()), clock.clone())
            .with_dispatcher_config(dispatcher_config())
            .with_heartbeat_interval(Duration::from_secs(10));
        for hook in hooks(&repos, clock.clone()) {
            hub = hub.with_hook(hook);
        }
        let hub = Arc::new(customize(hub));

        Self {
            store,
            repos,
            queue,
            clock,
            hub,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn advance(&self, seconds: i64) {
        self.clock.advance(chrono::Duration::seconds(seconds));
    }
}
