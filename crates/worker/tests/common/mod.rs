#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};
use tokio::sync::Notify;

use taskhub_core::{
    AiConfig, AlertEngine, CredentialService, DispatcherConfig, HandlerContext, HandlerOutput,
    MetricsService, ModelPrice, RetryConfig, TaskHandler, TaskTypeRegistry, TaskTypeSpec,
    WorkerConfig,
};
use taskhub_dispatcher::{PublicationWorkflow, TaskHub};
use taskhub_domain::{
    ErrorKind, Repositories, SecretString, Subscription, SubscriptionRepository, TaskError,
};
use taskhub_infrastructure::testing::{ManualClock, MockProviderClient, RecordingNotifier};
use taskhub_infrastructure::{InMemoryStore, InMemoryTaskQueue};
use taskhub_worker::{register_builtin_handlers, WorkerService, WorkerServiceBuilder};

/// 固定耗时后成功
pub struct SleepyHandler(pub Duration);

#[async_trait]
impl TaskHandler for SleepyHandler {
    async fn handle(&self, _ctx: &HandlerContext, input: Value) -> Result<HandlerOutput, TaskError> {
        tokio::time::sleep(self.0).await;
        Ok(HandlerOutput::new(input))
    }
}

/// 开始执行时发出通知；`cooperative` 时等待取消信号，否则睡眠后正常返回
pub struct GateHandler {
    pub started: Arc<Notify>,
    pub cooperative: bool,
}

#[async_trait]
impl TaskHandler for GateHandler {
    async fn handle(&self, ctx: &HandlerContext, _input: Value) -> Result<HandlerOutput, TaskError> {
        self.started.notify_one();
        if self.cooperative {
            ctx.cancelled().await;
            ctx.checkpoint()?;
        } else {
            tokio::time::sleep(Duration::from_secs(15)).await;
        }
        Ok(HandlerOutput::new(json!({"done": true})))
    }
}

pub struct FlakyHandler;

#[async_trait]
impl TaskHandler for FlakyHandler {
    async fn handle(&self, _ctx: &HandlerContext, _input: Value) -> Result<HandlerOutput, TaskError> {
        Err(TaskError::new(ErrorKind::Retryable, "下游暂不可用"))
    }
}

/// 2024-03-04 08:00 UTC
pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 4, 8, 0, 0).unwrap()
}

pub fn ai_config() -> AiConfig {
    AiConfig {
        pricing: vec![ModelPrice {
            model: "o3".into(),
            input_per_1k: 0.0375,
            output_per_1k: 0.1,
        }],
        ..AiConfig::default()
    }
}

pub fn worker_config() -> WorkerConfig {
    WorkerConfig {
        worker_id: "worker-1".into(),
        hostname: "test-host".into(),
        heartbeat_interval_seconds: 10,
        ..WorkerConfig::default()
    }
}

pub struct Harness {
    pub store: Arc<InMemoryStore>,
    pub repos: Repositories,
    pub clock: Arc<ManualClock>,
    pub hub: Arc<TaskHub>,
    pub provider: Arc<MockProviderClient>,
    pub notifier: Arc<RecordingNotifier>,
    pub metrics: Arc<MetricsService>,
    pub workflow: Arc<PublicationWorkflow>,
    pub started: Arc<Notify>,
    pub worker: WorkerService,
}

impl Harness {
    pub async fn new(provider: MockProviderClient) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let repos = Repositories::from_store(store.clone());
        let clock = Arc::new(ManualClock::new(start_time()));
        let provider = Arc::new(provider);
        let notifier = Arc::new(RecordingNotifier::new());
        let started = Arc::new(Notify::new());

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

        let workflow = Arc::new(PublicationWorkflow::new(
            repos.publications.clone(),
            repos.scheduled_publications.clone(),
            clock.clone(),
            3,
        ));

        let mut registry = TaskTypeRegistry::new();
        register_builtin_handlers(&mut registry, provider.clone(), &ai_config(), workflow.clone())
            .unwrap();
        registry
            .register(
                TaskTypeSpec::new("slow_report").with_timeout(Duration::from_secs(60)),
                Arc::new(SleepyHandler(Duration::from_secs(12))),
            )
            .unwrap();
        registry
            .register(
                TaskTypeSpec::new("hang").with_timeout(Duration::from_secs(5)),
                Arc::new(SleepyHandler(Duration::from_secs(60))),
            )
            .unwrap();
        registry
            .register(
                TaskTypeSpec::new("cooperative").with_timeout(Duration::from_secs(120)),
                Arc::new(GateHandler {
                    started: started.clone(),
                    cooperative: true,
                }),
            )
            .unwrap();
        registry
            .register(
                TaskTypeSpec::new("stubborn").with_timeout(Duration::from_secs(120)),
                Arc::new(GateHandler {
                    started: started.clone(),
                    cooperative: false,
                }),
            )
            .unwrap();
        registry
            .register(TaskTypeSpec::new("flaky"), Arc::new(FlakyHandler))
            .unwrap();

        let hub = Arc::new(
            TaskHub::new(
                repos.clone(),
                Arc::new(InMemoryTaskQueue::new(100)),
                Arc::new(registry),
                clock.clone(),
            )
            .with_dispatcher_config(DispatcherConfig {
                retry: RetryConfig {
                    jitter_factor: 0.0,
                    ..RetryConfig::default()
                },
                ..DispatcherConfig::default()
            })
            .with_heartbeat_interval(Duration::from_secs(10)),
        );

        let credentials = Arc::new(
            CredentialService::new(
                repos.credentials.clone(),
                &CredentialService::generate_key(),
                clock.clone(),
            )
            .unwrap(),
        );
        credentials
            .store("acme", "openai", &SecretString::new("sk-acme-test"))
            .await
            .unwrap();

        let alerts = Arc::new(AlertEngine::new(
            repos.alert_rules.clone(),
            notifier.clone(),
            clock.clone(),
        ));
        let metrics = Arc::new(MetricsService::new(
            repos.metrics.clone(),
            Some(alerts),
            clock.clone(),
        ));

        let worker = WorkerServiceBuilder::new(hub.clone(), credentials)
            .config(worker_config())
            .metrics_service(metrics.clone())
            .build()
            .unwrap();

        Self {
            store,
            repos,
            clock,
            hub,
            provider,
            notifier,
            metrics,
            workflow,
            started,
            worker,
        }
    }

    pub fn advance(&self, seconds: i64) {
        self.clock.advance(chrono::Duration::seconds(seconds));
    }
}
