use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::info;

use taskhub_core::{CredentialService, MetricsService, WorkerConfig};
use taskhub_dispatcher::TaskHub;
use taskhub_domain::{Task, WorkerRegistration};
use taskhub_errors::{HubError, HubResult};
use taskhub_infrastructure::{MetricsCollector, ResourceMonitor};

use crate::components::{HeartbeatManager, TaskExecutionManager, WorkerLifecycle};

/// 停止时等待在途任务的默认时长
const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Worker服务构建器
pub struct WorkerServiceBuilder {
    hub: Arc<TaskHub>,
    credentials: Arc<CredentialService>,
    config: WorkerConfig,
    metrics: Option<Arc<MetricsService>>,
    collector: Option<Arc<MetricsCollector>>,
    drain_timeout: Duration,
}

impl WorkerServiceBuilder {
    pub fn new(hub: Arc<TaskHub>, credentials: Arc<CredentialService>) -> Self {
        Self {
            hub,
            credentials,
            config: WorkerConfig::default(),
            metrics: None,
            collector: None,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    pub fn config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// 终态任务写入指标并触发告警规则
    pub fn metrics_service(mut self, metrics: Arc<MetricsService>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn collector(mut self, collector: Arc<MetricsCollector>) -> Self {
        self.collector = Some(collector);
        self
    }

    pub fn drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    pub fn build(self) -> HubResult<WorkerService> {
        let mut config = self.config;
        if config.worker_id.is_empty() {
            return Err(HubError::config_error("worker_id 不能为空"));
        }
        if config.hostname.is_empty() {
            config.hostname = hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string());
        }

        let monitor = Arc::new(ResourceMonitor::new());
        let workers = self.hub.repositories().workers.clone();

        let mut execution = TaskExecutionManager::new(
            config.worker_id.clone(),
            self.hub.clone(),
            self.credentials,
            config.heartbeat_interval(),
            monitor.clone(),
        );
        if let Some(metrics) = self.metrics {
            execution = execution.with_metrics(metrics);
        }
        if let Some(collector) = self.collector.clone() {
            execution = execution.with_collector(collector);
        }
        let execution = Arc::new(execution);

        let heartbeat = Arc::new(HeartbeatManager::new(
            config.worker_id.clone(),
            workers.clone(),
            self.hub.clock().clone(),
            config.heartbeat_interval(),
            monitor,
            self.collector,
        ));

        let lifecycle = Arc::new(WorkerLifecycle::new(
            config,
            self.hub,
            workers,
            execution.clone(),
            heartbeat.clone(),
        ));

        Ok(WorkerService {
            lifecycle,
            execution,
            heartbeat,
            drain_timeout: self.drain_timeout,
        })
    }
}

/// Worker运行时
pub struct WorkerService {
    lifecycle: Arc<WorkerLifecycle>,
    execution: Arc<TaskExecutionManager>,
    heartbeat: Arc<HeartbeatManager>,
    drain_timeout: Duration,
}

impl WorkerService {
    pub fn worker_id(&self) -> &str {
        self.lifecycle.worker_id()
    }

    pub fn queues(&self) -> Vec<String> {
        self.lifecycle.queues()
    }

    pub async fn start(&self) -> HubResult<()> {
        self.lifecycle.start().await
    }

    pub async fn stop(&self) -> HubResult<()> {
        self.lifecycle.stop(self.drain_timeout).await
    }

    /// 启动后阻塞到收到关闭信号
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> HubResult<()> {
        self.start().await?;
        let _ = shutdown_rx.recv().await;
        info!(worker.id = %self.worker_id(), "收到关闭信号");
        self.stop().await
    }

    pub async fn register(&self) -> HubResult<WorkerRegistration> {
        self.lifecycle.register().await
    }

    /// 领取并执行一个任务，不经过后台轮询
    pub async fn process_next(&self) -> HubResult<Option<Task>> {
        self.lifecycle.process_next().await
    }

    pub async fn send_heartbeat(&self) -> HubResult<WorkerRegistration> {
        let active = self.execution.get_current_task_count().await;
        self.heartbeat.send_heartbeat(active).await
    }

    pub async fn get_current_task_count(&self) -> usize {
        self.execution.get_current_task_count().await
    }

    pub async fn is_running(&self) -> bool {
        self.lifecycle.is_running().await
    }
}
