use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use taskhub_core::{
    AlertEngine, AppConfig, CredentialService, MetricsService, RetryPolicy, TaskTypeRegistry,
};
use taskhub_dispatcher::{
    CalendarService, PublicationTaskHook, PublicationWorkflow, RecoveryService, Scheduler, TaskHub,
    WorkerFailureDetector, WorkerFailureDetectorConfig,
};
use taskhub_domain::{Clock, SystemClock};
use taskhub_infrastructure::{
    connect_repositories, install_prometheus_exporter, ChannelNotifier, HttpProviderClient,
    InMemoryTaskQueue, LoggingHook, LoggingMailSender, MetricsCollector,
};
use taskhub_worker::{register_builtin_handlers, WorkerServiceBuilder};

/// 应用运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMode {
    /// 恢复扫描、周期调度与Worker失效检测
    Dispatcher,
    Worker,
    Api,
    All,
}

impl AppMode {
    pub fn parse(mode: &str) -> Result<Self> {
        match mode {
            "dispatcher" => Ok(Self::Dispatcher),
            "worker" => Ok(Self::Worker),
            "api" => Ok(Self::Api),
            "all" => Ok(Self::All),
            other => Err(anyhow::anyhow!("不支持的运行模式: {other}")),
        }
    }

    fn runs_dispatcher(self) -> bool {
        matches!(self, Self::Dispatcher | Self::All)
    }

    fn runs_worker(self) -> bool {
        matches!(self, Self::Worker | Self::All)
    }

    fn runs_api(self) -> bool {
        matches!(self, Self::Api | Self::All)
    }
}

/// 主应用程序：装配存储、任务中枢与各角色组件
pub struct Application {
    config: AppConfig,
    mode: AppMode,
    hub: Arc<TaskHub>,
    calendars: Arc<CalendarService>,
    credentials: Arc<CredentialService>,
    metrics: Arc<MetricsService>,
    collector: Arc<MetricsCollector>,
}

impl Application {
    pub async fn new(config: AppConfig, mode: AppMode) -> Result<Self> {
        info!(?mode, "初始化应用程序");
        config.validate().context("配置校验失败")?;

        if config.observability.metrics_enabled {
            if let Some(listen) = &config.observability.prometheus_listen {
                install_prometheus_exporter(listen)?;
            }
        }

        let repos = connect_repositories(
            &config.database.url,
            config.database.max_connections,
            config.database.run_migrations,
        )
        .await
        .context("连接存储失败")?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let collector = Arc::new(MetricsCollector::new());

        let workflow = Arc::new(PublicationWorkflow::new(
            repos.publications.clone(),
            repos.scheduled_publications.clone(),
            clock.clone(),
            config.scheduler.publication_max_retries,
        ));
        let provider = Arc::new(HttpProviderClient::new(
            config.ai.base_url.clone(),
            Duration::from_secs(config.ai.request_timeout_seconds),
        )?);
        let mut registry = TaskTypeRegistry::new();
        register_builtin_handlers(&mut registry, provider, &config.ai, workflow)?;
        info!(task_types = ?registry.names(), "任务类型已注册");

        let publication_hook = PublicationTaskHook::new(
            repos.scheduled_publications.clone(),
            RetryPolicy::new(config.dispatcher.retry.clone()),
            clock.clone(),
        );
        let hub = TaskHub::new(
            repos.clone(),
            Arc::new(InMemoryTaskQueue::new(config.queue.max_depth)),
            Arc::new(registry),
            clock.clone(),
        )
        .with_dispatcher_config(config.dispatcher.clone())
        .with_quota_config(config.quota.clone())
        .with_heartbeat_interval(config.worker.heartbeat_interval())
        .with_max_queue_depth(config.queue.max_depth)
        .with_hook(collector.clone())
        .with_hook(Arc::new(LoggingHook))
        .with_hook(Arc::new(publication_hook));

        let credentials = match &config.credentials.master_key {
            Some(key) => CredentialService::from_base64_key(repos.credentials.clone(), key, clock.clone())?,
            None => {
                warn!("未配置凭证主密钥，使用临时密钥，重启后已保存的凭证将无法解密");
                CredentialService::new(
                    repos.credentials.clone(),
                    &CredentialService::generate_key(),
                    clock.clone(),
                )?
            }
        };

        let alerts = if config.alerts.enabled {
            let notifier = ChannelNotifier::new(
                Duration::from_secs(config.alerts.webhook_timeout_seconds),
                Arc::new(LoggingMailSender),
                config.alerts.mail_from.clone(),
            )?;
            Some(Arc::new(AlertEngine::new(
                repos.alert_rules.clone(),
                Arc::new(notifier),
                clock.clone(),
            )))
        } else {
            None
        };
        let calendars = Arc::new(CalendarService::new(
            repos.calendars.clone(),
            repos.periodic.clone(),
            clock.clone(),
        ));
        let metrics = Arc::new(MetricsService::new(repos.metrics.clone(), alerts, clock));

        Ok(Self {
            config,
            mode,
            hub: Arc::new(hub),
            calendars,
            credentials: Arc::new(credentials),
            metrics,
            collector,
        })
    }

    pub fn hub(&self) -> Arc<TaskHub> {
        self.hub.clone()
    }

    /// 日历的覆盖引用由调度器物化，这里负责创建与查询
    pub fn calendars(&self) -> Arc<CalendarService> {
        self.calendars.clone()
    }

    pub fn mode(&self) -> AppMode {
        self.mode
    }

    /// 运行所选角色直到收到关闭信号
    pub async fn run(&self, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!(mode = ?self.mode, "启动应用程序");

        // 队列只在进程内，启动时从存储重建
        let recovery = Arc::new(RecoveryService::new(self.hub.clone(), self.config.dispatcher.clone()));
        let rebuilt = recovery.rebuild_queue().await.context("重建任务队列失败")?;
        info!(rebuilt, "任务队列已重建");

        let mut handles = Vec::new();

        if self.mode.runs_dispatcher() && self.config.dispatcher.enabled {
            handles.extend(self.spawn_dispatcher(recovery, &shutdown_rx));
        }

        if self.mode.runs_worker() && self.config.worker.enabled {
            let worker = WorkerServiceBuilder::new(self.hub.clone(), self.credentials.clone())
                .config(self.config.worker.clone())
                .metrics_service(self.metrics.clone())
                .collector(self.collector.clone())
                .build()?;
            let rx = shutdown_rx.resubscribe();
            handles.push(tokio::spawn(async move {
                if let Err(e) = worker.run(rx).await {
                    error!(error = %e, "Worker运行失败");
                }
            }));
        }

        if self.mode.runs_api() && self.config.api.enabled {
            let hub = self.hub.clone();
            let api = self.config.api.clone();
            let rx = shutdown_rx.resubscribe();
            handles.push(tokio::spawn(async move {
                if let Err(e) = taskhub_api::serve(hub, &api, rx).await {
                    error!(error = %e, "API服务运行失败");
                }
            }));
        }

        if handles.is_empty() {
            warn!(mode = ?self.mode, "当前模式下没有启用任何组件");
        }
        for handle in handles {
            let _ = handle.await;
        }
        info!("所有组件已停止");
        Ok(())
    }

    fn spawn_dispatcher(
        &self,
        recovery: Arc<RecoveryService>,
        shutdown_rx: &broadcast::Receiver<()>,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();

        let rx = shutdown_rx.resubscribe();
        handles.push(tokio::spawn(async move { recovery.run(rx).await }));

        let detector = WorkerFailureDetector::new(
            self.hub.clone(),
            WorkerFailureDetectorConfig::from_worker_config(&self.config.worker),
        )
        .with_metrics(self.collector.clone());
        let rx = shutdown_rx.resubscribe();
        handles.push(tokio::spawn(async move { detector.run(rx).await }));

        if self.config.scheduler.enabled {
            let scheduler = Scheduler::new(self.hub.clone(), self.config.scheduler.clone(), instance_id())
                .with_metrics(self.collector.clone());
            let rx = shutdown_rx.resubscribe();
            handles.push(tokio::spawn(async move { scheduler.run(rx).await }));
        }
        handles
    }
}

/// 调度器选主用的实例标识
fn instance_id() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    format!("{host}-{}", std::process::id())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mode() {
        assert_eq!(AppMode::parse("all").unwrap(), AppMode::All);
        assert!(AppMode::parse("dispatcher").unwrap().runs_dispatcher());
        assert!(!AppMode::parse("api").unwrap().runs_worker());
        assert!(AppMode::parse("cluster").is_err());
    }
}
