use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use taskhub_core::WorkerConfig;
use taskhub_domain::{WorkerRegistration, WorkerStatus};
use taskhub_errors::HubResult;
use taskhub_infrastructure::{MetricsCollector, StructuredLogger};

use crate::task_hub::{ReclaimCause, TaskHub};

/// Worker失效检测配置
#[derive(Debug, Clone)]
pub struct WorkerFailureDetectorConfig {
    /// 超过该时长没有心跳即判定死亡
    pub heartbeat_timeout: chrono::Duration,
    pub detection_interval: Duration,
}

impl Default for WorkerFailureDetectorConfig {
    fn default() -> Self {
        Self::from_worker_config(&WorkerConfig::default())
    }
}

impl WorkerFailureDetectorConfig {
    /// 死亡判定为 `missed_heartbeats × heartbeat_interval`，每个心跳周期检测一次
    pub fn from_worker_config(config: &WorkerConfig) -> Self {
        Self {
            heartbeat_timeout: config.dead_after(),
            detection_interval: config.heartbeat_interval(),
        }
    }
}

pub struct WorkerFailureDetector {
    hub: Arc<TaskHub>,
    config: WorkerFailureDetectorConfig,
    metrics: Option<Arc<MetricsCollector>>,
}

impl WorkerFailureDetector {
    pub fn new(hub: Arc<TaskHub>, config: WorkerFailureDetectorConfig) -> Self {
        Self {
            hub,
            config,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn is_worker_failed(&self, worker: &WorkerRegistration, now: chrono::DateTime<chrono::Utc>) -> bool {
        worker.is_alive() && worker.heartbeat_missed(now, self.config.heartbeat_timeout)
    }

    /// 标记失联Worker为死亡并回收其持有的租约，返回本轮判定死亡的Worker
    pub async fn detect_once(&self) -> HubResult<Vec<String>> {
        let now = self.hub.clock().now();
        let workers = self.hub.repositories().workers.list().await?;

        let mut alive = 0;
        let mut failed = Vec::new();
        for worker in workers {
            if !self.is_worker_failed(&worker, now) {
                if worker.is_alive() {
                    alive += 1;
                }
                continue;
            }

            warn!(
                worker.id = %worker.worker_id,
                last_heartbeat = %worker.heartbeat_at,
                "检测到失效Worker"
            );
            self.hub
                .repositories()
                .workers
                .set_status(&worker.worker_id, WorkerStatus::Dead)
                .await?;
            let reclaimed = self.reclaim_leases(&worker.worker_id).await?;
            StructuredLogger::log_worker_lost(&worker.worker_id, reclaimed);
            failed.push(worker.worker_id);
        }

        if let Some(metrics) = &self.metrics {
            metrics.update_active_workers(alive);
        }
        Ok(failed)
    }

    async fn reclaim_leases(&self, worker_id: &str) -> HubResult<usize> {
        let leased = self
            .hub
            .repositories()
            .tasks
            .find_leased_by(worker_id)
            .await?;

        let mut reclaimed = 0;
        for task in leased {
            match self.hub.reclaim(task.id, ReclaimCause::WorkerLost).await {
                Ok(Some(_)) => reclaimed += 1,
                Ok(None) => {}
                Err(e) => error!(task.id = %task.id, worker.id = worker_id, error = %e, "回收失效Worker的租约失败"),
            }
        }
        Ok(reclaimed)
    }

    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            timeout_seconds = self.config.heartbeat_timeout.num_seconds(),
            "启动Worker失效检测循环"
        );
        let mut interval = tokio::time::interval(self.config.detection_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.detect_once().await {
                        Ok(failed) if !failed.is_empty() => {
                            info!("检测到 {} 个失效的Worker", failed.len());
                        }
                        Ok(_) => debug!("本轮没有失效Worker"),
                        Err(e) => error!("Worker失效检测时出错: {}", e),
                    }
                }
                _ = shutdown.recv() => {
                    info!("收到停止信号，退出Worker失效检测循环");
                    break;
                }
            }
        }
    }
}
