use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use taskhub_core::DispatcherConfig;
use taskhub_domain::{QueueEntry, TaskFilter, TaskStatus};
use taskhub_errors::HubResult;

use crate::task_hub::{ReclaimCause, TaskHub};

/// 一轮恢复扫描的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub reclaimed: usize,
    pub expired: usize,
}

/// 恢复服务：回收过期租约、使超时等待的任务过期、启动时重建派发队列
pub struct RecoveryService {
    hub: Arc<TaskHub>,
    config: DispatcherConfig,
}

impl RecoveryService {
    pub fn new(hub: Arc<TaskHub>, config: DispatcherConfig) -> Self {
        Self { hub, config }
    }

    /// 把存储中全部 `pending` 任务重新放入派发队列
    pub async fn rebuild_queue(&self) -> HubResult<usize> {
        let pending = self
            .hub
            .list(&TaskFilter {
                status: Some(TaskStatus::Pending),
                ..Default::default()
            })
            .await?;

        let queue = self.hub.queue();
        for task in &pending {
            queue.requeue(QueueEntry::for_task(task)).await?;
        }
        info!(rebuilt = pending.len(), "派发队列已从存储重建");
        Ok(pending.len())
    }

    pub async fn reclaim_expired_leases(&self) -> HubResult<usize> {
        let now = self.hub.clock().now();
        let expired = self
            .hub
            .repositories()
            .tasks
            .find_expired_leases(now, self.config.recovery_batch_size)
            .await?;

        let mut reclaimed = 0;
        for task in expired {
            match self.hub.reclaim(task.id, ReclaimCause::LeaseExpired).await {
                Ok(Some(reclaimed_task)) => {
                    warn!(
                        event = "lease_reclaimed",
                        task.id = %task.id,
                        worker.id = task.leased_by.as_deref().unwrap_or(""),
                        task.attempts = reclaimed_task.attempts,
                        status = %reclaimed_task.status,
                        "租约过期，任务已回收"
                    );
                    reclaimed += 1;
                }
                Ok(None) => {}
                Err(e) => error!(task.id = %task.id, error = %e, "回收过期租约失败"),
            }
        }
        Ok(reclaimed)
    }

    pub async fn expire_pending(&self) -> HubResult<usize> {
        let now = self.hub.clock().now();
        let candidates = self
            .hub
            .repositories()
            .tasks
            .find_expired_pending(now, self.config.recovery_batch_size)
            .await?;

        let mut expired = 0;
        for task in candidates {
            match self.hub.expire(task.id).await {
                Ok(Some(_)) => expired += 1,
                Ok(None) => {}
                Err(e) => error!(task.id = %task.id, error = %e, "使等待任务过期失败"),
            }
        }
        Ok(expired)
    }

    pub async fn run_once(&self) -> HubResult<RecoveryReport> {
        let report = RecoveryReport {
            reclaimed: self.reclaim_expired_leases().await?,
            expired: self.expire_pending().await?,
        };
        if report != RecoveryReport::default() {
            info!(reclaimed = report.reclaimed, expired = report.expired, "恢复扫描完成");
        } else {
            debug!("恢复扫描无待处理任务");
        }
        Ok(report)
    }

    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.recovery_interval_seconds));
        info!(interval = ?interval.period(), "恢复服务已启动");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.run_once().await {
                        error!(error = %e, "恢复扫描失败");
                    }
                }
                _ = shutdown.recv() => {
                    info!("收到停止信号，退出恢复服务");
                    break;
                }
            }
        }
    }
}
