use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, error, info};

use taskhub_domain::{Clock, WorkerHeartbeat, WorkerRegistration, WorkerRepository};
use taskhub_errors::HubResult;
use taskhub_infrastructure::{MetricsCollector, ResourceMonitor};

pub type TaskCountFn = Box<dyn Fn() -> Pin<Box<dyn Future<Output = usize> + Send>> + Send + Sync>;

/// Worker注册心跳：定期上报 `{active_tasks, cpu%, mem%}`
pub struct HeartbeatManager {
    worker_id: String,
    workers: Arc<dyn WorkerRepository>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    monitor: Arc<ResourceMonitor>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl HeartbeatManager {
    pub fn new(
        worker_id: String,
        workers: Arc<dyn WorkerRepository>,
        clock: Arc<dyn Clock>,
        interval: Duration,
        monitor: Arc<ResourceMonitor>,
        metrics: Option<Arc<MetricsCollector>>,
    ) -> Self {
        Self {
            worker_id,
            workers,
            clock,
            interval,
            monitor,
            metrics,
        }
    }

    pub async fn send_heartbeat(&self, active_tasks: usize) -> HubResult<WorkerRegistration> {
        let sample = self.monitor.sample();
        let heartbeat = WorkerHeartbeat {
            active_tasks: active_tasks as u32,
            cpu_percent: sample.cpu_percent,
            mem_percent: sample.mem_percent,
        };
        if let Some(metrics) = &self.metrics {
            metrics.update_worker_load(active_tasks);
        }
        debug!(worker.id = %self.worker_id, active_tasks, "发送Worker心跳");
        self.workers
            .heartbeat(&self.worker_id, &heartbeat, self.clock.now())
            .await
    }

    pub fn start_heartbeat_task(
        self: &Arc<Self>,
        mut shutdown_rx: broadcast::Receiver<()>,
        get_task_count: TaskCountFn,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + manager.interval, manager.interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let active = get_task_count().await;
                        if let Err(e) = manager.send_heartbeat(active).await {
                            error!(worker.id = %manager.worker_id, error = %e, "发送Worker心跳失败");
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!(worker.id = %manager.worker_id, "心跳任务退出");
                        break;
                    }
                }
            }
        })
    }
}
