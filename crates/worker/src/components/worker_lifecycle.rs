use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use taskhub_core::WorkerConfig;
use taskhub_dispatcher::TaskHub;
use taskhub_domain::{Task, WorkerRegistration, WorkerRepository, WorkerStatus};
use taskhub_errors::{HubError, HubResult};
use taskhub_infrastructure::StructuredLogger;

use super::heartbeat_manager::TaskCountFn;
use super::{HeartbeatManager, TaskExecutionManager};

/// Worker生命周期：注册、租约轮询、并发扇出、注销
pub struct WorkerLifecycle {
    config: WorkerConfig,
    hub: Arc<TaskHub>,
    workers: Arc<dyn WorkerRepository>,
    execution: Arc<TaskExecutionManager>,
    heartbeat: Arc<HeartbeatManager>,
    slots: Arc<Semaphore>,
    shutdown_tx: RwLock<Option<broadcast::Sender<()>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    is_running: RwLock<bool>,
}

impl WorkerLifecycle {
    pub fn new(
        config: WorkerConfig,
        hub: Arc<TaskHub>,
        workers: Arc<dyn WorkerRepository>,
        execution: Arc<TaskExecutionManager>,
        heartbeat: Arc<HeartbeatManager>,
    ) -> Self {
        let capacity = config.capacity.max(1) as usize;
        Self {
            config,
            hub,
            workers,
            execution,
            heartbeat,
            slots: Arc::new(Semaphore::new(capacity)),
            shutdown_tx: RwLock::new(None),
            handles: Mutex::new(Vec::new()),
            is_running: RwLock::new(false),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// 监听的任务类型；未配置时监听全部已注册类型
    pub fn queues(&self) -> Vec<String> {
        if self.config.queues.is_empty() {
            self.hub.registry().names()
        } else {
            self.config.queues.clone()
        }
    }

    pub async fn is_running(&self) -> bool {
        *self.is_running.read().await
    }

    pub async fn register(&self) -> HubResult<WorkerRegistration> {
        let registration = WorkerRegistration::new(
            self.config.worker_id.clone(),
            self.config.hostname.clone(),
            self.queues(),
            self.config.capacity,
            self.hub.clock().now(),
        );
        let registered = self.workers.register(&registration).await?;
        StructuredLogger::log_worker_registered(
            &registered.worker_id,
            &registered.hostname,
            registered.capacity,
        );
        Ok(registered)
    }

    pub async fn start(self: &Arc<Self>) -> HubResult<()> {
        let mut is_running = self.is_running.write().await;
        if *is_running {
            return Err(HubError::Internal(format!(
                "Worker {} 已在运行",
                self.config.worker_id
            )));
        }

        self.register().await?;

        let (shutdown_tx, heartbeat_rx) = broadcast::channel(1);
        let poll_rx = shutdown_tx.subscribe();
        *self.shutdown_tx.write().await = Some(shutdown_tx);

        let execution = Arc::clone(&self.execution);
        let get_task_count: TaskCountFn = Box::new(move || {
            let execution = Arc::clone(&execution);
            Box::pin(async move { execution.get_current_task_count().await })
        });
        let heartbeat_handle = self
            .heartbeat
            .start_heartbeat_task(heartbeat_rx, get_task_count);

        let lifecycle = Arc::clone(self);
        let poll_handle = tokio::spawn(async move { lifecycle.poll_loop(poll_rx).await });

        let mut handles = self.handles.lock().await;
        handles.push(heartbeat_handle);
        handles.push(poll_handle);

        *is_running = true;
        info!(
            worker.id = %self.config.worker_id,
            capacity = self.config.capacity,
            queues = ?self.queues(),
            "Worker已启动"
        );
        Ok(())
    }

    /// 停止领取新任务，等待在途任务在 `drain_timeout` 内结束后注销
    pub async fn stop(&self, drain_timeout: Duration) -> HubResult<()> {
        let mut is_running = self.is_running.write().await;
        if !*is_running {
            return Ok(());
        }

        info!(worker.id = %self.config.worker_id, "停止Worker");
        if let Some(tx) = self.shutdown_tx.write().await.take() {
            let _ = tx.send(());
        }
        for handle in self.handles.lock().await.drain(..) {
            if let Err(e) = handle.await {
                error!(worker.id = %self.config.worker_id, error = %e, "后台任务异常退出");
            }
        }

        let capacity = self.config.capacity.max(1);
        match tokio::time::timeout(drain_timeout, self.slots.acquire_many(capacity)).await {
            Ok(Ok(permits)) => drop(permits),
            Ok(Err(_)) => {}
            Err(_) => {
                // 未结束的任务由租约过期后回收
                let running = self.execution.running_task_ids().await;
                warn!(
                    worker.id = %self.config.worker_id,
                    running = running.len(),
                    "等待在途任务超时"
                );
            }
        }

        self.workers
            .set_status(&self.config.worker_id, WorkerStatus::Stopped)
            .await?;
        *is_running = false;
        info!(worker.id = %self.config.worker_id, "Worker已注销");
        Ok(())
    }

    /// 领取并同步执行一个任务；队列为空时返回 `None`
    pub async fn process_next(&self) -> HubResult<Option<Task>> {
        let queues = self.queues();
        match self.hub.lease(&self.config.worker_id, &queues).await? {
            Some(lease) => self.execution.execute(lease).await,
            None => Ok(None),
        }
    }

    async fn poll_loop(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let poll_interval = self.config.poll_interval();
        let queues = self.queues();
        loop {
            let permit = tokio::select! {
                _ = shutdown_rx.recv() => break,
                permit = Arc::clone(&self.slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let leased = match self.try_dispatch(permit, &queues).await {
                Ok(leased) => leased,
                Err(e) => {
                    error!(worker.id = %self.config.worker_id, error = %e, "领取任务失败");
                    false
                }
            };
            if leased {
                continue;
            }

            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
        debug!(worker.id = %self.config.worker_id, "任务轮询退出");
    }

    /// 领取到任务时在独立任务中执行，执行结束释放并发槽
    async fn try_dispatch(&self, permit: OwnedSemaphorePermit, queues: &[String]) -> HubResult<bool> {
        let Some(lease) = self.hub.lease(&self.config.worker_id, queues).await? else {
            return Ok(false);
        };

        let execution = Arc::clone(&self.execution);
        let worker_id = self.config.worker_id.clone();
        tokio::spawn(async move {
            let task_id = lease.task.id;
            match execution.execute(lease).await {
                Ok(Some(task)) => {
                    debug!(task.id = %task_id, status = %task.status, "任务执行结束");
                }
                Ok(None) => {
                    debug!(task.id = %task_id, worker.id = %worker_id, "租约丢失，结果已丢弃");
                }
                Err(e) => {
                    error!(task.id = %task_id, worker.id = %worker_id, error = %e, "上报任务结果失败");
                }
            }
            drop(permit);
        });
        Ok(true)
    }
}
