use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, RwLock};
use tokio::time::{interval_at, Instant};
use tracing::{debug, error, info, warn};

use taskhub_core::{
    CredentialService, HandlerContext, HandlerOutput, MetricsService, RegisteredTaskType,
};
use taskhub_dispatcher::{CompletionReport, FailureReport, TaskHub};
use taskhub_domain::{
    merge_deltas, ErrorKind, Lease, QuotaDelta, QuotaResource, Task, TaskError, TaskId,
    TaskMetric, TaskStatus, UsageReport,
};
use taskhub_errors::{HubError, HubResult};
use taskhub_infrastructure::{MetricsCollector, ResourceMonitor, StructuredLogger};

/// 处理器与租约心跳竞争的结果
enum Outcome {
    Finished(Result<HandlerOutput, TaskError>),
    LeaseLost,
}

/// 执行一次租约：调用处理器、按间隔续约、回传取消意图、上报结果并写入指标
pub struct TaskExecutionManager {
    worker_id: String,
    hub: Arc<TaskHub>,
    credentials: Arc<CredentialService>,
    metrics: Option<Arc<MetricsService>>,
    collector: Option<Arc<MetricsCollector>>,
    monitor: Arc<ResourceMonitor>,
    heartbeat_interval: Duration,
    running_tasks: Arc<RwLock<HashMap<TaskId, String>>>,
}

impl TaskExecutionManager {
    pub fn new(
        worker_id: String,
        hub: Arc<TaskHub>,
        credentials: Arc<CredentialService>,
        heartbeat_interval: Duration,
        monitor: Arc<ResourceMonitor>,
    ) -> Self {
        Self {
            worker_id,
            hub,
            credentials,
            metrics: None,
            collector: None,
            monitor,
            heartbeat_interval,
            running_tasks: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsService>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_collector(mut self, collector: Arc<MetricsCollector>) -> Self {
        self.collector = Some(collector);
        self
    }

    pub async fn get_current_task_count(&self) -> usize {
        self.running_tasks.read().await.len()
    }

    pub async fn running_task_ids(&self) -> Vec<TaskId> {
        self.running_tasks.read().await.keys().copied().collect()
    }

    /// 执行到上报完成；租约在执行中丢失时返回 `None`
    pub async fn execute(&self, lease: Lease) -> HubResult<Option<Task>> {
        let task = lease.task.clone();
        let Some(registered) = self.hub.registry().get(&task.task_type).cloned() else {
            error!(task.id = %task.id, task_type = %task.task_type, "没有该任务类型的处理器");
            let error = TaskError::new(
                ErrorKind::Fatal,
                format!("Worker {} 不支持任务类型 {}", self.worker_id, task.task_type),
            );
            return self
                .hub
                .fail(task.id, lease.token, FailureReport::new(error))
                .await
                .map(Some);
        };

        let (cancel_tx, cancel_rx) = watch::channel(task.cancel_requested);
        let ctx = HandlerContext::new(
            task.clone(),
            self.worker_id.clone(),
            cancel_rx,
            self.credentials.clone(),
            self.hub.quota().clone(),
            self.hub.clock().clone(),
        );

        self.running_tasks
            .write()
            .await
            .insert(task.id, task.task_type.clone());
        let started = Instant::now();
        let outcome = self.drive(&lease, &registered, &ctx, &cancel_tx).await;
        let elapsed = started.elapsed();
        self.running_tasks.write().await.remove(&task.id);

        let usage = ctx.usage().await;
        let warnings = ctx.warnings().await;
        let consumed = usage_deltas(&usage, &registered.spec.quota_resources);

        let reported = match outcome {
            Outcome::LeaseLost => return Ok(None),
            Outcome::Finished(Ok(output)) => {
                let mut quota_usage = consumed;
                quota_usage.extend(output.quota_usage);
                debug!(task.id = %task.id, elapsed_ms = elapsed.as_millis() as u64, "处理器执行成功");
                self.hub
                    .complete(
                        task.id,
                        lease.token,
                        CompletionReport {
                            result: output.result,
                            quota_usage: merge_deltas(&quota_usage),
                            warnings,
                        },
                    )
                    .await
            }
            Outcome::Finished(Err(error)) => {
                warn!(
                    task.id = %task.id,
                    task_type = %task.task_type,
                    error.kind = %error.kind,
                    error = %error.message,
                    "处理器返回错误"
                );
                self.hub
                    .fail(
                        task.id,
                        lease.token,
                        FailureReport {
                            error,
                            quota_usage: consumed,
                            warnings,
                        },
                    )
                    .await
            }
        };

        let finished = match reported {
            Ok(finished) => finished,
            Err(HubError::Conflict(msg)) => {
                // 租约已被回收，结果以新的持有者为准
                warn!(task.id = %task.id, worker.id = %self.worker_id, error = %msg, "上报结果被拒绝，租约已失效");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        if let Some(collector) = &self.collector {
            collector.record_task_execution(&finished.task_type, finished.status, elapsed.as_secs_f64());
        }
        if finished.status.is_terminal() {
            self.record_metric(&lease.task, &finished, &usage, elapsed).await;
        }
        Ok(Some(finished))
    }

    async fn drive(
        &self,
        lease: &Lease,
        registered: &RegisteredTaskType,
        ctx: &HandlerContext,
        cancel_tx: &watch::Sender<bool>,
    ) -> Outcome {
        let task_id = lease.task.id;
        let timeout = registered.spec.timeout;
        let handler = tokio::time::timeout(
            timeout,
            registered.handler.handle(ctx, lease.task.input.clone()),
        );
        tokio::pin!(handler);

        let mut heartbeat = interval_at(
            Instant::now() + self.heartbeat_interval,
            self.heartbeat_interval,
        );
        loop {
            tokio::select! {
                result = &mut handler => {
                    return match result {
                        Ok(result) => Outcome::Finished(result),
                        Err(_) => Outcome::Finished(Err(TaskError::new(
                            ErrorKind::Timeout,
                            format!("处理器执行超过 {timeout:?}"),
                        ))),
                    };
                }
                _ = heartbeat.tick() => {
                    match self.hub.heartbeat(task_id, lease.token).await {
                        Ok(ack) => {
                            if ack.cancel_requested && !*cancel_tx.borrow() {
                                info!(task.id = %task_id, "收到取消请求，通知处理器");
                                let _ = cancel_tx.send(true);
                            }
                        }
                        Err(HubError::Conflict(msg)) => {
                            warn!(task.id = %task_id, worker.id = %self.worker_id, error = %msg, "租约已失效，放弃执行");
                            return Outcome::LeaseLost;
                        }
                        Err(e) => {
                            error!(task.id = %task_id, error = %e, "任务心跳失败");
                        }
                    }
                }
            }
        }
    }

    async fn record_metric(&self, leased: &Task, finished: &Task, usage: &UsageReport, elapsed: Duration) {
        let sample = self.monitor.sample();
        let queue_wait_ms = leased
            .started_at
            .map(|started| (started - leased.available_at).num_milliseconds().max(0) as u64)
            .unwrap_or(0);
        if let Some(collector) = &self.collector {
            collector.record_queue_wait(queue_wait_ms as f64 / 1000.0);
        }

        let Some(metrics) = &self.metrics else {
            return;
        };
        let metric = TaskMetric {
            task_id: Some(finished.id),
            company: finished.tenant.company.clone(),
            brand: finished.tenant.brand.clone(),
            task_type: finished.task_type.clone(),
            execution_ms: elapsed.as_millis() as u64,
            memory_mb: sample.memory_mb,
            cpu_percent: sample.cpu_percent,
            bytes_in: usage.bytes_in,
            bytes_out: usage.bytes_out,
            io_bytes: usage.bytes_in + usage.bytes_out,
            api_calls: usage.api_calls,
            tokens_in: usage.tokens_in,
            tokens_out: usage.tokens_out,
            cost: usage.cost,
            error_count: u32::from(finished.status != TaskStatus::Completed),
            warning_count: finished.warnings.len() as u32,
            retry_count: finished.attempts.saturating_sub(1),
            worker_id: self.worker_id.clone(),
            queue_wait_ms,
            recorded_at: None,
        };

        match metrics.record(metric).await {
            Ok(alerts) => {
                for alert in alerts {
                    StructuredLogger::log_alert_fired(&alert);
                    if let Some(collector) = &self.collector {
                        collector.record_alert_fired(&alert.rule_name);
                    }
                }
            }
            Err(e) => error!(task.id = %finished.id, error = %e, "写入任务指标失败"),
        }
    }
}

/// 处理器上报的用量中，该任务类型计入配额的部分
pub fn usage_deltas(usage: &UsageReport, resources: &[QuotaResource]) -> Vec<QuotaDelta> {
    resources
        .iter()
        .filter_map(|resource| {
            let amount = match resource {
                QuotaResource::Tokens => usage.total_tokens() as f64,
                QuotaResource::Cost => usage.cost,
                _ => return None,
            };
            (amount > 0.0).then(|| QuotaDelta::new(*resource, amount))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_deltas_only_for_consumed_resources() {
        let usage = UsageReport {
            api_calls: 1,
            tokens_in: 40,
            tokens_out: 85,
            cost: 0.01,
            ..UsageReport::default()
        };
        let deltas = usage_deltas(&usage, &[QuotaResource::Tokens, QuotaResource::Cost]);
        assert_eq!(
            deltas,
            vec![
                QuotaDelta::new(QuotaResource::Tokens, 125.0),
                QuotaDelta::new(QuotaResource::Cost, 0.01),
            ]
        );
        assert!(usage_deltas(&usage, &[QuotaResource::ConcurrentTasks]).is_empty());
        assert!(usage_deltas(&UsageReport::default(), &[QuotaResource::Tokens]).is_empty());
    }
}
