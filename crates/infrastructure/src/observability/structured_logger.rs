//! 结构化日志事件
//!
//! 所有生命周期日志都带 `event` 字段，便于按事件名检索

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use taskhub_domain::{Alert, Task, TaskEvent, TaskLifecycleHook, TaskStatus};

pub struct StructuredLogger;

impl StructuredLogger {
    pub fn log_task_submitted(task: &Task) {
        info!(
            event = "task_submitted",
            task.id = %task.id,
            task_type = %task.task_type,
            task.priority = %task.priority,
            tenant.company = %task.tenant.company,
            tenant.brand = task.tenant.brand.as_deref().unwrap_or(""),
            available_at = %task.available_at,
            "任务已提交"
        );
    }

    pub fn log_task_leased(task: &Task, worker_id: &str, deadline: DateTime<Utc>) {
        info!(
            event = "task_leased",
            task.id = %task.id,
            task_type = %task.task_type,
            task.attempts = task.attempts,
            worker.id = worker_id,
            lease.deadline = %deadline,
            "任务已租出"
        );
    }

    pub fn log_task_finished(task: &Task, reason: &str) {
        match task.status {
            TaskStatus::Completed => info!(
                event = "task_completed",
                task.id = %task.id,
                task_type = %task.task_type,
                task.attempts = task.attempts,
                tenant.company = %task.tenant.company,
                "任务执行完成"
            ),
            TaskStatus::Failed => warn!(
                event = "task_failed",
                task.id = %task.id,
                task_type = %task.task_type,
                task.attempts = task.attempts,
                error.kind = task.error.as_ref().map(|e| e.kind.as_str()).unwrap_or(""),
                error.message = task.error.as_ref().map(|e| e.message.as_str()).unwrap_or(""),
                reason,
                "任务执行失败"
            ),
            TaskStatus::Cancelled => info!(
                event = "task_cancelled",
                task.id = %task.id,
                task_type = %task.task_type,
                reason,
                "任务已取消"
            ),
            TaskStatus::Expired => warn!(
                event = "task_expired",
                task.id = %task.id,
                task_type = %task.task_type,
                "任务在等待中过期"
            ),
            _ => {}
        }
    }

    pub fn log_task_retry_scheduled(task: &Task, reason: &str) {
        warn!(
            event = "task_retry_scheduled",
            task.id = %task.id,
            task_type = %task.task_type,
            task.attempts = task.attempts,
            task.max_attempts = task.max_attempts,
            retry_at = %task.available_at,
            reason,
            "任务将重试"
        );
    }

    pub fn log_worker_registered(worker_id: &str, hostname: &str, capacity: u32) {
        info!(
            event = "worker_registered",
            worker.id = worker_id,
            worker.hostname = hostname,
            worker.capacity = capacity,
            "Worker已注册"
        );
    }

    pub fn log_worker_lost(worker_id: &str, reclaimed: usize) {
        warn!(
            event = "worker_lost",
            worker.id = worker_id,
            reclaimed_tasks = reclaimed,
            "Worker心跳超时，回收其租约"
        );
    }

    pub fn log_alert_fired(alert: &Alert) {
        warn!(
            event = "alert_fired",
            alert.rule = %alert.rule_name,
            alert.metric = alert.metric_field.as_str(),
            alert.value = alert.value,
            alert.threshold = alert.threshold,
            tenant.company = %alert.company,
            task_type = %alert.task_type,
            "告警触发"
        );
    }

    pub fn log_periodic_fired(definition: &str, fired: usize, next_fire_at: Option<DateTime<Utc>>) {
        info!(
            event = "periodic_fired",
            periodic.name = definition,
            fired,
            next_fire_at = ?next_fire_at,
            "周期任务已物化"
        );
    }
}

/// 把每次提交的迁移写成结构化日志的生命周期钩子
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHook;

#[async_trait]
impl TaskLifecycleHook for LoggingHook {
    fn name(&self) -> &str {
        "logging"
    }

    async fn after_commit(&self, task: &Task, event: &TaskEvent) {
        match event.to {
            TaskStatus::Pending if event.from.is_none() => StructuredLogger::log_task_submitted(task),
            TaskStatus::Pending => StructuredLogger::log_task_retry_scheduled(task, &event.reason),
            TaskStatus::Processing => {
                if let (Some(worker), Some(deadline)) = (&task.leased_by, task.lease_deadline) {
                    StructuredLogger::log_task_leased(task, worker, deadline);
                }
            }
            _ => StructuredLogger::log_task_finished(task, &event.reason),
        }
        debug!(
            task.id = %task.id,
            from = ?event.from,
            to = %event.to,
            reason = %event.reason,
            "任务状态迁移"
        );
    }
}
