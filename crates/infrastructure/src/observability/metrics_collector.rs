//! 任务中枢的Prometheus指标

use std::net::SocketAddr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use metrics::{counter, gauge, histogram, Counter, Gauge, Histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

use taskhub_domain::{Task, TaskEvent, TaskLifecycleHook, TaskStatus};

/// 安装Prometheus导出器，在 `listen` 上暴露 `/metrics`
pub fn install_prometheus_exporter(listen: &str) -> Result<()> {
    let addr: SocketAddr = listen
        .parse()
        .with_context(|| format!("无效的Prometheus监听地址: {listen}"))?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("安装Prometheus导出器失败")?;
    info!(listen = %addr, "Prometheus指标导出已启动");
    Ok(())
}

pub struct MetricsCollector {
    tasks_submitted_total: Counter,
    task_leases_total: Counter,
    task_retries_total: Counter,
    leases_reclaimed_total: Counter,
    task_execution_duration: Histogram,
    queue_wait_duration: Histogram,
    alerts_fired_total: Counter,
    periodic_fires_total: Counter,
    active_workers: Gauge,
    worker_active_tasks: Gauge,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            tasks_submitted_total: counter!("taskhub_tasks_submitted_total"),
            task_leases_total: counter!("taskhub_task_leases_total"),
            task_retries_total: counter!("taskhub_task_retries_total"),
            leases_reclaimed_total: counter!("taskhub_leases_reclaimed_total"),
            task_execution_duration: histogram!("taskhub_task_execution_duration_seconds"),
            queue_wait_duration: histogram!("taskhub_queue_wait_seconds"),
            alerts_fired_total: counter!("taskhub_alerts_fired_total"),
            periodic_fires_total: counter!("taskhub_periodic_fires_total"),
            active_workers: gauge!("taskhub_active_workers"),
            worker_active_tasks: gauge!("taskhub_worker_active_tasks"),
        }
    }

    pub fn record_task_execution(&self, task_type: &str, status: TaskStatus, duration_seconds: f64) {
        self.task_execution_duration.record(duration_seconds);
        counter!(
            "taskhub_task_executions_total",
            "task_type" => task_type.to_string(),
            "status" => status.as_str()
        )
        .increment(1);
    }

    pub fn record_queue_wait(&self, wait_seconds: f64) {
        self.queue_wait_duration.record(wait_seconds);
    }

    pub fn update_queue_depth(&self, queue: &str, depth: usize) {
        gauge!("taskhub_queue_depth", "queue" => queue.to_string()).set(depth as f64);
    }

    pub fn record_alert_fired(&self, rule_name: &str) {
        self.alerts_fired_total.increment(1);
        counter!("taskhub_alert_firings_total", "rule" => rule_name.to_string()).increment(1);
    }

    pub fn record_periodic_fire(&self, count: u64) {
        self.periodic_fires_total.increment(count);
    }

    pub fn update_active_workers(&self, count: usize) {
        self.active_workers.set(count as f64);
    }

    pub fn update_worker_load(&self, active_tasks: usize) {
        self.worker_active_tasks.set(active_tasks as f64);
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskLifecycleHook for MetricsCollector {
    fn name(&self) -> &str {
        "metrics"
    }

    async fn after_commit(&self, task: &Task, event: &TaskEvent) {
        match (event.from, event.to) {
            (None, TaskStatus::Pending) => self.tasks_submitted_total.increment(1),
            (Some(TaskStatus::Pending), TaskStatus::Processing) => {
                self.task_leases_total.increment(1)
            }
            (Some(TaskStatus::Processing), TaskStatus::Pending) => {
                self.task_retries_total.increment(1)
            }
            _ => {}
        }
        if event.reason == taskhub_domain::event_reasons::LEASE_EXPIRED
            || event.reason == taskhub_domain::event_reasons::WORKER_LOST
        {
            self.leases_reclaimed_total.increment(1);
        }
        counter!(
            "taskhub_task_transitions_total",
            "task_type" => task.task_type.clone(),
            "to" => event.to.as_str(),
            "reason" => event.reason.clone()
        )
        .increment(1);
    }
}
