use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use taskhub_domain::{
    Alert, Clock, MetricRepository, MetricRollup, RollupGranularity, TaskId, TaskMetric,
};
use taskhub_errors::HubResult;

use super::alerts::AlertEngine;

/// 指标服务：写入每任务指标并内联触发规则评估
pub struct MetricsService {
    metrics: Arc<dyn MetricRepository>,
    alerts: Option<Arc<AlertEngine>>,
    clock: Arc<dyn Clock>,
}

impl MetricsService {
    pub fn new(
        metrics: Arc<dyn MetricRepository>,
        alerts: Option<Arc<AlertEngine>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            metrics,
            alerts,
            clock,
        }
    }

    pub async fn record(&self, mut metric: TaskMetric) -> HubResult<Vec<Alert>> {
        if metric.recorded_at.is_none() {
            metric.recorded_at = Some(self.clock.now());
        }
        self.metrics.insert(&metric).await?;
        match &self.alerts {
            Some(engine) => engine.evaluate(&metric).await,
            None => Ok(Vec::new()),
        }
    }

    pub async fn get(&self, task_id: TaskId) -> HubResult<Option<TaskMetric>> {
        self.metrics.get_for_task(task_id).await
    }

    /// 按天或按周（周一起始，UTC）聚合
    pub async fn rollup(
        &self,
        company: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        granularity: RollupGranularity,
    ) -> HubResult<Vec<MetricRollup>> {
        let rows = self.metrics.list(company, from, to).await?;
        let mut buckets: BTreeMap<(DateTime<Utc>, String), MetricRollup> = BTreeMap::new();

        for row in rows {
            let at = row.recorded_at.unwrap_or(from);
            let bucket_start = bucket_start(at, granularity);
            let entry = buckets
                .entry((bucket_start, row.task_type.clone()))
                .or_insert_with(|| MetricRollup {
                    bucket_start,
                    task_type: row.task_type.clone(),
                    count: 0,
                    total_execution_ms: 0,
                    avg_execution_ms: 0.0,
                    avg_queue_wait_ms: 0.0,
                    tokens_in: 0,
                    tokens_out: 0,
                    cost: 0.0,
                    error_count: 0,
                });
            // 先累加总量，平均值最后统一计算
            entry.count += 1;
            entry.total_execution_ms += row.execution_ms;
            entry.avg_queue_wait_ms += row.queue_wait_ms as f64;
            entry.tokens_in += row.tokens_in;
            entry.tokens_out += row.tokens_out;
            entry.cost += row.cost;
            entry.error_count += row.error_count as u64;
        }

        Ok(buckets
            .into_values()
            .map(|mut r| {
                r.avg_execution_ms = r.total_execution_ms as f64 / r.count as f64;
                r.avg_queue_wait_ms /= r.count as f64;
                r
            })
            .collect())
    }
}

fn bucket_start(at: DateTime<Utc>, granularity: RollupGranularity) -> DateTime<Utc> {
    let day = Utc
        .with_ymd_and_hms(at.year(), at.month(), at.day(), 0, 0, 0)
        .single()
        .unwrap_or(at);
    match granularity {
        RollupGranularity::Daily => day,
        RollupGranularity::Weekly => {
            day - Duration::days(at.weekday().num_days_from_monday() as i64)
        }
    }
}
