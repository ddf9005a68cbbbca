use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::value_objects::{TaskId, Tenant};

/// 每个终态任务一行的执行指标
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TaskMetric {
    pub task_id: Option<TaskId>,
    pub company: String,
    pub brand: Option<String>,
    pub task_type: String,
    pub execution_ms: u64,
    pub memory_mb: f64,
    pub cpu_percent: f64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub io_bytes: u64,
    pub api_calls: u32,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost: f64,
    pub error_count: u32,
    pub warning_count: u32,
    pub retry_count: u32,
    pub worker_id: String,
    pub queue_wait_ms: u64,
    pub recorded_at: Option<DateTime<Utc>>,
}

impl TaskMetric {
    pub fn tenant(&self) -> Tenant {
        Tenant {
            company: self.company.clone(),
            brand: self.brand.clone(),
        }
    }
}

/// 处理器上报的用量，由Worker汇总进指标
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct UsageReport {
    pub api_calls: u32,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost: f64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

impl UsageReport {
    pub fn merge(&mut self, other: &UsageReport) {
        self.api_calls += other.api_calls;
        self.tokens_in += other.tokens_in;
        self.tokens_out += other.tokens_out;
        self.cost += other.cost;
        self.bytes_in += other.bytes_in;
        self.bytes_out += other.bytes_out;
    }

    pub fn total_tokens(&self) -> u64 {
        self.tokens_in + self.tokens_out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricField {
    ExecutionMs,
    MemoryMb,
    CpuPercent,
    BytesIn,
    BytesOut,
    IoBytes,
    ApiCalls,
    TokensIn,
    TokensOut,
    Cost,
    ErrorCount,
    WarningCount,
    RetryCount,
    QueueWaitMs,
}

impl MetricField {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricField::ExecutionMs => "execution_ms",
            MetricField::MemoryMb => "memory_mb",
            MetricField::CpuPercent => "cpu_percent",
            MetricField::BytesIn => "bytes_in",
            MetricField::BytesOut => "bytes_out",
            MetricField::IoBytes => "io_bytes",
            MetricField::ApiCalls => "api_calls",
            MetricField::TokensIn => "tokens_in",
            MetricField::TokensOut => "tokens_out",
            MetricField::Cost => "cost",
            MetricField::ErrorCount => "error_count",
            MetricField::WarningCount => "warning_count",
            MetricField::RetryCount => "retry_count",
            MetricField::QueueWaitMs => "queue_wait_ms",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let field = match value {
            "execution_ms" => MetricField::ExecutionMs,
            "memory_mb" => MetricField::MemoryMb,
            "cpu_percent" => MetricField::CpuPercent,
            "bytes_in" => MetricField::BytesIn,
            "bytes_out" => MetricField::BytesOut,
            "io_bytes" => MetricField::IoBytes,
            "api_calls" => MetricField::ApiCalls,
            "tokens_in" => MetricField::TokensIn,
            "tokens_out" => MetricField::TokensOut,
            "cost" => MetricField::Cost,
            "error_count" => MetricField::ErrorCount,
            "warning_count" => MetricField::WarningCount,
            "retry_count" => MetricField::RetryCount,
            "queue_wait_ms" => MetricField::QueueWaitMs,
            _ => return None,
        };
        Some(field)
    }

    pub fn value(&self, metric: &TaskMetric) -> f64 {
        match self {
            MetricField::ExecutionMs => metric.execution_ms as f64,
            MetricField::MemoryMb => metric.memory_mb,
            MetricField::CpuPercent => metric.cpu_percent,
            MetricField::BytesIn => metric.bytes_in as f64,
            MetricField::BytesOut => metric.bytes_out as f64,
            MetricField::IoBytes => metric.io_bytes as f64,
            MetricField::ApiCalls => metric.api_calls as f64,
            MetricField::TokensIn => metric.tokens_in as f64,
            MetricField::TokensOut => metric.tokens_out as f64,
            MetricField::Cost => metric.cost,
            MetricField::ErrorCount => metric.error_count as f64,
            MetricField::WarningCount => metric.warning_count as f64,
            MetricField::RetryCount => metric.retry_count as f64,
            MetricField::QueueWaitMs => metric.queue_wait_ms as f64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparator {
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = ">")]
    Gt,
}

impl Comparator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Comparator::Lt => "<",
            Comparator::Le => "<=",
            Comparator::Eq => "=",
            Comparator::Ge => ">=",
            Comparator::Gt => ">",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "<" => Some(Comparator::Lt),
            "<=" | "≤" => Some(Comparator::Le),
            "=" | "==" => Some(Comparator::Eq),
            ">=" | "≥" => Some(Comparator::Ge),
            ">" => Some(Comparator::Gt),
            _ => None,
        }
    }

    pub fn evaluate(&self, value: f64, threshold: f64) -> bool {
        match self {
            Comparator::Lt => value < threshold,
            Comparator::Le => value <= threshold,
            Comparator::Eq => (value - threshold).abs() < f64::EPSILON,
            Comparator::Ge => value >= threshold,
            Comparator::Gt => value > threshold,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AlertChannel {
    Email { recipients: Vec<String> },
    Webhook { url: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: Uuid,
    pub company: String,
    pub name: String,
    pub metric_field: MetricField,
    pub comparator: Comparator,
    pub threshold: f64,
    /// 为空表示匹配所有任务类型
    #[serde(default)]
    pub task_types: Vec<String>,
    pub cooldown_seconds: i64,
    pub channels: Vec<AlertChannel>,
    pub last_fired_at: Option<DateTime<Utc>>,
    pub active: bool,
}

impl AlertRule {
    pub fn applies_to(&self, task_type: &str) -> bool {
        self.task_types.is_empty() || self.task_types.iter().any(|t| t == task_type)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::seconds(self.cooldown_seconds.max(0))
    }

    pub fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        self.last_fired_at
            .map(|last| now < last + self.cooldown())
            .unwrap_or(false)
    }

    pub fn matches(&self, metric: &TaskMetric) -> Option<f64> {
        let value = self.metric_field.value(metric);
        self.comparator
            .evaluate(value, self.threshold)
            .then_some(value)
    }
}

/// 告警载荷，Webhook直接以JSON发送
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub rule_id: Uuid,
    pub rule_name: String,
    pub task_id: Option<TaskId>,
    pub task_type: String,
    pub company: String,
    pub brand: Option<String>,
    pub metric_field: MetricField,
    pub comparator: Comparator,
    pub value: f64,
    pub threshold: f64,
    pub fired_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollupGranularity {
    Daily,
    Weekly,
}

/// 仪表盘用的聚合结果，仅供参考
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRollup {
    pub bucket_start: DateTime<Utc>,
    pub task_type: String,
    pub count: u64,
    pub total_execution_ms: u64,
    pub avg_execution_ms: f64,
    pub avg_queue_wait_ms: f64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost: f64,
    pub error_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_comparators() {
        assert!(Comparator::Gt.evaluate(12000.0, 10000.0));
        assert!(!Comparator::Gt.evaluate(10000.0, 10000.0));
        assert!(Comparator::Ge.evaluate(10000.0, 10000.0));
        assert!(Comparator::Le.evaluate(1.0, 1.0));
        assert!(Comparator::Lt.evaluate(0.5, 1.0));
        assert!(Comparator::Eq.evaluate(0.01, 0.01));
        assert_eq!(Comparator::parse("≥"), Some(Comparator::Ge));
        assert_eq!(
            serde_json::to_string(&Comparator::Gt).unwrap(),
            "\">\""
        );
    }

    #[test]
    fn test_rule_matching_and_cooldown() {
        let now = Utc::now();
        let mut rule = AlertRule {
            id: Uuid::new_v4(),
            company: "acme".into(),
            name: "slow".into(),
            metric_field: MetricField::ExecutionMs,
            comparator: Comparator::Gt,
            threshold: 10_000.0,
            task_types: vec![],
            cooldown_seconds: 3600,
            channels: vec![],
            last_fired_at: None,
            active: true,
        };
        let metric = TaskMetric {
            execution_ms: 12_000,
            task_type: "chat_completion".into(),
            ..Default::default()
        };
        assert!(rule.applies_to("anything"));
        assert_eq!(rule.matches(&metric), Some(12_000.0));
        assert!(!rule.in_cooldown(now));
        rule.last_fired_at = Some(now);
        assert!(rule.in_cooldown(now + Duration::minutes(5)));
        assert!(!rule.in_cooldown(now + Duration::hours(1)));

        rule.task_types = vec!["publish_article".into()];
        assert!(!rule.applies_to("chat_completion"));
    }
}
