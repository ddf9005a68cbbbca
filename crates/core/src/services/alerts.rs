use std::sync::Arc;

use taskhub_domain::{Alert, AlertRuleRepository, Clock, Notifier, TaskMetric};
use taskhub_errors::HubResult;
use tracing::{info, warn};

/// 规则引擎：在指标写入后内联执行
pub struct AlertEngine {
    rules: Arc<dyn AlertRuleRepository>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
}

impl AlertEngine {
    pub fn new(
        rules: Arc<dyn AlertRuleRepository>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            rules,
            notifier,
            clock,
        }
    }

    /// 评估租户的全部有效规则，返回本次实际触发的告警
    pub async fn evaluate(&self, metric: &TaskMetric) -> HubResult<Vec<Alert>> {
        let now = self.clock.now();
        let mut fired = Vec::new();

        for rule in self.rules.list_active(&metric.company).await? {
            if !rule.applies_to(&metric.task_type) {
                continue;
            }
            let Some(value) = rule.matches(metric) else {
                continue;
            };
            if rule.in_cooldown(now) {
                info!(rule.id = %rule.id, rule.name = %rule.name, "告警规则处于冷却期，跳过");
                continue;
            }
            // 条件写入保证并发评估时只有一方触发
            if !self
                .rules
                .record_firing(rule.id, rule.last_fired_at, now)
                .await?
            {
                continue;
            }

            let alert = Alert {
                rule_id: rule.id,
                rule_name: rule.name.clone(),
                task_id: metric.task_id,
                task_type: metric.task_type.clone(),
                company: metric.company.clone(),
                brand: metric.brand.clone(),
                metric_field: rule.metric_field,
                comparator: rule.comparator,
                value,
                threshold: rule.threshold,
                fired_at: now,
            };

            for channel in &rule.channels {
                if let Err(e) = self.notifier.notify(channel, &alert).await {
                    warn!(rule.id = %rule.id, error = %e, "告警投递失败");
                }
            }
            warn!(
                event = "alert_fired",
                rule.id = %rule.id,
                tenant.company = %alert.company,
                metric = alert.metric_field.as_str(),
                value = alert.value,
                threshold = alert.threshold,
                "告警已触发"
            );
            fired.push(alert);
        }
        Ok(fired)
    }
}
