use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

use taskhub_domain::{AlertRule, AlertRuleRepository, MetricRepository, TaskId, TaskMetric};
use taskhub_errors::{HubError, HubResult};

use super::mapping::{from_json, map_unique_violation, millis, opt_from_millis, opt_millis, to_json};
use super::SqliteStore;

#[async_trait]
impl MetricRepository for SqliteStore {
    async fn insert(&self, metric: &TaskMetric) -> HubResult<()> {
        let recorded_at = metric
            .recorded_at
            .ok_or_else(|| HubError::invalid_input("指标缺少记录时间"))?;
        sqlx::query(
            "INSERT INTO task_metrics (task_id, company, task_type, recorded_at, payload) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(metric.task_id.map(|id| id.to_string()))
        .bind(&metric.company)
        .bind(&metric.task_type)
        .bind(millis(recorded_at))
        .bind(to_json(metric)?)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            map_unique_violation(e, || {
                format!(
                    "任务 {} 的指标已存在",
                    metric.task_id.map(|id| id.to_string()).unwrap_or_default()
                )
            })
        })?;
        Ok(())
    }

    async fn get_for_task(&self, task_id: TaskId) -> HubResult<Option<TaskMetric>> {
        let payload: Option<String> =
            sqlx::query_scalar("SELECT payload FROM task_metrics WHERE task_id = ?")
                .bind(task_id.to_string())
                .fetch_optional(&self.pool)
                .await?;
        payload.as_deref().map(from_json).transpose()
    }

    async fn list(
        &self,
        company: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> HubResult<Vec<TaskMetric>> {
        let payloads: Vec<String> = sqlx::query_scalar(
            "SELECT payload FROM task_metrics WHERE company = ? AND recorded_at >= ? AND recorded_at < ? ORDER BY recorded_at ASC",
        )
        .bind(company)
        .bind(millis(from))
        .bind(millis(to))
        .fetch_all(&self.pool)
        .await?;
        payloads.iter().map(|p| from_json(p)).collect()
    }
}

fn rule_from_row(row: &sqlx::sqlite::SqliteRow) -> HubResult<AlertRule> {
    let mut rule: AlertRule = from_json(&row.try_get::<String, _>("payload")?)?;
    // 触发时间以列为准，CAS只更新该列
    rule.last_fired_at = opt_from_millis(row.try_get("last_fired_at")?)?;
    Ok(rule)
}

#[async_trait]
impl AlertRuleRepository for SqliteStore {
    async fn upsert(&self, rule: &AlertRule) -> HubResult<()> {
        sqlx::query(
            r#"
            INSERT INTO alert_rules (id, company, active, last_fired_at, payload)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                company = excluded.company,
                active = excluded.active,
                last_fired_at = excluded.last_fired_at,
                payload = excluded.payload
            "#,
        )
        .bind(rule.id.to_string())
        .bind(&rule.company)
        .bind(rule.active)
        .bind(opt_millis(rule.last_fired_at))
        .bind(to_json(rule)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> HubResult<Option<AlertRule>> {
        let row = sqlx::query("SELECT payload, last_fired_at FROM alert_rules WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(rule_from_row).transpose()
    }

    async fn list_active(&self, company: &str) -> HubResult<Vec<AlertRule>> {
        let rows = sqlx::query(
            "SELECT payload, last_fired_at FROM alert_rules WHERE company = ? AND active = 1",
        )
        .bind(company)
        .fetch_all(&self.pool)
        .await?;
        let mut rules = rows.iter().map(rule_from_row).collect::<HubResult<Vec<_>>>()?;
        rules.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(rules)
    }

    async fn record_firing(
        &self,
        id: Uuid,
        previous: Option<DateTime<Utc>>,
        fired_at: DateTime<Utc>,
    ) -> HubResult<bool> {
        let result = sqlx::query(
            "UPDATE alert_rules SET last_fired_at = ? WHERE id = ? AND last_fired_at IS ?",
        )
        .bind(millis(fired_at))
        .bind(id.to_string())
        .bind(opt_millis(previous))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 1 {
            return Ok(true);
        }
        let exists: Option<String> = sqlx::query_scalar("SELECT id FROM alert_rules WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        match exists {
            Some(_) => Ok(false),
            None => Err(HubError::not_found("告警规则", id.to_string())),
        }
    }
}
