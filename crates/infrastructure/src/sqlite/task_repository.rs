use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection};
use tracing::debug;

use taskhub_domain::{
    QuotaDelta, Task, TaskEvent, TaskFilter, TaskId, TaskPriority, TaskRepository, TaskStatus,
    Tenant,
};
use taskhub_errors::{HubError, HubResult};

use super::mapping::{
    from_json, from_millis, map_unique_violation, millis, opt_from_millis, opt_millis,
    parse_enum, parse_uuid, to_json,
};
use super::quota_repository::apply_deltas;
use super::SqliteStore;

const TASK_COLUMNS: &str = "id, task_type, company, brand, principal, priority, status, input, result, error, warnings, attempts, max_attempts, lease_token, leased_by, lease_deadline, cancel_requested, available_at, expires_at, idempotency_key, parent_task_id, periodic_definition_id, created_at, started_at, completed_at, updated_at, version";

fn task_from_row(row: &SqliteRow) -> HubResult<Task> {
    let id: String = row.try_get("id")?;
    let result: Option<String> = row.try_get("result")?;
    let error: Option<String> = row.try_get("error")?;
    let lease_token: Option<String> = row.try_get("lease_token")?;
    let parent_task_id: Option<String> = row.try_get("parent_task_id")?;
    let periodic_definition_id: Option<String> = row.try_get("periodic_definition_id")?;

    Ok(Task {
        id: TaskId(parse_uuid(&id)?),
        task_type: row.try_get("task_type")?,
        tenant: Tenant {
            company: row.try_get("company")?,
            brand: row.try_get("brand")?,
        },
        principal: row.try_get("principal")?,
        priority: parse_enum(&row.try_get::<String, _>("priority")?, TaskPriority::parse, "任务优先级")?,
        status: parse_enum(&row.try_get::<String, _>("status")?, TaskStatus::parse, "任务状态")?,
        input: from_json(&row.try_get::<String, _>("input")?)?,
        result: result.as_deref().map(from_json).transpose()?,
        error: error.as_deref().map(from_json).transpose()?,
        warnings: from_json(&row.try_get::<String, _>("warnings")?)?,
        attempts: row.try_get::<i64, _>("attempts")? as u32,
        max_attempts: row.try_get::<i64, _>("max_attempts")? as u32,
        lease_token: lease_token.as_deref().map(parse_uuid).transpose()?,
        leased_by: row.try_get("leased_by")?,
        lease_deadline: opt_from_millis(row.try_get("lease_deadline")?)?,
        cancel_requested: row.try_get("cancel_requested")?,
        available_at: from_millis(row.try_get("available_at")?)?,
        expires_at: opt_from_millis(row.try_get("expires_at")?)?,
        idempotency_key: row.try_get("idempotency_key")?,
        parent_task_id: parent_task_id
            .as_deref()
            .map(parse_uuid)
            .transpose()?
            .map(TaskId),
        periodic_definition_id: periodic_definition_id
            .as_deref()
            .map(parse_uuid)
            .transpose()?,
        created_at: from_millis(row.try_get("created_at")?)?,
        started_at: opt_from_millis(row.try_get("started_at")?)?,
        completed_at: opt_from_millis(row.try_get("completed_at")?)?,
        updated_at: from_millis(row.try_get("updated_at")?)?,
        version: row.try_get("version")?,
    })
}

async fn append_event(conn: &mut SqliteConnection, event: &TaskEvent) -> HubResult<()> {
    sqlx::query(
        r#"
        INSERT INTO task_events (id, task_id, seq, from_status, to_status, reason, at)
        VALUES (?, ?, (SELECT COALESCE(MAX(seq), 0) + 1 FROM task_events WHERE task_id = ?), ?, ?, ?, ?)
        "#,
    )
    .bind(event.id.to_string())
    .bind(event.task_id.to_string())
    .bind(event.task_id.to_string())
    .bind(event.from.map(|s| s.as_str()))
    .bind(event.to.as_str())
    .bind(&event.reason)
    .bind(millis(event.at))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

fn event_from_row(row: &SqliteRow) -> HubResult<TaskEvent> {
    let from: Option<String> = row.try_get("from_status")?;
    Ok(TaskEvent {
        id: parse_uuid(&row.try_get::<String, _>("id")?)?,
        task_id: TaskId(parse_uuid(&row.try_get::<String, _>("task_id")?)?),
        from: from
            .as_deref()
            .map(|s| parse_enum(s, TaskStatus::parse, "任务状态"))
            .transpose()?,
        to: parse_enum(&row.try_get::<String, _>("to_status")?, TaskStatus::parse, "任务状态")?,
        reason: row.try_get("reason")?,
        at: from_millis(row.try_get("at")?)?,
    })
}

impl SqliteStore {
    async fn fetch_tasks(&self, sql: &str, now: DateTime<Utc>, limit: usize) -> HubResult<Vec<Task>> {
        let rows = sqlx::query(sql)
            .bind(millis(now))
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(task_from_row).collect()
    }
}

#[async_trait]
impl TaskRepository for SqliteStore {
    async fn insert(&self, task: &Task, reservations: &[QuotaDelta]) -> HubResult<Task> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!(
            "INSERT INTO tasks ({TASK_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(task.id.to_string())
        .bind(&task.task_type)
        .bind(&task.tenant.company)
        .bind(&task.tenant.brand)
        .bind(&task.principal)
        .bind(task.priority.as_str())
        .bind(task.status.as_str())
        .bind(to_json(&task.input)?)
        .bind(task.result.as_ref().map(to_json).transpose()?)
        .bind(task.error.as_ref().map(to_json).transpose()?)
        .bind(to_json(&task.warnings)?)
        .bind(task.attempts as i64)
        .bind(task.max_attempts as i64)
        .bind(task.lease_token.map(|t| t.to_string()))
        .bind(&task.leased_by)
        .bind(opt_millis(task.lease_deadline))
        .bind(task.cancel_requested)
        .bind(millis(task.available_at))
        .bind(opt_millis(task.expires_at))
        .bind(&task.idempotency_key)
        .bind(task.parent_task_id.map(|p| p.to_string()))
        .bind(task.periodic_definition_id.map(|p| p.to_string()))
        .bind(millis(task.created_at))
        .bind(opt_millis(task.started_at))
        .bind(opt_millis(task.completed_at))
        .bind(millis(task.updated_at))
        .bind(task.version)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_unique_violation(e, || format!("任务或幂等键已存在: {}", task.id)))?;

        apply_deltas(&mut *tx, &task.tenant.company, reservations, task.created_at).await?;
        append_event(&mut *tx, &TaskEvent::created(task.id, task.created_at)).await?;

        tx.commit().await?;
        debug!(task.id = %task.id, "任务已写入SQLite");
        Ok(task.clone())
    }

    async fn get(&self, id: TaskId) -> HubResult<Option<Task>> {
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(task_from_row).transpose()
    }

    async fn find_by_idempotency_key(&self, company: &str, key: &str) -> HubResult<Option<Task>> {
        let row = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE company = ? AND idempotency_key = ?"
        ))
        .bind(company)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(task_from_row).transpose()
    }

    async fn list(&self, filter: &TaskFilter) -> HubResult<Vec<Task>> {
        let mut query: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {TASK_COLUMNS} FROM tasks WHERE 1 = 1"));
        if let Some(company) = &filter.company {
            query.push(" AND company = ").push_bind(company.clone());
        }
        if let Some(brand) = &filter.brand {
            query.push(" AND brand = ").push_bind(brand.clone());
        }
        if let Some(status) = filter.status {
            query.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(task_type) = &filter.task_type {
            query.push(" AND task_type = ").push_bind(task_type.clone());
        }
        if let Some(parent) = filter.parent_task_id {
            query.push(" AND parent_task_id = ").push_bind(parent.to_string());
        }
        query.push(" ORDER BY created_at ASC, id ASC");
        query
            .push(" LIMIT ")
            .push_bind(filter.limit.map(|l| l as i64).unwrap_or(-1));
        query
            .push(" OFFSET ")
            .push_bind(filter.offset.unwrap_or(0) as i64);

        let rows = query.build().fetch_all(&self.pool).await?;
        rows.iter().map(task_from_row).collect()
    }

    async fn commit(
        &self,
        task: &Task,
        expected_version: i64,
        quota_deltas: &[QuotaDelta],
        event: Option<&TaskEvent>,
    ) -> HubResult<Task> {
        let mut tx = self.pool.begin().await?;

        // 先写任务行以尽早拿到写锁
        let result = sqlx::query(
            r#"
            UPDATE tasks SET
                priority = ?, status = ?, result = ?, error = ?, warnings = ?,
                attempts = ?, max_attempts = ?, lease_token = ?, leased_by = ?, lease_deadline = ?,
                cancel_requested = ?, available_at = ?, expires_at = ?,
                started_at = ?, completed_at = ?, updated_at = ?, version = ?
            WHERE id = ? AND version = ?
            "#,
        )
        .bind(task.priority.as_str())
        .bind(task.status.as_str())
        .bind(task.result.as_ref().map(to_json).transpose()?)
        .bind(task.error.as_ref().map(to_json).transpose()?)
        .bind(to_json(&task.warnings)?)
        .bind(task.attempts as i64)
        .bind(task.max_attempts as i64)
        .bind(task.lease_token.map(|t| t.to_string()))
        .bind(&task.leased_by)
        .bind(opt_millis(task.lease_deadline))
        .bind(task.cancel_requested)
        .bind(millis(task.available_at))
        .bind(opt_millis(task.expires_at))
        .bind(opt_millis(task.started_at))
        .bind(opt_millis(task.completed_at))
        .bind(millis(task.updated_at))
        .bind(expected_version + 1)
        .bind(task.id.to_string())
        .bind(expected_version)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            let actual: Option<i64> = sqlx::query_scalar("SELECT version FROM tasks WHERE id = ?")
                .bind(task.id.to_string())
                .fetch_optional(&mut *tx)
                .await?;
            return Err(match actual {
                Some(actual) => HubError::conflict(format!(
                    "任务 {} 版本冲突: 期望 {expected_version}, 实际 {actual}",
                    task.id
                )),
                None => HubError::not_found("任务", task.id.to_string()),
            });
        }

        apply_deltas(&mut *tx, &task.tenant.company, quota_deltas, task.updated_at).await?;
        if let Some(event) = event {
            append_event(&mut *tx, event).await?;
        }
        tx.commit().await?;

        let mut stored = task.clone();
        stored.version = expected_version + 1;
        Ok(stored)
    }

    async fn find_expired_leases(&self, now: DateTime<Utc>, limit: usize) -> HubResult<Vec<Task>> {
        self.fetch_tasks(
            &format!(
                "SELECT {TASK_COLUMNS} FROM tasks WHERE status = 'processing' AND (lease_deadline IS NULL OR lease_deadline < ?) ORDER BY lease_deadline ASC LIMIT ?"
            ),
            now,
            limit,
        )
        .await
    }

    async fn find_expired_pending(&self, now: DateTime<Utc>, limit: usize) -> HubResult<Vec<Task>> {
        self.fetch_tasks(
            &format!(
                "SELECT {TASK_COLUMNS} FROM tasks WHERE status = 'pending' AND expires_at IS NOT NULL AND expires_at <= ? ORDER BY expires_at ASC LIMIT ?"
            ),
            now,
            limit,
        )
        .await
    }

    async fn find_leased_by(&self, worker_id: &str) -> HubResult<Vec<Task>> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE status = 'processing' AND leased_by = ?"
        ))
        .bind(worker_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(task_from_row).collect()
    }

    async fn events(&self, id: TaskId) -> HubResult<Vec<TaskEvent>> {
        let rows = sqlx::query(
            "SELECT id, task_id, from_status, to_status, reason, at FROM task_events WHERE task_id = ? ORDER BY seq ASC",
        )
        .bind(id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(event_from_row).collect()
    }
}
