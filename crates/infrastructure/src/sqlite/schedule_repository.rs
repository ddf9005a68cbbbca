use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

use taskhub_domain::{
    Calendar, CalendarRepository, PeriodicDefinition, PeriodicDefinitionRepository,
    PublicationRepository, PublicationStatus, ScheduledPublication,
    ScheduledPublicationRepository, TaskId,
};
use taskhub_errors::{HubError, HubResult};

use super::mapping::{from_json, map_unique_violation, millis, opt_millis, to_json};
use super::SqliteStore;

fn with_version<T>(payload: &str, version: i64, set: impl FnOnce(&mut T, i64)) -> HubResult<T>
where
    T: serde::de::DeserializeOwned,
{
    let mut value: T = from_json(payload)?;
    set(&mut value, version);
    Ok(value)
}

fn periodic_from_row(row: &sqlx::sqlite::SqliteRow) -> HubResult<PeriodicDefinition> {
    with_version(
        &row.try_get::<String, _>("payload")?,
        row.try_get("version")?,
        |d: &mut PeriodicDefinition, v| d.version = v,
    )
}

fn calendar_from_row(row: &sqlx::sqlite::SqliteRow) -> HubResult<Calendar> {
    with_version(
        &row.try_get::<String, _>("payload")?,
        row.try_get("version")?,
        |c: &mut Calendar, v| c.version = v,
    )
}

fn scheduled_from_row(row: &sqlx::sqlite::SqliteRow) -> HubResult<ScheduledPublication> {
    with_version(
        &row.try_get::<String, _>("payload")?,
        row.try_get("version")?,
        |p: &mut ScheduledPublication, v| p.version = v,
    )
}

#[async_trait]
impl PeriodicDefinitionRepository for SqliteStore {
    async fn insert(&self, definition: &PeriodicDefinition) -> HubResult<PeriodicDefinition> {
        sqlx::query(
            "INSERT INTO periodic_definitions (id, company, active, next_fire_at, created_at, version, payload) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(definition.id.to_string())
        .bind(&definition.tenant.company)
        .bind(definition.active)
        .bind(opt_millis(definition.next_fire_at))
        .bind(millis(definition.created_at))
        .bind(definition.version)
        .bind(to_json(definition)?)
        .execute(&self.pool)
        .await
        .map_err(|e| map_unique_violation(e, || format!("周期定义已存在: {}", definition.id)))?;
        Ok(definition.clone())
    }

    async fn get(&self, id: Uuid) -> HubResult<Option<PeriodicDefinition>> {
        let row = sqlx::query("SELECT payload, version FROM periodic_definitions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(periodic_from_row).transpose()
    }

    async fn list(&self, company: &str) -> HubResult<Vec<PeriodicDefinition>> {
        let rows = sqlx::query(
            "SELECT payload, version FROM periodic_definitions WHERE company = ? ORDER BY created_at ASC",
        )
        .bind(company)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(periodic_from_row).collect()
    }

    async fn find_due(&self, now: DateTime<Utc>, limit: usize) -> HubResult<Vec<PeriodicDefinition>> {
        let rows = sqlx::query(
            "SELECT payload, version FROM periodic_definitions WHERE active = 1 AND next_fire_at IS NOT NULL AND next_fire_at <= ? ORDER BY next_fire_at ASC LIMIT ?",
        )
        .bind(millis(now))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(periodic_from_row).collect()
    }

    async fn update(
        &self,
        definition: &PeriodicDefinition,
        expected_version: i64,
    ) -> HubResult<PeriodicDefinition> {
        let mut stored = definition.clone();
        stored.version = expected_version + 1;
        let result = sqlx::query(
            "UPDATE periodic_definitions SET active = ?, next_fire_at = ?, version = ?, payload = ? WHERE id = ? AND version = ?",
        )
        .bind(stored.active)
        .bind(opt_millis(stored.next_fire_at))
        .bind(stored.version)
        .bind(to_json(&stored)?)
        .bind(stored.id.to_string())
        .bind(expected_version)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(match PeriodicDefinitionRepository::get(self, definition.id).await? {
                Some(current) => HubError::conflict(format!(
                    "周期定义 {} 版本冲突: 期望 {expected_version}, 实际 {}",
                    definition.id, current.version
                )),
                None => HubError::not_found("周期定义", definition.id.to_string()),
            });
        }
        Ok(stored)
    }
}

#[async_trait]
impl CalendarRepository for SqliteStore {
    async fn insert(&self, calendar: &Calendar) -> HubResult<Calendar> {
        sqlx::query(
            "INSERT INTO calendars (id, company, next_fire_at, version, payload) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(calendar.id.to_string())
        .bind(&calendar.tenant.company)
        .bind(opt_millis(calendar.next_fire_at()))
        .bind(calendar.version)
        .bind(to_json(calendar)?)
        .execute(&self.pool)
        .await
        .map_err(|e| map_unique_violation(e, || format!("日历已存在: {}", calendar.id)))?;
        Ok(calendar.clone())
    }

    async fn get(&self, id: Uuid) -> HubResult<Option<Calendar>> {
        let row = sqlx::query("SELECT payload, version FROM calendars WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(calendar_from_row).transpose()
    }

    async fn find_due(&self, now: DateTime<Utc>, limit: usize) -> HubResult<Vec<Calendar>> {
        let rows = sqlx::query(
            "SELECT payload, version FROM calendars WHERE next_fire_at IS NOT NULL AND next_fire_at <= ? ORDER BY next_fire_at ASC LIMIT ?",
        )
        .bind(millis(now))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(calendar_from_row).collect()
    }

    async fn update(&self, calendar: &Calendar, expected_version: i64) -> HubResult<Calendar> {
        let mut stored = calendar.clone();
        stored.version = expected_version + 1;
        let result = sqlx::query(
            "UPDATE calendars SET next_fire_at = ?, version = ?, payload = ? WHERE id = ? AND version = ?",
        )
        .bind(opt_millis(stored.next_fire_at()))
        .bind(stored.version)
        .bind(to_json(&stored)?)
        .bind(stored.id.to_string())
        .bind(expected_version)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(match CalendarRepository::get(self, calendar.id).await? {
                Some(current) => HubError::conflict(format!(
                    "日历 {} 版本冲突: 期望 {expected_version}, 实际 {}",
                    calendar.id, current.version
                )),
                None => HubError::not_found("日历", calendar.id.to_string()),
            });
        }
        Ok(stored)
    }
}

#[async_trait]
impl PublicationRepository for SqliteStore {
    async fn get_status(&self, content_id: &str) -> HubResult<Option<PublicationStatus>> {
        let row = sqlx::query("SELECT payload, version FROM publication_status WHERE content_id = ?")
            .bind(content_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(with_version(
                &row.try_get::<String, _>("payload")?,
                row.try_get("version")?,
                |s: &mut PublicationStatus, v| s.version = v,
            )?)),
            None => Ok(None),
        }
    }

    async fn save_status(
        &self,
        status: &PublicationStatus,
        expected_version: Option<i64>,
    ) -> HubResult<PublicationStatus> {
        let mut stored = status.clone();
        stored.version = expected_version.map(|v| v + 1).unwrap_or(0);
        let payload = to_json(&stored)?;

        let mut tx = self.pool.begin().await?;
        match expected_version {
            None => {
                sqlx::query(
                    "INSERT INTO publication_status (content_id, company, state, version, payload) VALUES (?, ?, ?, ?, ?)",
                )
                .bind(&stored.content_id)
                .bind(&stored.tenant.company)
                .bind(stored.state.as_str())
                .bind(stored.version)
                .bind(&payload)
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    map_unique_violation(e, || format!("发布状态已存在: {}", status.content_id))
                })?;
            }
            Some(expected) => {
                let result = sqlx::query(
                    "UPDATE publication_status SET state = ?, version = ?, payload = ? WHERE content_id = ? AND version = ?",
                )
                .bind(stored.state.as_str())
                .bind(stored.version)
                .bind(&payload)
                .bind(&stored.content_id)
                .bind(expected)
                .execute(&mut *tx)
                .await?;
                if result.rows_affected() == 0 {
                    return Err(HubError::conflict(format!(
                        "发布状态 {} 版本冲突: 期望 {expected}",
                        status.content_id
                    )));
                }
            }
        }

        sqlx::query(
            r#"
            INSERT INTO content_visibility (content_id, published) VALUES (?, ?)
            ON CONFLICT(content_id) DO UPDATE SET published = excluded.published
            "#,
        )
        .bind(&stored.content_id)
        .bind(stored.content_published)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(stored)
    }

    async fn content_visible(&self, content_id: &str) -> HubResult<bool> {
        let published: Option<bool> =
            sqlx::query_scalar("SELECT published FROM content_visibility WHERE content_id = ?")
                .bind(content_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(published.unwrap_or(false))
    }
}

#[async_trait]
impl ScheduledPublicationRepository for SqliteStore {
    async fn insert(&self, publication: &ScheduledPublication) -> HubResult<ScheduledPublication> {
        sqlx::query(
            "INSERT INTO scheduled_publications (id, content_id, task_id, execution_status, scheduled_for, created_at, version, payload) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(publication.id.to_string())
        .bind(&publication.content_id)
        .bind(publication.task_id.map(|t| t.to_string()))
        .bind(publication.execution_status.as_str())
        .bind(millis(publication.scheduled_for))
        .bind(millis(publication.created_at))
        .bind(publication.version)
        .bind(to_json(publication)?)
        .execute(&self.pool)
        .await
        .map_err(|e| map_unique_violation(e, || format!("定时发布已存在: {}", publication.id)))?;
        Ok(publication.clone())
    }

    async fn get(&self, id: Uuid) -> HubResult<Option<ScheduledPublication>> {
        let row = sqlx::query("SELECT payload, version FROM scheduled_publications WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(scheduled_from_row).transpose()
    }

    async fn find_due(&self, now: DateTime<Utc>, limit: usize) -> HubResult<Vec<ScheduledPublication>> {
        let rows = sqlx::query(
            "SELECT payload, version FROM scheduled_publications WHERE execution_status = 'pending' AND task_id IS NULL AND scheduled_for <= ? ORDER BY scheduled_for ASC LIMIT ?",
        )
        .bind(millis(now))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(scheduled_from_row).collect()
    }

    async fn find_by_task(&self, task_id: TaskId) -> HubResult<Option<ScheduledPublication>> {
        let row = sqlx::query("SELECT payload, version FROM scheduled_publications WHERE task_id = ?")
            .bind(task_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(scheduled_from_row).transpose()
    }

    async fn find_by_content(&self, content_id: &str) -> HubResult<Vec<ScheduledPublication>> {
        let rows = sqlx::query(
            "SELECT payload, version FROM scheduled_publications WHERE content_id = ? ORDER BY created_at ASC",
        )
        .bind(content_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(scheduled_from_row).collect()
    }

    async fn update(
        &self,
        publication: &ScheduledPublication,
        expected_version: i64,
    ) -> HubResult<ScheduledPublication> {
        let mut stored = publication.clone();
        stored.version = expected_version + 1;
        let result = sqlx::query(
            "UPDATE scheduled_publications SET task_id = ?, execution_status = ?, scheduled_for = ?, version = ?, payload = ? WHERE id = ? AND version = ?",
        )
        .bind(stored.task_id.map(|t| t.to_string()))
        .bind(stored.execution_status.as_str())
        .bind(millis(stored.scheduled_for))
        .bind(stored.version)
        .bind(to_json(&stored)?)
        .bind(stored.id.to_string())
        .bind(expected_version)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(match ScheduledPublicationRepository::get(self, publication.id).await? {
                Some(current) => HubError::conflict(format!(
                    "定时发布 {} 版本冲突: 期望 {expected_version}, 实际 {}",
                    publication.id, current.version
                )),
                None => HubError::not_found("定时发布", publication.id.to_string()),
            });
        }
        Ok(stored)
    }
}
