use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::Row;

use taskhub_domain::{
    LeaderLock, WorkerHeartbeat, WorkerRegistration, WorkerRepository, WorkerStatus,
};
use taskhub_errors::{HubError, HubResult};

use super::mapping::{from_json, millis, to_json};
use super::SqliteStore;

impl SqliteStore {
    async fn save_worker(&self, worker: &WorkerRegistration) -> HubResult<()> {
        sqlx::query(
            r#"
            INSERT INTO workers (worker_id, status, heartbeat_at, payload)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(worker_id) DO UPDATE SET
                status = excluded.status,
                heartbeat_at = excluded.heartbeat_at,
                payload = excluded.payload
            "#,
        )
        .bind(&worker.worker_id)
        .bind(worker.status.as_str())
        .bind(millis(worker.heartbeat_at))
        .bind(to_json(worker)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn require_worker(&self, worker_id: &str) -> HubResult<WorkerRegistration> {
        WorkerRepository::get(self, worker_id)
            .await?
            .ok_or_else(|| HubError::not_found("Worker", worker_id))
    }
}

#[async_trait]
impl WorkerRepository for SqliteStore {
    async fn register(&self, worker: &WorkerRegistration) -> HubResult<WorkerRegistration> {
        self.save_worker(worker).await?;
        Ok(worker.clone())
    }

    async fn heartbeat(
        &self,
        worker_id: &str,
        heartbeat: &WorkerHeartbeat,
        now: DateTime<Utc>,
    ) -> HubResult<WorkerRegistration> {
        let mut worker = self.require_worker(worker_id).await?;
        worker.active_tasks = heartbeat.active_tasks;
        worker.cpu_percent = heartbeat.cpu_percent;
        worker.mem_percent = heartbeat.mem_percent;
        worker.heartbeat_at = now;
        worker.status = WorkerStatus::Alive;
        self.save_worker(&worker).await?;
        Ok(worker)
    }

    async fn get(&self, worker_id: &str) -> HubResult<Option<WorkerRegistration>> {
        let payload: Option<String> =
            sqlx::query_scalar("SELECT payload FROM workers WHERE worker_id = ?")
                .bind(worker_id)
                .fetch_optional(&self.pool)
                .await?;
        payload.as_deref().map(from_json).transpose()
    }

    async fn list(&self) -> HubResult<Vec<WorkerRegistration>> {
        let rows = sqlx::query("SELECT payload FROM workers ORDER BY worker_id ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| from_json(&row.try_get::<String, _>("payload")?))
            .collect()
    }

    async fn set_status(&self, worker_id: &str, status: WorkerStatus) -> HubResult<()> {
        let mut worker = self.require_worker(worker_id).await?;
        worker.status = status;
        self.save_worker(&worker).await
    }
}

#[async_trait]
impl LeaderLock for SqliteStore {
    async fn try_acquire(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> HubResult<bool> {
        // 锁不存在、已过期或已由自己持有时写入
        let result = sqlx::query(
            r#"
            INSERT INTO leader_locks (name, holder, expires_at) VALUES (?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
                holder = excluded.holder,
                expires_at = excluded.expires_at
            WHERE leader_locks.holder = excluded.holder OR leader_locks.expires_at <= ?
            "#,
        )
        .bind(name)
        .bind(holder)
        .bind(millis(now + ttl))
        .bind(millis(now))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn release(&self, name: &str, holder: &str) -> HubResult<()> {
        sqlx::query("DELETE FROM leader_locks WHERE name = ? AND holder = ?")
            .bind(name)
            .bind(holder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
