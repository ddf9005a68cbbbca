//! SQLite存储适配器
//!
//! 所有仓储trait都由同一个 `SqliteStore` 实现；耦合写入（任务行、配额、事件）
//! 在同一事务内完成，版本号条件更新替代行锁。

mod account_repository;
mod mapping;
mod metric_repository;
mod quota_repository;
mod schedule_repository;
mod task_repository;
mod worker_repository;

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

use taskhub_errors::{HubError, HubResult};

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// 连接数据库；内存数据库只使用单个常驻连接，否则每个连接各是一个独立的库
    pub async fn connect(url: &str, max_connections: u32, run_migrations: bool) -> HubResult<Self> {
        let in_memory = url.contains(":memory:") || url.contains("mode=memory");
        let mut options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        let mut pool_options = SqlitePoolOptions::new();
        pool_options = if in_memory {
            pool_options
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            pool_options.max_connections(max_connections)
        };
        let pool = pool_options.connect_with(options).await?;

        let store = Self { pool };
        if run_migrations {
            store.migrate().await?;
        }
        info!(url, "SQLite存储已连接");
        Ok(store)
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> HubResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| HubError::internal(format!("数据库迁移失败: {e}")))?;
        Ok(())
    }

    pub async fn health_check(&self) -> HubResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
