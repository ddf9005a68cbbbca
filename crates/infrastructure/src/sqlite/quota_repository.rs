use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use tracing::debug;

use taskhub_domain::{merge_deltas, Quota, QuotaDelta, QuotaPeriod, QuotaRepository, QuotaResource};
use taskhub_errors::{HubError, HubResult};

use super::mapping::{from_millis, millis, opt_from_millis, opt_millis, parse_enum};
use super::SqliteStore;

const QUOTA_COLUMNS: &str = "company, resource, limit_value, used, period, period_start, period_end, hard_cap, updated_at, version";
const MAX_CAS_ATTEMPTS: usize = 5;

pub(super) fn quota_from_row(row: &SqliteRow) -> HubResult<Quota> {
    Ok(Quota {
        company: row.try_get("company")?,
        resource: parse_enum(
            &row.try_get::<String, _>("resource")?,
            QuotaResource::parse,
            "配额资源",
        )?,
        limit: row.try_get("limit_value")?,
        used: row.try_get("used")?,
        period: parse_enum(&row.try_get::<String, _>("period")?, QuotaPeriod::parse, "配额周期")?,
        period_start: from_millis(row.try_get("period_start")?)?,
        period_end: opt_from_millis(row.try_get("period_end")?)?,
        hard_cap: row.try_get("hard_cap")?,
        updated_at: from_millis(row.try_get("updated_at")?)?,
        version: row.try_get("version")?,
    })
}

async fn fetch_quota(
    conn: &mut SqliteConnection,
    company: &str,
    resource: QuotaResource,
) -> HubResult<Option<Quota>> {
    let row = sqlx::query(&format!(
        "SELECT {QUOTA_COLUMNS} FROM quotas WHERE company = ? AND resource = ?"
    ))
    .bind(company)
    .bind(resource.as_str())
    .fetch_optional(&mut *conn)
    .await?;
    row.as_ref().map(quota_from_row).transpose()
}

/// 以版本号为条件写回，返回是否命中
async fn write_quota(conn: &mut SqliteConnection, quota: &Quota, expected_version: i64) -> HubResult<bool> {
    let result = sqlx::query(
        r#"
        UPDATE quotas
        SET used = ?, period_start = ?, period_end = ?, updated_at = ?, version = ?
        WHERE company = ? AND resource = ? AND version = ?
        "#,
    )
    .bind(quota.used)
    .bind(millis(quota.period_start))
    .bind(opt_millis(quota.period_end))
    .bind(millis(quota.updated_at))
    .bind(quota.version)
    .bind(&quota.company)
    .bind(quota.resource.as_str())
    .bind(expected_version)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// 在调用方事务内应用配额变化量；任一资源超额即返回错误，由事务回滚撤销已写部分
pub(super) async fn apply_deltas(
    conn: &mut SqliteConnection,
    company: &str,
    deltas: &[QuotaDelta],
    now: DateTime<Utc>,
) -> HubResult<()> {
    for delta in merge_deltas(deltas) {
        let Some(mut quota) = fetch_quota(conn, company, delta.resource).await? else {
            continue;
        };
        let expected = quota.version;
        quota.apply(delta.amount, now)?;
        quota.version = expected + 1;
        if !write_quota(conn, &quota, expected).await? {
            return Err(HubError::conflict(format!(
                "配额 {company}/{} 并发修改",
                delta.resource
            )));
        }
    }
    Ok(())
}

#[async_trait]
impl QuotaRepository for SqliteStore {
    async fn get(&self, company: &str, resource: QuotaResource) -> HubResult<Option<Quota>> {
        let mut conn = self.pool.acquire().await?;
        fetch_quota(&mut *conn, company, resource).await
    }

    async fn list(&self, company: &str) -> HubResult<Vec<Quota>> {
        let rows = sqlx::query(&format!(
            "SELECT {QUOTA_COLUMNS} FROM quotas WHERE company = ? ORDER BY resource"
        ))
        .bind(company)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(quota_from_row).collect()
    }

    async fn upsert(&self, quota: &Quota) -> HubResult<Quota> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO quotas ({QUOTA_COLUMNS})
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0)
            ON CONFLICT(company, resource) DO UPDATE SET
                limit_value = excluded.limit_value,
                used = excluded.used,
                period = excluded.period,
                period_start = excluded.period_start,
                period_end = excluded.period_end,
                hard_cap = excluded.hard_cap,
                updated_at = excluded.updated_at,
                version = quotas.version + 1
            RETURNING {QUOTA_COLUMNS}
            "#
        ))
        .bind(&quota.company)
        .bind(quota.resource.as_str())
        .bind(quota.limit)
        .bind(quota.used)
        .bind(quota.period.as_str())
        .bind(millis(quota.period_start))
        .bind(opt_millis(quota.period_end))
        .bind(quota.hard_cap)
        .bind(millis(quota.updated_at))
        .fetch_one(&self.pool)
        .await?;
        quota_from_row(&row)
    }

    async fn consume(
        &self,
        company: &str,
        delta: QuotaDelta,
        now: DateTime<Utc>,
    ) -> HubResult<Option<Quota>> {
        let mut conn = self.pool.acquire().await?;
        for _ in 0..MAX_CAS_ATTEMPTS {
            let Some(mut quota) = fetch_quota(&mut *conn, company, delta.resource).await? else {
                return Ok(None);
            };
            let expected = quota.version;
            let rolled = quota.rollover(now);
            quota.apply(delta.amount, now)?;
            if !rolled && delta.amount == 0.0 {
                return Ok(Some(quota));
            }
            quota.version = expected + 1;
            if write_quota(&mut *conn, &quota, expected).await? {
                return Ok(Some(quota));
            }
            debug!(company, resource = %delta.resource, "配额版本冲突，重试");
        }
        Err(HubError::conflict(format!(
            "配额 {company}/{} 并发修改过于频繁",
            delta.resource
        )))
    }
}
