use async_trait::async_trait;
use sqlx::Row;

use taskhub_domain::{Credential, CredentialRepository, Subscription, SubscriptionRepository};
use taskhub_errors::HubResult;

use super::mapping::{from_millis, millis, opt_from_millis, opt_millis};
use super::SqliteStore;

#[async_trait]
impl CredentialRepository for SqliteStore {
    async fn get(&self, company: &str, provider: &str) -> HubResult<Option<Credential>> {
        let row = sqlx::query(
            "SELECT company, provider, ciphertext, created_at, rotated_at FROM credentials WHERE company = ? AND provider = ?",
        )
        .bind(company)
        .bind(provider)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(Credential {
                company: row.try_get("company")?,
                provider: row.try_get("provider")?,
                ciphertext: row.try_get("ciphertext")?,
                created_at: from_millis(row.try_get("created_at")?)?,
                rotated_at: from_millis(row.try_get("rotated_at")?)?,
            })),
            None => Ok(None),
        }
    }

    async fn upsert(&self, credential: &Credential) -> HubResult<()> {
        sqlx::query(
            r#"
            INSERT INTO credentials (company, provider, ciphertext, created_at, rotated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(company, provider) DO UPDATE SET
                ciphertext = excluded.ciphertext,
                rotated_at = excluded.rotated_at
            "#,
        )
        .bind(&credential.company)
        .bind(&credential.provider)
        .bind(&credential.ciphertext)
        .bind(millis(credential.created_at))
        .bind(millis(credential.rotated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl SubscriptionRepository for SqliteStore {
    async fn get(&self, company: &str) -> HubResult<Option<Subscription>> {
        let row = sqlx::query("SELECT company, plan, active, expires_at FROM subscriptions WHERE company = ?")
            .bind(company)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(Subscription {
                company: row.try_get("company")?,
                plan: row.try_get("plan")?,
                active: row.try_get("active")?,
                expires_at: opt_from_millis(row.try_get("expires_at")?)?,
            })),
            None => Ok(None),
        }
    }

    async fn upsert(&self, subscription: &Subscription) -> HubResult<()> {
        sqlx::query(
            r#"
            INSERT INTO subscriptions (company, plan, active, expires_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(company) DO UPDATE SET
                plan = excluded.plan,
                active = excluded.active,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(&subscription.company)
        .bind(&subscription.plan)
        .bind(subscription.active)
        .bind(opt_millis(subscription.expires_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
