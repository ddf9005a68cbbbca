use std::sync::Arc;

use taskhub_domain::{Clock, Quota, QuotaDelta, QuotaPeriod, QuotaRepository, QuotaResource};
use taskhub_errors::{HubError, HubResult};
use tracing::{debug, info};

/// 配额服务：消费、查询与限额管理
///
/// 配额行不存在表示该资源不限量。
pub struct QuotaService {
    quotas: Arc<dyn QuotaRepository>,
    clock: Arc<dyn Clock>,
}

impl QuotaService {
    pub fn new(quotas: Arc<dyn QuotaRepository>, clock: Arc<dyn Clock>) -> Self {
        Self { quotas, clock }
    }

    /// 原子消费；零变化量不做任何写入
    pub async fn consume(
        &self,
        company: &str,
        resource: QuotaResource,
        amount: f64,
    ) -> HubResult<Option<Quota>> {
        if amount == 0.0 {
            return self.usage(company, resource).await;
        }
        let quota = self
            .quotas
            .consume(company, QuotaDelta::new(resource, amount), self.clock.now())
            .await?;
        if let Some(q) = &quota {
            debug!(tenant.company = company, resource = %resource, amount, used = q.used, "配额已消费");
        }
        Ok(quota)
    }

    pub async fn set_limit(
        &self,
        company: &str,
        resource: QuotaResource,
        limit: f64,
        period: QuotaPeriod,
        hard_cap: bool,
    ) -> HubResult<Quota> {
        if limit < 0.0 {
            return Err(HubError::invalid_input("配额上限不能为负数"));
        }
        let now = self.clock.now();
        let quota = match self.quotas.get(company, resource).await? {
            Some(mut existing) => {
                existing.rollover(now);
                if existing.period != period {
                    existing.period = period;
                    existing.period_start = period.window_start(now);
                    existing.period_end = period.advance(existing.period_start);
                    existing.used = 0.0;
                }
                existing.limit = limit;
                existing.hard_cap = hard_cap;
                existing.updated_at = now;
                existing
            }
            None => Quota::new(company, resource, limit, period, hard_cap, now),
        };
        let saved = self.quotas.upsert(&quota).await?;
        info!(
            tenant.company = company,
            resource = %resource,
            limit,
            period = period.as_str(),
            hard_cap,
            "配额上限已设置"
        );
        Ok(saved)
    }

    /// 当前窗口下的用量视图（滚动在只读副本上计算）
    pub async fn usage(&self, company: &str, resource: QuotaResource) -> HubResult<Option<Quota>> {
        let now = self.clock.now();
        Ok(self.quotas.get(company, resource).await?.map(|mut q| {
            q.rollover(now);
            q
        }))
    }

    /// `None` 表示不限量
    pub async fn remaining(&self, company: &str, resource: QuotaResource) -> HubResult<Option<f64>> {
        Ok(self
            .usage(company, resource)
            .await?
            .map(|q| if q.hard_cap { q.remaining() } else { f64::INFINITY }))
    }

    pub async fn ensure_available(
        &self,
        company: &str,
        resource: QuotaResource,
        amount: f64,
    ) -> HubResult<()> {
        if let Some(quota) = self.usage(company, resource).await? {
            if quota.hard_cap && quota.used + amount > quota.limit {
                return Err(HubError::QuotaExceeded {
                    resource: resource.to_string(),
                    requested: amount,
                    remaining: quota.remaining(),
                });
            }
        }
        Ok(())
    }

    /// 所列硬上限资源都仍有剩余额度
    pub async fn has_headroom(&self, company: &str, resources: &[QuotaResource]) -> HubResult<bool> {
        for resource in resources {
            if let Some(quota) = self.usage(company, *resource).await? {
                if quota.hard_cap && quota.remaining() <= 0.0 {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    pub async fn list(&self, company: &str) -> HubResult<Vec<Quota>> {
        let now = self.clock.now();
        Ok(self
            .quotas
            .list(company)
            .await?
            .into_iter()
            .map(|mut q| {
                q.rollover(now);
                q
            })
            .collect())
    }
}
