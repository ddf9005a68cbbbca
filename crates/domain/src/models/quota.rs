use chrono::{DateTime, Datelike, Duration, Months, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use taskhub_errors::{HubError, HubResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaResource {
    Tokens,
    Cost,
    ConcurrentTasks,
    Users,
    Brands,
}

impl QuotaResource {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuotaResource::Tokens => "tokens",
            QuotaResource::Cost => "cost",
            QuotaResource::ConcurrentTasks => "concurrent_tasks",
            QuotaResource::Users => "users",
            QuotaResource::Brands => "brands",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "tokens" => Some(QuotaResource::Tokens),
            "cost" => Some(QuotaResource::Cost),
            "concurrent_tasks" => Some(QuotaResource::ConcurrentTasks),
            "users" => Some(QuotaResource::Users),
            "brands" => Some(QuotaResource::Brands),
            _ => None,
        }
    }
}

impl std::fmt::Display for QuotaResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 配额计数窗口
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaPeriod {
    Daily,
    Weekly,
    Monthly,
    /// 不滚动的计量（并发数、用户数等）
    None,
}

impl QuotaPeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuotaPeriod::Daily => "daily",
            QuotaPeriod::Weekly => "weekly",
            QuotaPeriod::Monthly => "monthly",
            QuotaPeriod::None => "none",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "daily" => Some(QuotaPeriod::Daily),
            "weekly" => Some(QuotaPeriod::Weekly),
            "monthly" => Some(QuotaPeriod::Monthly),
            "none" => Some(QuotaPeriod::None),
            _ => None,
        }
    }

    pub fn advance(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            QuotaPeriod::Daily => Some(from + Duration::days(1)),
            QuotaPeriod::Weekly => Some(from + Duration::weeks(1)),
            QuotaPeriod::Monthly => from.checked_add_months(Months::new(1)),
            QuotaPeriod::None => None,
        }
    }

    /// 包含 `now` 的自然窗口起点（UTC）
    pub fn window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let midnight = Utc
            .with_ymd_and_hms(now.year(), now.month(), now.day(), 0, 0, 0)
            .single()
            .unwrap_or(now);
        match self {
            QuotaPeriod::Daily => midnight,
            QuotaPeriod::Weekly => {
                midnight - Duration::days(now.weekday().num_days_from_monday() as i64)
            }
            QuotaPeriod::Monthly => Utc
                .with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
                .single()
                .unwrap_or(midnight),
            QuotaPeriod::None => now,
        }
    }
}

/// 单个资源的配额变化量
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuotaDelta {
    pub resource: QuotaResource,
    pub amount: f64,
}

impl QuotaDelta {
    pub fn new(resource: QuotaResource, amount: f64) -> Self {
        Self { resource, amount }
    }
}

/// 合并同一资源上的多个变化量，并丢弃为零的项
pub fn merge_deltas(deltas: &[QuotaDelta]) -> Vec<QuotaDelta> {
    let mut merged: Vec<QuotaDelta> = Vec::new();
    for delta in deltas {
        match merged.iter_mut().find(|d| d.resource == delta.resource) {
            Some(existing) => existing.amount += delta.amount,
            None => merged.push(*delta),
        }
    }
    merged.retain(|d| d.amount != 0.0);
    merged
}

/// `(tenant, resource)` 配额行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quota {
    pub company: String,
    pub resource: QuotaResource,
    pub limit: f64,
    pub used: f64,
    pub period: QuotaPeriod,
    pub period_start: DateTime<Utc>,
    pub period_end: Option<DateTime<Utc>>,
    pub hard_cap: bool,
    pub updated_at: DateTime<Utc>,
    pub version: i64,
}

impl Quota {
    pub fn new(
        company: impl Into<String>,
        resource: QuotaResource,
        limit: f64,
        period: QuotaPeriod,
        hard_cap: bool,
        now: DateTime<Utc>,
    ) -> Self {
        let period_start = period.window_start(now);
        Self {
            company: company.into(),
            resource,
            limit,
            used: 0.0,
            period,
            period_start,
            period_end: period.advance(period_start),
            hard_cap,
            updated_at: now,
            version: 0,
        }
    }

    pub fn remaining(&self) -> f64 {
        (self.limit - self.used).max(0.0)
    }

    /// 窗口已过期时惰性滚动，返回是否发生了滚动
    pub fn rollover(&mut self, now: DateTime<Utc>) -> bool {
        let mut rolled = false;
        while let Some(end) = self.period_end {
            if now < end {
                break;
            }
            self.period_start = end;
            self.period_end = self.period.advance(end);
            rolled = true;
        }
        if rolled {
            self.used = 0.0;
        }
        rolled
    }

    /// 应用一次变化量；硬上限下超额时返回 `QuotaExceeded` 且不修改状态
    pub fn apply(&mut self, delta: f64, now: DateTime<Utc>) -> HubResult<()> {
        self.rollover(now);
        if delta == 0.0 {
            return Ok(());
        }
        let next = self.used + delta;
        if delta > 0.0 && self.hard_cap && next > self.limit {
            return Err(HubError::QuotaExceeded {
                resource: self.resource.to_string(),
                requested: delta,
                remaining: self.remaining(),
            });
        }
        self.used = next.max(0.0);
        self.updated_at = now;
        Ok(())
    }
}
