//! 领域仓储抽象
//!
//! 定义数据访问的抽象接口，内存与SQLite两种适配器都实现这些trait

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use taskhub_errors::HubResult;

use crate::events::TaskEvent;
use crate::models::*;
use crate::value_objects::TaskId;

/// 任务仓储抽象
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// 插入新任务，同一事务内预占配额并追加创建事件
    async fn insert(&self, task: &Task, reservations: &[QuotaDelta]) -> HubResult<Task>;
    async fn get(&self, id: TaskId) -> HubResult<Option<Task>>;
    async fn find_by_idempotency_key(&self, company: &str, key: &str) -> HubResult<Option<Task>>;
    /// 按 `created_at` 升序返回
    async fn list(&self, filter: &TaskFilter) -> HubResult<Vec<Task>>;
    /// 以 `expected_version` 为条件写入任务行，配额变化量和事件在同一事务内提交。
    /// 版本不匹配时返回 `Conflict`。
    async fn commit(
        &self,
        task: &Task,
        expected_version: i64,
        quota_deltas: &[QuotaDelta],
        event: Option<&TaskEvent>,
    ) -> HubResult<Task>;
    async fn find_expired_leases(&self, now: DateTime<Utc>, limit: usize) -> HubResult<Vec<Task>>;
    async fn find_expired_pending(&self, now: DateTime<Utc>, limit: usize) -> HubResult<Vec<Task>>;
    async fn find_leased_by(&self, worker_id: &str) -> HubResult<Vec<Task>>;
    async fn events(&self, id: TaskId) -> HubResult<Vec<TaskEvent>>;
}

/// 配额仓储抽象
#[async_trait]
pub trait QuotaRepository: Send + Sync {
    async fn get(&self, company: &str, resource: QuotaResource) -> HubResult<Option<Quota>>;
    async fn list(&self, company: &str) -> HubResult<Vec<Quota>>;
    async fn upsert(&self, quota: &Quota) -> HubResult<Quota>;
    /// 原子的比较并更新；配额行不存在时返回 `None`（不限量）
    async fn consume(
        &self,
        company: &str,
        delta: QuotaDelta,
        now: DateTime<Utc>,
    ) -> HubResult<Option<Quota>>;
}

#[async_trait]
pub trait CredentialRepository: Send + Sync {
    async fn get(&self, company: &str, provider: &str) -> HubResult<Option<Credential>>;
    async fn upsert(&self, credential: &Credential) -> HubResult<()>;
}

#[async_trait]
pub trait SubscriptionRepository: Send + Sync {
    async fn get(&self, company: &str) -> HubResult<Option<Subscription>>;
    async fn upsert(&self, subscription: &Subscription) -> HubResult<()>;
}

#[async_trait]
pub trait MetricRepository: Send + Sync {
    /// 每个任务最多一行，重复写入返回 `Conflict`
    async fn insert(&self, metric: &TaskMetric) -> HubResult<()>;
    async fn get_for_task(&self, task_id: TaskId) -> HubResult<Option<TaskMetric>>;
    async fn list(
        &self,
        company: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> HubResult<Vec<TaskMetric>>;
}

#[async_trait]
pub trait AlertRuleRepository: Send + Sync {
    async fn upsert(&self, rule: &AlertRule) -> HubResult<()>;
    async fn get(&self, id: Uuid) -> HubResult<Option<AlertRule>>;
    async fn list_active(&self, company: &str) -> HubResult<Vec<AlertRule>>;
    /// `last_fired_at` 仍等于 `previous` 时才写入，返回是否成功
    async fn record_firing(
        &self,
        id: Uuid,
        previous: Option<DateTime<Utc>>,
        fired_at: DateTime<Utc>,
    ) -> HubResult<bool>;
}

#[async_trait]
pub trait PeriodicDefinitionRepository: Send + Sync {
    async fn insert(&self, definition: &PeriodicDefinition) -> HubResult<PeriodicDefinition>;
    async fn get(&self, id: Uuid) -> HubResult<Option<PeriodicDefinition>>;
    async fn list(&self, company: &str) -> HubResult<Vec<PeriodicDefinition>>;
    /// 到期且可触发的定义，按 `next_fire_at` 升序
    async fn find_due(&self, now: DateTime<Utc>, limit: usize) -> HubResult<Vec<PeriodicDefinition>>;
    async fn update(
        &self,
        definition: &PeriodicDefinition,
        expected_version: i64,
    ) -> HubResult<PeriodicDefinition>;
}

#[async_trait]
pub trait CalendarRepository: Send + Sync {
    async fn insert(&self, calendar: &Calendar) -> HubResult<Calendar>;
    async fn get(&self, id: Uuid) -> HubResult<Option<Calendar>>;
    /// 有覆盖引用到期的日历，按最早的 `next_fire_at` 升序
    async fn find_due(&self, now: DateTime<Utc>, limit: usize) -> HubResult<Vec<Calendar>>;
    /// 版本不匹配时返回 `Conflict`
    async fn update(&self, calendar: &Calendar, expected_version: i64) -> HubResult<Calendar>;
}

#[async_trait]
pub trait PublicationRepository: Send + Sync {
    async fn get_status(&self, content_id: &str) -> HubResult<Option<PublicationStatus>>;
    /// 写入工作流行并同步内容可见性；`expected_version` 为 `None` 时表示新建
    async fn save_status(
        &self,
        status: &PublicationStatus,
        expected_version: Option<i64>,
    ) -> HubResult<PublicationStatus>;
    async fn content_visible(&self, content_id: &str) -> HubResult<bool>;
}

#[async_trait]
pub trait ScheduledPublicationRepository: Send + Sync {
    async fn insert(&self, publication: &ScheduledPublication) -> HubResult<ScheduledPublication>;
    async fn get(&self, id: Uuid) -> HubResult<Option<ScheduledPublication>>;
    async fn find_due(&self, now: DateTime<Utc>, limit: usize) -> HubResult<Vec<ScheduledPublication>>;
    async fn find_by_task(&self, task_id: TaskId) -> HubResult<Option<ScheduledPublication>>;
    async fn find_by_content(&self, content_id: &str) -> HubResult<Vec<ScheduledPublication>>;
    async fn update(
        &self,
        publication: &ScheduledPublication,
        expected_version: i64,
    ) -> HubResult<ScheduledPublication>;
}

/// Worker仓储抽象
#[async_trait]
pub trait WorkerRepository: Send + Sync {
    async fn register(&self, worker: &WorkerRegistration) -> HubResult<WorkerRegistration>;
    async fn heartbeat(
        &self,
        worker_id: &str,
        heartbeat: &WorkerHeartbeat,
        now: DateTime<Utc>,
    ) -> HubResult<WorkerRegistration>;
    async fn get(&self, worker_id: &str) -> HubResult<Option<WorkerRegistration>>;
    async fn list(&self) -> HubResult<Vec<WorkerRegistration>>;
    async fn set_status(&self, worker_id: &str, status: WorkerStatus) -> HubResult<()>;
}

/// 存储级咨询锁，用于调度器选主
#[async_trait]
pub trait LeaderLock: Send + Sync {
    async fn try_acquire(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> HubResult<bool>;
    async fn release(&self, name: &str, holder: &str) -> HubResult<()>;
}

/// 一个存储适配器提供的全部仓储
#[derive(Clone)]
pub struct Repositories {
    pub tasks: Arc<dyn TaskRepository>,
    pub quotas: Arc<dyn QuotaRepository>,
    pub credentials: Arc<dyn CredentialRepository>,
    pub subscriptions: Arc<dyn SubscriptionRepository>,
    pub metrics: Arc<dyn MetricRepository>,
    pub alert_rules: Arc<dyn AlertRuleRepository>,
    pub periodic: Arc<dyn PeriodicDefinitionRepository>,
    pub calendars: Arc<dyn CalendarRepository>,
    pub publications: Arc<dyn PublicationRepository>,
    pub scheduled_publications: Arc<dyn ScheduledPublicationRepository>,
    pub workers: Arc<dyn WorkerRepository>,
    pub leader_lock: Arc<dyn LeaderLock>,
}

impl Repositories {
    /// 由同时实现所有仓储trait的存储构造
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: TaskRepository
            + QuotaRepository
            + CredentialRepository
            + SubscriptionRepository
            + MetricRepository
            + AlertRuleRepository
            + PeriodicDefinitionRepository
            + CalendarRepository
            + PublicationRepository
            + ScheduledPublicationRepository
            + WorkerRepository
            + LeaderLock
            + 'static,
    {
        Self {
            tasks: store.clone(),
            quotas: store.clone(),
            credentials: store.clone(),
            subscriptions: store.clone(),
            metrics: store.clone(),
            alert_rules: store.clone(),
            periodic: store.clone(),
            calendars: store.clone(),
            publications: store.clone(),
            scheduled_publications: store.clone(),
            workers: store.clone(),
            leader_lock: store,
        }
    }
}
