use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use taskhub_domain::{
    AlertRule, AlertRuleRepository, Calendar, CalendarRepository, Credential,
    CredentialRepository, LeaderLock, MetricRepository, PeriodicDefinition,
    PeriodicDefinitionRepository, PublicationRepository, PublicationStatus, Quota, QuotaDelta,
    QuotaRepository, QuotaResource, ScheduledPublication, ScheduledPublicationRepository,
    Subscription, SubscriptionRepository, Task, TaskEvent, TaskFilter, TaskId, TaskMetric,
    TaskRepository, TaskStatus, WorkerHeartbeat, WorkerRegistration, WorkerRepository,
    WorkerStatus,
};
use taskhub_errors::{HubError, HubResult};

#[derive(Default)]
struct State {
    tasks: HashMap<TaskId, Task>,
    idempotency: HashMap<(String, String), TaskId>,
    events: HashMap<TaskId, Vec<TaskEvent>>,
    quotas: HashMap<(String, QuotaResource), Quota>,
    credentials: HashMap<(String, String), Credential>,
    subscriptions: HashMap<String, Subscription>,
    metrics: Vec<TaskMetric>,
    alert_rules: HashMap<Uuid, AlertRule>,
    periodic: HashMap<Uuid, PeriodicDefinition>,
    calendars: HashMap<Uuid, Calendar>,
    publications: HashMap<String, PublicationStatus>,
    content_visibility: HashMap<String, bool>,
    scheduled_publications: HashMap<Uuid, ScheduledPublication>,
    workers: HashMap<String, WorkerRegistration>,
    locks: HashMap<String, (String, DateTime<Utc>)>,
}

impl State {
    /// 先在副本上应用全部变化量，任一失败则整体不生效
    fn apply_quota_deltas(
        &mut self,
        company: &str,
        deltas: &[QuotaDelta],
        now: DateTime<Utc>,
    ) -> HubResult<()> {
        let mut staged = Vec::with_capacity(deltas.len());
        for delta in taskhub_domain::merge_deltas(deltas) {
            let key = (company.to_string(), delta.resource);
            if let Some(mut quota) = self.quotas.get(&key).cloned() {
                quota.apply(delta.amount, now)?;
                quota.version += 1;
                staged.push((key, quota));
            }
        }
        for (key, quota) in staged {
            self.quotas.insert(key, quota);
        }
        Ok(())
    }
}

/// 进程内存储，实现全部仓储trait
///
/// 单把读写锁保护整个状态，`commit` 中的任务行、配额和事件因此天然原子。
/// 适用于嵌入式部署和测试。
#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn version_conflict(entity: &str, id: impl std::fmt::Display, expected: i64, actual: i64) -> HubError {
    HubError::conflict(format!(
        "{entity} {id} 版本冲突: 期望 {expected}, 实际 {actual}"
    ))
}

#[async_trait]
impl TaskRepository for InMemoryStore {
    async fn insert(&self, task: &Task, reservations: &[QuotaDelta]) -> HubResult<Task> {
        let mut state = self.state.write().await;
        if state.tasks.contains_key(&task.id) {
            return Err(HubError::conflict(format!("任务已存在: {}", task.id)));
        }
        let idempotency_key = task
            .idempotency_key
            .as_ref()
            .map(|key| (task.tenant.company.clone(), key.clone()));
        if let Some(key) = &idempotency_key {
            if state.idempotency.contains_key(key) {
                return Err(HubError::conflict(format!("幂等键已被使用: {}", key.1)));
            }
        }

        state.apply_quota_deltas(&task.tenant.company, reservations, task.created_at)?;

        if let Some(key) = idempotency_key {
            state.idempotency.insert(key, task.id);
        }
        state
            .events
            .entry(task.id)
            .or_default()
            .push(TaskEvent::created(task.id, task.created_at));
        state.tasks.insert(task.id, task.clone());
        debug!(task.id = %task.id, "任务已写入内存存储");
        Ok(task.clone())
    }

    async fn get(&self, id: TaskId) -> HubResult<Option<Task>> {
        Ok(self.state.read().await.tasks.get(&id).cloned())
    }

    async fn find_by_idempotency_key(&self, company: &str, key: &str) -> HubResult<Option<Task>> {
        let state = self.state.read().await;
        Ok(state
            .idempotency
            .get(&(company.to_string(), key.to_string()))
            .and_then(|id| state.tasks.get(id))
            .cloned())
    }

    async fn list(&self, filter: &TaskFilter) -> HubResult<Vec<Task>> {
        let state = self.state.read().await;
        let mut tasks: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        let offset = filter.offset.unwrap_or(0);
        let limit = filter.limit.unwrap_or(usize::MAX);
        Ok(tasks.into_iter().skip(offset).take(limit).collect())
    }

    async fn commit(
        &self,
        task: &Task,
        expected_version: i64,
        quota_deltas: &[QuotaDelta],
        event: Option<&TaskEvent>,
    ) -> HubResult<Task> {
        let mut state = self.state.write().await;
        let current_version = state
            .tasks
            .get(&task.id)
            .map(|t| t.version)
            .ok_or_else(|| HubError::not_found("任务", task.id.to_string()))?;
        if current_version != expected_version {
            return Err(version_conflict("任务", task.id, expected_version, current_version));
        }

        state.apply_quota_deltas(&task.tenant.company, quota_deltas, task.updated_at)?;

        let mut stored = task.clone();
        stored.version = expected_version + 1;
        if let Some(event) = event {
            state.events.entry(task.id).or_default().push(event.clone());
        }
        state.tasks.insert(task.id, stored.clone());
        Ok(stored)
    }

    async fn find_expired_leases(&self, now: DateTime<Utc>, limit: usize) -> HubResult<Vec<Task>> {
        let state = self.state.read().await;
        let mut expired: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| t.lease_expired(now))
            .cloned()
            .collect();
        expired.sort_by_key(|t| t.lease_deadline);
        expired.truncate(limit);
        Ok(expired)
    }

    async fn find_expired_pending(&self, now: DateTime<Utc>, limit: usize) -> HubResult<Vec<Task>> {
        let state = self.state.read().await;
        let mut expired: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| {
                t.status == TaskStatus::Pending && t.expires_at.map(|e| e <= now).unwrap_or(false)
            })
            .cloned()
            .collect();
        expired.sort_by_key(|t| t.expires_at);
        expired.truncate(limit);
        Ok(expired)
    }

    async fn find_leased_by(&self, worker_id: &str) -> HubResult<Vec<Task>> {
        let state = self.state.read().await;
        Ok(state
            .tasks
            .values()
            .filter(|t| {
                t.status == TaskStatus::Processing && t.leased_by.as_deref() == Some(worker_id)
            })
            .cloned()
            .collect())
    }

    async fn events(&self, id: TaskId) -> HubResult<Vec<TaskEvent>> {
        Ok(self
            .state
            .read()
            .await
            .events
            .get(&id)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl QuotaRepository for InMemoryStore {
    async fn get(&self, company: &str, resource: QuotaResource) -> HubResult<Option<Quota>> {
        let state = self.state.read().await;
        Ok(state.quotas.get(&(company.to_string(), resource)).cloned())
    }

    async fn list(&self, company: &str) -> HubResult<Vec<Quota>> {
        let state = self.state.read().await;
        let mut quotas: Vec<Quota> = state
            .quotas
            .values()
            .filter(|q| q.company == company)
            .cloned()
            .collect();
        quotas.sort_by_key(|q| q.resource);
        Ok(quotas)
    }

    async fn upsert(&self, quota: &Quota) -> HubResult<Quota> {
        let mut state = self.state.write().await;
        let key = (quota.company.clone(), quota.resource);
        let mut stored = quota.clone();
        stored.version = state.quotas.get(&key).map(|q| q.version + 1).unwrap_or(0);
        state.quotas.insert(key, stored.clone());
        Ok(stored)
    }

    async fn consume(
        &self,
        company: &str,
        delta: QuotaDelta,
        now: DateTime<Utc>,
    ) -> HubResult<Option<Quota>> {
        let mut state = self.state.write().await;
        let key = (company.to_string(), delta.resource);
        let Some(current) = state.quotas.get(&key) else {
            return Ok(None);
        };
        let mut updated = current.clone();
        let rolled = updated.rollover(now);
        updated.apply(delta.amount, now)?;
        if rolled || delta.amount != 0.0 {
            updated.version += 1;
            state.quotas.insert(key, updated.clone());
        }
        Ok(Some(updated))
    }
}

#[async_trait]
impl CredentialRepository for InMemoryStore {
    async fn get(&self, company: &str, provider: &str) -> HubResult<Option<Credential>> {
        let state = self.state.read().await;
        Ok(state
            .credentials
            .get(&(company.to_string(), provider.to_string()))
            .cloned())
    }

    async fn upsert(&self, credential: &Credential) -> HubResult<()> {
        let mut state = self.state.write().await;
        state.credentials.insert(
            (credential.company.clone(), credential.provider.clone()),
            credential.clone(),
        );
        Ok(())
    }
}

#[async_trait]
impl SubscriptionRepository for InMemoryStore {
    async fn get(&self, company: &str) -> HubResult<Option<Subscription>> {
        Ok(self.state.read().await.subscriptions.get(company).cloned())
    }

    async fn upsert(&self, subscription: &Subscription) -> HubResult<()> {
        let mut state = self.state.write().await;
        state
            .subscriptions
            .insert(subscription.company.clone(), subscription.clone());
        Ok(())
    }
}

#[async_trait]
impl MetricRepository for InMemoryStore {
    async fn insert(&self, metric: &TaskMetric) -> HubResult<()> {
        let mut state = self.state.write().await;
        if let Some(task_id) = metric.task_id {
            if state.metrics.iter().any(|m| m.task_id == Some(task_id)) {
                return Err(HubError::conflict(format!("任务 {task_id} 的指标已存在")));
            }
        }
        state.metrics.push(metric.clone());
        Ok(())
    }

    async fn get_for_task(&self, task_id: TaskId) -> HubResult<Option<TaskMetric>> {
        let state = self.state.read().await;
        Ok(state
            .metrics
            .iter()
            .find(|m| m.task_id == Some(task_id))
            .cloned())
    }

    async fn list(
        &self,
        company: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> HubResult<Vec<TaskMetric>> {
        let state = self.state.read().await;
        let mut metrics: Vec<TaskMetric> = state
            .metrics
            .iter()
            .filter(|m| {
                m.company == company
                    && m.recorded_at.map(|at| at >= from && at < to).unwrap_or(false)
            })
            .cloned()
            .collect();
        metrics.sort_by_key(|m| m.recorded_at);
        Ok(metrics)
    }
}

#[async_trait]
impl AlertRuleRepository for InMemoryStore {
    async fn upsert(&self, rule: &AlertRule) -> HubResult<()> {
        self.state
            .write()
            .await
            .alert_rules
            .insert(rule.id, rule.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> HubResult<Option<AlertRule>> {
        Ok(self.state.read().await.alert_rules.get(&id).cloned())
    }

    async fn list_active(&self, company: &str) -> HubResult<Vec<AlertRule>> {
        let state = self.state.read().await;
        let mut rules: Vec<AlertRule> = state
            .alert_rules
            .values()
            .filter(|r| r.active && r.company == company)
            .cloned()
            .collect();
        rules.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(rules)
    }

    async fn record_firing(
        &self,
        id: Uuid,
        previous: Option<DateTime<Utc>>,
        fired_at: DateTime<Utc>,
    ) -> HubResult<bool> {
        let mut state = self.state.write().await;
        let rule = state
            .alert_rules
            .get_mut(&id)
            .ok_or_else(|| HubError::not_found("告警规则", id.to_string()))?;
        if rule.last_fired_at != previous {
            return Ok(false);
        }
        rule.last_fired_at = Some(fired_at);
        Ok(true)
    }
}

#[async_trait]
impl PeriodicDefinitionRepository for InMemoryStore {
    async fn insert(&self, definition: &PeriodicDefinition) -> HubResult<PeriodicDefinition> {
        let mut state = self.state.write().await;
        if state.periodic.contains_key(&definition.id) {
            return Err(HubError::conflict(format!("周期定义已存在: {}", definition.id)));
        }
        state.periodic.insert(definition.id, definition.clone());
        Ok(definition.clone())
    }

    async fn get(&self, id: Uuid) -> HubResult<Option<PeriodicDefinition>> {
        Ok(self.state.read().await.periodic.get(&id).cloned())
    }

    async fn list(&self, company: &str) -> HubResult<Vec<PeriodicDefinition>> {
        let state = self.state.read().await;
        let mut definitions: Vec<PeriodicDefinition> = state
            .periodic
            .values()
            .filter(|d| d.tenant.company == company)
            .cloned()
            .collect();
        definitions.sort_by_key(|d| d.created_at);
        Ok(definitions)
    }

    async fn find_due(&self, now: DateTime<Utc>, limit: usize) -> HubResult<Vec<PeriodicDefinition>> {
        let state = self.state.read().await;
        let mut due: Vec<PeriodicDefinition> = state
            .periodic
            .values()
            .filter(|d| d.active && d.next_fire_at.map(|n| n <= now).unwrap_or(false))
            .cloned()
            .collect();
        due.sort_by_key(|d| d.next_fire_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn update(
        &self,
        definition: &PeriodicDefinition,
        expected_version: i64,
    ) -> HubResult<PeriodicDefinition> {
        let mut state = self.state.write().await;
        let current = state
            .periodic
            .get(&definition.id)
            .map(|d| d.version)
            .ok_or_else(|| HubError::not_found("周期定义", definition.id.to_string()))?;
        if current != expected_version {
            return Err(version_conflict("周期定义", definition.id, expected_version, current));
        }
        let mut stored = definition.clone();
        stored.version = expected_version + 1;
        state.periodic.insert(stored.id, stored.clone());
        Ok(stored)
    }
}

#[async_trait]
impl CalendarRepository for InMemoryStore {
    async fn insert(&self, calendar: &Calendar) -> HubResult<Calendar> {
        self.state
            .write()
            .await
            .calendars
            .insert(calendar.id, calendar.clone());
        Ok(calendar.clone())
    }

    async fn get(&self, id: Uuid) -> HubResult<Option<Calendar>> {
        Ok(self.state.read().await.calendars.get(&id).cloned())
    }

    async fn find_due(&self, now: DateTime<Utc>, limit: usize) -> HubResult<Vec<Calendar>> {
        let state = self.state.read().await;
        let mut due: Vec<Calendar> = state
            .calendars
            .values()
            .filter(|c| c.next_fire_at().map(|t| t <= now).unwrap_or(false))
            .cloned()
            .collect();
        due.sort_by_key(|c| c.next_fire_at());
        due.truncate(limit);
        Ok(due)
    }

    async fn update(&self, calendar: &Calendar, expected_version: i64) -> HubResult<Calendar> {
        let mut state = self.state.write().await;
        let current = state
            .calendars
            .get(&calendar.id)
            .map(|c| c.version)
            .ok_or_else(|| HubError::not_found("日历", calendar.id.to_string()))?;
        if current != expected_version {
            return Err(version_conflict("日历", calendar.id, expected_version, current));
        }
        let mut stored = calendar.clone();
        stored.version = expected_version + 1;
        state.calendars.insert(stored.id, stored.clone());
        Ok(stored)
    }
}

#[async_trait]
impl PublicationRepository for InMemoryStore {
    async fn get_status(&self, content_id: &str) -> HubResult<Option<PublicationStatus>> {
        Ok(self.state.read().await.publications.get(content_id).cloned())
    }

    async fn save_status(
        &self,
        status: &PublicationStatus,
        expected_version: Option<i64>,
    ) -> HubResult<PublicationStatus> {
        let mut state = self.state.write().await;
        let current = state.publications.get(&status.content_id).map(|s| s.version);
        let next_version = match (current, expected_version) {
            (None, None) => 0,
            (Some(actual), Some(expected)) if actual == expected => expected + 1,
            (Some(actual), Some(expected)) => {
                return Err(version_conflict("发布状态", &status.content_id, expected, actual))
            }
            (Some(_), None) => {
                return Err(HubError::conflict(format!(
                    "发布状态已存在: {}",
                    status.content_id
                )))
            }
            (None, Some(_)) => {
                return Err(HubError::not_found("发布状态", status.content_id.clone()))
            }
        };
        let mut stored = status.clone();
        stored.version = next_version;
        state
            .content_visibility
            .insert(stored.content_id.clone(), stored.content_published);
        state
            .publications
            .insert(stored.content_id.clone(), stored.clone());
        Ok(stored)
    }

    async fn content_visible(&self, content_id: &str) -> HubResult<bool> {
        let state = self.state.read().await;
        Ok(state
            .content_visibility
            .get(content_id)
            .copied()
            .unwrap_or(false))
    }
}

#[async_trait]
impl ScheduledPublicationRepository for InMemoryStore {
    async fn insert(&self, publication: &ScheduledPublication) -> HubResult<ScheduledPublication> {
        self.state
            .write()
            .await
            .scheduled_publications
            .insert(publication.id, publication.clone());
        Ok(publication.clone())
    }

    async fn get(&self, id: Uuid) -> HubResult<Option<ScheduledPublication>> {
        Ok(self
            .state
            .read()
            .await
            .scheduled_publications
            .get(&id)
            .cloned())
    }

    async fn find_due(&self, now: DateTime<Utc>, limit: usize) -> HubResult<Vec<ScheduledPublication>> {
        let state = self.state.read().await;
        let mut due: Vec<ScheduledPublication> = state
            .scheduled_publications
            .values()
            .filter(|p| p.is_due(now) && p.task_id.is_none())
            .cloned()
            .collect();
        due.sort_by_key(|p| p.scheduled_for);
        due.truncate(limit);
        Ok(due)
    }

    async fn find_by_task(&self, task_id: TaskId) -> HubResult<Option<ScheduledPublication>> {
        let state = self.state.read().await;
        Ok(state
            .scheduled_publications
            .values()
            .find(|p| p.task_id == Some(task_id))
            .cloned())
    }

    async fn find_by_content(&self, content_id: &str) -> HubResult<Vec<ScheduledPublication>> {
        let state = self.state.read().await;
        let mut found: Vec<ScheduledPublication> = state
            .scheduled_publications
            .values()
            .filter(|p| p.content_id == content_id)
            .cloned()
            .collect();
        found.sort_by_key(|p| p.created_at);
        Ok(found)
    }

    async fn update(
        &self,
        publication: &ScheduledPublication,
        expected_version: i64,
    ) -> HubResult<ScheduledPublication> {
        let mut state = self.state.write().await;
        let current = state
            .scheduled_publications
            .get(&publication.id)
            .map(|p| p.version)
            .ok_or_else(|| HubError::not_found("定时发布", publication.id.to_string()))?;
        if current != expected_version {
            return Err(version_conflict("定时发布", publication.id, expected_version, current));
        }
        let mut stored = publication.clone();
        stored.version = expected_version + 1;
        state.scheduled_publications.insert(stored.id, stored.clone());
        Ok(stored)
    }
}

#[async_trait]
impl WorkerRepository for InMemoryStore {
    async fn register(&self, worker: &WorkerRegistration) -> HubResult<WorkerRegistration> {
        self.state
            .write()
            .await
            .workers
            .insert(worker.worker_id.clone(), worker.clone());
        Ok(worker.clone())
    }

    async fn heartbeat(
        &self,
        worker_id: &str,
        heartbeat: &WorkerHeartbeat,
        now: DateTime<Utc>,
    ) -> HubResult<WorkerRegistration> {
        let mut state = self.state.write().await;
        let worker = state
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| HubError::not_found("Worker", worker_id))?;
        worker.active_tasks = heartbeat.active_tasks;
        worker.cpu_percent = heartbeat.cpu_percent;
        worker.mem_percent = heartbeat.mem_percent;
        worker.heartbeat_at = now;
        worker.status = WorkerStatus::Alive;
        Ok(worker.clone())
    }

    async fn get(&self, worker_id: &str) -> HubResult<Option<WorkerRegistration>> {
        Ok(self.state.read().await.workers.get(worker_id).cloned())
    }

    async fn list(&self) -> HubResult<Vec<WorkerRegistration>> {
        let state = self.state.read().await;
        let mut workers: Vec<WorkerRegistration> = state.workers.values().cloned().collect();
        workers.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        Ok(workers)
    }

    async fn set_status(&self, worker_id: &str, status: WorkerStatus) -> HubResult<()> {
        let mut state = self.state.write().await;
        let worker = state
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| HubError::not_found("Worker", worker_id))?;
        worker.status = status;
        Ok(())
    }
}

#[async_trait]
impl LeaderLock for InMemoryStore {
    async fn try_acquire(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> HubResult<bool> {
        let mut state = self.state.write().await;
        let available = match state.locks.get(name) {
            Some((current, expires_at)) => current == holder || *expires_at <= now,
            None => true,
        };
        if available {
            state
                .locks
                .insert(name.to_string(), (holder.to_string(), now + ttl));
        }
        Ok(available)
    }

    async fn release(&self, name: &str, holder: &str) -> HubResult<()> {
        let mut state = self.state.write().await;
        if state.locks.get(name).map(|(h, _)| h == holder).unwrap_or(false) {
            state.locks.remove(name);
        }
        Ok(())
    }
}
