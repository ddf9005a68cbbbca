//! 任务中心
//!
//! 所有任务状态迁移的唯一入口。每次迁移以版本号为条件写入任务行，
//! 配额变化量与事件在同一事务内提交，提交成功后依次调用生命周期钩子。

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use taskhub_core::{DispatcherConfig, QuotaConfig, QuotaService, RetryPolicy, TaskTypeRegistry};
use taskhub_domain::{
    event_reasons, Clock, HeartbeatAck, Lease, Principal, QueueEntry, QuotaDelta, QuotaResource,
    Repositories, Task, TaskDescriptor, TaskError, TaskEvent, TaskFilter, TaskId,
    TaskLifecycleHook, TaskPriority, TaskQueue, TaskStatus, Tenant, WARNING_CANCEL_AFTER_COMPLETE,
};
use taskhub_errors::{ErrorKind, HubError, HubResult};

/// 一次 `lease` 调用内最多检查的队列令牌数
const MAX_LEASE_CANDIDATES: usize = 32;

/// 并发修改时重新读取任务行的次数
const MAX_COMMIT_RETRIES: usize = 3;

/// 处理器成功返回后上报的结果
#[derive(Debug, Clone, Default)]
pub struct CompletionReport {
    pub result: Value,
    pub quota_usage: Vec<QuotaDelta>,
    pub warnings: Vec<String>,
}

/// 处理器失败时上报的错误与已发生的用量
#[derive(Debug, Clone)]
pub struct FailureReport {
    pub error: TaskError,
    pub quota_usage: Vec<QuotaDelta>,
    pub warnings: Vec<String>,
}

impl FailureReport {
    pub fn new(error: TaskError) -> Self {
        Self {
            error,
            quota_usage: Vec::new(),
            warnings: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimCause {
    LeaseExpired,
    WorkerLost,
}

impl ReclaimCause {
    fn reason(&self) -> &'static str {
        match self {
            ReclaimCause::LeaseExpired => event_reasons::LEASE_EXPIRED,
            ReclaimCause::WorkerLost => event_reasons::WORKER_LOST,
        }
    }
}

struct NewTask {
    task_type: String,
    tenant: Tenant,
    principal: String,
    priority: Option<TaskPriority>,
    input: Value,
    max_attempts: Option<u32>,
    scheduled_for: Option<DateTime<Utc>>,
    idempotency_key: Option<String>,
    parent_task_id: Option<TaskId>,
    periodic_definition_id: Option<Uuid>,
}

pub struct TaskHub {
    repos: Repositories,
    queue: Arc<dyn TaskQueue>,
    registry: Arc<TaskTypeRegistry>,
    quota: Arc<QuotaService>,
    retry: RetryPolicy,
    config: DispatcherConfig,
    quota_config: QuotaConfig,
    lease_extension: Duration,
    max_queue_depth: usize,
    clock: Arc<dyn Clock>,
    hooks: Vec<Arc<dyn TaskLifecycleHook>>,
}

impl TaskHub {
    pub fn new(
        repos: Repositories,
        queue: Arc<dyn TaskQueue>,
        registry: Arc<TaskTypeRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let config = DispatcherConfig::default();
        let quota = Arc::new(QuotaService::new(repos.quotas.clone(), clock.clone()));
        Self {
            repos,
            queue,
            registry,
            quota,
            retry: RetryPolicy::new(config.retry.clone()),
            lease_extension: Duration::seconds(10 * config.lease_extension_factor as i64),
            config,
            quota_config: QuotaConfig::default(),
            max_queue_depth: 10_000,
            clock,
            hooks: Vec::new(),
        }
    }

    pub fn with_dispatcher_config(mut self, config: DispatcherConfig) -> Self {
        self.retry = RetryPolicy::new(config.retry.clone());
        self.config = config;
        self
    }

    pub fn with_quota_config(mut self, config: QuotaConfig) -> Self {
        self.quota_config = config;
        self
    }

    /// 每次心跳把租约延长到 `now + interval × k`
    pub fn with_heartbeat_interval(mut self, interval: std::time::Duration) -> Self {
        let factor = self.config.lease_extension_factor.max(1) as i32;
        self.lease_extension = Duration::from_std(interval)
            .map(|h| h * factor)
            .unwrap_or(self.lease_extension);
        self
    }

    pub fn with_max_queue_depth(mut self, depth: usize) -> Self {
        self.max_queue_depth = depth;
        self
    }

    pub fn with_hook(mut self, hook: Arc<dyn TaskLifecycleHook>) -> Self {
        debug!(hook = hook.name(), "注册任务生命周期钩子");
        self.hooks.push(hook);
        self
    }

    pub fn registry(&self) -> &Arc<TaskTypeRegistry> {
        &self.registry
    }

    pub fn quota(&self) -> &Arc<QuotaService> {
        &self.quota
    }

    pub fn repositories(&self) -> &Repositories {
        &self.repos
    }

    pub fn queue(&self) -> &Arc<dyn TaskQueue> {
        &self.queue
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// 校验订阅、权限、输入后持久化为 `pending` 并入队
    pub async fn submit(&self, descriptor: TaskDescriptor) -> HubResult<Task> {
        let spec = self.registry.spec(&descriptor.task_type)?;

        if !descriptor.principal.belongs_to(&descriptor.tenant) {
            return Err(HubError::unauthorized(format!(
                "调用方 {} 不属于公司 {}",
                descriptor.principal.id, descriptor.tenant.company
            )));
        }
        if let Some(role) = &spec.required_role {
            if !descriptor.principal.has_role(role) && !descriptor.principal.is_admin() {
                return Err(HubError::unauthorized(format!(
                    "任务类型 {} 需要角色 {}",
                    spec.name, role
                )));
            }
        }
        self.ensure_subscription(&descriptor.tenant.company).await?;
        spec.input_schema.validate(&descriptor.input)?;

        self.create(NewTask {
            task_type: descriptor.task_type,
            tenant: descriptor.tenant,
            principal: descriptor.principal.id,
            priority: descriptor.priority,
            input: descriptor.input,
            max_attempts: descriptor.max_attempts,
            scheduled_for: descriptor.scheduled_for,
            idempotency_key: descriptor.idempotency_key,
            parent_task_id: descriptor.parent_task_id,
            periodic_definition_id: descriptor.periodic_definition_id,
        })
        .await
    }

    async fn ensure_subscription(&self, company: &str) -> HubResult<()> {
        if !self.quota_config.require_subscription {
            return Ok(());
        }
        match self.repos.subscriptions.get(company).await? {
            Some(subscription) if subscription.is_active(self.clock.now()) => Ok(()),
            Some(_) => Err(HubError::unauthorized(format!("公司 {company} 的订阅已失效"))),
            None => Err(HubError::unauthorized(format!("公司 {company} 没有有效订阅"))),
        }
    }

    async fn create(&self, new: NewTask) -> HubResult<Task> {
        let spec = self.registry.spec(&new.task_type)?;
        let now = self.clock.now();

        if let Some(key) = &new.idempotency_key {
            if let Some(existing) = self
                .repos
                .tasks
                .find_by_idempotency_key(&new.tenant.company, key)
                .await?
            {
                debug!(task.id = %existing.id, idempotency_key = %key, "幂等键命中，返回已有任务");
                return Ok(existing);
            }
        }

        let max_attempts = new.max_attempts.unwrap_or(self.config.default_max_attempts);
        if max_attempts == 0 {
            return Err(HubError::invalid_input("max_attempts 必须大于0"));
        }
        let priority = new.priority.unwrap_or(spec.default_priority);

        let key = taskhub_domain::QueueKey::new(new.task_type.clone(), priority);
        let depth = self.queue.depth(&key).await?;
        if depth >= self.max_queue_depth {
            return Err(HubError::Overloaded {
                queue: key.to_string(),
                depth,
            });
        }

        let available_at = new.scheduled_for.map(|t| t.max(now)).unwrap_or(now);
        let ttl = spec
            .ttl
            .unwrap_or_else(|| Duration::seconds(self.config.default_pending_ttl_seconds as i64));

        let task = Task {
            id: TaskId::new(),
            task_type: new.task_type,
            tenant: new.tenant,
            principal: new.principal,
            priority,
            status: TaskStatus::Pending,
            input: new.input,
            result: None,
            error: None,
            warnings: Vec::new(),
            attempts: 0,
            max_attempts,
            lease_token: None,
            leased_by: None,
            lease_deadline: None,
            cancel_requested: false,
            available_at,
            expires_at: Some(available_at + ttl),
            idempotency_key: new.idempotency_key,
            parent_task_id: new.parent_task_id,
            periodic_definition_id: new.periodic_definition_id,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
            version: 0,
        };

        let stored = match self.repos.tasks.insert(&task, &self.reservations()).await {
            Ok(stored) => stored,
            Err(HubError::Conflict(msg)) => {
                // 并发提交同一幂等键时返回先写入的那一条
                if let Some(key) = &task.idempotency_key {
                    if let Some(existing) = self
                        .repos
                        .tasks
                        .find_by_idempotency_key(&task.tenant.company, key)
                        .await?
                    {
                        return Ok(existing);
                    }
                }
                return Err(HubError::Conflict(msg));
            }
            Err(e) => return Err(e),
        };

        let entry = QueueEntry::for_task(&stored);
        if let Err(e) = self.queue.push(entry.clone()).await {
            debug!(task.id = %stored.id, error = %e, "入队时队列已满，改为无上限重新入队");
            self.queue.requeue(entry).await?;
        }

        self.run_hooks(&stored, &TaskEvent::created(stored.id, now)).await;
        Ok(stored)
    }

    /// 在给定任务类型中租出优先级最高、最早创建且配额允许推进的任务
    pub async fn lease(&self, worker_id: &str, task_types: &[String]) -> HubResult<Option<Lease>> {
        for _ in 0..MAX_LEASE_CANDIDATES {
            let now = self.clock.now();
            let Some(entry) = self.queue.pop(task_types, now).await? else {
                return Ok(None);
            };

            let Some(task) = self.repos.tasks.get(entry.task_id).await? else {
                debug!(task.id = %entry.task_id, "队列令牌对应的任务不存在，丢弃");
                continue;
            };
            if task.status != TaskStatus::Pending {
                debug!(task.id = %task.id, status = %task.status, "丢弃过期的队列令牌");
                continue;
            }
            if task.available_at > now {
                self.queue.requeue(QueueEntry::for_task(&task)).await?;
                continue;
            }

            let spec = match self.registry.spec(&task.task_type) {
                Ok(spec) => spec,
                Err(e) => {
                    warn!(task.id = %task.id, error = %e, "任务类型未注册，稍后重试派发");
                    self.defer(&task, now).await?;
                    continue;
                }
            };
            if !self
                .quota
                .has_headroom(&task.tenant.company, &spec.quota_resources)
                .await?
            {
                debug!(task.id = %task.id, tenant.company = %task.tenant.company, "配额已用尽，推迟派发");
                self.defer(&task, now).await?;
                continue;
            }

            let timeout = Duration::from_std(spec.timeout)
                .map_err(|e| HubError::internal(format!("任务超时配置无效: {e}")))?;
            let token = Uuid::new_v4();
            let deadline = now + timeout;

            let mut next = task.clone();
            next.status = TaskStatus::Processing;
            next.attempts += 1;
            next.lease_token = Some(token);
            next.leased_by = Some(worker_id.to_string());
            next.lease_deadline = Some(deadline);
            next.started_at = next.started_at.or(Some(now));
            next.updated_at = now;

            match self
                .commit_transition(&task, next, &[], event_reasons::LEASED)
                .await
            {
                Ok(leased) => {
                    return Ok(Some(Lease {
                        task: leased,
                        token,
                        deadline,
                    }))
                }
                Err(HubError::Conflict(_)) => {
                    debug!(task.id = %task.id, "任务已被其他Worker租出");
                    continue;
                }
                Err(e) => {
                    self.queue.requeue(entry).await?;
                    return Err(e);
                }
            }
        }
        Ok(None)
    }

    async fn defer(&self, task: &Task, now: DateTime<Utc>) -> HubResult<()> {
        let mut entry = QueueEntry::for_task(task);
        entry.not_before = now + Duration::seconds(self.retry.config().base_delay_seconds as i64);
        self.queue.requeue(entry).await
    }

    /// 续约并回传取消意图；令牌失效或已过期时返回 `Conflict`
    pub async fn heartbeat(&self, task_id: TaskId, token: Uuid) -> HubResult<HeartbeatAck> {
        for _ in 0..MAX_COMMIT_RETRIES {
            let now = self.clock.now();
            let task = self.load(task_id).await?;
            if !task.holds_lease(token, now) {
                return Err(HubError::conflict(format!("任务 {task_id} 的租约已失效")));
            }

            let deadline = task
                .lease_deadline
                .map(|d| d.max(now + self.lease_extension))
                .unwrap_or(now + self.lease_extension);
            let mut next = task.clone();
            next.lease_deadline = Some(deadline);
            next.updated_at = now;

            match self.repos.tasks.commit(&next, task.version, &[], None).await {
                Ok(saved) => {
                    debug!(task.id = %task_id, lease.deadline = %deadline, "租约已续期");
                    return Ok(HeartbeatAck {
                        deadline,
                        cancel_requested: saved.cancel_requested,
                    });
                }
                Err(HubError::Conflict(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(HubError::conflict(format!("任务 {task_id} 续约时持续冲突")))
    }

    /// 处理器成功返回；取消意图未被处理器观察到时仍迁移为 `cancelled`
    ///
    /// 用量越过某项硬上限时任务失败，该项消费不计入，其余用量照常提交。
    pub async fn complete(
        &self,
        task_id: TaskId,
        token: Uuid,
        report: CompletionReport,
    ) -> HubResult<Task> {
        let mut usage = report.quota_usage;
        let mut over_cap: Option<TaskError> = None;
        let mut conflicts = 0;
        loop {
            let now = self.clock.now();
            let task = self.load(task_id).await?;
            if !task.holds_lease(token, now) {
                return Err(HubError::conflict(format!(
                    "任务 {task_id} 的租约已失效，拒绝完成"
                )));
            }

            let mut next = task.clone();
            next.warnings.extend(report.warnings.iter().cloned());
            next.completed_at = Some(now);
            next.updated_at = now;
            next.clear_lease();
            let reason = match &over_cap {
                Some(error) => {
                    next.status = TaskStatus::Failed;
                    next.error = Some(error.clone());
                    event_reasons::FAILED
                }
                None if task.cancel_requested => {
                    next.result = Some(report.result.clone());
                    next.status = TaskStatus::Cancelled;
                    next.warnings.push(WARNING_CANCEL_AFTER_COMPLETE.to_string());
                    event_reasons::CANCEL_AFTER_COMPLETE
                }
                None => {
                    next.result = Some(report.result.clone());
                    next.status = TaskStatus::Completed;
                    event_reasons::COMPLETED
                }
            };

            let mut deltas = usage.clone();
            deltas.extend(self.releases());

            match self.commit_transition(&task, next, &deltas, reason).await {
                Err(HubError::Conflict(_)) if conflicts < MAX_COMMIT_RETRIES => {
                    // 完成期间任务行被并发修改（如设置了取消标志），重新读取
                    conflicts += 1;
                }
                Err(HubError::QuotaExceeded {
                    resource,
                    requested,
                    remaining,
                }) if drop_usage(&mut usage, &resource) => {
                    warn!(task.id = %task_id, resource = %resource, requested, remaining, "用量超出配额上限，任务失败");
                    over_cap.get_or_insert_with(|| {
                        TaskError::from(HubError::QuotaExceeded {
                            resource,
                            requested,
                            remaining,
                        })
                    });
                }
                other => return other,
            }
        }
    }

    /// 处理器返回错误：可重试且未耗尽次数时退回 `pending`，否则 `failed`
    ///
    /// 超出硬上限的那项用量不计入，其余用量照常提交。
    pub async fn fail(&self, task_id: TaskId, token: Uuid, report: FailureReport) -> HubResult<Task> {
        let mut usage = report.quota_usage;
        let mut conflicts = 0;
        let committed = loop {
            let now = self.clock.now();
            let task = self.load(task_id).await?;
            if !task.holds_lease(token, now) {
                return Err(HubError::conflict(format!(
                    "任务 {task_id} 的租约已失效，拒绝上报失败"
                )));
            }

            let retryable = self
                .registry
                .spec(&task.task_type)
                .map(|spec| spec.is_retryable(&report.error))
                .unwrap_or(false);

            let mut next = task.clone();
            next.warnings.extend(report.warnings.iter().cloned());
            next.updated_at = now;
            next.clear_lease();

            let mut deltas = usage.clone();
            let reason = if report.error.kind == ErrorKind::Cancelled || task.cancel_requested {
                next.status = TaskStatus::Cancelled;
                next.completed_at = Some(now);
                deltas.extend(self.releases());
                event_reasons::CANCELLED
            } else if retryable && task.attempts < task.max_attempts {
                next.status = TaskStatus::Pending;
                next.available_at = now + self.retry.delay(task.attempts);
                next.error = Some(report.error.clone());
                event_reasons::RETRY
            } else {
                next.status = TaskStatus::Failed;
                next.error = Some(report.error.clone());
                next.completed_at = Some(now);
                deltas.extend(self.releases());
                event_reasons::FAILED
            };

            match self.commit_transition(&task, next, &deltas, reason).await {
                Err(HubError::Conflict(_)) if conflicts < MAX_COMMIT_RETRIES => {
                    conflicts += 1;
                }
                Err(HubError::QuotaExceeded { resource, .. }) if drop_usage(&mut usage, &resource) => {
                    warn!(task.id = %task_id, resource = %resource, "部分用量超出配额上限，该项按未消费提交");
                }
                other => break other?,
            }
        };

        if committed.status == TaskStatus::Pending {
            self.enqueue_retry(&committed).await;
        }
        Ok(committed)
    }

    /// 取消：`pending` 直接迁移，`processing` 只设置协作式取消标志，终态为空操作
    pub async fn cancel(&self, task_id: TaskId, principal: &Principal) -> HubResult<Task> {
        for _ in 0..MAX_COMMIT_RETRIES {
            let now = self.clock.now();
            let task = self.load(task_id).await?;
            if !principal.belongs_to(&task.tenant) {
                return Err(HubError::unauthorized(format!(
                    "调用方 {} 无权取消任务 {task_id}",
                    principal.id
                )));
            }

            let result = match task.status {
                status if status.is_terminal() => return Ok(task),
                TaskStatus::Pending => {
                    let mut next = task.clone();
                    next.status = TaskStatus::Cancelled;
                    next.completed_at = Some(now);
                    next.updated_at = now;
                    let cancelled = self
                        .commit_transition(&task, next, &self.releases(), event_reasons::CANCELLED)
                        .await;
                    if cancelled.is_ok() {
                        self.queue.remove(task_id).await?;
                    }
                    cancelled
                }
                _ => {
                    if task.cancel_requested {
                        return Ok(task);
                    }
                    let mut next = task.clone();
                    next.cancel_requested = true;
                    next.updated_at = now;
                    let flagged = self.repos.tasks.commit(&next, task.version, &[], None).await;
                    if flagged.is_ok() {
                        info!(task.id = %task_id, worker.id = task.leased_by.as_deref().unwrap_or(""), "已设置取消标志，等待处理器响应");
                    }
                    flagged
                }
            };

            match result {
                Err(HubError::Conflict(_)) => continue,
                other => return other,
            }
        }
        Err(HubError::conflict(format!("任务 {task_id} 取消时持续冲突")))
    }

    /// 管理员重置终态任务：创建通过 `parent_task_id` 关联的新任务
    pub async fn reset(&self, task_id: TaskId, principal: &Principal) -> HubResult<Task> {
        let task = self.load(task_id).await?;
        if !principal.is_admin() || !principal.belongs_to(&task.tenant) {
            return Err(HubError::unauthorized("只有本公司管理员可以重置任务"));
        }
        if !task.is_terminal() {
            return Err(HubError::conflict(format!(
                "任务 {task_id} 处于 {} 状态，只有终态任务可以重置",
                task.status
            )));
        }
        self.ensure_subscription(&task.tenant.company).await?;

        let reset = self
            .create(NewTask {
                task_type: task.task_type.clone(),
                tenant: task.tenant.clone(),
                principal: task.principal.clone(),
                priority: Some(task.priority),
                input: task.input.clone(),
                max_attempts: Some(task.max_attempts),
                scheduled_for: None,
                idempotency_key: None,
                parent_task_id: Some(task.id),
                periodic_definition_id: task.periodic_definition_id,
            })
            .await?;
        info!(task.id = %reset.id, parent.id = %task_id, principal = %principal.id, "任务已重置");
        Ok(reset)
    }

    /// 回收过期或失联Worker持有的租约；任务已不在处理中时返回 `None`
    pub async fn reclaim(&self, task_id: TaskId, cause: ReclaimCause) -> HubResult<Option<Task>> {
        let now = self.clock.now();
        let task = self.load(task_id).await?;
        if task.status != TaskStatus::Processing {
            return Ok(None);
        }
        if cause == ReclaimCause::LeaseExpired && !task.lease_expired(now) {
            return Ok(None);
        }

        let mut next = task.clone();
        next.updated_at = now;
        next.clear_lease();
        let timeout = TaskError::new(
            ErrorKind::Timeout,
            format!("租约在 {} 前未续约", task.lease_deadline.unwrap_or(now)),
        );

        let (deltas, reason) = if task.cancel_requested {
            next.status = TaskStatus::Cancelled;
            next.completed_at = Some(now);
            (self.releases(), event_reasons::CANCELLED)
        } else if task.attempts < task.max_attempts {
            next.status = TaskStatus::Pending;
            next.available_at = now + self.retry.delay(task.attempts);
            next.error = Some(timeout);
            (Vec::new(), cause.reason())
        } else {
            next.status = TaskStatus::Failed;
            next.error = Some(timeout);
            next.completed_at = Some(now);
            (self.releases(), cause.reason())
        };

        match self.commit_transition(&task, next, &deltas, reason).await {
            Ok(reclaimed) => {
                if reclaimed.status == TaskStatus::Pending {
                    self.enqueue_retry(&reclaimed).await;
                }
                Ok(Some(reclaimed))
            }
            Err(HubError::Conflict(_)) => {
                debug!(task.id = %task_id, "回收时任务已被并发修改，跳过");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// 等待超过TTL的 `pending` 任务迁移为 `expired`
    pub async fn expire(&self, task_id: TaskId) -> HubResult<Option<Task>> {
        let now = self.clock.now();
        let task = self.load(task_id).await?;
        let due = task.status == TaskStatus::Pending
            && task.expires_at.map(|e| e <= now).unwrap_or(false);
        if !due {
            return Ok(None);
        }

        let mut next = task.clone();
        next.status = TaskStatus::Expired;
        next.completed_at = Some(now);
        next.updated_at = now;
        match self
            .commit_transition(&task, next, &self.releases(), event_reasons::EXPIRED)
            .await
        {
            Ok(expired) => {
                self.queue.remove(task_id).await?;
                Ok(Some(expired))
            }
            Err(HubError::Conflict(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn get(&self, task_id: TaskId) -> HubResult<Task> {
        self.load(task_id).await
    }

    pub async fn list(&self, filter: &TaskFilter) -> HubResult<Vec<Task>> {
        self.repos.tasks.list(filter).await
    }

    pub async fn events(&self, task_id: TaskId) -> HubResult<Vec<TaskEvent>> {
        self.load(task_id).await?;
        self.repos.tasks.events(task_id).await
    }

    async fn load(&self, task_id: TaskId) -> HubResult<Task> {
        self.repos
            .tasks
            .get(task_id)
            .await?
            .ok_or_else(|| HubError::not_found("任务", task_id.to_string()))
    }

    fn reservations(&self) -> Vec<QuotaDelta> {
        if self.quota_config.reserve_concurrent_tasks {
            vec![QuotaDelta::new(QuotaResource::ConcurrentTasks, 1.0)]
        } else {
            Vec::new()
        }
    }

    fn releases(&self) -> Vec<QuotaDelta> {
        self.reservations()
            .into_iter()
            .map(|d| QuotaDelta::new(d.resource, -d.amount))
            .collect()
    }

    async fn enqueue_retry(&self, task: &Task) {
        if let Err(e) = self.queue.requeue(QueueEntry::for_task(task)).await {
            warn!(task.id = %task.id, error = %e, "重试任务入队失败，等待队列重建");
        }
    }

    async fn commit_transition(
        &self,
        previous: &Task,
        next: Task,
        deltas: &[QuotaDelta],
        reason: &str,
    ) -> HubResult<Task> {
        if !previous.status.can_transition_to(next.status) {
            return Err(HubError::conflict(format!(
                "任务 {} 不允许从 {} 迁移到 {}",
                previous.id, previous.status, next.status
            )));
        }
        let event = TaskEvent::transition(
            previous.id,
            previous.status,
            next.status,
            reason,
            next.updated_at,
        );
        let committed = self
            .repos
            .tasks
            .commit(&next, previous.version, deltas, Some(&event))
            .await?;
        self.run_hooks(&committed, &event).await;
        Ok(committed)
    }

    async fn run_hooks(&self, task: &Task, event: &TaskEvent) {
        for hook in &self.hooks {
            hook.after_commit(task, event).await;
        }
    }
}

/// 去掉某资源的正向用量，返回是否有项被去掉
fn drop_usage(usage: &mut Vec<QuotaDelta>, resource: &str) -> bool {
    let before = usage.len();
    usage.retain(|d| d.amount <= 0.0 || d.resource.as_str() != resource);
    usage.len() != before
}
