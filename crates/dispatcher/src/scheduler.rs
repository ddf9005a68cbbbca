use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use taskhub_core::SchedulerConfig;
use taskhub_domain::{
    Calendar, Clock, ExecutionStatus, PeriodicDefinition, Repositories, ScheduledPublication, TaskDescriptor,
    TaskTemplate, Tenant,
};
use taskhub_errors::{HubError, HubResult};
use taskhub_infrastructure::{MetricsCollector, StructuredLogger};

use crate::calendar::merge_payload;
use crate::cron_utils::CronSchedule;
use crate::publication::{record_outcome, PUBLISH_ARTICLE};
use crate::task_hub::TaskHub;

const LEADER_LOCK_NAME: &str = "taskhub-scheduler";

/// 新建周期定义的请求
#[derive(Debug, Clone)]
pub struct PeriodicRequest {
    pub tenant: Tenant,
    pub name: String,
    pub template: TaskTemplate,
    pub cron: String,
    pub timezone: String,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    pub max_fires: Option<u32>,
    pub catch_up: bool,
    pub origin_task_id: Option<taskhub_domain::TaskId>,
}

/// 单次调度循环的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub leader: bool,
    pub periodic_fired: usize,
    pub calendar_fired: usize,
    pub publications_fired: usize,
}

/// 周期任务调度器
///
/// 任意实例都可以运行，存储级咨询锁保证同一时刻只有一个实例在物化。
pub struct Scheduler {
    hub: Arc<TaskHub>,
    repos: Repositories,
    config: SchedulerConfig,
    clock: Arc<dyn Clock>,
    instance_id: String,
    metrics: Option<Arc<MetricsCollector>>,
}

impl Scheduler {
    pub fn new(hub: Arc<TaskHub>, config: SchedulerConfig, instance_id: impl Into<String>) -> Self {
        Self {
            repos: hub.repositories().clone(),
            clock: hub.clock().clone(),
            hub,
            config,
            instance_id: instance_id.into(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// 校验CRON与模板后创建周期定义，首次触发不早于 `max(start_at, now)`
    pub async fn define(&self, request: PeriodicRequest) -> HubResult<PeriodicDefinition> {
        let schedule = CronSchedule::new(&request.cron, &request.timezone)?;
        self.hub.registry().spec(&request.template.task_type)?;
        if !request.template.principal.belongs_to(&request.tenant) {
            return Err(HubError::unauthorized("模板中的调用方不属于该公司"));
        }
        if request.name.trim().is_empty() {
            return Err(HubError::invalid_input("周期定义名称不能为空"));
        }

        let now = self.clock.now();
        let start_at = request.start_at.unwrap_or(now);
        if let Some(end) = request.end_at {
            if end < start_at {
                return Err(HubError::invalid_input("结束时间不能早于开始时间"));
            }
        }
        let next_fire_at = schedule
            .first_at_or_after(start_at.max(now))
            .filter(|next| request.end_at.map(|end| *next <= end).unwrap_or(true));

        let definition = PeriodicDefinition {
            id: Uuid::new_v4(),
            tenant: request.tenant,
            name: request.name,
            template: request.template,
            cron: request.cron,
            timezone: request.timezone,
            start_at,
            end_at: request.end_at,
            next_fire_at,
            last_fire_at: None,
            max_fires: request.max_fires,
            fires_count: 0,
            active: next_fire_at.is_some(),
            catch_up: request.catch_up,
            origin_task_id: request.origin_task_id,
            created_at: now,
            updated_at: now,
            version: 0,
        };
        let saved = self.repos.periodic.insert(&definition).await?;
        info!(
            periodic.id = %saved.id,
            periodic.name = %saved.name,
            cron = %saved.cron,
            timezone = %saved.timezone,
            next_fire_at = ?saved.next_fire_at,
            "周期定义已创建"
        );
        Ok(saved)
    }

    /// 幂等停用
    pub async fn deactivate(&self, id: Uuid) -> HubResult<PeriodicDefinition> {
        let definition = self
            .repos
            .periodic
            .get(id)
            .await?
            .ok_or_else(|| HubError::not_found("周期定义", id.to_string()))?;
        let mut updated = definition.clone();
        if !updated.deactivate(self.clock.now()) {
            return Ok(definition);
        }
        self.repos.periodic.update(&updated, definition.version).await
    }

    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!(instance = %self.instance_id, tick = ?self.config.tick(), "调度器已启动");
        let mut interval = tokio::time::interval(self.config.tick());

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "调度循环执行失败");
                    }
                }
                _ = shutdown.recv() => {
                    info!("收到停止信号，退出调度循环");
                    break;
                }
            }
        }

        if let Err(e) = self
            .repos
            .leader_lock
            .release(LEADER_LOCK_NAME, &self.instance_id)
            .await
        {
            warn!(error = %e, "释放调度器选主锁失败");
        }
    }

    pub async fn tick(&self) -> HubResult<TickReport> {
        let now = self.clock.now();
        let ttl = Duration::seconds(self.config.leader_lock_ttl_seconds as i64);
        if !self
            .repos
            .leader_lock
            .try_acquire(LEADER_LOCK_NAME, &self.instance_id, ttl, now)
            .await?
        {
            debug!(instance = %self.instance_id, "未获得调度器选主锁，跳过本轮");
            return Ok(TickReport::default());
        }

        let periodic_fired = self.process_periodic(now).await?;
        let calendar_fired = self.process_calendars(now).await?;
        let publications_fired = self.process_publications(now).await?;
        if let Some(metrics) = &self.metrics {
            let total = periodic_fired + calendar_fired + publications_fired;
            metrics.record_periodic_fire(total as u64);
        }

        Ok(TickReport {
            leader: true,
            periodic_fired,
            calendar_fired,
            publications_fired,
        })
    }

    async fn process_periodic(&self, now: DateTime<Utc>) -> HubResult<usize> {
        let due = self
            .repos
            .periodic
            .find_due(now, self.config.batch_size)
            .await?;
        let mut fired = 0;
        for definition in due {
            match self.fire_definition(definition, now).await {
                Ok(count) => fired += count,
                Err(HubError::Conflict(msg)) => {
                    debug!(error = %msg, "周期定义已被其他实例更新，跳过");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(fired)
    }

    /// 物化一个到期定义，返回创建的任务数
    pub async fn fire_definition(
        &self,
        definition: PeriodicDefinition,
        now: DateTime<Utc>,
    ) -> HubResult<usize> {
        let Some(first) = definition.next_fire_at else {
            return Ok(0);
        };
        let schedule = match CronSchedule::new(&definition.cron, &definition.timezone) {
            Ok(schedule) => schedule,
            Err(e) => {
                error!(periodic.id = %definition.id, error = %e, "周期定义的CRON无效，停用");
                let mut updated = definition.clone();
                updated.deactivate(now);
                self.repos.periodic.update(&updated, definition.version).await?;
                return Ok(0);
            }
        };

        let mut occurrences = self.due_occurrences(
            &schedule,
            first,
            now,
            definition.end_at,
            definition.catch_up,
        );
        if let Some(max) = definition.max_fires {
            occurrences.truncate(max.saturating_sub(definition.fires_count) as usize);
        }

        let mut updated = definition.clone();
        let mut fired = 0;
        for fire_at in occurrences {
            let descriptor = self.materialize(&definition, fire_at);
            match self.hub.submit(descriptor).await {
                Ok(task) => {
                    debug!(periodic.id = %definition.id, task.id = %task.id, fire_at = %fire_at, "周期任务已提交");
                    fired += 1;
                    updated.fires_count += 1;
                }
                Err(e) if e.is_retryable() => {
                    // 保留未处理的触发点，下一轮继续
                    warn!(periodic.id = %definition.id, fire_at = %fire_at, error = %e, "周期任务提交暂时失败");
                    break;
                }
                Err(e) => {
                    warn!(periodic.id = %definition.id, fire_at = %fire_at, error = %e, "周期任务提交被拒绝，跳过该次触发");
                }
            }
            updated.last_fire_at = Some(fire_at);
        }

        let Some(last) = updated.last_fire_at.filter(|l| Some(*l) != definition.last_fire_at) else {
            return Ok(0);
        };
        updated.next_fire_at = schedule
            .next_after(last)
            .filter(|next| updated.end_at.map(|end| *next <= end).unwrap_or(true));
        updated.updated_at = now;
        if updated.cap_reached() || updated.next_fire_at.is_none() {
            updated.deactivate(now);
        }

        self.repos.periodic.update(&updated, definition.version).await?;
        StructuredLogger::log_periodic_fired(&definition.name, fired, updated.next_fire_at);
        Ok(fired)
    }

    /// 本次应物化的触发点：默认只取最近一次错过的触发，追赶模式取最近的若干次
    fn due_occurrences(
        &self,
        schedule: &CronSchedule,
        first: DateTime<Utc>,
        now: DateTime<Utc>,
        end_at: Option<DateTime<Utc>>,
        catch_up: bool,
    ) -> Vec<DateTime<Utc>> {
        let until = end_at.map(|end| end.min(now)).unwrap_or(now);
        if first > until {
            return Vec::new();
        }
        let keep = if catch_up {
            self.config.catch_up_limit.max(1)
        } else {
            1
        };
        schedule.latest_between(first, until, keep)
    }

    fn materialize(&self, definition: &PeriodicDefinition, fire_at: DateTime<Utc>) -> TaskDescriptor {
        let template = &definition.template;
        let mut descriptor = TaskDescriptor::new(
            template.task_type.clone(),
            definition.tenant.clone(),
            template.principal.clone(),
        );
        descriptor.priority = template.priority;
        descriptor.input = template.input.clone();
        descriptor.max_attempts = template.max_attempts;
        descriptor.parent_task_id = definition.origin_task_id;
        descriptor.periodic_definition_id = Some(definition.id);
        // 同一触发点在换主后重复物化时由幂等键去重
        descriptor.idempotency_key = Some(format!(
            "periodic:{}:{}",
            definition.id,
            fire_at.timestamp()
        ));
        descriptor
    }

    async fn process_calendars(&self, now: DateTime<Utc>) -> HubResult<usize> {
        let due = self
            .repos
            .calendars
            .find_due(now, self.config.batch_size)
            .await?;
        let mut fired = 0;
        for calendar in due {
            match self.fire_calendar(calendar, now).await {
                Ok(count) => fired += count,
                Err(HubError::Conflict(msg)) => {
                    debug!(error = %msg, "日历已被其他实例更新，跳过");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(fired)
    }

    /// 物化日历中到期的覆盖引用，每条引用按自己的触发进度推进
    pub async fn fire_calendar(&self, calendar: Calendar, now: DateTime<Utc>) -> HubResult<usize> {
        let mut updated = calendar.clone();
        let mut fired = 0;
        for assignment in updated.assignments.iter_mut() {
            let Some(first) = assignment.next_fire_at.filter(|next| *next <= now) else {
                continue;
            };
            let definition = match self.repos.periodic.get(assignment.definition_id).await? {
                Some(definition) if definition.active => definition,
                _ => {
                    debug!(calendar.id = %calendar.id, periodic.id = %assignment.definition_id, "周期定义已停用或不存在，停止物化该引用");
                    assignment.next_fire_at = None;
                    continue;
                }
            };
            let cron = assignment
                .cron_override
                .as_deref()
                .unwrap_or(&definition.cron);
            let schedule = match CronSchedule::new(cron, &definition.timezone) {
                Ok(schedule) => schedule,
                Err(e) => {
                    error!(calendar.id = %calendar.id, periodic.id = %definition.id, error = %e, "日历覆盖的CRON无效，停止物化该引用");
                    assignment.next_fire_at = None;
                    continue;
                }
            };

            let in_window =
                |t: &DateTime<Utc>| definition.end_at.map(|end| *t <= end).unwrap_or(true);
            if !in_window(&first) {
                assignment.next_fire_at = None;
                continue;
            }

            let input = merge_payload(
                &definition.template.input,
                assignment.payload_override.as_ref(),
            );
            let due = self.due_occurrences(
                &schedule,
                first,
                now,
                definition.end_at,
                definition.catch_up,
            );
            let mut last = None;
            for fire_at in due {
                let mut descriptor = self.materialize(&definition, fire_at);
                descriptor.input = input.clone();
                descriptor.idempotency_key = Some(format!(
                    "calendar:{}:{}:{}",
                    calendar.id,
                    definition.id,
                    fire_at.timestamp()
                ));
                match self.hub.submit(descriptor).await {
                    Ok(task) => {
                        debug!(calendar.id = %calendar.id, periodic.id = %definition.id, task.id = %task.id, fire_at = %fire_at, "日历覆盖任务已提交");
                        fired += 1;
                    }
                    Err(e) if e.is_retryable() => {
                        warn!(calendar.id = %calendar.id, fire_at = %fire_at, error = %e, "日历覆盖任务提交暂时失败");
                        break;
                    }
                    Err(e) => {
                        warn!(calendar.id = %calendar.id, fire_at = %fire_at, error = %e, "日历覆盖任务提交被拒绝，跳过该次触发");
                    }
                }
                last = Some(fire_at);
            }

            if let Some(last) = last {
                assignment.last_fire_at = Some(last);
                assignment.next_fire_at = schedule.next_after(last).filter(in_window);
            }
        }

        if updated == calendar {
            return Ok(0);
        }
        self.repos.calendars.update(&updated, calendar.version).await?;
        if fired > 0 {
            info!(calendar.id = %calendar.id, calendar.name = %calendar.name, fired, next_fire_at = ?updated.next_fire_at(), "日历覆盖已物化");
        }
        Ok(fired)
    }

    async fn process_publications(&self, now: DateTime<Utc>) -> HubResult<usize> {
        let due = self
            .repos
            .scheduled_publications
            .find_due(now, self.config.batch_size)
            .await?;
        let mut fired = 0;
        for publication in due {
            match self.fire_publication(publication, now).await {
                Ok(true) => fired += 1,
                Ok(false) => {}
                Err(HubError::Conflict(msg)) => {
                    debug!(error = %msg, "定时发布已被其他实例处理，跳过");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(fired)
    }

    async fn fire_publication(
        &self,
        publication: ScheduledPublication,
        now: DateTime<Utc>,
    ) -> HubResult<bool> {
        let mut descriptor = TaskDescriptor::new(
            PUBLISH_ARTICLE,
            publication.tenant.clone(),
            publication.principal.clone(),
        );
        descriptor.input = json!({
            "content_id": publication.content_id,
            "scheduled_publication_id": publication.id.to_string(),
        });
        descriptor.idempotency_key = Some(format!(
            "publication:{}:{}",
            publication.id, publication.retry_count
        ));

        let updated = match self.hub.submit(descriptor).await {
            Ok(task) => {
                let mut updated = publication.clone();
                updated.execution_status = ExecutionStatus::Processing;
                updated.task_id = Some(task.id);
                updated.updated_at = now;
                info!(publication.id = %publication.id, task.id = %task.id, content.id = %publication.content_id, "定时发布已物化为任务");
                updated
            }
            Err(e) if e.is_retryable() => {
                warn!(publication.id = %publication.id, error = %e, "定时发布提交暂时失败，下一轮重试");
                return Ok(false);
            }
            Err(e) => record_outcome(
                &publication,
                Some(e.to_string()),
                self.hub.retry_policy(),
                now,
            ),
        };

        let fired = updated.execution_status == ExecutionStatus::Processing;
        self.repos
            .scheduled_publications
            .update(&updated, publication.version)
            .await?;
        Ok(fired)
    }
}
