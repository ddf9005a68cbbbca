use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{error, info, warn};
use uuid::Uuid;

use taskhub_core::RetryPolicy;
use taskhub_domain::{
    Clock, ExecutionStatus, Principal, PublicationRepository, PublicationState, PublicationStatus,
    ScheduledPublication, ScheduledPublicationRepository, Task, TaskEvent, TaskLifecycleHook,
    TaskStatus, Tenant,
};
use taskhub_errors::{HubError, HubResult};

pub const PUBLISH_ARTICLE: &str = "publish_article";

/// 内容项的编辑工作流
pub struct PublicationWorkflow {
    publications: Arc<dyn PublicationRepository>,
    scheduled: Arc<dyn ScheduledPublicationRepository>,
    clock: Arc<dyn Clock>,
    max_retries: u32,
}

impl PublicationWorkflow {
    pub fn new(
        publications: Arc<dyn PublicationRepository>,
        scheduled: Arc<dyn ScheduledPublicationRepository>,
        clock: Arc<dyn Clock>,
        max_retries: u32,
    ) -> Self {
        Self {
            publications,
            scheduled,
            clock,
            max_retries,
        }
    }

    pub async fn create_draft(
        &self,
        content_id: &str,
        tenant: Tenant,
        principal: &Principal,
    ) -> HubResult<PublicationStatus> {
        if !principal.belongs_to(&tenant) || principal.editorial_rank() == 0 {
            return Err(HubError::unauthorized("只有本公司的作者可以创建草稿"));
        }
        let draft = PublicationStatus::draft(content_id, tenant, &principal.id, self.clock.now());
        self.publications.save_status(&draft, None).await
    }

    pub async fn status(&self, content_id: &str) -> HubResult<PublicationStatus> {
        self.publications
            .get_status(content_id)
            .await?
            .ok_or_else(|| HubError::not_found("内容发布状态", content_id))
    }

    pub async fn content_visible(&self, content_id: &str) -> HubResult<bool> {
        self.publications.content_visible(content_id).await
    }

    /// 按角色校验后迁移；`scheduled` 只能经由 [`Self::schedule`] 进入
    pub async fn transition(
        &self,
        content_id: &str,
        next: PublicationState,
        principal: &Principal,
    ) -> HubResult<PublicationStatus> {
        if next == PublicationState::Scheduled {
            return Err(HubError::invalid_input("进入 scheduled 状态需要指定发布时间"));
        }
        let current = self.status(content_id).await?;
        self.apply(current, next, principal).await
    }

    pub async fn publish(&self, content_id: &str, principal: &Principal) -> HubResult<PublicationStatus> {
        let current = self.status(content_id).await?;
        if current.state == PublicationState::Published {
            return Ok(current);
        }
        self.apply(current, PublicationState::Published, principal)
            .await
    }

    async fn apply(
        &self,
        current: PublicationStatus,
        next: PublicationState,
        principal: &Principal,
    ) -> HubResult<PublicationStatus> {
        if !principal.belongs_to(&current.tenant) {
            return Err(HubError::unauthorized(format!(
                "调用方 {} 不属于内容所在公司",
                principal.id
            )));
        }
        let Some(role) = current.state.required_role(next) else {
            return Err(HubError::invalid_input(format!(
                "不允许从 {} 迁移到 {}",
                current.state, next
            )));
        };
        if !current.state.allows(next, principal) {
            return Err(HubError::unauthorized(format!(
                "从 {} 迁移到 {} 需要 {} 角色",
                current.state, next, role
            )));
        }

        let mut updated = current.clone();
        updated.state = next;
        updated.content_published = next.is_visible();
        updated.updated_by = principal.id.clone();
        updated.updated_at = self.clock.now();

        let saved = self
            .publications
            .save_status(&updated, Some(current.version))
            .await?;
        info!(
            content.id = %saved.content_id,
            from = %current.state,
            to = %saved.state,
            principal = %principal.id,
            "内容发布状态已迁移"
        );
        Ok(saved)
    }

    /// 已审批的内容安排在未来某个时间发布
    pub async fn schedule(
        &self,
        content_id: &str,
        scheduled_for: DateTime<Utc>,
        principal: &Principal,
    ) -> HubResult<ScheduledPublication> {
        let now = self.clock.now();
        let current = self.status(content_id).await?;
        if current.state != PublicationState::Approved {
            return Err(HubError::conflict(format!(
                "内容 {content_id} 处于 {} 状态，必须先审批才能安排发布",
                current.state
            )));
        }
        if scheduled_for <= now {
            return Err(HubError::invalid_input("发布时间必须晚于当前时间"));
        }

        let status = self
            .apply(current, PublicationState::Scheduled, principal)
            .await?;
        let publication = ScheduledPublication {
            id: Uuid::new_v4(),
            content_id: content_id.to_string(),
            tenant: status.tenant.clone(),
            principal: principal.clone(),
            scheduled_for,
            execution_status: ExecutionStatus::Pending,
            retry_count: 0,
            max_retries: self.max_retries,
            task_id: None,
            last_error: None,
            created_at: now,
            updated_at: now,
            version: 0,
        };
        let saved = self.scheduled.insert(&publication).await?;
        info!(content.id = content_id, publication.id = %saved.id, scheduled_for = %scheduled_for, "已安排定时发布");
        Ok(saved)
    }

    /// 取消尚未执行的定时发布，内容退回 `approved`
    pub async fn cancel_schedule(
        &self,
        publication_id: Uuid,
        principal: &Principal,
    ) -> HubResult<ScheduledPublication> {
        let publication = self
            .scheduled
            .get(publication_id)
            .await?
            .ok_or_else(|| HubError::not_found("定时发布", publication_id.to_string()))?;
        if publication.execution_status.is_final() {
            return Ok(publication);
        }
        if publication.execution_status == ExecutionStatus::Processing {
            return Err(HubError::conflict("定时发布正在执行，无法取消"));
        }

        let current = self.status(&publication.content_id).await?;
        if current.state == PublicationState::Scheduled {
            self.apply(current, PublicationState::Approved, principal)
                .await?;
        } else if !principal.belongs_to(&publication.tenant) || !principal.is_admin() {
            return Err(HubError::unauthorized("只有管理员可以取消定时发布"));
        }

        let mut cancelled = publication.clone();
        cancelled.execution_status = ExecutionStatus::Cancelled;
        cancelled.updated_at = self.clock.now();
        self.scheduled.update(&cancelled, publication.version).await
    }
}

/// 发布任务结束后推进定时发布行：成功则完成，失败按退避重新排期或最终失败
pub struct PublicationTaskHook {
    scheduled: Arc<dyn ScheduledPublicationRepository>,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl PublicationTaskHook {
    pub fn new(
        scheduled: Arc<dyn ScheduledPublicationRepository>,
        retry: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            scheduled,
            retry,
            clock,
        }
    }

    async fn settle(&self, task: &Task) -> HubResult<()> {
        // 调度器可能尚未写回 task_id，优先按输入中的行ID查找
        let by_input = task
            .input
            .get("scheduled_publication_id")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok());
        let publication = match by_input {
            Some(id) => self.scheduled.get(id).await?,
            None => self.scheduled.find_by_task(task.id).await?,
        };
        let Some(publication) = publication else {
            return Ok(());
        };
        if publication.execution_status.is_final()
            || publication.task_id.map(|id| id != task.id).unwrap_or(false)
        {
            return Ok(());
        }

        let error = match task.status {
            TaskStatus::Completed => None,
            _ => Some(
                task.error
                    .as_ref()
                    .map(|e| e.message.clone())
                    .unwrap_or_else(|| format!("发布任务以 {} 结束", task.status)),
            ),
        };
        let updated = record_outcome(&publication, error, &self.retry, self.clock.now());
        self.scheduled.update(&updated, publication.version).await?;
        Ok(())
    }
}

#[async_trait]
impl TaskLifecycleHook for PublicationTaskHook {
    fn name(&self) -> &str {
        "scheduled_publication"
    }

    async fn after_commit(&self, task: &Task, event: &TaskEvent) {
        if task.task_type != PUBLISH_ARTICLE || !event.to.is_terminal() {
            return;
        }
        if let Err(e) = self.settle(task).await {
            error!(task.id = %task.id, error = %e, "更新定时发布执行状态失败");
        }
    }
}

/// 一次执行的结果：成功即完成；失败时 `retry_count < max_retries` 则按退避重新排期
pub fn record_outcome(
    publication: &ScheduledPublication,
    error: Option<String>,
    retry: &RetryPolicy,
    now: DateTime<Utc>,
) -> ScheduledPublication {
    let mut updated = publication.clone();
    updated.updated_at = now;
    match error {
        None => {
            updated.execution_status = ExecutionStatus::Completed;
            updated.last_error = None;
        }
        Some(message) => {
            updated.retry_count += 1;
            updated.last_error = Some(message.clone());
            updated.task_id = None;
            if updated.retry_count < updated.max_retries {
                updated.execution_status = ExecutionStatus::Pending;
                updated.scheduled_for = now + retry.delay(updated.retry_count);
                warn!(
                    publication.id = %updated.id,
                    retry_count = updated.retry_count,
                    retry_at = %updated.scheduled_for,
                    error = %message,
                    "定时发布失败，稍后重试"
                );
            } else {
                updated.execution_status = ExecutionStatus::Failed;
                error!(
                    publication.id = %updated.id,
                    retry_count = updated.retry_count,
                    error = %message,
                    "定时发布重试耗尽"
                );
            }
        }
    }
    updated
}
