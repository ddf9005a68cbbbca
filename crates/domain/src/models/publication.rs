use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::value_objects::{role_rank, Principal, TaskId, Tenant, ROLE_ADMIN, ROLE_AUTHOR, ROLE_EDITOR};

/// 内容项的编辑状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublicationState {
    Draft,
    PendingReview,
    ChangesRequested,
    Approved,
    Scheduled,
    Published,
    Unpublished,
    Archived,
}

impl PublicationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PublicationState::Draft => "draft",
            PublicationState::PendingReview => "pending_review",
            PublicationState::ChangesRequested => "changes_requested",
            PublicationState::Approved => "approved",
            PublicationState::Scheduled => "scheduled",
            PublicationState::Published => "published",
            PublicationState::Unpublished => "unpublished",
            PublicationState::Archived => "archived",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let state = match value {
            "draft" => PublicationState::Draft,
            "pending_review" => PublicationState::PendingReview,
            "changes_requested" => PublicationState::ChangesRequested,
            "approved" => PublicationState::Approved,
            "scheduled" => PublicationState::Scheduled,
            "published" => PublicationState::Published,
            "unpublished" => PublicationState::Unpublished,
            "archived" => PublicationState::Archived,
            _ => return None,
        };
        Some(state)
    }

    /// 迁移所需的最低角色；`None` 表示不允许该迁移
    pub fn required_role(&self, next: PublicationState) -> Option<&'static str> {
        use PublicationState::*;
        let role = match (self, next) {
            (Draft, PendingReview) => ROLE_AUTHOR,
            (PendingReview, Draft) => ROLE_AUTHOR,
            (ChangesRequested, PendingReview) => ROLE_AUTHOR,
            (PendingReview, ChangesRequested) => ROLE_EDITOR,
            (Approved, ChangesRequested) => ROLE_EDITOR,
            (Approved, PendingReview) => ROLE_EDITOR,
            (PendingReview, Approved) => ROLE_ADMIN,
            (Approved, Scheduled) => ROLE_ADMIN,
            (Scheduled, Approved) => ROLE_ADMIN,
            (Scheduled, Published) => ROLE_ADMIN,
            (Published, Unpublished) => ROLE_ADMIN,
            (Unpublished, Published) => ROLE_ADMIN,
            (Unpublished, Archived) => ROLE_ADMIN,
            _ => return None,
        };
        Some(role)
    }

    pub fn allows(&self, next: PublicationState, principal: &Principal) -> bool {
        self.required_role(next)
            .map(|role| principal.editorial_rank() >= role_rank(role))
            .unwrap_or(false)
    }

    pub fn is_visible(&self) -> bool {
        matches!(self, PublicationState::Published)
    }
}

impl std::fmt::Display for PublicationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 内容项的工作流行，`content_published` 与内容可见性同步
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicationStatus {
    pub content_id: String,
    pub tenant: Tenant,
    pub state: PublicationState,
    pub content_published: bool,
    pub updated_by: String,
    pub updated_at: DateTime<Utc>,
    pub version: i64,
}

impl PublicationStatus {
    pub fn draft(content_id: impl Into<String>, tenant: Tenant, author: &str, now: DateTime<Utc>) -> Self {
        Self {
            content_id: content_id.into(),
            tenant,
            state: PublicationState::Draft,
            content_published: false,
            updated_by: author.to_string(),
            updated_at: now,
            version: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Processing => "processing",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(ExecutionStatus::Pending),
            "processing" => Some(ExecutionStatus::Processing),
            "completed" => Some(ExecutionStatus::Completed),
            "failed" => Some(ExecutionStatus::Failed),
            "cancelled" => Some(ExecutionStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledPublication {
    pub id: Uuid,
    pub content_id: String,
    pub tenant: Tenant,
    pub principal: Principal,
    pub scheduled_for: DateTime<Utc>,
    pub execution_status: ExecutionStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub task_id: Option<TaskId>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: i64,
}

impl ScheduledPublication {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.execution_status == ExecutionStatus::Pending && self.scheduled_for <= now
    }
}
