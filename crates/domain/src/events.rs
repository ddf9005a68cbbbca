//! 任务事件日志
//!
//! 每次持久化的状态迁移都追加一条事件，按时间顺序可重放任务的完整路径

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::TaskStatus;
use crate::value_objects::TaskId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub id: Uuid,
    pub task_id: TaskId,
    /// 创建事件没有前置状态
    pub from: Option<TaskStatus>,
    pub to: TaskStatus,
    pub reason: String,
    pub at: DateTime<Utc>,
}

impl TaskEvent {
    pub fn created(task_id: TaskId, at: DateTime<Utc>) -> Self {
        Self::new(task_id, None, TaskStatus::Pending, event_reasons::CREATED, at)
    }

    pub fn transition(
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
        reason: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self::new(task_id, Some(from), to, reason, at)
    }

    fn new(
        task_id: TaskId,
        from: Option<TaskStatus>,
        to: TaskStatus,
        reason: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id,
            from,
            to,
            reason: reason.into(),
            at,
        }
    }
}

pub mod event_reasons {
    pub const CREATED: &str = "created";
    pub const LEASED: &str = "leased";
    pub const COMPLETED: &str = "completed";
    pub const RETRY: &str = "retry";
    pub const FAILED: &str = "failed";
    pub const CANCELLED: &str = "cancelled";
    pub const CANCEL_AFTER_COMPLETE: &str = "cancel_after_complete";
    pub const EXPIRED: &str = "expired";
    pub const LEASE_EXPIRED: &str = "lease_expired";
    pub const WORKER_LOST: &str = "worker_lost";
}
