use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use taskhub_errors::HubResult;

use crate::models::{QueueKey, Task};
use crate::value_objects::{TaskId, TaskPriority};

/// 队列中的不透明派发令牌
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub task_id: TaskId,
    pub task_type: String,
    pub priority: TaskPriority,
    pub created_at: DateTime<Utc>,
    pub not_before: DateTime<Utc>,
}

impl QueueEntry {
    pub fn for_task(task: &Task) -> Self {
        Self {
            task_id: task.id,
            task_type: task.task_type.clone(),
            priority: task.priority,
            created_at: task.created_at,
            not_before: task.available_at,
        }
    }

    pub fn key(&self) -> QueueKey {
        QueueKey::new(self.task_type.clone(), self.priority)
    }
}

/// 按 `(task_type, priority)` 分区的派发队列
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// 队列深度超过上限时返回 `Overloaded`
    async fn push(&self, entry: QueueEntry) -> HubResult<()>;
    /// 重新入队（重试、重建），不受深度上限约束
    async fn requeue(&self, entry: QueueEntry) -> HubResult<()>;
    /// 在给定任务类型中先按优先级、再按 `created_at` 取出一个已到期的令牌
    async fn pop(&self, task_types: &[String], now: DateTime<Utc>) -> HubResult<Option<QueueEntry>>;
    async fn depth(&self, key: &QueueKey) -> HubResult<usize>;
    async fn remove(&self, task_id: TaskId) -> HubResult<bool>;
}
