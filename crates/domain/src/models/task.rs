use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use taskhub_errors::{ErrorKind, HubError};

use crate::value_objects::{Principal, TaskId, TaskPriority, Tenant};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
    Expired,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Expired => "expired",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(TaskStatus::Pending),
            "processing" => Some(TaskStatus::Processing),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            "cancelled" => Some(TaskStatus::Cancelled),
            "expired" => Some(TaskStatus::Expired),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::Expired
        )
    }

    /// 生命周期状态机允许的迁移
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Cancelled)
                | (Pending, Expired)
                | (Processing, Completed)
                | (Processing, Pending)
                | (Processing, Failed)
                | (Processing, Cancelled)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 处理器返回并持久化在任务上的结构化错误
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl TaskError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            detail: None,
            code: None,
        }
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl From<HubError> for TaskError {
    fn from(err: HubError) -> Self {
        let detail = match &err {
            HubError::QuotaExceeded {
                resource,
                requested,
                remaining,
            } => Some(serde_json::json!({
                "resource": resource,
                "requested": requested,
                "remaining": remaining,
            })),
            _ => None,
        };
        Self {
            kind: err.kind(),
            message: err.to_string(),
            detail,
            code: None,
        }
    }
}

pub const WARNING_CANCEL_AFTER_COMPLETE: &str = "cancel_after_complete";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: TaskId,
    pub task_type: String,
    pub tenant: Tenant,
    pub principal: String,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub input: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub error: Option<TaskError>,
    #[serde(default)]
    pub warnings: Vec<String>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub lease_token: Option<Uuid>,
    pub leased_by: Option<String>,
    pub lease_deadline: Option<DateTime<Utc>>,
    pub cancel_requested: bool,
    /// 最早可被派发的时间（延迟提交或重试退避）
    pub available_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub idempotency_key: Option<String>,
    pub parent_task_id: Option<TaskId>,
    pub periodic_definition_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    /// 乐观锁版本号，每次提交迁移加一
    pub version: i64,
}

impl Task {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn queue_key(&self) -> QueueKey {
        QueueKey::new(self.task_type.clone(), self.priority)
    }

    /// 租约令牌匹配且尚未过期
    pub fn holds_lease(&self, token: Uuid, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Processing
            && self.lease_token == Some(token)
            && self.lease_deadline.map(|d| now <= d).unwrap_or(false)
    }

    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Processing
            && self.lease_deadline.map(|d| d < now).unwrap_or(true)
    }

    pub fn clear_lease(&mut self) {
        self.lease_token = None;
        self.leased_by = None;
        self.lease_deadline = None;
    }

    pub fn entity_description(&self) -> String {
        format!(
            "任务 {} (类型: {}, 租户: {})",
            self.id, self.task_type, self.tenant
        )
    }
}

/// 提交任务时的描述
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub task_type: String,
    pub tenant: Tenant,
    pub principal: Principal,
    #[serde(default)]
    pub priority: Option<TaskPriority>,
    #[serde(default)]
    pub input: serde_json::Value,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub parent_task_id: Option<TaskId>,
    #[serde(default)]
    pub periodic_definition_id: Option<Uuid>,
}

impl TaskDescriptor {
    pub fn new(task_type: impl Into<String>, tenant: Tenant, principal: Principal) -> Self {
        Self {
            task_type: task_type.into(),
            tenant,
            principal,
            priority: None,
            input: serde_json::Value::Object(Default::default()),
            max_attempts: None,
            scheduled_for: None,
            idempotency_key: None,
            parent_task_id: None,
            periodic_definition_id: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskFilter {
    pub company: Option<String>,
    pub brand: Option<String>,
    pub status: Option<TaskStatus>,
    pub task_type: Option<String>,
    pub parent_task_id: Option<TaskId>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl TaskFilter {
    pub fn matches(&self, task: &Task) -> bool {
        self.company
            .as_ref()
            .map_or(true, |c| &task.tenant.company == c)
            && self
                .brand
                .as_ref()
                .map_or(true, |b| task.tenant.brand.as_ref() == Some(b))
            && self.status.map_or(true, |s| task.status == s)
            && self
                .task_type
                .as_ref()
                .map_or(true, |t| &task.task_type == t)
            && self
                .parent_task_id
                .map_or(true, |p| task.parent_task_id == Some(p))
    }
}

/// 派发队列的键 `(task_type, priority)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueueKey {
    pub task_type: String,
    pub priority: TaskPriority,
}

impl QueueKey {
    pub fn new(task_type: impl Into<String>, priority: TaskPriority) -> Self {
        Self {
            task_type: task_type.into(),
            priority,
        }
    }
}

impl std::fmt::Display for QueueKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.task_type, self.priority)
    }
}

/// Worker持有的限时租约
#[derive(Debug, Clone)]
pub struct Lease {
    pub task: Task,
    pub token: Uuid,
    pub deadline: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatAck {
    pub deadline: DateTime<Utc>,
    pub cancel_requested: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine_paths() {
        use TaskStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Pending));
        assert!(Processing.can_transition_to(Cancelled));
        assert!(Pending.can_transition_to(Expired));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Processing.can_transition_to(Expired));
        for terminal in [Completed, Failed, Cancelled, Expired] {
            assert!(terminal.is_terminal());
            for next in [Pending, Processing, Completed, Failed, Cancelled, Expired] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_task_error_from_quota_error() {
        let err = TaskError::from(HubError::QuotaExceeded {
            resource: "tokens".into(),
            requested: 100.0,
            remaining: 50.0,
        });
        assert_eq!(err.kind, ErrorKind::QuotaExceeded);
        assert_eq!(err.detail.unwrap()["remaining"], 50.0);
    }

    #[test]
    fn test_filter_matches() {
        let now = Utc::now();
        let task = Task {
            id: TaskId::new(),
            task_type: "chat_completion".into(),
            tenant: Tenant::with_brand("acme", "shoes"),
            principal: "u1".into(),
            priority: TaskPriority::High,
            status: TaskStatus::Pending,
            input: serde_json::json!({}),
            result: None,
            error: None,
            warnings: vec![],
            attempts: 0,
            max_attempts: 3,
            lease_token: None,
            leased_by: None,
            lease_deadline: None,
            cancel_requested: false,
            available_at: now,
            expires_at: None,
            idempotency_key: None,
            parent_task_id: None,
            periodic_definition_id: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
            version: 0,
        };
        let filter = TaskFilter {
            company: Some("acme".into()),
            status: Some(TaskStatus::Pending),
            ..Default::default()
        };
        assert!(filter.matches(&task));
        let other = TaskFilter {
            brand: Some("hats".into()),
            ..Default::default()
        };
        assert!(!other.matches(&task));
        assert_eq!(task.queue_key().to_string(), "chat_completion:high");
    }
}
