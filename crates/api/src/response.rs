use axum::{http::StatusCode, response::IntoResponse, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use taskhub_domain::{Task, TaskError, TaskId, TaskPriority, TaskStatus, Tenant};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl<T> ApiResponse<T>
where
    T: Serialize,
{
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
            timestamp: Utc::now(),
        }
    }

    pub fn success_with_message(data: T, message: impl Into<String>) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: Some(message.into()),
            timestamp: Utc::now(),
        }
    }
}

impl<T> IntoResponse for ApiResponse<T>
where
    T: Serialize,
{
    fn into_response(self) -> axum::response::Response {
        Json(self).into_response()
    }
}

pub fn success<T: Serialize>(data: T) -> impl IntoResponse {
    (StatusCode::OK, ApiResponse::success(data))
}

pub fn created<T: Serialize>(data: T) -> impl IntoResponse {
    (StatusCode::CREATED, ApiResponse::success(data))
}

/// 对外的任务视图，不暴露租约令牌与版本号
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskView {
    pub id: TaskId,
    pub task_type: String,
    pub tenant: Tenant,
    pub principal: String,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub input: Value,
    pub result: Option<Value>,
    pub error: Option<TaskError>,
    pub warnings: Vec<String>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub leased_by: Option<String>,
    pub lease_deadline: Option<DateTime<Utc>>,
    pub cancel_requested: bool,
    pub available_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub idempotency_key: Option<String>,
    pub parent_task_id: Option<TaskId>,
    pub periodic_definition_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<Task> for TaskView {
    fn from(task: Task) -> Self {
        Self {
            id: task.id,
            task_type: task.task_type,
            tenant: task.tenant,
            principal: task.principal,
            priority: task.priority,
            status: task.status,
            input: task.input,
            result: task.result,
            error: task.error,
            warnings: task.warnings,
            attempts: task.attempts,
            max_attempts: task.max_attempts,
            leased_by: task.leased_by,
            lease_deadline: task.lease_deadline,
            cancel_requested: task.cancel_requested,
            available_at: task.available_at,
            expires_at: task.expires_at,
            idempotency_key: task.idempotency_key,
            parent_task_id: task.parent_task_id,
            periodic_definition_id: task.periodic_definition_id,
            created_at: task.created_at,
            started_at: task.started_at,
            completed_at: task.completed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_response_success() {
        let response = ApiResponse::success("ok");
        assert!(response.success);
        assert_eq!(response.data, Some("ok"));
        assert!(response.message.is_none());
        assert!(response.timestamp <= Utc::now());
    }

    #[test]
    fn test_message_omitted_when_absent() {
        let value = serde_json::to_value(ApiResponse::success(1)).unwrap();
        assert!(value.get("message").is_none());
        let value = serde_json::to_value(ApiResponse::success_with_message(1, "已取消")).unwrap();
        assert_eq!(value["message"], "已取消");
    }
}
