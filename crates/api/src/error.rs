use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::error;

use taskhub_errors::HubError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Hub(#[from] HubError),

    #[error("缺少请求头: {0}")]
    MissingHeader(&'static str),

    #[error("请求参数错误: {0}")]
    BadRequest(String),

    #[error("请求处理超时")]
    Timeout,

    #[error("未找到资源")]
    NotFound,
}

impl ApiError {
    fn classify(&self) -> (StatusCode, &'static str, Vec<&'static str>) {
        match self {
            ApiError::Hub(err) => match err {
                HubError::UnknownTaskType { .. } => (
                    StatusCode::BAD_REQUEST,
                    "UNKNOWN_TASK_TYPE",
                    vec!["检查 task_type 是否已注册"],
                ),
                HubError::InvalidInput(_)
                | HubError::InvalidCron { .. }
                | HubError::InvalidTimezone(_) => (
                    StatusCode::BAD_REQUEST,
                    "INVALID_INPUT",
                    vec!["按任务类型的输入结构检查请求体"],
                ),
                HubError::Unauthorized(_) => (
                    StatusCode::FORBIDDEN,
                    "UNAUTHORIZED",
                    vec!["确认调用方所属公司与角色"],
                ),
                HubError::QuotaExceeded { .. } => (
                    StatusCode::TOO_MANY_REQUESTS,
                    "QUOTA_EXCEEDED",
                    vec!["等待配额周期滚动或提高上限"],
                ),
                HubError::NotFound { .. } => (StatusCode::NOT_FOUND, "NOT_FOUND", vec![]),
                HubError::Conflict(_) => (
                    StatusCode::CONFLICT,
                    "CONFLICT",
                    vec!["刷新资源状态后重试"],
                ),
                HubError::Overloaded { .. } => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "OVERLOADED",
                    vec!["队列已满，请退避后重试"],
                ),
                _ => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    vec!["系统遇到内部错误，请稍后重试"],
                ),
            },
            ApiError::MissingHeader(_) => (
                StatusCode::UNAUTHORIZED,
                "MISSING_IDENTITY",
                vec!["请求需携带 X-Tenant-Company 与 X-Principal"],
            ),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", vec![]),
            ApiError::Timeout => (StatusCode::REQUEST_TIMEOUT, "TIMEOUT", vec![]),
            ApiError::NotFound => (StatusCode::NOT_FOUND, "NOT_FOUND", vec![]),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type, suggestions) = self.classify();
        if status.is_server_error() {
            error!(error = %self, "请求处理失败");
        }
        let retryable = matches!(&self, ApiError::Hub(err) if err.is_retryable());

        let body = Json(json!({
            "error": {
                "message": self.to_string(),
                "type": error_type,
                "code": status.as_u16(),
                "retryable": retryable,
                "suggestions": suggestions,
                "timestamp": chrono::Utc::now().to_rfc3339(),
            }
        }));
        (status, body).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hub_errors_map_to_status() {
        let cases = [
            (HubError::invalid_input("x"), StatusCode::BAD_REQUEST),
            (
                HubError::UnknownTaskType {
                    task_type: "nope".into(),
                },
                StatusCode::BAD_REQUEST,
            ),
            (HubError::unauthorized("x"), StatusCode::FORBIDDEN),
            (HubError::not_found("任务", "1"), StatusCode::NOT_FOUND),
            (HubError::conflict("x"), StatusCode::CONFLICT),
            (
                HubError::Overloaded {
                    queue: "noop:normal".into(),
                    depth: 10,
                },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (HubError::Internal("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).into_response().status(), status);
        }
        assert_eq!(
            ApiError::MissingHeader("X-Principal").into_response().status(),
            StatusCode::UNAUTHORIZED
        );
    }
}
