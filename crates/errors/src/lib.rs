use serde::{Deserialize, Serialize};
use thiserror::Error;

#[cfg(test)]
mod tests;

/// 核心对外暴露的错误分类
///
/// 处理器返回的结构化错误、Hub持久化的失败原因以及告警规则都基于该分类。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidInput,
    Unauthorized,
    QuotaExceeded,
    NotFound,
    Conflict,
    Overloaded,
    Retryable,
    Fatal,
    Timeout,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::QuotaExceeded => "quota_exceeded",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Overloaded => "overloaded",
            ErrorKind::Retryable => "retryable",
            ErrorKind::Fatal => "fatal",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let kind = match value {
            "invalid_input" => ErrorKind::InvalidInput,
            "unauthorized" => ErrorKind::Unauthorized,
            "quota_exceeded" => ErrorKind::QuotaExceeded,
            "not_found" => ErrorKind::NotFound,
            "conflict" => ErrorKind::Conflict,
            "overloaded" => ErrorKind::Overloaded,
            "retryable" => ErrorKind::Retryable,
            "fatal" => ErrorKind::Fatal,
            "timeout" => ErrorKind::Timeout,
            "cancelled" => ErrorKind::Cancelled,
            _ => return None,
        };
        Some(kind)
    }

    /// Worker在该类错误上会按退避策略重试
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Retryable | ErrorKind::Timeout)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 任务编排核心错误类型定义
#[derive(Debug, Error)]
pub enum HubError {
    #[error("输入无效: {0}")]
    InvalidInput(String),

    #[error("未知的任务类型: {task_type}")]
    UnknownTaskType { task_type: String },

    #[error("权限不足: {0}")]
    Unauthorized(String),

    #[error("配额不足: 资源 {resource} 请求 {requested}, 剩余 {remaining}")]
    QuotaExceeded {
        resource: String,
        requested: f64,
        remaining: f64,
    },

    #[error("{entity}未找到: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("并发冲突: {0}")]
    Conflict(String),

    #[error("队列过载: {queue} 当前深度 {depth}")]
    Overloaded { queue: String, depth: usize },

    #[error("可重试错误: {0}")]
    Retryable(String),

    #[error("不可重试错误: {0}")]
    Fatal(String),

    #[error("执行超时: {0}")]
    Timeout(String),

    #[error("任务已取消: {0}")]
    Cancelled(String),

    #[error("无效的CRON表达式: {expr} - {message}")]
    InvalidCron { expr: String, message: String },

    #[error("无效的时区: {0}")]
    InvalidTimezone(String),

    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

pub type HubResult<T> = Result<T, HubError>;

impl HubError {
    pub fn not_found<S: Into<String>>(entity: &'static str, id: S) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }
    pub fn invalid_input<S: Into<String>>(msg: S) -> Self {
        Self::InvalidInput(msg.into())
    }
    pub fn unauthorized<S: Into<String>>(msg: S) -> Self {
        Self::Unauthorized(msg.into())
    }
    pub fn conflict<S: Into<String>>(msg: S) -> Self {
        Self::Conflict(msg.into())
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// 映射到对外的错误分类
    pub fn kind(&self) -> ErrorKind {
        match self {
            HubError::InvalidInput(_)
            | HubError::UnknownTaskType { .. }
            | HubError::InvalidCron { .. }
            | HubError::InvalidTimezone(_) => ErrorKind::InvalidInput,
            HubError::Unauthorized(_) => ErrorKind::Unauthorized,
            HubError::QuotaExceeded { .. } => ErrorKind::QuotaExceeded,
            HubError::NotFound { .. } => ErrorKind::NotFound,
            HubError::Conflict(_) => ErrorKind::Conflict,
            HubError::Overloaded { .. } => ErrorKind::Overloaded,
            HubError::Retryable(_) | HubError::Database(_) => ErrorKind::Retryable,
            HubError::Timeout(_) => ErrorKind::Timeout,
            HubError::Cancelled(_) => ErrorKind::Cancelled,
            HubError::Fatal(_)
            | HubError::Configuration(_)
            | HubError::Serialization(_)
            | HubError::Internal(_) => ErrorKind::Fatal,
        }
    }

    /// 调用方可以带着新状态或退避后重试
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            HubError::Retryable(_)
                | HubError::Timeout(_)
                | HubError::Overloaded { .. }
                | HubError::Conflict(_)
                | HubError::Database(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, HubError::NotFound { .. })
    }

    pub fn user_message(&self) -> &str {
        match self {
            HubError::NotFound { .. } => "请求的资源不存在",
            HubError::InvalidInput(_) | HubError::UnknownTaskType { .. } => "输入数据验证失败",
            HubError::Unauthorized(_) => "您没有执行此操作的权限",
            HubError::QuotaExceeded { .. } => "配额不足",
            HubError::Overloaded { .. } => "系统繁忙，请稍后重试",
            HubError::Conflict(_) => "资源已被修改，请刷新后重试",
            _ => "系统内部错误",
        }
    }
}

impl From<serde_json::Error> for HubError {
    fn from(err: serde_json::Error) -> Self {
        HubError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for HubError {
    fn from(err: anyhow::Error) -> Self {
        HubError::Internal(err.to_string())
    }
}
