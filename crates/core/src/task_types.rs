//! 任务类型注册表
//!
//! 每个任务类型注册 `{name, input_schema, handler, timeout, default_priority,
//! retryable_errors}`，Hub在提交时据此校验，Worker据此派发处理器。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{watch, Mutex};

use taskhub_domain::{
    Clock, QuotaDelta, QuotaResource, SecretString, Task, TaskError, TaskPriority, UsageReport,
};
use taskhub_errors::{ErrorKind, HubError, HubResult};

use crate::services::{CredentialService, QuotaService};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
    Any,
}

impl FieldKind {
    fn accepts(&self, value: &Value) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Number => value.is_number(),
            FieldKind::Integer => value.is_i64() || value.is_u64(),
            FieldKind::Boolean => value.is_boolean(),
            FieldKind::Array => value.is_array(),
            FieldKind::Object => value.is_object(),
            FieldKind::Any => true,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            FieldKind::String => "string",
            FieldKind::Number => "number",
            FieldKind::Integer => "integer",
            FieldKind::Boolean => "boolean",
            FieldKind::Array => "array",
            FieldKind::Object => "object",
            FieldKind::Any => "any",
        }
    }
}

#[derive(Debug, Clone)]
struct FieldSpec {
    name: String,
    kind: FieldKind,
    required: bool,
}

/// 顶层字段的轻量输入约束
#[derive(Debug, Clone, Default)]
pub struct InputSchema {
    fields: Vec<FieldSpec>,
    deny_unknown: bool,
}

impl InputSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required(mut self, name: &str, kind: FieldKind) -> Self {
        self.fields.push(FieldSpec {
            name: name.to_string(),
            kind,
            required: true,
        });
        self
    }

    pub fn optional(mut self, name: &str, kind: FieldKind) -> Self {
        self.fields.push(FieldSpec {
            name: name.to_string(),
            kind,
            required: false,
        });
        self
    }

    pub fn deny_unknown_fields(mut self) -> Self {
        self.deny_unknown = true;
        self
    }

    pub fn validate(&self, input: &Value) -> HubResult<()> {
        let object = input
            .as_object()
            .ok_or_else(|| HubError::invalid_input("任务输入必须是JSON对象"))?;

        for field in &self.fields {
            match object.get(&field.name) {
                None | Some(Value::Null) if field.required => {
                    return Err(HubError::invalid_input(format!(
                        "缺少必填字段: {}",
                        field.name
                    )));
                }
                Some(value) if !value.is_null() && !field.kind.accepts(value) => {
                    return Err(HubError::invalid_input(format!(
                        "字段 {} 类型错误，期望 {}",
                        field.name,
                        field.kind.name()
                    )));
                }
                _ => {}
            }
        }

        if self.deny_unknown {
            if let Some(unknown) = object
                .keys()
                .find(|k| !self.fields.iter().any(|f| &f.name == *k))
            {
                return Err(HubError::invalid_input(format!("未知字段: {unknown}")));
            }
        }
        Ok(())
    }
}

/// 任务类型的静态描述
#[derive(Debug, Clone)]
pub struct TaskTypeSpec {
    pub name: String,
    pub input_schema: InputSchema,
    pub timeout: Duration,
    pub default_priority: TaskPriority,
    /// 额外视为可重试的错误码（`TaskError::code`）
    pub retryable_errors: Vec<String>,
    /// 待处理状态的存活时间，`None` 时使用全局默认值
    pub ttl: Option<chrono::Duration>,
    pub required_role: Option<String>,
    /// 租约前要求仍有剩余额度的资源
    pub quota_resources: Vec<QuotaResource>,
}

impl TaskTypeSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            input_schema: InputSchema::default(),
            timeout: Duration::from_secs(300),
            default_priority: TaskPriority::Normal,
            retryable_errors: Vec::new(),
            ttl: None,
            required_role: None,
            quota_resources: Vec::new(),
        }
    }

    pub fn with_schema(mut self, schema: InputSchema) -> Self {
        self.input_schema = schema;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.default_priority = priority;
        self
    }

    pub fn with_retryable_error(mut self, code: impl Into<String>) -> Self {
        self.retryable_errors.push(code.into());
        self
    }

    pub fn with_ttl(mut self, ttl: chrono::Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_required_role(mut self, role: impl Into<String>) -> Self {
        self.required_role = Some(role.into());
        self
    }

    pub fn consumes(mut self, resource: QuotaResource) -> Self {
        self.quota_resources.push(resource);
        self
    }

    /// 按错误类别与注册的错误码判定是否重试
    pub fn is_retryable(&self, error: &TaskError) -> bool {
        if error.kind.is_retryable() {
            return true;
        }
        if matches!(error.kind, ErrorKind::Cancelled | ErrorKind::InvalidInput) {
            return false;
        }
        error
            .code
            .as_ref()
            .map(|code| self.retryable_errors.iter().any(|c| c == code))
            .unwrap_or(false)
    }
}

/// 处理器成功返回的内容
#[derive(Debug, Clone, Default)]
pub struct HandlerOutput {
    pub result: Value,
    pub quota_usage: Vec<QuotaDelta>,
}

impl HandlerOutput {
    pub fn new(result: Value) -> Self {
        Self {
            result,
            quota_usage: Vec::new(),
        }
    }

    pub fn with_usage(mut self, delta: QuotaDelta) -> Self {
        self.quota_usage.push(delta);
        self
    }
}

/// 任务类型处理器
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, ctx: &HandlerContext, input: Value) -> Result<HandlerOutput, TaskError>;
}

/// 处理器一次调用的上下文
///
/// 凭证明文只在本次调用内可见；取消标志由心跳回传，处理器在检查点读取。
pub struct HandlerContext {
    pub task: Task,
    pub worker_id: String,
    cancel: watch::Receiver<bool>,
    credentials: Arc<CredentialService>,
    quota: Arc<QuotaService>,
    clock: Arc<dyn Clock>,
    usage: Mutex<UsageReport>,
    warnings: Mutex<Vec<String>>,
}

impl HandlerContext {
    pub fn new(
        task: Task,
        worker_id: impl Into<String>,
        cancel: watch::Receiver<bool>,
        credentials: Arc<CredentialService>,
        quota: Arc<QuotaService>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            task,
            worker_id: worker_id.into(),
            cancel,
            credentials,
            quota,
            clock,
            usage: Mutex::new(UsageReport::default()),
            warnings: Mutex::new(Vec::new()),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// 取消检查点
    pub fn checkpoint(&self) -> Result<(), TaskError> {
        if self.is_cancelled() {
            return Err(TaskError::new(ErrorKind::Cancelled, "任务已被请求取消"));
        }
        Ok(())
    }

    /// 等待取消意图；发送端关闭时永久挂起
    pub async fn cancelled(&self) {
        let mut rx = self.cancel.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                futures::future::pending::<()>().await;
            }
        }
    }

    pub async fn credential(&self, provider: &str) -> Result<SecretString, TaskError> {
        self.credentials
            .get(&self.task.tenant.company, provider)
            .await
            .map_err(TaskError::from)
    }

    /// 预检剩余额度，不足时返回 `QuotaExceeded`
    pub async fn ensure_quota(&self, resource: QuotaResource, amount: f64) -> Result<(), TaskError> {
        self.quota
            .ensure_available(&self.task.tenant.company, resource, amount)
            .await
            .map_err(TaskError::from)
    }

    pub async fn report_usage(&self, usage: UsageReport) {
        self.usage.lock().await.merge(&usage);
    }

    pub async fn usage(&self) -> UsageReport {
        *self.usage.lock().await
    }

    pub async fn warn(&self, warning: impl Into<String>) {
        self.warnings.lock().await.push(warning.into());
    }

    pub async fn warnings(&self) -> Vec<String> {
        self.warnings.lock().await.clone()
    }
}

#[derive(Clone)]
pub struct RegisteredTaskType {
    pub spec: Arc<TaskTypeSpec>,
    pub handler: Arc<dyn TaskHandler>,
}

/// 启动时构建，之后以 `Arc` 共享只读使用
#[derive(Clone, Default)]
pub struct TaskTypeRegistry {
    entries: HashMap<String, RegisteredTaskType>,
}

impl TaskTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, spec: TaskTypeSpec, handler: Arc<dyn TaskHandler>) -> HubResult<()> {
        if self.entries.contains_key(&spec.name) {
            return Err(HubError::conflict(format!("任务类型已注册: {}", spec.name)));
        }
        tracing::debug!(task.type = %spec.name, "注册任务类型");
        self.entries.insert(
            spec.name.clone(),
            RegisteredTaskType {
                spec: Arc::new(spec),
                handler,
            },
        );
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredTaskType> {
        self.entries.get(name)
    }

    pub fn spec(&self, name: &str) -> HubResult<Arc<TaskTypeSpec>> {
        self.entries
            .get(name)
            .map(|e| e.spec.clone())
            .ok_or_else(|| HubError::UnknownTaskType {
                task_type: name.to_string(),
            })
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct NoopHandler;

    #[async_trait]
    impl TaskHandler for NoopHandler {
        async fn handle(&self, _ctx: &HandlerContext, input: Value) -> Result<HandlerOutput, TaskError> {
            Ok(HandlerOutput::new(input))
        }
    }

    #[test]
    fn test_schema_validation() {
        let schema = InputSchema::new()
            .required("model", FieldKind::String)
            .optional("max_tokens", FieldKind::Integer)
            .deny_unknown_fields();

        assert!(schema.validate(&json!({"model": "o3"})).is_ok());
        assert!(schema.validate(&json!({"model": "o3", "max_tokens": 5})).is_ok());
        assert!(schema.validate(&json!({"max_tokens": 5})).is_err());
        assert!(schema.validate(&json!({"model": 1})).is_err());
        assert!(schema.validate(&json!({"model": "o3", "max_tokens": 1.5})).is_err());
        assert!(schema.validate(&json!({"model": "o3", "extra": true})).is_err());
        assert!(schema.validate(&json!("o3")).is_err());
    }

    #[test]
    fn test_retryable_classification() {
        let spec = TaskTypeSpec::new("import_csv").with_retryable_error("rate_limited");
        assert!(spec.is_retryable(&TaskError::new(ErrorKind::Retryable, "503")));
        assert!(spec.is_retryable(&TaskError::new(ErrorKind::Timeout, "slow")));
        assert!(spec.is_retryable(
            &TaskError::new(ErrorKind::Fatal, "429").with_code("rate_limited")
        ));
        assert!(!spec.is_retryable(&TaskError::new(ErrorKind::Fatal, "bad")));
        assert!(!spec.is_retryable(&TaskError::new(ErrorKind::QuotaExceeded, "quota")));
    }

    #[test]
    fn test_registry_rejects_duplicates_and_unknown() {
        let mut registry = TaskTypeRegistry::new();
        registry
            .register(TaskTypeSpec::new("noop"), Arc::new(NoopHandler))
            .unwrap();
        assert!(registry
            .register(TaskTypeSpec::new("noop"), Arc::new(NoopHandler))
            .is_err());
        assert!(registry.spec("noop").is_ok());
        assert!(matches!(
            registry.spec("missing"),
            Err(HubError::UnknownTaskType { .. })
        ));
        assert_eq!(registry.names(), vec!["noop".to_string()]);
    }
}
