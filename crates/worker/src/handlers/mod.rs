//! 内置任务处理器

pub mod ai_completion;
pub mod pricing;
pub mod publish_article;

use std::sync::Arc;
use std::time::Duration;

use taskhub_core::{AiConfig, FieldKind, InputSchema, TaskTypeRegistry, TaskTypeSpec};
use taskhub_dispatcher::{PublicationWorkflow, PUBLISH_ARTICLE};
use taskhub_domain::{ProviderClient, QuotaResource, TaskPriority, ROLE_ADMIN};
use taskhub_errors::HubResult;

pub use ai_completion::{AiCompletionHandler, ModelFamily, CHAT_COMPLETION};
pub use pricing::PricingTable;
pub use publish_article::PublishArticleHandler;

/// 供应商限流时返回的错误码，注册为可重试
pub const RATE_LIMITED: &str = "rate_limited";

/// 注册 `chat_completion` 与 `publish_article`
pub fn register_builtin_handlers(
    registry: &mut TaskTypeRegistry,
    provider: Arc<dyn ProviderClient>,
    ai: &AiConfig,
    workflow: Arc<PublicationWorkflow>,
) -> HubResult<()> {
    let chat = TaskTypeSpec::new(CHAT_COMPLETION)
        .with_schema(
            InputSchema::new()
                .required("model", FieldKind::String)
                .required("messages", FieldKind::Array)
                .optional("provider", FieldKind::String)
                .optional("max_tokens", FieldKind::Integer)
                .optional("max_completion_tokens", FieldKind::Integer)
                .optional("temperature", FieldKind::Number)
                .optional("reasoning_effort", FieldKind::String)
                .optional("response_format", FieldKind::Object)
                .optional("message_format", FieldKind::String),
        )
        // 供应商请求超时之外留出余量
        .with_timeout(Duration::from_secs(ai.request_timeout_seconds + 30))
        .with_priority(TaskPriority::Normal)
        .with_retryable_error(RATE_LIMITED)
        .consumes(QuotaResource::Tokens)
        .consumes(QuotaResource::Cost);
    registry.register(
        chat,
        Arc::new(AiCompletionHandler::new(
            provider,
            PricingTable::with_overrides(&ai.pricing),
            ai.provider.clone(),
        )),
    )?;

    let publish = TaskTypeSpec::new(PUBLISH_ARTICLE)
        .with_schema(InputSchema::new().required("content_id", FieldKind::String))
        .with_timeout(Duration::from_secs(30))
        .with_priority(TaskPriority::High)
        .with_required_role(ROLE_ADMIN);
    registry.register(publish, Arc::new(PublishArticleHandler::new(workflow)))?;
    Ok(())
}
