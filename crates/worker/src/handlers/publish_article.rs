use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use taskhub_core::{HandlerContext, HandlerOutput, TaskHandler};
use taskhub_dispatcher::PublicationWorkflow;
use taskhub_domain::{ErrorKind, Principal, TaskError, ROLE_ADMIN};
use taskhub_errors::HubError;

/// `publish_article` 处理器：把内容迁移到 `published` 并同步可见性
pub struct PublishArticleHandler {
    workflow: Arc<PublicationWorkflow>,
}

impl PublishArticleHandler {
    pub fn new(workflow: Arc<PublicationWorkflow>) -> Self {
        Self { workflow }
    }
}

#[async_trait]
impl TaskHandler for PublishArticleHandler {
    async fn handle(&self, ctx: &HandlerContext, input: Value) -> Result<HandlerOutput, TaskError> {
        let content_id = input
            .get("content_id")
            .and_then(Value::as_str)
            .ok_or_else(|| TaskError::new(ErrorKind::InvalidInput, "缺少 content_id"))?;
        ctx.checkpoint()?;

        // 提交时已校验admin角色
        let principal = Principal::new(ctx.task.principal.clone(), ctx.task.tenant.company.clone())
            .with_role(ROLE_ADMIN);
        let status = self
            .workflow
            .publish(content_id, &principal)
            .await
            .map_err(|e| match e {
                // 版本冲突说明有并发编辑，稍后重试
                HubError::Conflict(msg) => TaskError::new(ErrorKind::Retryable, msg),
                other => TaskError::from(other),
            })?;

        info!(task.id = %ctx.task.id, content.id = content_id, "内容已发布");
        Ok(HandlerOutput::new(json!({
            "content_id": status.content_id,
            "state": status.state.as_str(),
            "published": status.content_published,
        })))
    }
}
