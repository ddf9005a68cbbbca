use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use taskhub_core::{HandlerContext, HandlerOutput, TaskHandler};
use taskhub_domain::{
    ErrorKind, ProviderClient, ProviderRequest, QuotaResource, TaskError, UsageReport,
};
use taskhub_errors::HubError;

use super::pricing::PricingTable;
use super::RATE_LIMITED;

pub const CHAT_COMPLETION: &str = "chat_completion";

/// 未指定输出上限时用于配额预检的估计值
const DEFAULT_MAX_TOKENS: u64 = 1024;

/// 按模型名决定请求方言
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
    /// `max_tokens`、字符串内容、`system` 角色
    Legacy,
    /// `gpt-4.1` 系列：结构化消息，支持temperature
    NewGeneration,
    /// `o1`、`o3`、`o3-mini` 等：`max_completion_tokens`，`system` 改写为 `developer`
    Reasoning,
}

impl ModelFamily {
    pub fn classify(model: &str) -> Self {
        let model = model.trim().to_ascii_lowercase();
        let mut chars = model.chars();
        if chars.next() == Some('o') && chars.next().is_some_and(|c| c.is_ascii_digit()) {
            return ModelFamily::Reasoning;
        }
        if model.starts_with("gpt-4.1") {
            return ModelFamily::NewGeneration;
        }
        ModelFamily::Legacy
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelFamily::Legacy => "legacy",
            ModelFamily::NewGeneration => "new_generation",
            ModelFamily::Reasoning => "reasoning",
        }
    }

    fn structured_content(&self) -> bool {
        !matches!(self, ModelFamily::Legacy)
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ChatMessage {
    role: String,
    content: Value,
}

/// 统一的AI任务输入
#[derive(Debug, Clone, Deserialize)]
struct ChatCompletionInput {
    #[serde(default)]
    provider: Option<String>,
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(default)]
    max_tokens: Option<u64>,
    #[serde(default)]
    max_completion_tokens: Option<u64>,
    #[serde(default)]
    temperature: Option<f64>,
    #[serde(default)]
    reasoning_effort: Option<String>,
    #[serde(default)]
    response_format: Option<Value>,
}

impl ChatCompletionInput {
    fn output_limit(&self) -> Option<u64> {
        self.max_completion_tokens.or(self.max_tokens)
    }
}

/// `chat_completion` 处理器：识别模型系列、转换方言、调用供应商并记录用量
pub struct AiCompletionHandler {
    provider: Arc<dyn ProviderClient>,
    pricing: PricingTable,
    default_provider: String,
}

impl AiCompletionHandler {
    pub fn new(provider: Arc<dyn ProviderClient>, pricing: PricingTable, default_provider: String) -> Self {
        Self {
            provider,
            pricing,
            default_provider,
        }
    }

    /// 把统一输入转换为目标系列要求的请求体，返回请求体和需要提示调用方的警告
    fn build_body(
        family: ModelFamily,
        input: &ChatCompletionInput,
    ) -> Result<(Value, Vec<String>), TaskError> {
        let mut warnings = Vec::new();
        let mut body = Map::new();
        body.insert("model".into(), json!(input.model));

        let messages = input
            .messages
            .iter()
            .map(|m| convert_message(family, m))
            .collect::<Result<Vec<_>, _>>()?;
        body.insert("messages".into(), Value::Array(messages));

        match (family, input.output_limit()) {
            (ModelFamily::Legacy, Some(limit)) => {
                body.insert("max_tokens".into(), json!(limit));
            }
            (_, Some(limit)) => {
                body.insert("max_completion_tokens".into(), json!(limit));
            }
            (_, None) => {}
        }

        if let Some(temperature) = input.temperature {
            if family == ModelFamily::Reasoning {
                warnings.push(format!("推理模型 {} 忽略temperature参数", input.model));
            } else {
                body.insert("temperature".into(), json!(temperature));
            }
        }

        if let Some(effort) = &input.reasoning_effort {
            if family == ModelFamily::Reasoning {
                if !matches!(effort.as_str(), "low" | "medium" | "high") {
                    return Err(TaskError::new(
                        ErrorKind::InvalidInput,
                        format!("reasoning_effort 必须是 low、medium 或 high，实际为 {effort}"),
                    ));
                }
                body.insert("reasoning_effort".into(), json!(effort));
            } else {
                warnings.push(format!("模型 {} 不支持reasoning_effort，已忽略", input.model));
            }
        }

        if let Some(format) = &input.response_format {
            body.insert("response_format".into(), format.clone());
        }
        Ok((Value::Object(body), warnings))
    }
}

fn convert_message(family: ModelFamily, message: &ChatMessage) -> Result<Value, TaskError> {
    let role = match (family, message.role.as_str()) {
        (ModelFamily::Reasoning, "system") => "developer",
        (ModelFamily::Legacy | ModelFamily::NewGeneration, "developer") => "system",
        (_, role @ ("system" | "developer" | "user" | "assistant" | "tool")) => role,
        (_, other) => {
            return Err(TaskError::new(
                ErrorKind::InvalidInput,
                format!("不支持的消息角色: {other}"),
            ))
        }
    };

    let content = if family.structured_content() {
        match &message.content {
            Value::String(text) => json!([{"type": "text", "text": text}]),
            Value::Array(parts) => Value::Array(parts.clone()),
            other => return Err(invalid_content(other)),
        }
    } else {
        match &message.content {
            Value::String(text) => json!(text),
            Value::Array(parts) => {
                let texts: Vec<&str> = parts
                    .iter()
                    .filter_map(|p| p.get("text").and_then(Value::as_str))
                    .collect();
                json!(texts.join("\n"))
            }
            other => return Err(invalid_content(other)),
        }
    };
    Ok(json!({"role": role, "content": content}))
}

fn invalid_content(value: &Value) -> TaskError {
    TaskError::new(
        ErrorKind::InvalidInput,
        format!("消息内容必须是字符串或内容片段数组: {value}"),
    )
}

/// 供应商错误映射为任务错误；限流附带可重试错误码
fn provider_error(err: HubError) -> TaskError {
    let rate_limited = matches!(&err, HubError::Retryable(msg) if msg.contains("429"));
    let error = TaskError::from(err);
    if rate_limited {
        error.with_code(RATE_LIMITED)
    } else {
        error
    }
}

#[async_trait]
impl TaskHandler for AiCompletionHandler {
    async fn handle(&self, ctx: &HandlerContext, input: Value) -> Result<HandlerOutput, TaskError> {
        let input: ChatCompletionInput = serde_json::from_value(input).map_err(|e| {
            TaskError::new(ErrorKind::InvalidInput, format!("AI任务输入格式错误: {e}"))
        })?;
        if input.messages.is_empty() {
            return Err(TaskError::new(ErrorKind::InvalidInput, "messages 不能为空"));
        }

        let family = ModelFamily::classify(&input.model);
        let (body, warnings) = Self::build_body(family, &input)?;
        for warning in warnings {
            ctx.warn(warning).await;
        }
        debug!(task.id = %ctx.task.id, model = %input.model, family = family.as_str(), "AI请求方言已确定");

        // 预检：请求的输出上限超过剩余额度时不调用供应商
        let estimate = input.output_limit().unwrap_or(DEFAULT_MAX_TOKENS);
        ctx.ensure_quota(QuotaResource::Tokens, estimate as f64).await?;
        ctx.checkpoint()?;

        let provider = input
            .provider
            .clone()
            .unwrap_or_else(|| self.default_provider.clone());
        let api_key = ctx.credential(&provider).await?;
        let request = ProviderRequest {
            provider: provider.clone(),
            model: input.model.clone(),
            body,
        };

        let response = tokio::select! {
            response = self.provider.complete(&api_key, &request) => response.map_err(provider_error)?,
            _ = ctx.cancelled() => {
                return Err(TaskError::new(ErrorKind::Cancelled, "等待供应商响应时任务被取消"));
            }
        };
        drop(api_key);

        let cost = match self.pricing.cost(&input.model, response.tokens_in, response.tokens_out) {
            Some(cost) => cost,
            None => {
                warn!(model = %input.model, "价格表中没有该模型，费用记为0");
                ctx.warn(format!("模型 {} 没有价格信息", input.model)).await;
                0.0
            }
        };
        ctx.report_usage(UsageReport {
            api_calls: 1,
            tokens_in: response.tokens_in,
            tokens_out: response.tokens_out,
            cost,
            ..UsageReport::default()
        })
        .await;

        info!(
            task.id = %ctx.task.id,
            model = %input.model,
            family = family.as_str(),
            tokens_in = response.tokens_in,
            tokens_out = response.tokens_out,
            cost,
            "AI任务完成"
        );
        Ok(HandlerOutput::new(json!({
            "model": input.model,
            "family": family.as_str(),
            "message": response.content,
            "usage": {
                "tokens_in": response.tokens_in,
                "tokens_out": response.tokens_out,
                "cost": cost,
            },
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(value: Value) -> ChatCompletionInput {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_classify_model_family() {
        assert_eq!(ModelFamily::classify("o3"), ModelFamily::Reasoning);
        assert_eq!(ModelFamily::classify("o3-mini"), ModelFamily::Reasoning);
        assert_eq!(ModelFamily::classify("o1-preview"), ModelFamily::Reasoning);
        assert_eq!(ModelFamily::classify("gpt-4.1"), ModelFamily::NewGeneration);
        assert_eq!(ModelFamily::classify("gpt-4.1-mini"), ModelFamily::NewGeneration);
        assert_eq!(ModelFamily::classify("gpt-4o"), ModelFamily::Legacy);
        assert_eq!(ModelFamily::classify("omni-moderation"), ModelFamily::Legacy);
    }

    #[test]
    fn test_reasoning_dialect() {
        let (body, warnings) = AiCompletionHandler::build_body(
            ModelFamily::Reasoning,
            &input(json!({
                "model": "o3",
                "messages": [{"role": "system", "content": "be brief"}],
                "max_tokens": 500,
                "temperature": 0.2,
                "reasoning_effort": "high"
            })),
        )
        .unwrap();
        assert_eq!(body["messages"][0]["role"], "developer");
        assert_eq!(body["messages"][0]["content"][0]["text"], "be brief");
        assert_eq!(body["max_completion_tokens"], 500);
        assert!(body.get("max_tokens").is_none());
        assert!(body.get("temperature").is_none());
        assert_eq!(body["reasoning_effort"], "high");
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn test_legacy_dialect_flattens_content() {
        let (body, warnings) = AiCompletionHandler::build_body(
            ModelFamily::Legacy,
            &input(json!({
                "model": "gpt-3.5-turbo",
                "messages": [{
                    "role": "developer",
                    "content": [{"type": "text", "text": "a"}, {"type": "text", "text": "b"}]
                }],
                "max_completion_tokens": 64,
                "temperature": 0.7,
                "reasoning_effort": "low"
            })),
        )
        .unwrap();
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][0]["content"], "a\nb");
        assert_eq!(body["max_tokens"], 64);
        assert_eq!(body["temperature"], 0.7);
        assert!(body.get("reasoning_effort").is_none());
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn test_invalid_reasoning_effort_and_role() {
        let err = AiCompletionHandler::build_body(
            ModelFamily::Reasoning,
            &input(json!({
                "model": "o3",
                "messages": [{"role": "user", "content": "hi"}],
                "reasoning_effort": "extreme"
            })),
        )
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidInput);

        let err = AiCompletionHandler::build_body(
            ModelFamily::NewGeneration,
            &input(json!({
                "model": "gpt-4.1",
                "messages": [{"role": "narrator", "content": "hi"}]
            })),
        )
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidInput);
    }

    #[test]
    fn test_rate_limit_gets_retryable_code() {
        let err = provider_error(HubError::Retryable("供应商返回状态码 429 Too Many Requests".into()));
        assert_eq!(err.code.as_deref(), Some(RATE_LIMITED));
        let err = provider_error(HubError::Fatal("bad request".into()));
        assert_eq!(err.kind, ErrorKind::Fatal);
        assert_eq!(err.code, None);
    }
}
