use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use taskhub_domain::{ProviderClient, ProviderRequest, ProviderResponse, SecretString};
use taskhub_errors::{HubError, HubResult};

/// OpenAI兼容的 `/chat/completions` HTTP客户端
///
/// 5xx、429与网络错误映射为 `Retryable`，其余4xx映射为 `Fatal`。
pub struct HttpProviderClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpProviderClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> HubResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HubError::config_error(format!("创建HTTP客户端失败: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

/// 从响应体提取token用量与首个回复
pub fn parse_completion(raw: Value) -> ProviderResponse {
    let usage = raw.get("usage");
    let tokens_in = usage
        .and_then(|u| u.get("prompt_tokens").or_else(|| u.get("input_tokens")))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let tokens_out = usage
        .and_then(|u| u.get("completion_tokens").or_else(|| u.get("output_tokens")))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let content = raw
        .pointer("/choices/0/message")
        .cloned()
        .unwrap_or(Value::Null);
    ProviderResponse {
        tokens_in,
        tokens_out,
        content,
        raw,
    }
}

#[async_trait]
impl ProviderClient for HttpProviderClient {
    async fn complete(
        &self,
        api_key: &SecretString,
        request: &ProviderRequest,
    ) -> HubResult<ProviderResponse> {
        debug!(provider = %request.provider, model = %request.model, "调用AI供应商");
        let response = self
            .http
            .post(self.endpoint())
            .bearer_auth(api_key.expose())
            .json(&request.body)
            .send()
            .await
            .map_err(|e| HubError::Retryable(format!("供应商请求失败: {e}")))?;

        let status = response.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            warn!(provider = %request.provider, %status, "供应商暂时不可用");
            return Err(HubError::Retryable(format!("供应商返回状态码 {status}")));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(HubError::Fatal(format!("供应商拒绝请求 ({status}): {body}")));
        }

        let raw: Value = response
            .json()
            .await
            .map_err(|e| HubError::Retryable(format!("解析供应商响应失败: {e}")))?;
        Ok(parse_completion(raw))
    }
}
