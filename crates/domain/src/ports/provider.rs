use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use taskhub_errors::HubResult;

use crate::value_objects::SecretString;

/// 已转换为目标方言的供应商请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderRequest {
    pub provider: String,
    pub model: String,
    pub body: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderResponse {
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub content: serde_json::Value,
    #[serde(default)]
    pub raw: serde_json::Value,
}

/// AI供应商客户端；5xx与网络错误应返回 `HubError::Retryable`
#[async_trait]
pub trait ProviderClient: Send + Sync {
    async fn complete(
        &self,
        api_key: &SecretString,
        request: &ProviderRequest,
    ) -> HubResult<ProviderResponse>;
}
