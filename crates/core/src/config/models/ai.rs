use serde::{Deserialize, Serialize};

/// 每千token的价格（美元）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPrice {
    /// 模型名或名称前缀
    pub model: String,
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AiConfig {
    pub provider: String,
    pub base_url: String,
    pub request_timeout_seconds: u64,
    /// 覆盖或补充内置价格表
    pub pricing: Vec<ModelPrice>,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            request_timeout_seconds: 120,
            pricing: Vec::new(),
        }
    }
}

impl AiConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.provider.is_empty() {
            return Err(anyhow::anyhow!("AI供应商名称不能为空"));
        }
        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err(anyhow::anyhow!("AI供应商地址必须是HTTP(S) URL: {}", self.base_url));
        }
        for price in &self.pricing {
            if price.input_per_1k < 0.0 || price.output_per_1k < 0.0 {
                return Err(anyhow::anyhow!("模型 {} 的价格不能为负数", price.model));
            }
        }
        Ok(())
    }
}
