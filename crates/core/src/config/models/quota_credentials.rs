use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// 提交前要求公司拥有有效订阅
    pub require_subscription: bool,
    /// 提交时预占并发任务配额
    pub reserve_concurrent_tasks: bool,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            require_subscription: true,
            reserve_concurrent_tasks: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    /// base64编码的32字节主密钥
    pub master_key: Option<String>,
}

impl CredentialsConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        use base64::Engine;

        if let Some(key) = &self.master_key {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(key)
                .map_err(|e| anyhow::anyhow!("凭证主密钥不是有效的base64: {e}"))?;
            if bytes.len() != 32 {
                return Err(anyhow::anyhow!(
                    "凭证主密钥长度必须为32字节，实际为 {}",
                    bytes.len()
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertsConfig {
    pub enabled: bool,
    pub webhook_timeout_seconds: u64,
    pub mail_from: String,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            webhook_timeout_seconds: 10,
            mail_from: "alerts@taskhub.local".to_string(),
        }
    }
}

impl AlertsConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.webhook_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("Webhook超时必须大于0"));
        }
        Ok(())
    }
}
