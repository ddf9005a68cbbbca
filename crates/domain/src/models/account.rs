use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 公司的订阅状态，提交任务前校验
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub company: String,
    pub plan: String,
    pub active: bool,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Subscription {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.active && self.expires_at.map(|e| e > now).unwrap_or(true)
    }
}

/// 加密存储的供应商凭证
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub company: String,
    pub provider: String,
    /// base64(nonce || ciphertext)
    pub ciphertext: String,
    pub created_at: DateTime<Utc>,
    pub rotated_at: DateTime<Utc>,
}
