use std::sync::Arc;

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use taskhub_domain::{Clock, Credential, CredentialRepository, SecretString};
use taskhub_errors::{HubError, HubResult};
use tracing::info;

const NONCE_LEN: usize = 12;

/// 凭证服务，唯一可以解密供应商密钥的组件
pub struct CredentialService {
    repo: Arc<dyn CredentialRepository>,
    cipher: Aes256Gcm,
    clock: Arc<dyn Clock>,
}

impl CredentialService {
    pub fn new(
        repo: Arc<dyn CredentialRepository>,
        master_key: &[u8],
        clock: Arc<dyn Clock>,
    ) -> HubResult<Self> {
        let cipher = Aes256Gcm::new_from_slice(master_key)
            .map_err(|e| HubError::config_error(format!("无效的凭证主密钥: {e}")))?;
        Ok(Self { repo, cipher, clock })
    }

    /// 从base64编码的主密钥构造
    pub fn from_base64_key(
        repo: Arc<dyn CredentialRepository>,
        master_key_b64: &str,
        clock: Arc<dyn Clock>,
    ) -> HubResult<Self> {
        let key = BASE64
            .decode(master_key_b64)
            .map_err(|e| HubError::config_error(format!("凭证主密钥base64解码失败: {e}")))?;
        Self::new(repo, &key, clock)
    }

    pub fn generate_key() -> [u8; 32] {
        rand::random::<[u8; 32]>()
    }

    /// 加密保存；已存在时视为轮换
    pub async fn store(&self, company: &str, provider: &str, secret: &SecretString) -> HubResult<()> {
        let now = self.clock.now();
        let created_at = self
            .repo
            .get(company, provider)
            .await?
            .map(|c| c.created_at)
            .unwrap_or(now);
        let credential = Credential {
            company: company.to_string(),
            provider: provider.to_string(),
            ciphertext: self.encrypt(secret.expose())?,
            created_at,
            rotated_at: now,
        };
        self.repo.upsert(&credential).await?;
        info!(tenant.company = company, provider, "凭证已保存");
        Ok(())
    }

    /// 替换已有凭证，不存在时返回 `NotFound`
    pub async fn rotate(&self, company: &str, provider: &str, secret: &SecretString) -> HubResult<()> {
        if self.repo.get(company, provider).await?.is_none() {
            return Err(HubError::not_found("凭证", format!("{company}/{provider}")));
        }
        self.store(company, provider, secret).await
    }

    pub async fn get(&self, company: &str, provider: &str) -> HubResult<SecretString> {
        let credential = self
            .repo
            .get(company, provider)
            .await?
            .ok_or_else(|| HubError::not_found("凭证", format!("{company}/{provider}")))?;
        self.decrypt(&credential.ciphertext).map(SecretString::new)
    }

    fn encrypt(&self, plaintext: &str) -> HubResult<String> {
        let nonce_bytes = rand::random::<[u8; NONCE_LEN]>();
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| HubError::internal(format!("凭证加密失败: {e}")))?;

        let mut combined = nonce_bytes.to_vec();
        combined.extend(ciphertext);
        Ok(BASE64.encode(combined))
    }

    fn decrypt(&self, encoded: &str) -> HubResult<String> {
        let combined = BASE64
            .decode(encoded)
            .map_err(|e| HubError::internal(format!("凭证base64解码失败: {e}")))?;
        if combined.len() < NONCE_LEN {
            return Err(HubError::internal("凭证密文格式无效"));
        }
        let (nonce, ciphertext) = combined.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| HubError::internal("凭证解密失败"))?;
        String::from_utf8(plaintext).map_err(|e| HubError::internal(format!("凭证不是有效的UTF-8: {e}")))
    }
}
