use async_trait::async_trait;

use taskhub_errors::HubResult;

use crate::models::{Alert, AlertChannel};

/// 告警投递的窄接口，邮件与Webhook的实际发送在外部完成
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, channel: &AlertChannel, alert: &Alert) -> HubResult<()>;
}
