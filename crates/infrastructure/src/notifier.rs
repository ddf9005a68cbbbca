use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use taskhub_domain::{Alert, AlertChannel, Notifier};
use taskhub_errors::{HubError, HubResult};

/// 邮件发送的外部接口，SMTP等实际通道不在本系统内实现
#[async_trait]
pub trait MailSender: Send + Sync {
    async fn send(&self, from: &str, recipients: &[String], subject: &str, body: &str)
        -> HubResult<()>;
}

/// 只写日志的邮件发送器，用于未接入外部邮件服务的部署
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingMailSender;

#[async_trait]
impl MailSender for LoggingMailSender {
    async fn send(
        &self,
        from: &str,
        recipients: &[String],
        subject: &str,
        _body: &str,
    ) -> HubResult<()> {
        info!(
            event = "alert_mail",
            mail.from = from,
            mail.recipients = recipients.join(","),
            mail.subject = subject,
            "告警邮件已记录"
        );
        Ok(())
    }
}

/// 按通道类型分发告警：Webhook直接POST JSON，邮件交给 `MailSender`
pub struct ChannelNotifier {
    http: reqwest::Client,
    mail: Arc<dyn MailSender>,
    mail_from: String,
}

impl ChannelNotifier {
    pub fn new(webhook_timeout: Duration, mail: Arc<dyn MailSender>, mail_from: impl Into<String>) -> HubResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(webhook_timeout)
            .build()
            .map_err(|e| HubError::config_error(format!("创建HTTP客户端失败: {e}")))?;
        Ok(Self {
            http,
            mail,
            mail_from: mail_from.into(),
        })
    }

    fn subject(alert: &Alert) -> String {
        format!(
            "[TaskHub] {}: {} {} {}",
            alert.rule_name,
            alert.metric_field.as_str(),
            alert.comparator.as_str(),
            alert.threshold
        )
    }

    fn body(alert: &Alert) -> String {
        format!(
            "规则 {} 在 {} 触发\n租户: {}\n任务类型: {}\n任务: {}\n指标 {} = {} (阈值 {} {})",
            alert.rule_name,
            alert.fired_at.to_rfc3339(),
            alert.company,
            alert.task_type,
            alert
                .task_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| "-".to_string()),
            alert.metric_field.as_str(),
            alert.value,
            alert.comparator.as_str(),
            alert.threshold
        )
    }
}

#[async_trait]
impl Notifier for ChannelNotifier {
    async fn notify(&self, channel: &AlertChannel, alert: &Alert) -> HubResult<()> {
        match channel {
            AlertChannel::Webhook { url } => {
                let response = self
                    .http
                    .post(url)
                    .json(alert)
                    .send()
                    .await
                    .map_err(|e| HubError::Retryable(format!("Webhook请求失败: {e}")))?;
                if !response.status().is_success() {
                    warn!(webhook.url = %url, status = %response.status(), "Webhook返回非成功状态");
                    return Err(HubError::Retryable(format!(
                        "Webhook返回状态码 {}",
                        response.status()
                    )));
                }
                Ok(())
            }
            AlertChannel::Email { recipients } => {
                if recipients.is_empty() {
                    return Ok(());
                }
                self.mail
                    .send(
                        &self.mail_from,
                        recipients,
                        &Self::subject(alert),
                        &Self::body(alert),
                    )
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use taskhub_domain::{Comparator, MetricField};
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct CapturingMail {
        sent: Mutex<Vec<(Vec<String>, String)>>,
    }

    #[async_trait]
    impl MailSender for CapturingMail {
        async fn send(&self, _from: &str, recipients: &[String], subject: &str, _body: &str) -> HubResult<()> {
            self.sent
                .lock()
                .await
                .push((recipients.to_vec(), subject.to_string()));
            Ok(())
        }
    }

    fn alert() -> Alert {
        Alert {
            rule_id: uuid::Uuid::new_v4(),
            rule_name: "slow".into(),
            task_id: None,
            task_type: "chat_completion".into(),
            company: "acme".into(),
            brand: None,
            metric_field: MetricField::ExecutionMs,
            comparator: Comparator::Gt,
            value: 6000.0,
            threshold: 5000.0,
            fired_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_email_channel_uses_mail_sender() {
        let mail = Arc::new(CapturingMail::default());
        let notifier = ChannelNotifier::new(Duration::from_secs(1), mail.clone(), "alerts@acme.test").unwrap();
        let channel = AlertChannel::Email {
            recipients: vec!["ops@acme.test".into()],
        };
        notifier.notify(&channel, &alert()).await.unwrap();

        let sent = mail.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, vec!["ops@acme.test".to_string()]);
        assert!(sent[0].1.contains("slow"));
    }

    #[tokio::test]
    async fn test_unreachable_webhook_is_retryable() {
        let notifier = ChannelNotifier::new(Duration::from_millis(200), Arc::new(LoggingMailSender), "a@b").unwrap();
        let channel = AlertChannel::Webhook {
            url: "http://127.0.0.1:9/hook".into(),
        };
        let err = notifier.notify(&channel, &alert()).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
