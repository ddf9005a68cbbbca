//! 跨crate测试使用的替身实现

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use taskhub_domain::{
    Alert, AlertChannel, Clock, Notifier, Principal, ProviderClient, ProviderRequest,
    ProviderResponse, SecretString, TaskDescriptor, TaskPriority, Tenant,
};
use taskhub_errors::{HubError, HubResult};

/// 手动推进的时钟
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        if let Ok(mut now) = self.now.lock() {
            *now = at;
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.lock().map(|now| *now).unwrap_or_else(|_| Utc::now())
    }
}

/// 按脚本依次返回结果的供应商客户端，并记录收到的请求
#[derive(Default)]
pub struct MockProviderClient {
    script: Mutex<VecDeque<HubResult<ProviderResponse>>>,
    requests: Mutex<Vec<ProviderRequest>>,
    keys: Mutex<Vec<String>>,
}

impl MockProviderClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(self, tokens_in: u64, tokens_out: u64, content: serde_json::Value) -> Self {
        self.push(Ok(ProviderResponse {
            tokens_in,
            tokens_out,
            content,
            raw: serde_json::Value::Null,
        }))
    }

    pub fn fail(self, error: HubError) -> Self {
        self.push(Err(error))
    }

    fn push(self, result: HubResult<ProviderResponse>) -> Self {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(result);
        }
        self
    }

    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn api_keys(&self) -> Vec<String> {
        self.keys.lock().map(|k| k.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ProviderClient for MockProviderClient {
    async fn complete(
        &self,
        api_key: &SecretString,
        request: &ProviderRequest,
    ) -> HubResult<ProviderResponse> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        if let Ok(mut keys) = self.keys.lock() {
            keys.push(api_key.expose().to_string());
        }
        self.script
            .lock()
            .ok()
            .and_then(|mut script| script.pop_front())
            .unwrap_or_else(|| Err(HubError::Fatal("供应商脚本已耗尽".to_string())))
    }
}

/// 记录全部告警投递
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(AlertChannel, Alert)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<(AlertChannel, Alert)> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, channel: &AlertChannel, alert: &Alert) -> HubResult<()> {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push((channel.clone(), alert.clone()));
        }
        Ok(())
    }
}

/// 测试用任务描述构建器，默认租户 `acme`、调用方 `user-1`
pub struct TaskDescriptorBuilder {
    descriptor: TaskDescriptor,
}

impl TaskDescriptorBuilder {
    pub fn new(task_type: &str) -> Self {
        Self {
            descriptor: TaskDescriptor::new(
                task_type,
                Tenant::company("acme"),
                Principal::new("user-1", "acme"),
            ),
        }
    }

    pub fn tenant(mut self, tenant: Tenant) -> Self {
        self.descriptor.principal.company = tenant.company.clone();
        self.descriptor.tenant = tenant;
        self
    }

    pub fn principal(mut self, principal: Principal) -> Self {
        self.descriptor.principal = principal;
        self
    }

    pub fn priority(mut self, priority: TaskPriority) -> Self {
        self.descriptor.priority = Some(priority);
        self
    }

    pub fn input(mut self, input: serde_json::Value) -> Self {
        self.descriptor.input = input;
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.descriptor.max_attempts = Some(max_attempts);
        self
    }

    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.descriptor.scheduled_for = Some(at);
        self
    }

    pub fn idempotency_key(mut self, key: &str) -> Self {
        self.descriptor.idempotency_key = Some(key.to_string());
        self
    }

    pub fn build(self) -> TaskDescriptor {
        self.descriptor
    }
}
