use std::time::Duration;

use serde::{Deserialize, Serialize};

/// 重试退避配置：`base × multiplier^(attempts-1)`，叠加抖动后截断到上限
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_seconds: u64,
    pub max_delay_seconds: u64,
    pub multiplier: f64,
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_seconds: 5,
            max_delay_seconds: 600,
            multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.base_delay_seconds == 0 {
            return Err(anyhow::anyhow!("重试基础延迟必须大于0"));
        }
        if self.max_delay_seconds < self.base_delay_seconds {
            return Err(anyhow::anyhow!("重试最大延迟不能小于基础延迟"));
        }
        if self.multiplier < 1.0 {
            return Err(anyhow::anyhow!("重试倍数不能小于1"));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(anyhow::anyhow!("抖动因子必须在0到1之间"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub enabled: bool,
    /// 每次心跳把租约延长 `heartbeat_interval × k`
    pub lease_extension_factor: u32,
    pub default_max_attempts: u32,
    /// 未单独配置TTL的任务类型使用该值
    pub default_pending_ttl_seconds: u64,
    pub recovery_interval_seconds: u64,
    pub recovery_batch_size: usize,
    pub retry: RetryConfig,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            lease_extension_factor: 3,
            default_max_attempts: 3,
            default_pending_ttl_seconds: 24 * 3600,
            recovery_interval_seconds: 10,
            recovery_batch_size: 100,
            retry: RetryConfig::default(),
        }
    }
}

impl DispatcherConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.lease_extension_factor == 0 {
            return Err(anyhow::anyhow!("租约延长因子必须大于0"));
        }
        if self.default_max_attempts == 0 {
            return Err(anyhow::anyhow!("最大尝试次数必须大于0"));
        }
        if self.default_pending_ttl_seconds == 0 {
            return Err(anyhow::anyhow!("待处理任务TTL必须是有限的正数"));
        }
        if self.recovery_interval_seconds == 0 {
            return Err(anyhow::anyhow!("恢复扫描间隔必须大于0"));
        }
        if self.recovery_batch_size == 0 {
            return Err(anyhow::anyhow!("恢复批次大小必须大于0"));
        }
        self.retry.validate()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub tick_seconds: u64,
    pub batch_size: usize,
    /// `catch_up = true` 时一次最多补发的错过次数
    pub catch_up_limit: usize,
    pub leader_lock_ttl_seconds: u64,
    pub publication_max_retries: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_seconds: 10,
            batch_size: 100,
            catch_up_limit: 100,
            leader_lock_ttl_seconds: 30,
            publication_max_retries: 3,
        }
    }
}

impl SchedulerConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_seconds)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.tick_seconds == 0 {
            return Err(anyhow::anyhow!("调度间隔必须大于0"));
        }
        if self.batch_size == 0 {
            return Err(anyhow::anyhow!("调度批次大小必须大于0"));
        }
        if self.leader_lock_ttl_seconds <= self.tick_seconds {
            return Err(anyhow::anyhow!("选主锁TTL必须大于调度间隔"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub enabled: bool,
    pub worker_id: String,
    pub hostname: String,
    /// 监听的任务类型，为空时监听全部已注册类型
    pub queues: Vec<String>,
    /// 单个Worker内的并发处理数
    pub capacity: u32,
    pub heartbeat_interval_seconds: u64,
    pub poll_interval_ms: u64,
    /// 连续错过多少个心跳周期判定为死亡
    pub missed_heartbeats_before_dead: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            worker_id: "worker-001".to_string(),
            hostname: "localhost".to_string(),
            queues: Vec::new(),
            capacity: 4,
            heartbeat_interval_seconds: 10,
            poll_interval_ms: 500,
            missed_heartbeats_before_dead: 3,
        }
    }
}

impl WorkerConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn dead_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(
            (self.heartbeat_interval_seconds * self.missed_heartbeats_before_dead as u64) as i64,
        )
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.worker_id.is_empty() {
            return Err(anyhow::anyhow!("Worker ID不能为空"));
        }
        if self.capacity == 0 {
            return Err(anyhow::anyhow!("Worker并发数必须大于0"));
        }
        if self.heartbeat_interval_seconds == 0 {
            return Err(anyhow::anyhow!("心跳间隔必须大于0"));
        }
        if self.poll_interval_ms == 0 {
            return Err(anyhow::anyhow!("任务轮询间隔必须大于0"));
        }
        if self.missed_heartbeats_before_dead == 0 {
            return Err(anyhow::anyhow!("死亡判定的心跳周期数必须大于0"));
        }
        Ok(())
    }
}
