use chrono::Duration;

use crate::config::RetryConfig;

/// 指数退避策略：`base × multiplier^(attempts-1)`，叠加抖动后不超过上限
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// 第 `attempts` 次尝试失败后的等待时长
    pub fn delay(&self, attempts: u32) -> Duration {
        let base = self.config.base_delay_seconds as f64;
        let max = self.config.max_delay_seconds as f64;
        let exponent = attempts.saturating_sub(1).min(63) as i32;

        let capped = (base * self.config.multiplier.powi(exponent)).min(max);

        // 添加随机抖动以避免雷群效应
        let jitter = capped * self.config.jitter_factor * (rand::random::<f64>() - 0.5) * 2.0;
        let seconds = (capped + jitter).clamp(0.0, max);

        Duration::milliseconds((seconds * 1000.0) as i64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}
