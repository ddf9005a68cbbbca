use std::path::Path;

use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use super::{
    ai::AiConfig,
    api_observability::{ApiConfig, ObservabilityConfig},
    database::{DatabaseConfig, QueueConfig},
    dispatcher_worker::{DispatcherConfig, SchedulerConfig, WorkerConfig},
    quota_credentials::{AlertsConfig, CredentialsConfig, QuotaConfig},
};

const DEFAULT_CONFIG_PATHS: [&str; 3] = [
    "config/taskhub.toml",
    "taskhub.toml",
    "/etc/taskhub/config.toml",
];

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub queue: QueueConfig,
    pub dispatcher: DispatcherConfig,
    pub scheduler: SchedulerConfig,
    pub worker: WorkerConfig,
    pub quota: QuotaConfig,
    pub credentials: CredentialsConfig,
    pub alerts: AlertsConfig,
    pub api: ApiConfig,
    pub observability: ObservabilityConfig,
    pub ai: AiConfig,
}

impl AppConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// 加载顺序:
    /// 1. 内置默认值
    /// 2. 配置文件 (TOML)，未指定时依次尝试默认路径
    /// 3. 环境变量覆盖 (前缀 `TASKHUB_`，层级分隔符 `__`)
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let defaults = ConfigBuilder::try_from(&AppConfig::default()).context("构建默认配置失败")?;
        let mut builder = ConfigBuilder::builder().add_source(defaults);

        match config_path {
            Some(path) => {
                if !Path::new(path).exists() {
                    return Err(anyhow::anyhow!("配置文件不存在: {}", path));
                }
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            }
            None => {
                if let Some(path) = DEFAULT_CONFIG_PATHS.iter().find(|p| Path::new(p).exists()) {
                    builder = builder.add_source(File::new(path, FileFormat::Toml));
                }
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("TASKHUB")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("worker.queues"),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;
        Ok(config)
    }

    /// 从TOML字符串加载配置
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }

    pub fn validate(&self) -> Result<()> {
        self.database.validate().context("数据库配置验证失败")?;
        self.queue.validate().context("队列配置验证失败")?;
        self.dispatcher.validate().context("Dispatcher配置验证失败")?;
        self.scheduler.validate().context("调度器配置验证失败")?;
        self.worker.validate().context("Worker配置验证失败")?;
        self.credentials.validate().context("凭证配置验证失败")?;
        self.alerts.validate().context("告警配置验证失败")?;
        self.api.validate().context("API配置验证失败")?;
        self.observability
            .validate()
            .context("可观测性配置验证失败")?;
        self.ai.validate().context("AI配置验证失败")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scheduler.tick_seconds, 10);
        assert_eq!(config.scheduler.catch_up_limit, 100);
        assert_eq!(config.worker.heartbeat_interval_seconds, 10);
        assert_eq!(config.dispatcher.lease_extension_factor, 3);
        assert_eq!(config.dispatcher.default_max_attempts, 3);
        assert_eq!(config.dispatcher.default_pending_ttl_seconds, 86_400);
        assert_eq!(config.dispatcher.retry.max_delay_seconds, 600);
        assert_eq!(config.queue.max_depth, 10_000);
        assert_eq!(config.worker.dead_after(), chrono::Duration::seconds(30));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = AppConfig::from_toml(
            r#"
            [database]
            url = "sqlite::memory:"

            [worker]
            capacity = 8
            queues = ["chat_completion"]
            "#,
        )
        .unwrap();
        assert_eq!(config.database.url, "sqlite::memory:");
        assert_eq!(config.worker.capacity, 8);
        assert_eq!(config.worker.queues, vec!["chat_completion".to_string()]);
        assert_eq!(config.scheduler.batch_size, 100);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = AppConfig::from_toml("[database]\nurl = \"postgres://db\"").unwrap_err();
        assert!(format!("{err:#}").contains("数据库配置验证失败"));

        let err = AppConfig::from_toml("[credentials]\nmaster_key = \"c2hvcnQ=\"").unwrap_err();
        assert!(format!("{err:#}").contains("32字节"));

        assert!(AppConfig::from_toml("[dispatcher.retry]\njitter_factor = 2.0").is_err());
    }

    #[test]
    fn test_toml_roundtrip() {
        let mut config = AppConfig::default();
        config.ai.pricing.push(super::super::ModelPrice {
            model: "my-model".into(),
            input_per_1k: 0.1,
            output_per_1k: 0.2,
        });
        let text = config.to_toml().unwrap();
        let parsed = AppConfig::from_toml(&text).unwrap();
        assert_eq!(parsed.ai.pricing, config.ai.pricing);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[scheduler]\ntick_seconds = 5\nleader_lock_ttl_seconds = 20").unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let config = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(config.scheduler.tick_seconds, 5);
        assert_eq!(config.scheduler.batch_size, 100);

        assert!(AppConfig::load(Some("/nonexistent/taskhub.toml")).is_err());
    }
}
