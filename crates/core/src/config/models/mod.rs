pub mod ai;
pub mod api_observability;
pub mod app_config;
pub mod database;
pub mod dispatcher_worker;
pub mod quota_credentials;

pub use ai::{AiConfig, ModelPrice};
pub use api_observability::{ApiConfig, ObservabilityConfig};
pub use app_config::AppConfig;
pub use database::{DatabaseConfig, QueueConfig};
pub use dispatcher_worker::{DispatcherConfig, RetryConfig, SchedulerConfig, WorkerConfig};
pub use quota_credentials::{AlertsConfig, CredentialsConfig, QuotaConfig};
