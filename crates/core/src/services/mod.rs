pub mod alerts;
pub mod credentials;
pub mod metrics;
pub mod quota;

pub use alerts::AlertEngine;
pub use credentials::CredentialService;
pub use metrics::MetricsService;
pub use quota::QuotaService;
