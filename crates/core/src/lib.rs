pub mod config;
pub mod logging;
pub mod retry;
pub mod services;
pub mod task_types;

pub use config::*;
pub use logging::init_logging;
pub use retry::RetryPolicy;
pub use services::*;
pub use task_types::*;
pub use taskhub_errors::{HubError, HubResult};
