pub mod components;
pub mod handlers;
pub mod service;

pub use components::{HeartbeatManager, TaskExecutionManager, WorkerLifecycle};
pub use handlers::{
    register_builtin_handlers, AiCompletionHandler, ModelFamily, PricingTable,
    PublishArticleHandler, CHAT_COMPLETION,
};
pub use service::{WorkerService, WorkerServiceBuilder};
