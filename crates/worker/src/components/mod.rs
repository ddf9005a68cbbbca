pub mod heartbeat_manager;
pub mod task_execution;
pub mod worker_lifecycle;

pub use heartbeat_manager::{HeartbeatManager, TaskCountFn};
pub use task_execution::{usage_deltas, TaskExecutionManager};
pub use worker_lifecycle::WorkerLifecycle;
