//! Dispatcher
//!
//! 任务中心（全部状态迁移的入口）、周期调度器、日历、恢复服务、
//! Worker失效检测以及内容发布工作流。

pub mod calendar;
pub mod cron_utils;
pub mod publication;
pub mod recovery_service;
pub mod scheduler;
pub mod task_hub;
pub mod worker_failure_detector;

pub use calendar::CalendarService;
pub use cron_utils::{parse_timezone, CronSchedule};
pub use publication::{PublicationTaskHook, PublicationWorkflow, PUBLISH_ARTICLE};
pub use recovery_service::{RecoveryReport, RecoveryService};
pub use scheduler::{PeriodicRequest, Scheduler, TickReport};
pub use task_hub::{CompletionReport, FailureReport, ReclaimCause, TaskHub};
pub use worker_failure_detector::{WorkerFailureDetector, WorkerFailureDetectorConfig};
