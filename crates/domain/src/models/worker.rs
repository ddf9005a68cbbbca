use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Alive,
    Dead,
    Stopped,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Alive => "alive",
            WorkerStatus::Dead => "dead",
            WorkerStatus::Stopped => "stopped",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "alive" => Some(WorkerStatus::Alive),
            "dead" => Some(WorkerStatus::Dead),
            "stopped" => Some(WorkerStatus::Stopped),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerRegistration {
    pub worker_id: String,
    pub hostname: String,
    /// 监听的任务类型队列
    pub queues: Vec<String>,
    pub capacity: u32,
    pub active_tasks: u32,
    pub cpu_percent: f64,
    pub mem_percent: f64,
    pub status: WorkerStatus,
    pub heartbeat_at: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
}

impl WorkerRegistration {
    pub fn new(
        worker_id: impl Into<String>,
        hostname: impl Into<String>,
        queues: Vec<String>,
        capacity: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            hostname: hostname.into(),
            queues,
            capacity,
            active_tasks: 0,
            cpu_percent: 0.0,
            mem_percent: 0.0,
            status: WorkerStatus::Alive,
            heartbeat_at: now,
            registered_at: now,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.status == WorkerStatus::Alive
    }

    pub fn heartbeat_missed(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        now - self.heartbeat_at > timeout
    }

    pub fn available_slots(&self) -> u32 {
        self.capacity.saturating_sub(self.active_tasks)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct WorkerHeartbeat {
    pub active_tasks: u32,
    pub cpu_percent: f64,
    pub mem_percent: f64,
}
