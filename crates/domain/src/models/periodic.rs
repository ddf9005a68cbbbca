use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::value_objects::{Principal, TaskId, TaskPriority, Tenant};

/// 周期定义拥有的任务模板
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskTemplate {
    pub task_type: String,
    pub principal: Principal,
    #[serde(default)]
    pub priority: Option<TaskPriority>,
    #[serde(default)]
    pub input: serde_json::Value,
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodicDefinition {
    pub id: Uuid,
    pub tenant: Tenant,
    pub name: String,
    pub template: TaskTemplate,
    /// 标准5字段cron表达式
    pub cron: String,
    /// IANA时区名
    pub timezone: String,
    pub start_at: DateTime<Utc>,
    pub end_at: Option<DateTime<Utc>>,
    pub next_fire_at: Option<DateTime<Utc>>,
    pub last_fire_at: Option<DateTime<Utc>>,
    pub max_fires: Option<u32>,
    pub fires_count: u32,
    pub active: bool,
    pub catch_up: bool,
    pub origin_task_id: Option<TaskId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: i64,
}

impl PeriodicDefinition {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.active
            && self.next_fire_at.map(|n| n <= now).unwrap_or(false)
            && self.end_at.map(|e| e >= now).unwrap_or(true)
            && !self.cap_reached()
    }

    pub fn cap_reached(&self) -> bool {
        self.max_fires
            .map(|max| self.fires_count >= max)
            .unwrap_or(false)
    }

    /// 幂等停用
    pub fn deactivate(&mut self, now: DateTime<Utc>) -> bool {
        if !self.active {
            return false;
        }
        self.active = false;
        self.updated_at = now;
        true
    }
}

/// 日历中对周期定义的一次引用
///
/// 带覆盖的引用由调度器按自己的触发进度单独物化，
/// 不带覆盖的引用只展示定义本身的触发。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalendarAssignment {
    pub definition_id: Uuid,
    #[serde(default)]
    pub cron_override: Option<String>,
    #[serde(default)]
    pub payload_override: Option<serde_json::Value>,
    #[serde(default)]
    pub next_fire_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_fire_at: Option<DateTime<Utc>>,
}

impl CalendarAssignment {
    pub fn new(definition_id: Uuid) -> Self {
        Self {
            definition_id,
            cron_override: None,
            payload_override: None,
            next_fire_at: None,
            last_fire_at: None,
        }
    }

    pub fn with_cron_override(mut self, cron: impl Into<String>) -> Self {
        self.cron_override = Some(cron.into());
        self
    }

    pub fn with_payload_override(mut self, payload: serde_json::Value) -> Self {
        self.payload_override = Some(payload);
        self
    }

    pub fn has_override(&self) -> bool {
        self.cron_override.is_some() || self.payload_override.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Calendar {
    pub id: Uuid,
    pub tenant: Tenant,
    pub name: String,
    pub timezone: String,
    pub assignments: Vec<CalendarAssignment>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub version: i64,
}

impl Calendar {
    /// 各覆盖引用中最早的待触发时刻
    pub fn next_fire_at(&self) -> Option<DateTime<Utc>> {
        self.assignments.iter().filter_map(|a| a.next_fire_at).min()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalendarEntry {
    pub definition_id: Uuid,
    pub name: String,
    pub task_type: String,
    pub fire_at: DateTime<Utc>,
    pub input: serde_json::Value,
}

/// 日历按本地日期分组的一天
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgendaDay {
    pub date: chrono::NaiveDate,
    pub entries: Vec<CalendarEntry>,
}
