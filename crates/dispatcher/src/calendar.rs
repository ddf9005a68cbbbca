use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use taskhub_domain::{
    AgendaDay, Calendar, CalendarAssignment, CalendarEntry, CalendarRepository, Clock,
    PeriodicDefinitionRepository, Tenant,
};
use taskhub_errors::{HubError, HubResult};

use crate::cron_utils::{parse_timezone, CronSchedule};

/// 每个引用在一次查询中最多展开的触发次数
const MAX_OCCURRENCES_PER_ASSIGNMENT: usize = 1000;

/// 编辑日历：由可复用的周期定义组合而成，可逐条覆盖CRON和载荷
///
/// 覆盖引用的首次触发时刻在创建时确定，之后由 [`crate::Scheduler`] 推进。
pub struct CalendarService {
    calendars: Arc<dyn CalendarRepository>,
    periodic: Arc<dyn PeriodicDefinitionRepository>,
    clock: Arc<dyn Clock>,
}

impl CalendarService {
    pub fn new(
        calendars: Arc<dyn CalendarRepository>,
        periodic: Arc<dyn PeriodicDefinitionRepository>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            calendars,
            periodic,
            clock,
        }
    }

    pub async fn create(
        &self,
        tenant: Tenant,
        name: &str,
        timezone: &str,
        assignments: Vec<CalendarAssignment>,
    ) -> HubResult<Calendar> {
        parse_timezone(timezone)?;
        let now = self.clock.now();
        let mut scheduled = Vec::with_capacity(assignments.len());
        for mut assignment in assignments {
            let definition = self
                .periodic
                .get(assignment.definition_id)
                .await?
                .ok_or_else(|| {
                    HubError::not_found("周期定义", assignment.definition_id.to_string())
                })?;
            if definition.tenant.company != tenant.company {
                return Err(HubError::unauthorized(format!(
                    "周期定义 {} 不属于公司 {}",
                    definition.id, tenant.company
                )));
            }
            let cron = assignment
                .cron_override
                .as_deref()
                .unwrap_or(&definition.cron);
            let schedule = CronSchedule::new(cron, &definition.timezone)?;

            assignment.last_fire_at = None;
            assignment.next_fire_at = if assignment.has_override() && definition.active {
                schedule
                    .first_at_or_after(definition.start_at.max(now))
                    .filter(|next| definition.end_at.map(|end| *next <= end).unwrap_or(true))
            } else {
                None
            };
            scheduled.push(assignment);
        }

        let calendar = Calendar {
            id: Uuid::new_v4(),
            tenant,
            name: name.to_string(),
            timezone: timezone.to_string(),
            assignments: scheduled,
            created_at: now,
            version: 0,
        };
        let saved = self.calendars.insert(&calendar).await?;
        info!(calendar.id = %saved.id, calendar.name = %saved.name, assignments = saved.assignments.len(), "日历已创建");
        Ok(saved)
    }

    pub async fn get(&self, id: Uuid) -> HubResult<Calendar> {
        self.calendars
            .get(id)
            .await?
            .ok_or_else(|| HubError::not_found("日历", id.to_string()))
    }

    /// `[from, to]` 内的触发计划，按日历时区的本地日期分组
    pub async fn agenda(
        &self,
        calendar_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> HubResult<Vec<AgendaDay>> {
        if to < from {
            return Err(HubError::invalid_input("查询区间的结束时间早于开始时间"));
        }
        let calendar = self.get(calendar_id).await?;
        let calendar_tz = parse_timezone(&calendar.timezone)?;

        let mut days: BTreeMap<NaiveDate, Vec<CalendarEntry>> = BTreeMap::new();
        for assignment in &calendar.assignments {
            let Some(definition) = self.periodic.get(assignment.definition_id).await? else {
                debug!(calendar.id = %calendar.id, periodic.id = %assignment.definition_id, "日历引用的周期定义已不存在");
                continue;
            };
            if !definition.active {
                continue;
            }

            let cron = assignment
                .cron_override
                .as_deref()
                .unwrap_or(&definition.cron);
            let schedule = CronSchedule::new(cron, &definition.timezone)?;
            let input = merge_payload(
                &definition.template.input,
                assignment.payload_override.as_ref(),
            );

            let window_start = from.max(definition.start_at);
            let window_end = definition.end_at.map(|end| end.min(to)).unwrap_or(to);
            let mut limit = MAX_OCCURRENCES_PER_ASSIGNMENT;
            if let Some(max) = definition.max_fires {
                limit = limit.min(max.saturating_sub(definition.fires_count) as usize);
            }

            for fire_at in schedule.occurrences_between(
                window_start - Duration::milliseconds(1),
                window_end,
                limit,
            ) {
                let date = fire_at.with_timezone(&calendar_tz).date_naive();
                days.entry(date).or_default().push(CalendarEntry {
                    definition_id: definition.id,
                    name: definition.name.clone(),
                    task_type: definition.template.task_type.clone(),
                    fire_at,
                    input: input.clone(),
                });
            }
        }

        Ok(days
            .into_iter()
            .map(|(date, mut entries)| {
                entries.sort_by(|a, b| a.fire_at.cmp(&b.fire_at).then(a.name.cmp(&b.name)));
                AgendaDay { date, entries }
            })
            .collect())
    }
}

/// 顶层字段浅合并，覆盖值优先
pub(crate) fn merge_payload(base: &Value, overlay: Option<&Value>) -> Value {
    match (base, overlay) {
        (Value::Object(base), Some(Value::Object(overlay))) => {
            let mut merged = base.clone();
            for (key, value) in overlay {
                merged.insert(key.clone(), value.clone());
            }
            Value::Object(merged)
        }
        (_, Some(overlay)) => overlay.clone(),
        (base, None) => base.clone(),
    }
}
