use std::collections::VecDeque;
use std::str::FromStr;

use chrono::{DateTime, Duration, LocalResult, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use tracing::{debug, warn};

use taskhub_errors::{HubError, HubResult};

const WEEKDAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// 一次查找最多检查的候选时刻数（跨越DST回拨时会跳过重复的本地时间）
const MAX_CANDIDATES: usize = 4096;

/// DST空档最长按一天计
const MAX_GAP_MINUTES: i64 = 24 * 60;

pub fn parse_timezone(name: &str) -> HubResult<Tz> {
    name.parse::<Tz>()
        .map_err(|_| HubError::InvalidTimezone(name.to_string()))
}

/// 带时区的5字段CRON调度
///
/// 表达式在定义所在时区的本地挂钟上求值，结果以UTC返回：
/// 落入DST空档的本地时间顺延到空档后的第一个有效时刻，
/// 重复出现的本地时间只在较早的那一次触发。
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    timezone: Tz,
    schedule: Schedule,
}

impl CronSchedule {
    pub fn new(expression: &str, timezone: &str) -> HubResult<Self> {
        let timezone = parse_timezone(timezone)?;
        let normalized = normalize_expression(expression).map_err(|message| HubError::InvalidCron {
            expr: expression.to_string(),
            message,
        })?;
        let schedule = Schedule::from_str(&normalized).map_err(|e| HubError::InvalidCron {
            expr: expression.to_string(),
            message: e.to_string(),
        })?;

        debug!(cron = expression, normalized = %normalized, timezone = %timezone, "CRON表达式解析完成");
        Ok(Self {
            expression: expression.to_string(),
            timezone,
            schedule,
        })
    }

    pub fn validate(expression: &str, timezone: &str) -> HubResult<()> {
        Self::new(expression, timezone).map(|_| ())
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// 严格晚于 `after` 的最近一次触发时刻
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let local_start = after.with_timezone(&self.timezone).naive_local();
        // 以UTC承载本地挂钟时间，避免cron在时区上做二次换算
        let wall_clock = Utc.from_utc_datetime(&local_start);

        let next = self
            .schedule
            .after(&wall_clock)
            .take(MAX_CANDIDATES)
            .filter_map(|candidate| self.resolve_local(candidate.naive_utc()))
            .find(|instant| *instant > after);

        if next.is_none() {
            warn!(cron = %self.expression, after = %after, "无法计算下一次触发时间");
        }
        next
    }

    /// 不早于 `at` 的第一次触发时刻
    pub fn first_at_or_after(&self, at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.next_after(at - Duration::milliseconds(1))
    }

    /// `(from, to]` 区间内的触发时刻，最多 `limit` 个
    pub fn occurrences_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
    ) -> Vec<DateTime<Utc>> {
        let mut times = Vec::new();
        let mut cursor = from;
        while times.len() < limit {
            match self.next_after(cursor) {
                Some(next) if next <= to => {
                    times.push(next);
                    cursor = next;
                }
                _ => break,
            }
        }
        times
    }

    pub fn upcoming_times(&self, from: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        let mut times = Vec::with_capacity(count);
        let mut cursor = from;
        while times.len() < count {
            let Some(next) = self.next_after(cursor) else {
                break;
            };
            times.push(next);
            cursor = next;
        }
        times
    }

    /// `[from, to]` 内最晚的至多 `count` 个触发时刻，升序返回
    ///
    /// 从 `to` 向前按倍增的窗口查找，停机很久后也只检查末尾附近的时刻。
    pub fn latest_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        count: usize,
    ) -> Vec<DateTime<Utc>> {
        let mut found: VecDeque<DateTime<Utc>> = VecDeque::with_capacity(count);
        let mut hi = to;
        let mut span = Duration::minutes(1);
        while found.len() < count && hi >= from {
            let lo = (hi - span).max(from);
            let needed = count - found.len();
            let mut window: VecDeque<DateTime<Utc>> = VecDeque::with_capacity(needed);
            let mut cursor = lo - Duration::milliseconds(1);
            while let Some(next) = self.next_after(cursor).filter(|next| *next <= hi) {
                if window.len() == needed {
                    window.pop_front();
                }
                window.push_back(next);
                cursor = next;
            }
            for instant in window.into_iter().rev() {
                found.push_front(instant);
            }
            if lo == from {
                break;
            }
            hi = lo - Duration::milliseconds(1);
            span = span * 2;
        }
        found.into()
    }

    fn resolve_local(&self, local: NaiveDateTime) -> Option<DateTime<Utc>> {
        match self.timezone.from_local_datetime(&local) {
            LocalResult::Single(t) => Some(t.with_timezone(&Utc)),
            LocalResult::Ambiguous(earliest, _) => Some(earliest.with_timezone(&Utc)),
            LocalResult::None => {
                let mut candidate = local;
                for _ in 0..MAX_GAP_MINUTES {
                    candidate += Duration::minutes(1);
                    match self.timezone.from_local_datetime(&candidate) {
                        LocalResult::Single(t) => return Some(t.with_timezone(&Utc)),
                        LocalResult::Ambiguous(earliest, _) => {
                            return Some(earliest.with_timezone(&Utc))
                        }
                        LocalResult::None => continue,
                    }
                }
                None
            }
        }
    }
}

/// 标准5字段表达式转换为cron crate的6字段格式（秒固定为0）
fn normalize_expression(expression: &str) -> Result<String, String> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(format!("需要5个字段，实际为 {} 个", fields.len()));
    }
    let day_of_month = if fields[2] == "?" { "*" } else { fields[2] };
    let day_of_week = translate_day_of_week(fields[4])?;
    Ok(format!(
        "0 {} {} {} {} {}",
        fields[0], fields[1], day_of_month, fields[3], day_of_week
    ))
}

/// 星期字段：0和7都表示周日，支持名称、范围、列表和步长
fn translate_day_of_week(field: &str) -> Result<String, String> {
    if field == "*" || field == "?" {
        return Ok("*".to_string());
    }

    let mut days = [false; 7];
    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => (
                range,
                step.parse::<u32>()
                    .map_err(|_| format!("无效的星期步长: {step}"))?,
            ),
            None => (item, 1),
        };
        if step == 0 {
            return Err("星期步长必须大于0".to_string());
        }

        let (start, end) = if range == "*" {
            (0, 6)
        } else if let Some((a, b)) = range.split_once('-') {
            (parse_weekday(a)?, parse_weekday(b)?)
        } else {
            let day = parse_weekday(range)?;
            // `5/2` 表示从周五起每隔两天
            if item.contains('/') {
                (day, 6.max(day))
            } else {
                (day, day)
            }
        };
        if start > end {
            return Err(format!("无效的星期范围: {range}"));
        }

        let mut day = start;
        while day <= end {
            days[(day % 7) as usize] = true;
            day += step;
        }
    }

    if days.iter().all(|d| *d) {
        return Ok("*".to_string());
    }
    Ok(WEEKDAY_NAMES
        .iter()
        .zip(days.iter())
        .filter(|(_, selected)| **selected)
        .map(|(name, _)| *name)
        .collect::<Vec<_>>()
        .join(","))
}

fn parse_weekday(token: &str) -> Result<u32, String> {
    if let Ok(n) = token.parse::<u32>() {
        if n <= 7 {
            return Ok(n);
        }
        return Err(format!("星期取值超出范围: {n}"));
    }
    let upper = token.to_ascii_uppercase();
    WEEKDAY_NAMES
        .iter()
        .position(|name| *name == upper)
        .map(|i| i as u32)
        .ok_or_else(|| format!("无效的星期名称: {token}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_day_of_week_translation() {
        assert_eq!(translate_day_of_week("*").unwrap(), "*");
        assert_eq!(translate_day_of_week("0").unwrap(), "SUN");
        assert_eq!(translate_day_of_week("7").unwrap(), "SUN");
        assert_eq!(translate_day_of_week("1-5").unwrap(), "MON,TUE,WED,THU,FRI");
        assert_eq!(translate_day_of_week("mon,Fri").unwrap(), "MON,FRI");
        assert_eq!(translate_day_of_week("*/2").unwrap(), "SUN,TUE,THU,SAT");
        assert_eq!(translate_day_of_week("5-7").unwrap(), "SUN,FRI,SAT");
        assert_eq!(translate_day_of_week("0-7").unwrap(), "*");
        assert!(translate_day_of_week("8").is_err());
        assert!(translate_day_of_week("5-1").is_err());
        assert!(translate_day_of_week("*/0").is_err());
        assert!(translate_day_of_week("funday").is_err());
    }

    #[test]
    fn test_normalize_expression() {
        assert_eq!(normalize_expression("0 9 * * 1").unwrap(), "0 0 9 * * MON");
        assert_eq!(normalize_expression("*/15 * ? * *").unwrap(), "0 */15 * * * *");
        assert!(normalize_expression("0 9 * *").is_err());
        assert!(normalize_expression("0 0 9 * * 1").is_err());
    }
}
