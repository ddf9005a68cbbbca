//! SQLite行与领域类型之间的转换工具

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use uuid::Uuid;

use taskhub_errors::{HubError, HubResult};

pub(crate) fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn opt_millis(at: Option<DateTime<Utc>>) -> Option<i64> {
    at.map(millis)
}

pub(crate) fn from_millis(value: i64) -> HubResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(value)
        .ok_or_else(|| HubError::internal(format!("无效的时间戳: {value}")))
}

pub(crate) fn opt_from_millis(value: Option<i64>) -> HubResult<Option<DateTime<Utc>>> {
    value.map(from_millis).transpose()
}

pub(crate) fn to_json<T: Serialize>(value: &T) -> HubResult<String> {
    Ok(serde_json::to_string(value)?)
}

pub(crate) fn from_json<T: DeserializeOwned>(value: &str) -> HubResult<T> {
    Ok(serde_json::from_str(value)?)
}

pub(crate) fn parse_uuid(value: &str) -> HubResult<Uuid> {
    Uuid::parse_str(value).map_err(|e| HubError::internal(format!("无效的UUID {value}: {e}")))
}

pub(crate) fn parse_enum<T>(value: &str, parse: fn(&str) -> Option<T>, what: &str) -> HubResult<T> {
    parse(value).ok_or_else(|| HubError::internal(format!("无效的{what}: {value}")))
}

/// 唯一约束冲突映射为 `Conflict`，其余保留为数据库错误
pub(crate) fn map_unique_violation(err: sqlx::Error, message: impl FnOnce() -> String) -> HubError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => HubError::conflict(message()),
        _ => HubError::Database(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_millis_roundtrip_truncates_to_millis() {
        let now = Utc::now();
        let restored = from_millis(millis(now)).unwrap();
        assert_eq!(restored.timestamp_millis(), now.timestamp_millis());
        assert!(opt_from_millis(None).unwrap().is_none());
    }

    #[test]
    fn test_invalid_values() {
        assert!(parse_uuid("not-a-uuid").is_err());
        assert!(parse_enum("bogus", taskhub_domain::TaskStatus::parse, "任务状态").is_err());
    }
}
