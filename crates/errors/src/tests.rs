#[cfg(test)]
mod error_tests {
    use crate::*;

    #[test]
    fn test_hub_error_display() {
        let not_found = HubError::not_found("任务", "abc");
        assert_eq!(not_found.to_string(), "任务未找到: abc");

        let overloaded = HubError::Overloaded {
            queue: "chat_completion:high".to_string(),
            depth: 10,
        };
        assert_eq!(
            overloaded.to_string(),
            "队列过载: chat_completion:high 当前深度 10"
        );

        let cron = HubError::InvalidCron {
            expr: "* *".to_string(),
            message: "字段数量错误".to_string(),
        };
        assert_eq!(cron.to_string(), "无效的CRON表达式: * * - 字段数量错误");
    }

    #[test]
    fn test_error_kind_mapping() {
        assert_eq!(
            HubError::UnknownTaskType {
                task_type: "x".into()
            }
            .kind(),
            ErrorKind::InvalidInput
        );
        assert_eq!(
            HubError::QuotaExceeded {
                resource: "tokens".into(),
                requested: 100.0,
                remaining: 50.0
            }
            .kind(),
            ErrorKind::QuotaExceeded
        );
        assert_eq!(HubError::Timeout("lease".into()).kind(), ErrorKind::Timeout);
        assert_eq!(HubError::internal("boom").kind(), ErrorKind::Fatal);
        assert_eq!(
            HubError::Cancelled("stop".into()).kind(),
            ErrorKind::Cancelled
        );
    }

    #[test]
    fn test_retryable_classification() {
        assert!(HubError::Retryable("503".into()).is_retryable());
        assert!(HubError::Timeout("lease".into()).is_retryable());
        assert!(HubError::conflict("version").is_retryable());
        assert!(!HubError::invalid_input("bad").is_retryable());
        assert!(!HubError::Fatal("bad".into()).is_retryable());

        assert!(ErrorKind::Retryable.is_retryable());
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(!ErrorKind::QuotaExceeded.is_retryable());
    }

    #[test]
    fn test_error_kind_round_trip_names() {
        for kind in [
            ErrorKind::InvalidInput,
            ErrorKind::Unauthorized,
            ErrorKind::QuotaExceeded,
            ErrorKind::NotFound,
            ErrorKind::Conflict,
            ErrorKind::Overloaded,
            ErrorKind::Retryable,
            ErrorKind::Fatal,
            ErrorKind::Timeout,
            ErrorKind::Cancelled,
        ] {
            assert_eq!(ErrorKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ErrorKind::parse("nope"), None);
    }

    #[test]
    fn test_from_serde_error() {
        let err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let hub: HubError = err.into();
        assert!(matches!(hub, HubError::Serialization(_)));
    }
}
