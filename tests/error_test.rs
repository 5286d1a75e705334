use std::time::Duration;

use tollgate::{FailureClass, Result, TollgateError};

#[test]
fn error_display() {
    let err = TollgateError::Api {
        status: 503,
        message: "overloaded".into(),
    };
    assert_eq!(err.to_string(), "API error (503): overloaded");
}

#[test]
fn result_alias() {
    fn returns_error() -> Result<()> {
        Err(TollgateError::SchedulerClosed)
    }
    assert!(returns_error().is_err());
}

// ============================================================================
// Failure classification
// ============================================================================

#[test]
fn rate_limit_errors() {
    assert!(TollgateError::RateLimited { retry_after: None }.is_rate_limit());
    assert!(
        TollgateError::Api {
            status: 429,
            message: "quota".into()
        }
        .is_rate_limit()
    );
    assert!(!TollgateError::RateLimited { retry_after: None }.is_transient());
}

#[test]
fn transient_errors() {
    assert!(TollgateError::Http("connection reset".into()).is_transient());
    for status in [500, 502, 503, 504] {
        assert!(
            TollgateError::Api {
                status,
                message: String::new()
            }
            .is_transient(),
            "{status} should be transient"
        );
    }
}

#[test]
fn permanent_errors() {
    let permanent = [
        TollgateError::Api {
            status: 400,
            message: "bad request".into(),
        },
        TollgateError::Api {
            status: 401,
            message: "unauthorized".into(),
        },
        TollgateError::Permanent("unparseable".into()),
        TollgateError::InvalidInput("empty prompt".into()),
        TollgateError::BatchItemMissing,
    ];
    for err in permanent {
        assert_eq!(err.failure_class(), FailureClass::Permanent, "{err}");
    }
}

#[test]
fn from_status_maps_429_to_rate_limited() {
    let err = TollgateError::from_status(429, "slow down", Some(Duration::from_secs(30)));
    assert!(matches!(
        err,
        TollgateError::RateLimited {
            retry_after: Some(d)
        } if d == Duration::from_secs(30)
    ));
    assert_eq!(err.retry_after(), Some(Duration::from_secs(30)));

    let err = TollgateError::from_status(404, "no such model", None);
    assert!(matches!(err, TollgateError::Api { status: 404, .. }));
    assert_eq!(err.retry_after(), None);
}

#[test]
fn json_errors_convert() {
    let err: TollgateError = serde_json::from_str::<u32>("nope").unwrap_err().into();
    assert!(matches!(err, TollgateError::Json(_)));
    assert_eq!(err.failure_class(), FailureClass::Permanent);
}
