// Tests for the crate-wide error type: conversions from library errors,
// classification through `kind()` and the structured `report()`.

use super::*;
use std::io;

// ==================== CONVERSION TESTS ====================

#[test]
fn test_io_not_found_keeps_kind_and_code() {
    let err: StorageError = io::Error::new(io::ErrorKind::NotFound, "missing.bin").into();

    match &err {
        StorageError::Io { kind, code, .. } => {
            assert_eq!(*kind, io::ErrorKind::NotFound);
            assert_eq!(code.as_deref(), Some("ENOENT"));
        }
        other => panic!("expected Io, got {:?}", other),
    }
    assert!(err.is_not_found());
    assert_eq!(err.kind(), ErrorKind::File);
}

#[test]
fn test_io_connection_refused_is_network() {
    let err: StorageError = io::Error::new(io::ErrorKind::ConnectionRefused, "refused").into();
    assert_eq!(err.kind(), ErrorKind::Network);
    assert!(!err.is_not_found());
}

#[test]
fn test_io_permission_denied_is_file() {
    let err: StorageError = io::Error::new(io::ErrorKind::PermissionDenied, "read-only").into();
    assert_eq!(err.kind(), ErrorKind::File);
}

#[test]
fn test_io_without_code_falls_back_to_message() {
    let err: StorageError = io::Error::new(io::ErrorKind::Other, "network is unreachable").into();
    assert_eq!(err.kind(), ErrorKind::Network);

    let err: StorageError = io::Error::new(io::ErrorKind::Other, "something odd").into();
    assert_eq!(err.kind(), ErrorKind::Unknown);
}

#[test]
fn test_object_store_not_found_maps_to_not_found() {
    let source: Box<dyn std::error::Error + Send + Sync> = "gone".into();
    let err: StorageError = object_store::Error::NotFound {
        path: "uploads/a.txt".to_string(),
        source,
    }
    .into();

    assert!(matches!(&err, StorageError::NotFound { key } if key == "uploads/a.txt"));
    assert_eq!(err.kind(), ErrorKind::File);
}

#[test]
fn test_object_store_generic_reads_status_from_message() {
    let source: Box<dyn std::error::Error + Send + Sync> =
        "HTTP status server error (503 Service Unavailable)".into();
    let err: StorageError = object_store::Error::Generic {
        store: "S3",
        source,
    }
    .into();

    assert!(err.to_string().contains("S3 store error"));
    assert_eq!(err.kind(), ErrorKind::Server);
}

#[test]
fn test_serde_json_error_converts_to_other() {
    let parse_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
    let err: StorageError = parse_err.into();

    assert!(matches!(err, StorageError::Other(_)));
    assert!(err.to_string().starts_with("serialization error"));
}

#[test]
fn test_rusqlite_error_converts_to_session_store() {
    let err: StorageError = rusqlite::Error::InvalidQuery.into();
    assert!(matches!(err, StorageError::SessionStore(_)));
}

#[test]
fn test_anyhow_error_is_classified_by_text() {
    let err: StorageError = anyhow::anyhow!("upstream said: too many requests").into();
    assert_eq!(err.kind(), ErrorKind::RateLimit);
}

// ==================== KIND TESTS ====================

#[test]
fn test_typed_variants_map_directly() {
    let cases = vec![
        (StorageError::NotInitialized, ErrorKind::Validation),
        (StorageError::NoBackendsAvailable, ErrorKind::Server),
        (
            StorageError::BackendUnavailable("cloud".into()),
            ErrorKind::Server,
        ),
        (StorageError::Timeout("probe".into()), ErrorKind::Network),
        (
            StorageError::NetworkUnavailable { waited_ms: 500 },
            ErrorKind::Network,
        ),
        (
            StorageError::Authentication("bad key".into()),
            ErrorKind::Authentication,
        ),
        (
            StorageError::PermissionDenied("bucket".into()),
            ErrorKind::Permission,
        ),
        (StorageError::RateLimited("slow".into()), ErrorKind::RateLimit),
        (StorageError::Upload("aborted".into()), ErrorKind::Upload),
        (
            StorageError::SessionNotFound("upload_x".into()),
            ErrorKind::Validation,
        ),
    ];

    for (err, expected) in cases {
        assert_eq!(err.kind(), expected, "wrong kind for {:?}", err);
    }
}

#[test]
fn test_http_statuses() {
    assert_eq!(StorageError::http(502, "bad gateway").kind(), ErrorKind::Server);
    assert_eq!(StorageError::http(401, "nope").kind(), ErrorKind::Authentication);
    assert_eq!(StorageError::http(403, "nope").kind(), ErrorKind::Permission);
    assert_eq!(StorageError::http(400, "nope").kind(), ErrorKind::Validation);
    assert_eq!(StorageError::http(408, "slow").kind(), ErrorKind::Network);
    assert_eq!(StorageError::http(429, "slow").kind(), ErrorKind::RateLimit);
}

#[test]
fn test_aggregate_errors_carry_inner_kind() {
    let err = StorageError::AllBackendsFailed {
        attempts: 2,
        last_error: "HTTP 503: unavailable".into(),
        last_kind: ErrorKind::Server,
    };
    assert_eq!(err.kind(), ErrorKind::Server);
    assert_eq!(
        err.to_string(),
        "all 2 storage backends failed; last error: HTTP 503: unavailable"
    );

    let err = StorageError::RecoveryFailed {
        operation: "upload".into(),
        attempts: 4,
        elapsed_ms: 1200,
        kind: ErrorKind::Network,
        message: "connection reset".into(),
    };
    assert_eq!(err.kind(), ErrorKind::Network);
    assert!(err.to_string().contains("after 4 attempts"));
}

// ==================== REPORT TESTS ====================

#[test]
fn test_report_pairs_kind_with_display() {
    let err = StorageError::network("ECONNRESET", "peer hung up");
    let report = err.report();

    assert_eq!(report.kind, ErrorKind::Network);
    assert_eq!(report.message, "network error (ECONNRESET): peer hung up");
}

#[test]
fn test_report_serializes_camel_case_kind() {
    let report = StorageError::RateLimited("quota".into()).report();
    let json = serde_json::to_value(&report).unwrap();

    assert_eq!(json["kind"], "rateLimit");
    assert_eq!(json["message"], "rate limited: quota");

    let back: ErrorReport = serde_json::from_value(json).unwrap();
    assert_eq!(back, report);
}

#[test]
fn test_errors_are_cloneable() {
    let err = StorageError::NotFound { key: "k".into() };
    let copy = err.clone();
    assert_eq!(err.to_string(), copy.to_string());
    assert!(copy.is_not_found());
}
