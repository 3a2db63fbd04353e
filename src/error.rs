//! Error types for the fusion core

use thiserror::Error;

/// The error taxonomy from the core's error handling design.
///
/// Each variant names one failure kind; the policy for each (retry,
/// log-and-skip, process-fatal) lives with the component that raises it,
/// not here.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("schema invalid: {0}")]
    SchemaInvalid(String),

    #[error("stale or skewed: detected_at {detected_at_ms} outside sanity window of now {now_ms}")]
    StaleOrSkewed { detected_at_ms: i64, now_ms: i64 },

    #[error("duplicate event suppressed for fingerprint {0}")]
    Duplicate(String),

    #[error("bus transient error: {0}")]
    BusTransient(#[from] redis::RedisError),

    #[error("bus fatal error: {0}")]
    BusFatal(String),

    #[error("notification delivery failed: {0}")]
    NotifyDeliveryFailed(#[from] reqwest::Error),

    #[error("route target unavailable: {0}")]
    RouteTargetUnavailable(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;
