//! Error classification and retry/backoff policy for the job pipeline engine.
//!
//! Ground truth: `stream_worker::error::{ErrorCategory, RetryStrategy}` in the
//! teacher repo (a closed enum of categories, each owning its own retry
//! strategy), generalized here to the closed `JobErrorKind` taxonomy and the
//! exact classification order the pipeline spec requires.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::{error, info, warn};

/// Closed set of error kinds a raw failure classifies into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobErrorKind {
    DatabaseError,
    RedisError,
    NetworkError,
    TimeoutError,
    ExternalServiceError,
    WorkerError,
    ValidationError,
    UnknownError,
}

impl fmt::Display for JobErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::DatabaseError => "DATABASE_ERROR",
            Self::RedisError => "REDIS_ERROR",
            Self::NetworkError => "NETWORK_ERROR",
            Self::TimeoutError => "TIMEOUT_ERROR",
            Self::ExternalServiceError => "EXTERNAL_SERVICE_ERROR",
            Self::WorkerError => "WORKER_ERROR",
            Self::ValidationError => "VALIDATION_ERROR",
            Self::UnknownError => "UNKNOWN_ERROR",
        };
        f.write_str(s)
    }
}

/// Severity assigned alongside a `JobErrorKind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// A classified failure, carrying everything the worker needs to decide
/// whether to retry and what to log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobError {
    pub kind: JobErrorKind,
    pub severity: Severity,
    pub message: String,
    pub code: Option<String>,
    pub context: Option<serde_json::Value>,
    pub original_error: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub job_id: Option<String>,
    pub queue_name: Option<String>,
    pub retry_count: Option<u32>,
}

/// Extra fields merged into a `JobError` at the point it is raised.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    pub job_id: Option<String>,
    pub queue_name: Option<String>,
    pub retry_count: Option<u32>,
    pub code: Option<String>,
    pub context: Option<serde_json::Value>,
}

/// Classify a raw failure message into `(kind, severity)`.
///
/// Rules are evaluated in order; the first match wins. `connection refused`
/// classifies as `REDIS_ERROR`, not `NETWORK_ERROR` — a deliberate priority
/// choice preserved from the distilled spec.
pub fn classify_message(message: &str) -> (JobErrorKind, Severity) {
    let lower = message.to_lowercase();
    if contains_any(&lower, &["database", "prisma", "sql"]) {
        (JobErrorKind::DatabaseError, Severity::High)
    } else if contains_any(&lower, &["redis", "connection refused", "econnrefused"]) {
        (JobErrorKind::RedisError, Severity::High)
    } else if contains_any(&lower, &["network", "timeout", "timed out", "econnreset"]) {
        (JobErrorKind::NetworkError, Severity::Medium)
    } else if contains_any(&lower, &["api", "service", "http", "external"]) {
        (JobErrorKind::ExternalServiceError, Severity::Medium)
    } else {
        (JobErrorKind::UnknownError, Severity::Medium)
    }
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

impl JobError {
    /// Classify a raw message, filling in the mandatory fields.
    pub fn classify(message: impl Into<String>, ctx: ErrorContext) -> Self {
        let message = message.into();
        let (kind, severity) = classify_message(&message);
        Self {
            kind,
            severity,
            message,
            code: ctx.code,
            context: ctx.context,
            original_error: None,
            timestamp: Utc::now(),
            job_id: ctx.job_id,
            queue_name: ctx.queue_name,
            retry_count: ctx.retry_count,
        }
    }

    /// Classify an underlying error, keeping its `Display` output as
    /// `original_error`.
    pub fn classify_error(err: &(impl std::error::Error + ?Sized), ctx: ErrorContext) -> Self {
        let mut job_error = Self::classify(err.to_string(), ctx);
        job_error.original_error = Some(err.to_string());
        job_error
    }

    /// Builds a `VALIDATION_ERROR` directly, bypassing message classification.
    ///
    /// Input validation is a local, action-declared rejection (malformed
    /// payload, missing required field) rather than a raw failure that
    /// needs substring classification — callers that already know the kind
    /// construct it this way so a message containing e.g. "timeout" isn't
    /// misclassified as `NETWORK_ERROR`.
    pub fn validation(message: impl Into<String>, ctx: ErrorContext) -> Self {
        Self {
            kind: JobErrorKind::ValidationError,
            severity: Severity::Medium,
            message: message.into(),
            code: ctx.code,
            context: ctx.context,
            original_error: None,
            timestamp: Utc::now(),
            job_id: ctx.job_id,
            queue_name: ctx.queue_name,
            retry_count: ctx.retry_count,
        }
    }

    /// Emit the structured log record for this error, at a level keyed by
    /// severity: CRITICAL/HIGH -> error, MEDIUM -> warn, LOW -> info.
    pub fn log(&self) {
        match self.severity {
            Severity::Critical | Severity::High => error!(
                kind = %self.kind,
                severity = ?self.severity,
                message = %self.message,
                code = ?self.code,
                job_id = ?self.job_id,
                queue_name = ?self.queue_name,
                retry_count = ?self.retry_count,
                timestamp = %self.timestamp.to_rfc3339(),
                "job error"
            ),
            Severity::Medium => warn!(
                kind = %self.kind,
                severity = ?self.severity,
                message = %self.message,
                code = ?self.code,
                job_id = ?self.job_id,
                queue_name = ?self.queue_name,
                retry_count = ?self.retry_count,
                timestamp = %self.timestamp.to_rfc3339(),
                "job error"
            ),
            Severity::Low => info!(
                kind = %self.kind,
                severity = ?self.severity,
                message = %self.message,
                code = ?self.code,
                job_id = ?self.job_id,
                queue_name = ?self.queue_name,
                retry_count = ?self.retry_count,
                timestamp = %self.timestamp.to_rfc3339(),
                "job error"
            ),
        }
    }

    /// Whether this error is eligible for retry given `max_retries`.
    ///
    /// True iff `retry_count < max_retries`, severity isn't `Critical`, and
    /// kind isn't `ValidationError`.
    pub fn should_retry(&self, max_retries: u32) -> bool {
        let retry_count = self.retry_count.unwrap_or(0);
        retry_count < max_retries
            && self.severity != Severity::Critical
            && self.kind != JobErrorKind::ValidationError
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for JobError {}

/// Wraps a classified `JobError` as a propagatable error type.
#[derive(Debug, Error, Clone, Serialize, Deserialize)]
#[error("{0}")]
pub struct QueueError(pub JobError);

impl From<JobError> for QueueError {
    fn from(err: JobError) -> Self {
        Self(err)
    }
}

impl QueueError {
    pub fn job_error(&self) -> &JobError {
        &self.0
    }

    pub fn should_retry(&self, max_retries: u32) -> bool {
        self.0.should_retry(max_retries)
    }
}

/// Backoff policy parameters. Defaults match spec.md §4.1.
#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    pub backoff_ms: i64,
    pub backoff_multiplier: f64,
    pub max_backoff_ms: i64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            backoff_ms: 1000,
            backoff_multiplier: 2.0,
            max_backoff_ms: 30_000,
        }
    }
}

/// `min(maxBackoffMs, backoffMs * backoffMultiplier^retryCount)`.
///
/// This is a pure math function: negative/zero retry counts are not
/// clamped (the raw exponent is applied), and an out-of-range
/// `backoff_multiplier` simply flows through the formula — callers are
/// responsible for passing legal ranges.
pub fn calculate_backoff(retry_count: i32, config: &BackoffConfig) -> i64 {
    let raw = config.backoff_ms as f64 * config.backoff_multiplier.powi(retry_count);
    let raw = raw.abs().round() as i64;
    raw.min(config.max_backoff_ms)
}

/// Default `maxRetries` per spec.md §4.1.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Awaits `op()`; on failure, classifies the error and returns a
/// `QueueError` carrying the merged context. Mirrors the teacher's
/// `withErrorHandling`-style boundary wrapper.
pub async fn with_error_handling<T, E, F, Fut>(
    op: F,
    ctx: ErrorContext,
) -> Result<T, QueueError>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    match op().await {
        Ok(value) => Ok(value),
        Err(err) => {
            let job_error = JobError::classify(err.to_string(), ctx);
            job_error.log();
            Err(QueueError(job_error))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_priority_database_over_network() {
        let (kind, severity) = classify_message("Database network timeout");
        assert_eq!(kind, JobErrorKind::DatabaseError);
        assert_eq!(severity, Severity::High);
    }

    #[test]
    fn classification_priority_redis_over_network() {
        let (kind, severity) = classify_message("Redis connection timeout");
        assert_eq!(kind, JobErrorKind::RedisError);
        assert_eq!(severity, Severity::High);
    }

    #[test]
    fn classification_network_timeout() {
        let (kind, severity) = classify_message("Network timeout error");
        assert_eq!(kind, JobErrorKind::NetworkError);
        assert_eq!(severity, Severity::Medium);
    }

    #[test]
    fn connection_refused_classifies_as_redis_not_network() {
        let (kind, _) = classify_message("connection refused");
        assert_eq!(kind, JobErrorKind::RedisError);
    }

    #[test]
    fn validation_constructor_bypasses_message_classification() {
        let err = JobError::validation("timeout field is required", ErrorContext::default());
        assert_eq!(err.kind, JobErrorKind::ValidationError);
        assert!(!err.should_retry(DEFAULT_MAX_RETRIES));
    }

    #[test]
    fn classification_is_case_insensitive() {
        let (kind, _) = classify_message("DATABASE CONNECTION LOST");
        assert_eq!(kind, JobErrorKind::DatabaseError);
    }

    #[test]
    fn classification_defaults_to_unknown() {
        let (kind, severity) = classify_message("something broke");
        assert_eq!(kind, JobErrorKind::UnknownError);
        assert_eq!(severity, Severity::Medium);
    }

    #[test]
    fn backoff_math_matches_example() {
        let config = BackoffConfig {
            backoff_ms: 100,
            backoff_multiplier: 2.0,
            max_backoff_ms: 30_000,
        };
        assert_eq!(calculate_backoff(2, &config), 400);
    }

    #[test]
    fn backoff_saturates_at_max() {
        let config = BackoffConfig::default();
        assert_eq!(calculate_backoff(10, &config), 30_000);
    }

    #[test]
    fn backoff_is_monotone_until_saturation() {
        let config = BackoffConfig::default();
        let mut prev = calculate_backoff(0, &config);
        for retry in 1..8 {
            let next = calculate_backoff(retry, &config);
            assert!(next >= prev);
            prev = next;
        }
    }

    #[test]
    fn should_retry_respects_max_retries_and_severity() {
        let ctx = ErrorContext {
            retry_count: Some(2),
            ..Default::default()
        };
        let err = JobError::classify("network timeout", ctx);
        assert!(err.should_retry(3));

        let ctx = ErrorContext {
            retry_count: Some(3),
            ..Default::default()
        };
        let err = JobError::classify("network timeout", ctx);
        assert!(!err.should_retry(3));
    }

    #[test]
    fn validation_errors_never_retry() {
        let mut err = JobError::classify("bad payload", ErrorContext::default());
        err.kind = JobErrorKind::ValidationError;
        assert!(!err.should_retry(DEFAULT_MAX_RETRIES));
    }

    #[test]
    fn critical_severity_never_retries() {
        let mut err = JobError::classify("database outage", ErrorContext::default());
        err.severity = Severity::Critical;
        assert!(!err.should_retry(DEFAULT_MAX_RETRIES));
    }

    #[tokio::test]
    async fn with_error_handling_passes_through_success() {
        let result: Result<u32, QueueError> =
            with_error_handling(|| async { Ok::<_, String>(42) }, ErrorContext::default()).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn with_error_handling_classifies_failure() {
        let result: Result<u32, QueueError> = with_error_handling(
            || async { Err::<u32, _>("redis connection refused".to_string()) },
            ErrorContext {
                job_id: Some("job-1".into()),
                ..Default::default()
            },
        )
        .await;
        let err = result.unwrap_err();
        assert_eq!(err.job_error().kind, JobErrorKind::RedisError);
        assert_eq!(err.job_error().job_id.as_deref(), Some("job-1"));
    }
}
