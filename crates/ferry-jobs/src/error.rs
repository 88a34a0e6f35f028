//! Job error types.

use crate::job::JobKind;
use ferry_core::FerryError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type for handler execution.
pub type JobResult<T> = Result<T, JobError>;

/// Result type for persistent queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Result type for dead letter store operations.
pub type DeadLetterResult<T> = Result<T, DeadLetterError>;

/// Classified failure returned by a job handler.
#[derive(Debug, Clone, Error)]
pub enum JobError {
    /// Transient failure such as a dropped connection.
    #[error("Transient failure: {0}")]
    Transient(String),

    /// Job exceeded its execution budget.
    #[error("Job timed out: {0}")]
    Timeout(String),

    /// A downstream service returned an error.
    #[error("External service error: {service} - {message}")]
    ExternalService { service: String, message: String },

    /// The circuit breaker for this job kind rejected the call.
    #[error("Circuit breaker open for {0}")]
    CircuitOpen(String),

    /// Payload failed business validation.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Payload could not be decoded.
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// No handler was registered for the job kind.
    #[error("No handler registered for job kind {0}")]
    NoHandler(JobKind),
}

impl JobError {
    /// Returns true if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            JobError::Transient(_)
                | JobError::Timeout(_)
                | JobError::ExternalService { .. }
                | JobError::CircuitOpen(_)
        )
    }

    /// Returns the error category used in metrics and dead letter entries.
    pub fn category(&self) -> ErrorCategory {
        match self {
            JobError::Transient(_) => ErrorCategory::Transient,
            JobError::Timeout(_) => ErrorCategory::Timeout,
            JobError::ExternalService { .. } => ErrorCategory::ExternalService,
            JobError::CircuitOpen(_) => ErrorCategory::CircuitOpen,
            JobError::Validation(_) => ErrorCategory::Validation,
            JobError::MalformedPayload(_) => ErrorCategory::Payload,
            JobError::NoHandler(_) => ErrorCategory::Configuration,
        }
    }

    /// Returns a machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            JobError::Transient(_) => "TRANSIENT_ERROR",
            JobError::Timeout(_) => "TIMEOUT",
            JobError::ExternalService { .. } => "EXTERNAL_SERVICE_ERROR",
            JobError::CircuitOpen(_) => "CIRCUIT_BREAKER_OPEN",
            JobError::Validation(_) => "VALIDATION_ERROR",
            JobError::MalformedPayload(_) => "MALFORMED_PAYLOAD",
            JobError::NoHandler(_) => "NO_HANDLER",
        }
    }
}

impl From<FerryError> for JobError {
    fn from(err: FerryError) -> Self {
        match err {
            FerryError::Timeout(msg) => JobError::Timeout(msg),
            FerryError::CircuitBreakerOpen(name) => JobError::CircuitOpen(name),
            FerryError::ExternalService { service, message } => {
                JobError::ExternalService { service, message }
            }
            FerryError::Validation(msg) => JobError::Validation(msg),
            other => JobError::Transient(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for JobError {
    fn from(err: serde_json::Error) -> Self {
        JobError::MalformedPayload(err.to_string())
    }
}

/// Coarse classification of job failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Transient,
    Timeout,
    ExternalService,
    CircuitOpen,
    Validation,
    Payload,
    Configuration,
}

impl ErrorCategory {
    /// Returns the category as a static label.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::ExternalService => "external_service",
            ErrorCategory::CircuitOpen => "circuit_open",
            ErrorCategory::Validation => "validation",
            ErrorCategory::Payload => "payload",
            ErrorCategory::Configuration => "configuration",
        }
    }

    /// Failures that another attempt with the same payload cannot fix.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ErrorCategory::Validation | ErrorCategory::Payload | ErrorCategory::Configuration
        )
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persistent queue errors.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Redis error.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Redis pool error.
    #[error("Redis pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Job not found.
    #[error("Job not found: {0}")]
    NotFound(String),

    /// Queue backend cannot accept work.
    #[error("Queue unavailable: {0}")]
    Unavailable(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl From<QueueError> for FerryError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Configuration(msg) => FerryError::Configuration(msg),
            other => FerryError::Storage(other.to_string()),
        }
    }
}

/// Returned to producers when a job was not durably accepted.
#[derive(Debug, Error)]
pub enum EnqueueError {
    /// The persistent queue rejected the submission.
    #[error("Queue rejected {kind} job: {source}")]
    Rejected {
        kind: JobKind,
        #[source]
        source: QueueError,
    },
}

/// Dead letter store errors.
#[derive(Debug, Error)]
pub enum DeadLetterError {
    /// Underlying persistence is unavailable.
    #[error("Dead letter persistence failed: {0}")]
    Persist(String),

    /// Entry could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<redis::RedisError> for DeadLetterError {
    fn from(err: redis::RedisError) -> Self {
        DeadLetterError::Persist(err.to_string())
    }
}

impl From<deadpool_redis::PoolError> for DeadLetterError {
    fn from(err: deadpool_redis::PoolError) -> Self {
        DeadLetterError::Persist(err.to_string())
    }
}

/// Metrics recorder errors.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// The record buffer is full; the record was dropped.
    #[error("Metrics buffer full")]
    BufferFull,

    /// The background flusher has stopped.
    #[error("Metrics recorder closed")]
    Closed,

    /// The sink failed to persist a batch.
    #[error("Metrics sink error: {0}")]
    Sink(String),
}

impl From<redis::RedisError> for MetricsError {
    fn from(err: redis::RedisError) -> Self {
        MetricsError::Sink(err.to_string())
    }
}

impl From<deadpool_redis::PoolError> for MetricsError {
    fn from(err: deadpool_redis::PoolError) -> Self {
        MetricsError::Sink(err.to_string())
    }
}

impl From<serde_json::Error> for MetricsError {
    fn from(err: serde_json::Error) -> Self {
        MetricsError::Sink(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_retryable_transient() {
        assert!(JobError::Transient("reset by peer".into()).is_retryable());
    }

    #[test]
    fn test_is_retryable_timeout() {
        assert!(JobError::Timeout("30s".into()).is_retryable());
    }

    #[test]
    fn test_circuit_open_is_retryable() {
        let err = JobError::CircuitOpen("webhook-processing".into());
        assert!(err.is_retryable());
        assert_eq!(err.category(), ErrorCategory::CircuitOpen);
    }

    #[test]
    fn test_terminal_errors() {
        assert!(!JobError::Validation("missing event id".into()).is_retryable());
        assert!(!JobError::MalformedPayload("eof".into()).is_retryable());
        assert!(!JobError::NoHandler(JobKind::ReminderProcessing).is_retryable());
    }

    #[test]
    fn test_terminal_categories_match_retryability() {
        let errors = [
            JobError::Transient("reset".into()),
            JobError::Timeout("30s".into()),
            JobError::CircuitOpen("webhook-processing".into()),
            JobError::Validation("missing event id".into()),
            JobError::MalformedPayload("eof".into()),
            JobError::NoHandler(JobKind::ReminderProcessing),
        ];
        for err in errors {
            assert_eq!(err.category().is_terminal(), !err.is_retryable(), "{:?}", err);
        }
    }

    #[test]
    fn test_codes_and_categories() {
        let err = JobError::ExternalService {
            service: "crm".into(),
            message: "503".into(),
        };
        assert_eq!(err.code(), "EXTERNAL_SERVICE_ERROR");
        assert_eq!(err.category().as_str(), "external_service");
        assert_eq!(JobError::MalformedPayload("x".into()).category(), ErrorCategory::Payload);
    }

    #[test]
    fn test_from_ferry_timeout() {
        let err = JobError::from(FerryError::Timeout("after 5s".into()));
        assert!(matches!(err, JobError::Timeout(msg) if msg.contains("5s")));
    }

    #[test]
    fn test_from_ferry_internal_is_transient() {
        let err = JobError::from(FerryError::internal("database down"));
        match err {
            JobError::Transient(msg) => assert!(msg.contains("database down")),
            other => panic!("Expected Transient error, got {:?}", other),
        }
    }

    #[test]
    fn test_from_serde_error_is_malformed() {
        let json_err = serde_json::from_str::<u32>("\"nope\"").unwrap_err();
        assert!(matches!(JobError::from(json_err), JobError::MalformedPayload(_)));
    }

    #[test]
    fn test_enqueue_error_display() {
        let err = EnqueueError::Rejected {
            kind: JobKind::WebhookProcessing,
            source: QueueError::Unavailable("connection refused".into()),
        };
        let msg = err.to_string();
        assert!(msg.contains("webhook-processing") && msg.contains("connection refused"));
    }
}
