//! Unified error type shared by the resilience and job layers.

use std::fmt::Debug;
use thiserror::Error;

/// Unified error type for Ferry infrastructure.
#[derive(Error, Debug)]
pub enum FerryError {
    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// External service error
    #[error("External service error: {service} - {message}")]
    ExternalService { service: String, message: String },

    /// Queue storage error
    #[error("Queue storage error: {0}")]
    Storage(String),

    /// Circuit breaker open
    #[error("Service unavailable: circuit breaker open for {0}")]
    CircuitBreakerOpen(String),

    /// Timeout error
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Generic error wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl FerryError {
    /// Returns a machine-readable error code.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::ExternalService { .. } => "EXTERNAL_SERVICE_ERROR",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::CircuitBreakerOpen(_) => "CIRCUIT_BREAKER_OPEN",
            Self::Timeout(_) => "TIMEOUT",
            Self::Internal(_) | Self::Other(_) => "INTERNAL_ERROR",
        }
    }

    /// Creates a validation error.
    #[must_use]
    pub fn validation<T: Into<String>>(message: T) -> Self {
        Self::Validation(message.into())
    }

    /// Creates a configuration error.
    #[must_use]
    pub fn configuration<T: Into<String>>(message: T) -> Self {
        Self::Configuration(message.into())
    }

    /// Creates an internal error.
    #[must_use]
    pub fn internal<T: Into<String>>(message: T) -> Self {
        Self::Internal(message.into())
    }

    /// Checks if this error is retriable.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::ExternalService { .. }
                | Self::Storage(_)
                | Self::CircuitBreakerOpen(_)
                | Self::Timeout(_)
        )
    }
}

impl From<serde_json::Error> for FerryError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("JSON serialization error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(FerryError::validation("x").error_code(), "VALIDATION_ERROR");
        assert_eq!(FerryError::Timeout("5s".into()).error_code(), "TIMEOUT");
        assert_eq!(
            FerryError::CircuitBreakerOpen("webhook-processing".into()).error_code(),
            "CIRCUIT_BREAKER_OPEN"
        );
        assert_eq!(FerryError::internal("boom").error_code(), "INTERNAL_ERROR");
    }

    #[test]
    fn test_retriable_classification() {
        assert!(FerryError::Timeout("1s".into()).is_retriable());
        assert!(FerryError::CircuitBreakerOpen("cb".into()).is_retriable());
        assert!(FerryError::ExternalService {
            service: "smtp".into(),
            message: "refused".into()
        }
        .is_retriable());
        assert!(!FerryError::validation("bad").is_retriable());
        assert!(!FerryError::configuration("missing").is_retriable());
    }

    #[test]
    fn test_from_anyhow() {
        let err: FerryError = anyhow::anyhow!("wrapped").into();
        assert!(err.to_string().contains("wrapped"));
        assert_eq!(err.error_code(), "INTERNAL_ERROR");
    }

    #[test]
    fn test_from_serde_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err = FerryError::from(json_err);
        assert!(matches!(err, FerryError::Internal(_)));
    }
}
