//! Classified errors returned across the connector boundary.
//!
//! Adapters classify every failure into an [`ErrorKind`] and never retry on
//! their own; the dispatcher reads the kind to decide whether to try again.

use crate::backend::BackendKind;
use serde::{Serialize, Serializer};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Failure taxonomy shared by both backends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ErrorKind {
    /// No usable backend for the request
    NotConfigured,
    /// Credentials invalid, expired or challenged
    Auth,
    /// Backend asked us to slow down
    RateLimited {
        #[serde(rename = "retry_after_secs", serialize_with = "duration_secs")]
        retry_after: Duration,
    },
    /// Malformed request
    Validation,
    /// Target entity absent
    NotFound,
    /// Network failure or 5xx
    Transient,
    /// Backend explicitly refuses (suspended account, unexpected shape, ...)
    Permanent,
}

fn duration_secs<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64())
}

impl ErrorKind {
    /// Whether the dispatcher may try again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Transient | ErrorKind::RateLimited { .. })
    }

    /// Minimum delay before another attempt, if the backend gave one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ErrorKind::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotConfigured => "not_configured",
            ErrorKind::Auth => "auth",
            ErrorKind::RateLimited { .. } => "rate_limited",
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::RateLimited { retry_after } => {
                write!(f, "rate_limited (retry after {:.1}s)", retry_after.as_secs_f64())
            }
            other => f.write_str(other.as_str()),
        }
    }
}

/// A typed failure with enough structure for the host to decide what to do.
#[derive(Debug, Clone, Error, Serialize)]
#[error("{kind}{}: {message}", backend_suffix(.backend))]
pub struct ClassifiedError {
    #[serde(flatten)]
    pub kind: ErrorKind,
    /// Backend that produced the failure, if one was reached
    pub backend: Option<BackendKind>,
    /// Human-readable detail, usually the upstream message
    pub message: String,
    /// Attempts made before giving up (0 when no backend call was made)
    pub attempts: u32,
    /// A mutating request may or may not have been committed upstream
    pub outcome_unknown: bool,
}

fn backend_suffix(backend: &Option<BackendKind>) -> String {
    backend.map(|b| format!(" from {} backend", b)).unwrap_or_default()
}

impl ClassifiedError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            backend: None,
            message: message.into(),
            attempts: 0,
            outcome_unknown: false,
        }
    }

    pub fn not_configured(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotConfigured, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Auth, message)
    }

    pub fn rate_limited(retry_after: Duration, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimited { retry_after }, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Permanent, message)
    }

    /// Tag the error with the backend that produced it.
    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Mark that the request may already have taken effect upstream.
    pub fn with_unknown_outcome(mut self) -> Self {
        self.outcome_unknown = true;
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// Result type for connector operations.
pub type ConnectorResult<T> = Result<T, ClassifiedError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(ErrorKind::Transient.is_retryable());
        assert!(ErrorKind::RateLimited {
            retry_after: Duration::from_secs(2)
        }
        .is_retryable());

        for kind in [
            ErrorKind::NotConfigured,
            ErrorKind::Auth,
            ErrorKind::Validation,
            ErrorKind::NotFound,
            ErrorKind::Permanent,
        ] {
            assert!(!kind.is_retryable(), "{} must not be retried", kind);
        }
    }

    #[test]
    fn test_display_includes_backend() {
        let err = ClassifiedError::auth("challenge page").with_backend(BackendKind::Scraper);
        assert_eq!(err.to_string(), "auth from scraper backend: challenge page");

        let err = ClassifiedError::validation("text is required");
        assert_eq!(err.to_string(), "validation: text is required");
    }

    #[test]
    fn test_serializes_flat() {
        let err = ClassifiedError::rate_limited(Duration::from_millis(2500), "slow down")
            .with_backend(BackendKind::Api)
            .with_attempts(3);
        let value = serde_json::to_value(&err).unwrap();

        assert_eq!(value["kind"], "rate_limited");
        assert_eq!(value["retry_after_secs"], 2.5);
        assert_eq!(value["backend"], "api");
        assert_eq!(value["attempts"], 3);
        assert_eq!(value["outcome_unknown"], false);
    }
}
