//! Application error kinds.
//!
//! One enum for the whole backend so that callers can branch on *kind*
//! rather than on provider-specific error types. Pipeline stages treat
//! `RateLimited` and `CircuitOpen` as transient (fail the attempt, let the
//! scheduler re-run); everything else is surfaced to the task queue.

use std::time::Duration;

#[derive(Debug)]
pub enum AppError {
    /// Bad input shape. Caller-visible message.
    Validation(String),
    /// Referenced row or blob is absent.
    NotFound(String),
    /// Transient: caller receives a retry-after hint.
    RateLimited { retry_after: Duration },
    /// Transient: a circuit breaker rejected the call without invoking it.
    CircuitOpen(String),
    /// An upstream call exceeded its wall-clock timeout.
    ProviderTimeout(String),
    /// Upstream SDK / HTTP failure.
    Provider(String),
    /// Blob or database write failure.
    Storage(String),
    /// Bug. The worker marks the article failed and moves on.
    Invariant(String),
}

impl AppError {
    /// Stable machine-readable kind string (logged and returned over HTTP).
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::NotFound(_) => "not_found",
            Self::RateLimited { .. } => "rate_limited",
            Self::CircuitOpen(_) => "circuit_open",
            Self::ProviderTimeout(_) => "provider_timeout",
            Self::Provider(_) => "provider_error",
            Self::Storage(_) => "storage_error",
            Self::Invariant(_) => "invariant_violation",
        }
    }

    /// Transient errors fail the current attempt but leave the article
    /// eligible for a later scheduler pass.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::CircuitOpen(_))
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(msg) => write!(f, "validation error: {}", msg),
            Self::NotFound(what) => write!(f, "not found: {}", what),
            Self::RateLimited { retry_after } => {
                write!(f, "rate limited, retry after {}s", retry_after.as_secs())
            }
            Self::CircuitOpen(name) => write!(f, "circuit breaker '{}' is open", name),
            Self::ProviderTimeout(what) => write!(f, "provider timeout: {}", what),
            Self::Provider(msg) => write!(f, "provider error: {}", msg),
            Self::Storage(msg) => write!(f, "storage error: {}", msg),
            Self::Invariant(msg) => write!(f, "invariant violation: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

impl From<rusqlite::Error> for AppError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(e: std::io::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        Self::Storage(format!("json: {}", e))
    }
}

impl From<reqwest::Error> for AppError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::ProviderTimeout(e.to_string())
        } else {
            Self::Provider(e.to_string())
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_strings_are_stable() {
        assert_eq!(AppError::Validation("x".into()).kind(), "validation_error");
        assert_eq!(AppError::CircuitOpen("llm".into()).kind(), "circuit_open");
        assert_eq!(AppError::Storage("x".into()).kind(), "storage_error");
    }

    #[test]
    fn test_transient_classification() {
        assert!(AppError::RateLimited {
            retry_after: Duration::from_secs(1)
        }
        .is_transient());
        assert!(AppError::CircuitOpen("llm".into()).is_transient());
        assert!(!AppError::Provider("boom".into()).is_transient());
    }
}
