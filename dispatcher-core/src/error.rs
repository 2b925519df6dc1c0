//! Error types for dispatcher operations.
//!
//! This module provides:
//! - `DispatcherError` - the main error type for dispatcher operations
//! - `ErrorCategory` - classification of errors for smart retry logic
//! - `RetryStrategy` - how to handle retries based on error category

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while running the dispatcher.
#[derive(Error, Debug)]
pub enum DispatcherError {
    /// Redis connection or command error.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Orchestrator HTTP client error.
    #[error("Orchestrator HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Job intake validation failure. Carries the `lastError` code used in
    /// the job record (`INVALID_CONTACTS`, `INVALID_MODE`, ...).
    #[error("Validation error: {0}")]
    Validation(String),

    /// No healthy session available to route to.
    #[error("No sessions available")]
    NoSessionsAvailable,

    /// Configuration error surfaced at startup.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal/unexpected error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DispatcherError {
    /// Check if this is a connection-related error that might be recoverable.
    pub fn is_connection_error(&self) -> bool {
        match self {
            Self::Redis(e) => {
                let err_str = e.to_string().to_lowercase();
                err_str.contains("connection")
                    || err_str.contains("disconnected")
                    || err_str.contains("broken pipe")
                    || err_str.contains("reset by peer")
                    || err_str.contains("refused")
                    || err_str.contains("eof")
                    || err_str.contains("io error")
            }
            Self::Http(e) => e.is_connect() || e.is_timeout(),
            _ => false,
        }
    }

    /// Categorize the error for smart retry logic.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Redis(e) => {
                let err_str = e.to_string().to_lowercase();
                if err_str.contains("busy") || err_str.contains("loading") {
                    ErrorCategory::RateLimited
                } else {
                    ErrorCategory::Transient
                }
            }
            Self::Http(e) => {
                if let Some(status) = e.status() {
                    if status.as_u16() == 429 {
                        ErrorCategory::RateLimited
                    } else if status.is_client_error() {
                        ErrorCategory::Permanent
                    } else {
                        ErrorCategory::Transient
                    }
                } else {
                    ErrorCategory::Transient
                }
            }
            Self::Validation(_) => ErrorCategory::Permanent,
            Self::NoSessionsAvailable => ErrorCategory::Transient,
            Self::Serialization(_) => ErrorCategory::Permanent,
            Self::Config(_) => ErrorCategory::Permanent,
            Self::Internal(_) => ErrorCategory::Transient,
        }
    }
}

/// Error category for smart retry logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Temporary error - retry with exponential backoff.
    Transient,
    /// Permanent error - do not retry.
    Permanent,
    /// Rate limited - retry with longer backoff.
    RateLimited,
}

impl ErrorCategory {
    /// Get the retry strategy for this error category.
    pub fn retry_strategy(&self) -> RetryStrategy {
        match self {
            Self::Transient => RetryStrategy::ExponentialBackoff {
                base_delay_ms: 1000,
                max_delay_ms: 30_000,
                max_retries: 3,
            },
            Self::Permanent => RetryStrategy::NoRetry,
            Self::RateLimited => RetryStrategy::ExponentialBackoff {
                base_delay_ms: 5000,
                max_delay_ms: 120_000,
                max_retries: 5,
            },
        }
    }

    /// Check if this error category should be retried.
    pub fn should_retry(&self) -> bool {
        !matches!(self, Self::Permanent)
    }
}

/// Retry strategy for handling errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStrategy {
    /// Do not retry.
    NoRetry,
    /// Retry with exponential backoff.
    ExponentialBackoff {
        base_delay_ms: u64,
        max_delay_ms: u64,
        max_retries: u32,
    },
}

impl RetryStrategy {
    /// Calculate the delay for a given retry attempt, with jitter to avoid
    /// a thundering herd of retries landing on the same tick.
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        match self {
            Self::NoRetry => None,
            Self::ExponentialBackoff {
                base_delay_ms,
                max_delay_ms,
                max_retries,
            } => {
                if attempt >= *max_retries {
                    return None;
                }
                let exp_delay = base_delay_ms.saturating_mul(2u64.pow(attempt));
                let capped_delay = exp_delay.min(*max_delay_ms);
                Some(Duration::from_millis(jitter(capped_delay)))
            }
        }
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        match self {
            Self::NoRetry => false,
            Self::ExponentialBackoff { max_retries, .. } => attempt < *max_retries,
        }
    }

    pub fn max_retries(&self) -> u32 {
        match self {
            Self::NoRetry => 0,
            Self::ExponentialBackoff { max_retries, .. } => *max_retries,
        }
    }
}

/// Apply ±25% jitter to a delay.
fn jitter(delay_ms: u64) -> u64 {
    use rand::Rng;
    let range = delay_ms / 4;
    if range == 0 {
        return delay_ms;
    }
    let offset = rand::rng().random_range(0..=range * 2) as i64 - range as i64;
    if offset < 0 {
        delay_ms.saturating_sub((-offset) as u64)
    } else {
        delay_ms.saturating_add(offset as u64)
    }
}

/// Clamp a retry delay into `[1s, 10min]`, per the dispatcher's retry scheduler.
pub fn clamp_retry_delay_ms(delay_ms: u64) -> u64 {
    delay_ms.clamp(1_000, 600_000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DispatcherError::Validation("INVALID_MODE".to_string());
        assert_eq!(err.to_string(), "Validation error: INVALID_MODE");
    }

    #[test]
    fn test_error_category_validation_is_permanent() {
        let err = DispatcherError::Validation("INVALID_CONTACTS".to_string());
        assert_eq!(err.category(), ErrorCategory::Permanent);
        assert!(!err.category().should_retry());
    }

    #[test]
    fn test_error_category_no_sessions_is_transient() {
        let err = DispatcherError::NoSessionsAvailable;
        assert_eq!(err.category(), ErrorCategory::Transient);
    }

    #[test]
    fn test_retry_strategy_no_retry() {
        let strategy = RetryStrategy::NoRetry;
        assert!(!strategy.should_retry(0));
        assert_eq!(strategy.delay_for_attempt(0), None);
        assert_eq!(strategy.max_retries(), 0);
    }

    #[test]
    fn test_retry_strategy_exponential_backoff() {
        let strategy = RetryStrategy::ExponentialBackoff {
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            max_retries: 3,
        };

        assert!(strategy.should_retry(0));
        assert!(strategy.should_retry(2));
        assert!(!strategy.should_retry(3));
        assert!(strategy.delay_for_attempt(2).is_some());
        assert!(strategy.delay_for_attempt(3).is_none());
    }

    #[test]
    fn test_clamp_retry_delay() {
        assert_eq!(clamp_retry_delay_ms(500), 1_000);
        assert_eq!(clamp_retry_delay_ms(60_000), 60_000);
        assert_eq!(clamp_retry_delay_ms(700_000), 600_000);
    }
}
