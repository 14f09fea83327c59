//! Error types for phyto-id
//!
//! Only the aggregate outcome crosses the crate boundary:
//! - `ValidationError`: bad input, rejected before cache, lock or providers
//! - `IdentifyError`: what callers of the orchestrator see
//!
//! Per-provider failures (`ProviderError`, breaker rejections) are caught and
//! recorded by the orchestrator and never propagate raw.

use crate::types::{FailureReason, ProviderFailure};
use std::time::Duration;
use thiserror::Error;

/// Input validation error
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("image is empty")]
    EmptyImage,

    #[error("image is {size} bytes, limit is {max}")]
    ImageTooLarge { size: usize, max: usize },

    #[error("unsupported image type: {0}")]
    UnsupportedImageType(String),

    #[error("invalid option: {0}")]
    InvalidOption(String),
}

/// Error raised by a provider adapter
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// Call exceeded its timeout
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Network communication error
    #[error("Network error: {0}")]
    Network(String),

    /// Quota exhausted or rate limited (HTTP 429)
    #[error("Rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    /// Response could not be parsed
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// Provider returned an error status
    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },
}

impl ProviderError {
    /// Failure category recorded in merged results
    pub fn reason(&self) -> FailureReason {
        match self {
            ProviderError::Timeout(_) => FailureReason::Timeout,
            ProviderError::Network(_) => FailureReason::Network,
            ProviderError::RateLimited { .. } => FailureReason::RateLimited,
            ProviderError::MalformedResponse(_) => FailureReason::MalformedResponse,
            ProviderError::Api { .. } => FailureReason::Api,
        }
    }

    /// Provider-supplied retry hint, if any
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProviderError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProviderError::Timeout(e.to_string())
        } else if e.is_decode() {
            ProviderError::MalformedResponse(e.to_string())
        } else if let Some(status) = e.status() {
            ProviderError::Api {
                status: status.as_u16(),
                message: e.to_string(),
            }
        } else {
            ProviderError::Network(e.to_string())
        }
    }
}

/// Lock manager error
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    /// Blocking timeout elapsed without acquiring the lock
    #[error("lock '{key}' not acquired within {waited:?}")]
    Timeout { key: String, waited: Duration },

    /// Lock backend failed
    #[error("lock backend error: {0}")]
    Backend(String),
}

/// Outcome error of the combined identification service
#[derive(Debug, Error)]
pub enum IdentifyError {
    /// Bad input; no cache, lock or provider was touched
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Every provider failed or had an open breaker
    #[error("all identification providers unavailable, retry after {}s", retry_after.as_secs())]
    AllProvidersUnavailable {
        retry_after: Duration,
        failures: Vec<ProviderFailure>,
    },

    /// Caller cancelled the request; nothing was cached
    #[error("identification cancelled")]
    Cancelled,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl IdentifyError {
    /// Retry hint for unavailable outcomes
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            IdentifyError::AllProvidersUnavailable { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}

/// Result type for identification
pub type IdentifyResult<T> = Result<T, IdentifyError>;
