//! Dispatch error taxonomy
//!
//! One error type covers the whole dispatch pipeline: adapter configuration,
//! upstream HTTP failures, stream parsing, and the terminal all-profiles
//! outcome. Per-chunk parse errors are recovered locally by the stream
//! normalizer and never reach callers.

use thiserror::Error;

/// Result type for dispatch operations
pub type DispatchResult<T> = Result<T, DispatchError>;

/// Errors surfaced by the dispatcher and its provider adapters
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Profile is missing a required credential or is otherwise unusable
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Backend returned a non-success response
    #[error("upstream error ({status}): {message}")]
    Upstream {
        status: u16,
        /// Structured vendor error code when the envelope carried one
        code: Option<String>,
        message: String,
    },

    /// Backend reported a rate-limit or quota condition
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after_secs: Option<u64>,
    },

    /// Network or connection failure
    #[error("network error: {0}")]
    Network(String),

    /// Response body or stream payload could not be parsed
    #[error("failed to parse response: {0}")]
    Parse(String),

    /// Request exceeded its deadline
    #[error("request timed out after {0} seconds")]
    Timeout(u64),

    /// Caller abandoned the request
    #[error("request cancelled by caller")]
    Cancelled,

    /// Every configured profile was inadmissible or failed
    #[error("all {attempts} backend profiles exhausted: {last}")]
    AllProfilesExhausted {
        attempts: usize,
        last: Box<DispatchError>,
    },
}

impl From<reqwest::Error> for DispatchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            DispatchError::Timeout(30)
        } else if err.is_connect() {
            DispatchError::Network(format!("connection failed: {err}"))
        } else if err.is_status() {
            let status = err.status().map(|s| s.as_u16()).unwrap_or(0);
            if status == 429 {
                DispatchError::RateLimited {
                    message: err.to_string(),
                    retry_after_secs: None,
                }
            } else {
                DispatchError::Upstream {
                    status,
                    code: None,
                    message: err.to_string(),
                }
            }
        } else {
            DispatchError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for DispatchError {
    fn from(err: serde_json::Error) -> Self {
        DispatchError::Parse(err.to_string())
    }
}

impl DispatchError {
    /// Status code for upstream errors, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            DispatchError::Upstream { status, .. } => Some(*status),
            DispatchError::RateLimited { .. } => Some(429),
            _ => None,
        }
    }
}
