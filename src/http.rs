//! Shared HTTP plumbing for provider adapters
//!
//! One pooled `reqwest` client is built at orchestrator construction and
//! cloned into every adapter; adapters themselves stay stateless.

use crate::error::DispatchError;
use reqwest::{Client, ClientBuilder};
use std::time::Duration;
use uuid::Uuid;

const USER_AGENT: &str = concat!("llmux/", env!("CARGO_PKG_VERSION"));

/// Build the shared pooled HTTP client
pub fn build_client() -> Result<Client, DispatchError> {
    ClientBuilder::new()
        .pool_max_idle_per_host(10)
        .pool_idle_timeout(Duration::from_secs(90))
        .connect_timeout(Duration::from_secs(10))
        .user_agent(USER_AGENT)
        .gzip(true)
        .build()
        .map_err(|e| DispatchError::Configuration(format!("failed to create HTTP client: {e}")))
}

/// Per-attempt options: a correlation id plus the caller's deadline.
///
/// The deadline bounds the whole adapter call; when it fires, the in-flight
/// network call is aborted and surfaces as [`DispatchError::Timeout`].
#[derive(Debug, Clone)]
pub struct RequestOptions {
    /// Unique id for log correlation across one attempt
    pub request_id: Uuid,
    /// Deadline for the adapter call
    pub timeout: Duration,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            request_id: Uuid::new_v4(),
            timeout: Duration::from_secs(30),
        }
    }
}

impl RequestOptions {
    pub fn new(timeout: Duration) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            timeout,
        }
    }
}
