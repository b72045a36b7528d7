//! Backend profile configuration
//!
//! Profiles are supplied by the host application's settings layer and read
//! at dispatch time. The ordered profile list determines rotation priority;
//! a profile is immutable for the lifetime of a single dispatch attempt.

mod secrets;

pub use secrets::SecretString;

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Supported backend families.
///
/// Closed set: each kind is bound at compile time to its adapter
/// implementation, and an unrecognized kind is a deserialization error
/// rather than a runtime lookup failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Gemini,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Gemini => "gemini",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Usage ceilings for one profile within a quota window.
///
/// Either ceiling may be absent; a profile with no configured limit at all
/// is always admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct QuotaLimit {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_requests: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
}

/// Configuration for one upstream backend target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendProfile {
    /// Unique profile identifier
    pub id: String,

    /// Backend family this profile targets
    pub kind: ProviderKind,

    /// API credential; redacted in all Debug/Display output
    pub credentials: SecretString,

    /// Model identifier passed to the backend
    pub model: String,

    /// Override for the backend's default API base URL
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// Usage ceilings for quota admission
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota_limit: Option<QuotaLimit>,

    /// Window length applied when this profile's quota window opens or the
    /// upstream reports exhaustion
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota_reset_period: Option<Duration>,
}

impl BackendProfile {
    /// Create a profile with no quota policy
    pub fn new(
        id: impl Into<String>,
        kind: ProviderKind,
        credentials: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            credentials: SecretString::new(credentials),
            model: model.into(),
            base_url: None,
            quota_limit: None,
            quota_reset_period: None,
        }
    }

    /// Set a base URL override
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Attach a quota policy
    pub fn with_quota(mut self, limit: QuotaLimit, reset_period: Duration) -> Self {
        self.quota_limit = Some(limit);
        self.quota_reset_period = Some(reset_period);
        self
    }
}
