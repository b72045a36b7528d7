//! Provider adapter contract and concrete backend adapters
//!
//! One adapter per backend family, distinguished by authentication scheme,
//! base endpoint, and event framing. Adapters are stateless beyond a shared
//! HTTP client and are safely reusable across concurrent calls for any
//! profile of their kind.

pub mod anthropic;
pub mod gemini;
pub mod openai;
pub mod sse;

pub use anthropic::AnthropicAdapter;
pub use gemini::GeminiAdapter;
pub use openai::OpenAiAdapter;
pub use sse::ChatStream;

use crate::error::DispatchError;
use crate::http::RequestOptions;
use crate::profile::{BackendProfile, ProviderKind};
use crate::protocol::{ChatRequest, ChatResponse};
use async_trait::async_trait;

/// How the orchestrator should treat a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDisposition {
    /// Quota or rate-limit condition: mark the profile exhausted, rotate
    Quota,
    /// Transient or profile-local failure: rotate without exhausting
    Transient,
    /// Terminal for the whole call: no rotation (caller cancelled, gave up)
    Fatal,
}

/// Core contract every backend adapter implements
#[async_trait]
pub trait Provider: Send + Sync {
    /// Backend family this adapter serves
    fn kind(&self) -> ProviderKind;

    /// Stable adapter name for logs and diagnostics
    fn name(&self) -> &'static str {
        self.kind().as_str()
    }

    /// Issue a non-streaming completion
    async fn complete(
        &self,
        profile: &BackendProfile,
        request: &ChatRequest,
        options: &RequestOptions,
    ) -> Result<ChatResponse, DispatchError>;

    /// Issue a streaming completion.
    ///
    /// An `Err` here means the call failed before any event was yielded and
    /// is safe to retry on another profile. Once a [`ChatStream`] is
    /// returned, failures surface inside the stream and are terminal.
    async fn stream(
        &self,
        profile: &BackendProfile,
        request: &ChatRequest,
        options: &RequestOptions,
    ) -> Result<ChatStream, DispatchError>;

    /// Classify a failed attempt for rotation purposes.
    ///
    /// The default is a status/keyword heuristic; adapters override it to
    /// read their vendor's structured error codes instead.
    fn classify(&self, error: &DispatchError) -> ErrorDisposition {
        heuristic_classification(error)
    }
}

/// Fallback classification by status code and message keywords.
///
/// Deliberately loose: unknown vendor error shapes should still fail over
/// when they smell like quota exhaustion.
pub fn heuristic_classification(error: &DispatchError) -> ErrorDisposition {
    match error {
        DispatchError::Cancelled => ErrorDisposition::Fatal,
        DispatchError::RateLimited { .. } => ErrorDisposition::Quota,
        DispatchError::Upstream { status, message, .. } => {
            if *status == 429 || has_quota_keywords(message) {
                ErrorDisposition::Quota
            } else {
                ErrorDisposition::Transient
            }
        }
        _ => ErrorDisposition::Transient,
    }
}

fn has_quota_keywords(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    ["quota", "rate limit", "rate_limit", "too many requests", "exceeded"]
        .iter()
        .any(|kw| lower.contains(kw))
}

/// Resolves the adapter responsible for a provider kind
pub trait ProviderSet: Send + Sync {
    fn provider_for(&self, kind: ProviderKind) -> &dyn Provider;
}

/// The built-in adapter set, one instance per backend family.
///
/// Dispatch is a closed match over [`ProviderKind`]: every kind is bound at
/// compile time to its adapter.
pub struct Adapters {
    openai: OpenAiAdapter,
    anthropic: AnthropicAdapter,
    gemini: GeminiAdapter,
}

impl Adapters {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            openai: OpenAiAdapter::new(client.clone()),
            anthropic: AnthropicAdapter::new(client.clone()),
            gemini: GeminiAdapter::new(client),
        }
    }
}

impl ProviderSet for Adapters {
    fn provider_for(&self, kind: ProviderKind) -> &dyn Provider {
        match kind {
            ProviderKind::OpenAi => &self.openai,
            ProviderKind::Anthropic => &self.anthropic,
            ProviderKind::Gemini => &self.gemini,
        }
    }
}

/// Reject a profile whose credential is missing before any network call
pub(crate) fn require_credentials(profile: &BackendProfile) -> Result<(), DispatchError> {
    if profile.credentials.is_empty() {
        return Err(DispatchError::Configuration(format!(
            "profile '{}' has no credentials configured",
            profile.id
        )));
    }
    Ok(())
}
