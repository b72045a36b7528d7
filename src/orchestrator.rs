//! Fallback orchestration across backend profiles
//!
//! One orchestrator instance is constructed per process with injected
//! profile configuration and owns all mutable dispatch state: the advisory
//! rotation cursor and the quota tracker. Callers share it by reference
//! across concurrent requests.
//!
//! Rotation is strictly round-robin over the configured profile order. A
//! call makes at most one attempt per profile: profiles denied admission
//! are skipped, quota-shaped failures mark the profile exhausted, and when
//! every profile has been spent the call fails with
//! [`DispatchError::AllProfilesExhausted`].
//!
//! Streaming is retryable only before the first byte: once a stream handle
//! has been returned to the caller, a mid-stream failure terminates the
//! sequence with an error instead of silently reissuing on another backend,
//! so no duplicate or partial output can reach the caller.

use crate::error::DispatchError;
use crate::http::{build_client, RequestOptions};
use crate::profile::BackendProfile;
use crate::protocol::{ChatRequest, ChatResponse, StreamEvent, Usage};
use crate::providers::{Adapters, ChatStream, ErrorDisposition, ProviderSet};
use crate::quota::QuotaTracker;
use futures::Stream;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::task::{Context, Poll};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Window length applied when a profile configures no reset period
pub const DEFAULT_RESET_PERIOD: Duration = Duration::from_secs(60);

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Quota-aware round-robin dispatcher over an ordered profile list
pub struct FallbackOrchestrator {
    profiles: RwLock<Vec<BackendProfile>>,
    providers: Arc<dyn ProviderSet>,
    quota: QuotaTracker,
    /// Advisory rotation start; lost updates only cost a sub-optimal
    /// starting profile, so relaxed atomics suffice
    cursor: AtomicUsize,
    default_reset_period: Duration,
    request_timeout: Duration,
}

impl FallbackOrchestrator {
    /// Create an orchestrator with the built-in adapter set
    pub fn new(profiles: Vec<BackendProfile>) -> Result<Self, DispatchError> {
        let client = build_client()?;
        Ok(Self::with_providers(profiles, Arc::new(Adapters::new(client))))
    }

    /// Create an orchestrator with a custom provider set (test seam)
    pub fn with_providers(
        profiles: Vec<BackendProfile>,
        providers: Arc<dyn ProviderSet>,
    ) -> Self {
        Self {
            profiles: RwLock::new(profiles),
            providers,
            quota: QuotaTracker::new(),
            cursor: AtomicUsize::new(0),
            default_reset_period: DEFAULT_RESET_PERIOD,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Set the per-attempt deadline
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the window applied to profiles without a configured reset period
    pub fn with_default_reset_period(mut self, period: Duration) -> Self {
        self.default_reset_period = period;
        self
    }

    /// Swap the profile list; in-flight calls keep their snapshot.
    ///
    /// The rotation cursor is re-bounded on the next dispatch, so the list
    /// may grow or shrink between calls.
    pub fn replace_profiles(&self, profiles: Vec<BackendProfile>) {
        *self.profiles.write().expect("profile lock poisoned") = profiles;
    }

    /// Shared quota counters (observability and tests)
    pub fn quota(&self) -> &QuotaTracker {
        &self.quota
    }

    fn snapshot(&self) -> (Vec<BackendProfile>, usize) {
        let profiles = self
            .profiles
            .read()
            .expect("profile lock poisoned")
            .clone();
        let start = if profiles.is_empty() {
            0
        } else {
            self.cursor.load(Ordering::Relaxed) % profiles.len()
        };
        (profiles, start)
    }

    fn reset_period(&self, profile: &BackendProfile) -> Duration {
        profile.quota_reset_period.unwrap_or(self.default_reset_period)
    }

    /// Dispatch a non-streaming completion, rotating across profiles until
    /// one succeeds or all are exhausted
    pub async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, DispatchError> {
        let (profiles, start) = self.snapshot();
        if profiles.is_empty() {
            return Err(no_profiles());
        }

        let mut last_error: Option<DispatchError> = None;
        for attempt in 0..profiles.len() {
            let index = (start + attempt) % profiles.len();
            let profile = &profiles[index];

            if !self.admit(profile) {
                last_error.get_or_insert_with(|| admission_denied(profile));
                continue;
            }

            let provider = self.providers.provider_for(profile.kind);
            let options = RequestOptions::new(self.request_timeout);
            match provider.complete(profile, request, &options).await {
                Ok(response) => {
                    self.quota
                        .record_usage(&profile.id, 1, response.usage.total());
                    self.cursor
                        .store((index + 1) % profiles.len(), Ordering::Relaxed);
                    info!(
                        profile_id = %profile.id,
                        request_id = %options.request_id,
                        input_tokens = response.usage.input_tokens,
                        output_tokens = response.usage.output_tokens,
                        "attempt succeeded"
                    );
                    return Ok(response);
                }
                Err(error) => {
                    if !self.handle_failure(profile, provider.classify(&error), &error) {
                        return Err(error);
                    }
                    last_error = Some(error);
                }
            }
        }

        Err(DispatchError::AllProfilesExhausted {
            attempts: profiles.len(),
            last: Box::new(last_error.unwrap_or_else(no_profiles)),
        })
    }

    /// Dispatch a streaming completion.
    ///
    /// Rotation happens only while obtaining the stream handle; after that,
    /// quota accounting rides inside the returned stream and failures are
    /// terminal.
    pub async fn stream(&self, request: &ChatRequest) -> Result<ChatStream, DispatchError> {
        let (profiles, start) = self.snapshot();
        if profiles.is_empty() {
            return Err(no_profiles());
        }

        let mut last_error: Option<DispatchError> = None;
        for attempt in 0..profiles.len() {
            let index = (start + attempt) % profiles.len();
            let profile = &profiles[index];

            if !self.admit(profile) {
                last_error.get_or_insert_with(|| admission_denied(profile));
                continue;
            }

            let provider = self.providers.provider_for(profile.kind);
            let options = RequestOptions::new(self.request_timeout);
            match provider.stream(profile, request, &options).await {
                Ok(stream) => {
                    self.cursor
                        .store((index + 1) % profiles.len(), Ordering::Relaxed);
                    info!(
                        profile_id = %profile.id,
                        request_id = %options.request_id,
                        "stream opened"
                    );
                    return Ok(Box::pin(UsageRecordingStream {
                        inner: stream,
                        quota: self.quota.clone(),
                        profile_id: profile.id.clone(),
                        observed: Usage::default(),
                        recorded: false,
                    }));
                }
                Err(error) => {
                    if !self.handle_failure(profile, provider.classify(&error), &error) {
                        return Err(error);
                    }
                    last_error = Some(error);
                }
            }
        }

        Err(DispatchError::AllProfilesExhausted {
            attempts: profiles.len(),
            last: Box::new(last_error.unwrap_or_else(no_profiles)),
        })
    }

    fn admit(&self, profile: &BackendProfile) -> bool {
        let admitted = self.quota.check_admission(
            &profile.id,
            profile.quota_limit.as_ref(),
            self.reset_period(profile),
        );
        if !admitted {
            debug!(profile_id = %profile.id, "attempt skipped: quota admission denied");
        }
        admitted
    }

    /// Apply rotation policy for one failed attempt; returns false when the
    /// error is terminal for the whole call
    fn handle_failure(
        &self,
        profile: &BackendProfile,
        disposition: ErrorDisposition,
        error: &DispatchError,
    ) -> bool {
        match disposition {
            ErrorDisposition::Quota => {
                self.quota
                    .mark_exhausted(&profile.id, self.reset_period(profile));
                warn!(profile_id = %profile.id, %error, "attempt failed: quota exhausted upstream");
                true
            }
            ErrorDisposition::Transient => {
                warn!(profile_id = %profile.id, %error, "attempt failed");
                true
            }
            ErrorDisposition::Fatal => {
                warn!(profile_id = %profile.id, %error, "attempt failed terminally");
                false
            }
        }
    }
}

fn no_profiles() -> DispatchError {
    DispatchError::Configuration("no backend profiles configured".to_string())
}

fn admission_denied(profile: &BackendProfile) -> DispatchError {
    DispatchError::RateLimited {
        message: format!("profile '{}' denied by quota admission", profile.id),
        retry_after_secs: None,
    }
}

/// Wraps a provider stream to settle quota accounting at the terminal
/// event.
///
/// Usage frames may arrive more than once (or not at all); the latest
/// non-zero value per direction wins. `Done` records the observed totals,
/// a terminal error records the synthetic minimal delta, and a silent drop
/// (caller cancellation) records nothing since true usage is unknown.
struct UsageRecordingStream {
    inner: ChatStream,
    quota: QuotaTracker,
    profile_id: String,
    observed: Usage,
    recorded: bool,
}

impl UsageRecordingStream {
    fn settle(&mut self, tokens: u64) {
        if !self.recorded {
            self.recorded = true;
            self.quota.record_usage(&self.profile_id, 1, tokens);
        }
    }
}

impl Stream for UsageRecordingStream {
    type Item = Result<StreamEvent, DispatchError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let polled = this.inner.as_mut().poll_next(cx);
        match &polled {
            Poll::Ready(Some(Ok(StreamEvent::Usage(usage)))) => {
                if usage.input_tokens > 0 {
                    this.observed.input_tokens = usage.input_tokens;
                }
                if usage.output_tokens > 0 {
                    this.observed.output_tokens = usage.output_tokens;
                }
            }
            Poll::Ready(Some(Ok(StreamEvent::Done))) => {
                let total = this.observed.total();
                this.settle(total);
            }
            Poll::Ready(Some(Err(_))) => {
                // Record whatever usage was observed; when the stream died
                // before any usage frame this is the synthetic minimal
                // delta of one request and zero tokens
                let total = this.observed.total();
                this.settle(total);
            }
            _ => {}
        }
        polled
    }
}
