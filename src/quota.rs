//! Per-profile quota tracking
//!
//! Counters live in memory only and are keyed by profile id. The window is
//! a hard reset-at-timestamp, not a sliding window: when the current time
//! passes `window_reset_at`, counters drop to zero and a new window opens
//! lazily on the next access.
//!
//! Every touch is a short, non-blocking critical section under one mutex;
//! nothing here awaits.

use crate::profile::QuotaLimit;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

/// Usage counters for one profile within the current window
#[derive(Debug, Clone, Default)]
pub struct QuotaUsage {
    /// Requests completed in this window
    pub request_count: u64,
    /// Tokens consumed in this window
    pub token_count: u64,
    /// When this window closes; always in the future once set
    pub window_reset_at: Option<Instant>,
    /// Set when the upstream itself reported exhaustion; denies admission
    /// until the window reopens regardless of local counters
    pub exhausted: bool,
}

impl QuotaUsage {
    fn reopen_if_elapsed(&mut self, now: Instant) {
        if let Some(reset_at) = self.window_reset_at {
            if now >= reset_at {
                *self = QuotaUsage::default();
            }
        }
    }
}

/// Tracks quota usage across all profiles.
///
/// Cheap to clone; clones share the same counters.
#[derive(Debug, Clone, Default)]
pub struct QuotaTracker {
    inner: Arc<Mutex<HashMap<String, QuotaUsage>>>,
}

impl QuotaTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check whether a profile may be invoked right now.
    ///
    /// Lazily reopens the window when it has elapsed. Returns `false` when
    /// the upstream marked the profile exhausted or either configured limit
    /// is met or exceeded. A profile with no configured limit is always
    /// admitted (its usage is still tracked).
    pub fn check_admission(
        &self,
        profile_id: &str,
        limit: Option<&QuotaLimit>,
        reset_period: Duration,
    ) -> bool {
        self.check_admission_at(profile_id, limit, reset_period, Instant::now())
    }

    pub(crate) fn check_admission_at(
        &self,
        profile_id: &str,
        limit: Option<&QuotaLimit>,
        reset_period: Duration,
        now: Instant,
    ) -> bool {
        let mut map = self.inner.lock().expect("quota lock poisoned");
        let usage = map.entry(profile_id.to_string()).or_default();
        usage.reopen_if_elapsed(now);
        if usage.window_reset_at.is_none() {
            usage.window_reset_at = Some(now + reset_period);
        }

        if usage.exhausted {
            debug!(profile_id, "admission denied: upstream-reported exhaustion");
            return false;
        }

        let Some(limit) = limit else {
            return true;
        };
        if let Some(max_requests) = limit.max_requests {
            if usage.request_count >= max_requests {
                debug!(profile_id, requests = usage.request_count, "admission denied: request limit");
                return false;
            }
        }
        if let Some(max_tokens) = limit.max_tokens {
            if usage.token_count >= max_tokens {
                debug!(profile_id, tokens = usage.token_count, "admission denied: token limit");
                return false;
            }
        }
        true
    }

    /// Record one completed attempt against a profile.
    ///
    /// Called with the observed usage on success, or with a synthetic
    /// minimal delta when true usage is unknown.
    pub fn record_usage(&self, profile_id: &str, requests_delta: u64, tokens_delta: u64) {
        let mut map = self.inner.lock().expect("quota lock poisoned");
        let usage = map.entry(profile_id.to_string()).or_default();
        usage.request_count += requests_delta;
        usage.token_count += tokens_delta;
    }

    /// Force a profile's window shut until `now + reset_period`.
    ///
    /// Used when the upstream reported a quota/rate-limit error: the
    /// upstream's signal is authoritative, so local counters are left
    /// untouched.
    pub fn mark_exhausted(&self, profile_id: &str, reset_period: Duration) {
        self.mark_exhausted_at(profile_id, reset_period, Instant::now())
    }

    pub(crate) fn mark_exhausted_at(&self, profile_id: &str, reset_period: Duration, now: Instant) {
        let mut map = self.inner.lock().expect("quota lock poisoned");
        let usage = map.entry(profile_id.to_string()).or_default();
        usage.exhausted = true;
        usage.window_reset_at = Some(now + reset_period);
    }

    /// Snapshot of a profile's current counters, if it has any
    pub fn usage(&self, profile_id: &str) -> Option<QuotaUsage> {
        self.inner
            .lock()
            .expect("quota lock poisoned")
            .get(profile_id)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(60);

    fn request_limit(n: u64) -> QuotaLimit {
        QuotaLimit {
            max_requests: Some(n),
            max_tokens: None,
        }
    }

    #[test]
    fn unlimited_profile_is_always_admitted() {
        let tracker = QuotaTracker::new();
        for _ in 0..1000 {
            assert!(tracker.check_admission("p", None, WINDOW));
            tracker.record_usage("p", 1, 10_000);
        }
    }

    #[test]
    fn request_limit_denies_after_limit_reached() {
        let tracker = QuotaTracker::new();
        let limit = request_limit(3);
        for _ in 0..3 {
            assert!(tracker.check_admission("p", Some(&limit), WINDOW));
            tracker.record_usage("p", 1, 5);
        }
        assert!(!tracker.check_admission("p", Some(&limit), WINDOW));
    }

    #[test]
    fn token_limit_denies_when_met_or_exceeded() {
        let tracker = QuotaTracker::new();
        let limit = QuotaLimit {
            max_requests: None,
            max_tokens: Some(100),
        };
        assert!(tracker.check_admission("p", Some(&limit), WINDOW));
        tracker.record_usage("p", 1, 100);
        assert!(!tracker.check_admission("p", Some(&limit), WINDOW));
    }

    #[test]
    fn window_reopens_after_reset_instant() {
        let tracker = QuotaTracker::new();
        let limit = request_limit(1);
        let start = Instant::now();

        assert!(tracker.check_admission_at("p", Some(&limit), WINDOW, start));
        tracker.record_usage("p", 1, 5);
        assert!(!tracker.check_admission_at("p", Some(&limit), WINDOW, start));

        // One tick past the window boundary: counters drop to zero
        let later = start + WINDOW + Duration::from_millis(1);
        assert!(tracker.check_admission_at("p", Some(&limit), WINDOW, later));
        let usage = tracker.usage("p").unwrap();
        assert_eq!(usage.request_count, 0);
        assert_eq!(usage.token_count, 0);
    }

    #[test]
    fn mark_exhausted_denies_without_touching_counters() {
        let tracker = QuotaTracker::new();
        let start = Instant::now();
        assert!(tracker.check_admission_at("p", None, WINDOW, start));
        tracker.record_usage("p", 2, 40);

        tracker.mark_exhausted_at("p", WINDOW, start);
        assert!(!tracker.check_admission_at("p", None, WINDOW, start));

        let usage = tracker.usage("p").unwrap();
        assert_eq!(usage.request_count, 2);
        assert_eq!(usage.token_count, 40);
        assert!(usage.exhausted);
        assert!(usage.window_reset_at.unwrap() > start);

        // Window elapses: profile is admissible again
        let later = start + WINDOW + Duration::from_millis(1);
        assert!(tracker.check_admission_at("p", None, WINDOW, later));
        assert!(!tracker.usage("p").unwrap().exhausted);
    }

    #[test]
    fn clones_share_counters() {
        let tracker = QuotaTracker::new();
        let limit = request_limit(1);
        let other = tracker.clone();
        assert!(tracker.check_admission("p", Some(&limit), WINDOW));
        other.record_usage("p", 1, 1);
        assert!(!tracker.check_admission("p", Some(&limit), WINDOW));
    }
}
