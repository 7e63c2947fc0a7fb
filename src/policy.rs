//! Retry policy: backoff math and failure classification.
//!
//! [`RetryPolicy`] is pure, stateless configuration. The worker consults it
//! for two things:
//!
//! - [`backoff`](RetryPolicy::backoff): the delay before retrying a failed
//!   item, growing exponentially up to a cap
//! - [`classify`](RetryPolicy::classify): mapping an HTTP response to a
//!   [`FailureKind`] that drives the retry decision
//!
//! Classification is derived per attempt from the transport outcome; it is
//! never persisted as a queue-item state.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Classification of a failed delivery attempt.
///
/// All kinds except [`ClientTerminal`](FailureKind::ClientTerminal) are
/// retryable. [`RateLimited`](FailureKind::RateLimited) may carry an exact
/// server-provided delay; without one the caller falls back to computed
/// backoff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// Transport-level failure, no response received.
    Network,
    /// HTTP 429, optionally carrying a `Retry-After` delay.
    RateLimited(Option<Duration>),
    /// HTTP 5xx.
    ServerError,
    /// Non-retryable 4xx; the item is marked failed without further attempts.
    ClientTerminal,
    /// Retryable request-level conflict (408, 425, 409 by default).
    ConflictRetryable,
    /// Expired credentials. Never produced by [`RetryPolicy::classify`];
    /// reserved for external classification, treated as retryable.
    AuthExpired,
}

impl FailureKind {
    /// Whether this kind permits another attempt at all.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FailureKind::ClientTerminal)
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Network => write!(f, "network"),
            FailureKind::RateLimited(Some(d)) => write!(f, "rate-limited (retry after {d:?})"),
            FailureKind::RateLimited(None) => write!(f, "rate-limited"),
            FailureKind::ServerError => write!(f, "server error"),
            FailureKind::ClientTerminal => write!(f, "client terminal"),
            FailureKind::ConflictRetryable => write!(f, "conflict"),
            FailureKind::AuthExpired => write!(f, "auth expired"),
        }
    }
}

/// Retry configuration with exponential backoff.
///
/// `max_attempts` includes the first try. The retryable status set defaults
/// to `{408, 425, 409}`; statuses in it classify as
/// [`FailureKind::ConflictRetryable`] instead of terminal.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum delivery attempts, including the first try.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_backoff: Duration,
    /// Multiplier applied per subsequent attempt.
    pub growth_factor: f64,
    /// Upper bound on the computed delay.
    pub max_backoff: Duration,
    /// Statuses (besides 429 and 5xx) that stay retryable.
    pub retryable_statuses: BTreeSet<u16>,
    /// Honor a parsable `Retry-After` header on 429 responses.
    pub honor_retry_after: bool,
    /// Skip dispatch entirely while offline; enqueue goes straight to the
    /// store.
    pub skip_dispatch_offline: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_secs(2),
            growth_factor: 2.0,
            max_backoff: Duration::from_secs(5 * 60),
            retryable_statuses: BTreeSet::from([408, 425, 409]),
            honor_retry_after: true,
            skip_dispatch_offline: true,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-indexed).
    ///
    /// `backoff(1)` equals the base backoff; the result is non-decreasing in
    /// `attempt` and never exceeds the cap.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.max(1) - 1;
        let secs = self.base_backoff.as_secs_f64() * self.growth_factor.powi(exponent as i32);
        // The product overflows f64-representable durations long before the
        // cap stops growing; clamp before converting.
        Duration::try_from_secs_f64(secs).map_or(self.max_backoff, |delay| {
            delay.min(self.max_backoff)
        })
    }

    /// Classify an HTTP response.
    ///
    /// Returns `None` for success (status below 400). 429 maps to
    /// rate-limited, carrying the exact `Retry-After` delay when the header
    /// is honored and parses as whole seconds. 5xx maps to server error.
    /// Statuses in the retryable set stay retryable; every other 4xx is
    /// terminal.
    pub fn classify(
        &self,
        status: u16,
        headers: &HashMap<String, String>,
    ) -> Option<FailureKind> {
        if status < 400 {
            return None;
        }
        if status == 429 {
            let delay = if self.honor_retry_after {
                retry_after_seconds(headers)
            } else {
                None
            };
            return Some(FailureKind::RateLimited(delay));
        }
        if status >= 500 {
            return Some(FailureKind::ServerError);
        }
        if self.retryable_statuses.contains(&status) {
            return Some(FailureKind::ConflictRetryable);
        }
        Some(FailureKind::ClientTerminal)
    }
}

/// Case-insensitive `Retry-After` lookup; only the seconds form is honored.
fn retry_after_seconds(headers: &HashMap<String, String>) -> Option<Duration> {
    headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("retry-after"))
        .and_then(|(_, value)| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_starts_at_base_and_grows() {
        let policy = RetryPolicy {
            base_backoff: Duration::from_secs(2),
            growth_factor: 2.0,
            max_backoff: Duration::from_secs(60),
            ..RetryPolicy::default()
        };

        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(2), Duration::from_secs(4));
        assert_eq!(policy.backoff(3), Duration::from_secs(8));
        assert_eq!(policy.backoff(4), Duration::from_secs(16));
    }

    #[test]
    fn backoff_is_capped_and_non_decreasing() {
        let policy = RetryPolicy {
            base_backoff: Duration::from_secs(10),
            growth_factor: 3.0,
            max_backoff: Duration::from_secs(45),
            ..RetryPolicy::default()
        };

        let mut previous = Duration::ZERO;
        for attempt in 1..12 {
            let delay = policy.backoff(attempt);
            assert!(delay >= previous);
            assert!(delay <= Duration::from_secs(45));
            previous = delay;
        }
        assert_eq!(policy.backoff(11), Duration::from_secs(45));
    }

    #[test]
    fn backoff_caps_even_when_the_product_overflows() {
        let policy = RetryPolicy {
            base_backoff: Duration::from_secs(2),
            growth_factor: 2.0,
            max_backoff: Duration::from_secs(60),
            ..RetryPolicy::default()
        };

        assert_eq!(policy.backoff(100), Duration::from_secs(60));
        assert_eq!(policy.backoff(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn classify_success_is_none() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.classify(200, &HashMap::new()), None);
        assert_eq!(policy.classify(204, &HashMap::new()), None);
        assert_eq!(policy.classify(302, &HashMap::new()), None);
    }

    #[test]
    fn classify_429_without_header_carries_no_delay() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.classify(429, &HashMap::new()),
            Some(FailureKind::RateLimited(None))
        );
    }

    #[test]
    fn classify_429_honors_retry_after_seconds() {
        let policy = RetryPolicy::default();
        let headers = HashMap::from([("Retry-After".to_string(), "5".to_string())]);
        assert_eq!(
            policy.classify(429, &headers),
            Some(FailureKind::RateLimited(Some(Duration::from_secs(5))))
        );
    }

    #[test]
    fn classify_429_retry_after_is_case_insensitive() {
        let policy = RetryPolicy::default();
        let headers = HashMap::from([("retry-after".to_string(), "12".to_string())]);
        assert_eq!(
            policy.classify(429, &headers),
            Some(FailureKind::RateLimited(Some(Duration::from_secs(12))))
        );
    }

    #[test]
    fn classify_429_unparsable_header_falls_back() {
        let policy = RetryPolicy::default();
        let headers =
            HashMap::from([("Retry-After".to_string(), "Wed, 21 Oct 2015".to_string())]);
        assert_eq!(
            policy.classify(429, &headers),
            Some(FailureKind::RateLimited(None))
        );
    }

    #[test]
    fn classify_429_ignores_header_when_not_honored() {
        let policy = RetryPolicy {
            honor_retry_after: false,
            ..RetryPolicy::default()
        };
        let headers = HashMap::from([("Retry-After".to_string(), "5".to_string())]);
        assert_eq!(
            policy.classify(429, &headers),
            Some(FailureKind::RateLimited(None))
        );
    }

    #[test]
    fn classify_server_and_client_errors() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.classify(500, &HashMap::new()),
            Some(FailureKind::ServerError)
        );
        assert_eq!(
            policy.classify(503, &HashMap::new()),
            Some(FailureKind::ServerError)
        );
        assert_eq!(
            policy.classify(404, &HashMap::new()),
            Some(FailureKind::ClientTerminal)
        );
        assert_eq!(
            policy.classify(422, &HashMap::new()),
            Some(FailureKind::ClientTerminal)
        );
    }

    #[test]
    fn classify_respects_retryable_status_set() {
        let policy = RetryPolicy::default();
        for status in [408, 425, 409] {
            assert_eq!(
                policy.classify(status, &HashMap::new()),
                Some(FailureKind::ConflictRetryable)
            );
        }

        let narrowed = RetryPolicy {
            retryable_statuses: BTreeSet::from([409]),
            ..RetryPolicy::default()
        };
        assert_eq!(
            narrowed.classify(408, &HashMap::new()),
            Some(FailureKind::ClientTerminal)
        );
    }
}
