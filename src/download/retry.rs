//! Backoff scheduling and retry decisions for failed page fetches.
//!
//! [`BackoffPolicy::delay_for`] is a pure function from attempt number (and a
//! jitter fraction) to delay. [`RetryPolicy::decide`] combines it with the
//! error classification and the attempt budget into a [`RetryDecision`];
//! workers never sleep on their own, they report the decision and the
//! scheduler re-dispatches the page once the delay has passed.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use manuscript_core::download::{BackoffPolicy, FetchError, RetryDecision, RetryPolicy};
//!
//! let policy = RetryPolicy::new(3, BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(30)));
//! let error = FetchError::http_status("https://example.com/p1.jpg", 503, None);
//!
//! match policy.decide(&error, 1, 0.0) {
//!     RetryDecision::Retry { delay, attempt } => {
//!         assert_eq!(delay, Duration::from_secs(1));
//!         assert_eq!(attempt, 2);
//!     }
//!     RetryDecision::DoNotRetry { reason } => panic!("{reason}"),
//! }
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use super::FetchError;

/// Default number of retries after the first attempt.
pub const DEFAULT_RETRY_LIMIT: u32 = 3;

/// Default delay before the first retry.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Default cap on any single backoff delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Upper bound of the random jitter fraction added to a delay.
pub const MAX_JITTER_FRACTION: f64 = 0.3;

/// Maximum honoured Retry-After value (1 hour).
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Largest exponent applied to the base delay; keeps the float finite.
const MAX_EXPONENT: u32 = 30;

/// Exponential backoff with jitter, capped at a maximum delay.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    base: Duration,
    max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}

impl BackoffPolicy {
    /// Creates a policy; `max` is raised to `base` if it is smaller.
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
        }
    }

    /// Delay before the first retry.
    #[must_use]
    pub fn base(&self) -> Duration {
        self.base
    }

    /// Cap on any single delay.
    #[must_use]
    pub fn max(&self) -> Duration {
        self.max
    }

    /// Delay to wait after failed attempt number `attempt` (1-indexed).
    ///
    /// `delay = min(base * 2^(attempt-1) * (1 + jitter), max)` with `jitter`
    /// clamped into `[0, MAX_JITTER_FRACTION]`.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn delay_for(&self, attempt: u32, jitter: f64) -> Duration {
        let exponent = attempt.saturating_sub(1).min(MAX_EXPONENT);
        let jitter = if jitter.is_finite() {
            jitter.clamp(0.0, MAX_JITTER_FRACTION)
        } else {
            0.0
        };

        let base_nanos = self.base.as_nanos() as f64;
        let raw = base_nanos * f64::from(2_u32.pow(exponent)) * (1.0 + jitter);
        let capped = raw.min(self.max.as_nanos() as f64);

        Duration::from_nanos(capped.round() as u64)
    }

    /// Same as [`Self::delay_for`] with a random jitter fraction.
    #[must_use]
    pub fn sample_delay(&self, attempt: u32) -> Duration {
        self.delay_for(attempt, random_jitter())
    }
}

/// Draws a jitter fraction uniformly from `[0, MAX_JITTER_FRACTION]`.
#[must_use]
pub fn random_jitter() -> f64 {
    rand::thread_rng().gen_range(0.0..=MAX_JITTER_FRACTION)
}

/// Decision on whether to retry a failed page fetch.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Retry the page after the specified delay.
    Retry {
        /// How long to wait before retrying.
        delay: Duration,
        /// The attempt number the retry will be (first retry is attempt 2).
        attempt: u32,
    },

    /// The failure is terminal for this page.
    DoNotRetry {
        /// Human-readable reason why no retry is attempted.
        reason: String,
    },
}

impl RetryDecision {
    /// Returns true for [`RetryDecision::Retry`].
    #[must_use]
    pub fn is_retry(&self) -> bool {
        matches!(self, Self::Retry { .. })
    }
}

/// Attempt budget plus backoff for one library.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    retry_limit: u32,
    backoff: BackoffPolicy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY_LIMIT, BackoffPolicy::default())
    }
}

impl RetryPolicy {
    /// Creates a policy allowing `retry_limit` retries after the first attempt.
    #[must_use]
    pub fn new(retry_limit: u32, backoff: BackoffPolicy) -> Self {
        Self {
            retry_limit,
            backoff,
        }
    }

    /// Number of retries allowed after the first attempt.
    #[must_use]
    pub fn retry_limit(&self) -> u32 {
        self.retry_limit
    }

    /// Total attempts allowed, including the first.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.retry_limit.saturating_add(1)
    }

    /// The backoff used between attempts.
    #[must_use]
    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    /// Decides what to do after attempt number `attempt` (1-indexed) failed.
    ///
    /// A server-supplied Retry-After raises the backoff delay, never lowers it.
    #[must_use]
    pub fn decide(&self, error: &FetchError, attempt: u32, jitter: f64) -> RetryDecision {
        if !error.is_retryable() {
            return RetryDecision::DoNotRetry {
                reason: format!("{} failure is not retryable", error.kind()),
            };
        }

        if attempt >= self.max_attempts() {
            debug!(attempt, max = self.max_attempts(), "max attempts reached");
            return RetryDecision::DoNotRetry {
                reason: format!("max attempts ({}) exhausted", self.max_attempts()),
            };
        }

        let mut delay = self.backoff.delay_for(attempt, jitter);
        if let Some(requested) = error.retry_after() {
            delay = delay.max(requested.min(MAX_RETRY_AFTER));
        }

        debug!(
            attempt,
            next_attempt = attempt + 1,
            delay_ms = delay.as_millis(),
            "will retry"
        );

        RetryDecision::Retry {
            delay,
            attempt: attempt + 1,
        }
    }
}

/// Parses a Retry-After header value (delta-seconds or HTTP-date).
///
/// Values above [`MAX_RETRY_AFTER`] are capped; negative values, dates in the
/// past and unparseable values yield `None`.
#[must_use]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    if let Ok(seconds) = header_value.parse::<i64>() {
        if seconds < 0 {
            debug!(seconds, "negative Retry-After value, ignoring");
            return None;
        }

        #[allow(clippy::cast_sign_loss)]
        let duration = Duration::from_secs(seconds as u64);
        return Some(cap_retry_after(duration));
    }

    let datetime = httpdate::parse_http_date(header_value).ok()?;
    let duration = datetime.duration_since(std::time::SystemTime::now()).ok()?;
    Some(cap_retry_after(duration))
}

fn cap_retry_after(duration: Duration) -> Duration {
    if duration > MAX_RETRY_AFTER {
        warn!(
            delay_secs = duration.as_secs(),
            max_secs = MAX_RETRY_AFTER.as_secs(),
            "Retry-After exceeds maximum, capping at 1 hour"
        );
        MAX_RETRY_AFTER
    } else {
        duration
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn policy(limit: u32) -> RetryPolicy {
        RetryPolicy::new(
            limit,
            BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(30)),
        )
    }

    fn server_error() -> FetchError {
        FetchError::http_status("https://example.com/p.jpg", 503, None)
    }

    // ==================== Backoff Tests ====================

    #[test]
    fn test_delay_doubles_per_attempt_without_jitter() {
        let backoff = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(30));
        assert_eq!(backoff.delay_for(1, 0.0), Duration::from_secs(1));
        assert_eq!(backoff.delay_for(2, 0.0), Duration::from_secs(2));
        assert_eq!(backoff.delay_for(3, 0.0), Duration::from_secs(4));
        assert_eq!(backoff.delay_for(4, 0.0), Duration::from_secs(8));
    }

    #[test]
    fn test_delay_is_capped_at_max() {
        let backoff = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(5));
        assert_eq!(backoff.delay_for(6, 0.0), Duration::from_secs(5));
        assert_eq!(backoff.delay_for(u32::MAX, 0.3), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_scales_delay() {
        let backoff = BackoffPolicy::new(Duration::from_millis(1000), Duration::from_secs(30));
        assert_eq!(backoff.delay_for(2, 0.25), Duration::from_millis(2500));
    }

    #[test]
    fn test_jitter_is_clamped() {
        let backoff = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(30));
        assert_eq!(backoff.delay_for(1, 5.0), Duration::from_millis(1300));
        assert_eq!(backoff.delay_for(1, -1.0), Duration::from_secs(1));
        assert_eq!(backoff.delay_for(1, f64::NAN), Duration::from_secs(1));
    }

    #[test]
    fn test_sampled_delay_within_jitter_bounds() {
        let backoff = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(30));
        for _ in 0..100 {
            let delay = backoff.sample_delay(3);
            assert!(delay >= Duration::from_secs(4));
            assert!(delay <= Duration::from_millis(5200));
        }
    }

    #[test]
    fn test_max_is_raised_to_base() {
        let backoff = BackoffPolicy::new(Duration::from_secs(10), Duration::from_secs(1));
        assert_eq!(backoff.max(), Duration::from_secs(10));
    }

    // ==================== Decision Tests ====================

    #[test]
    fn test_retryable_error_within_budget_retries() {
        let decision = policy(3).decide(&server_error(), 1, 0.0);
        assert_eq!(
            decision,
            RetryDecision::Retry {
                delay: Duration::from_secs(1),
                attempt: 2
            }
        );
    }

    #[test]
    fn test_budget_exhausted_after_limit_plus_one_attempts() {
        let policy = policy(2);
        assert!(policy.decide(&server_error(), 2, 0.0).is_retry());
        match policy.decide(&server_error(), 3, 0.0) {
            RetryDecision::DoNotRetry { reason } => assert!(reason.contains("exhausted")),
            other => panic!("expected DoNotRetry, got {other:?}"),
        }
    }

    #[test]
    fn test_zero_retry_limit_never_retries() {
        assert!(!policy(0).decide(&server_error(), 1, 0.0).is_retry());
    }

    #[test]
    fn test_permanent_status_is_not_retried() {
        let error = FetchError::http_status("https://example.com/p.jpg", 404, None);
        match policy(5).decide(&error, 1, 0.0) {
            RetryDecision::DoNotRetry { reason } => assert!(reason.contains("not retryable")),
            other => panic!("expected DoNotRetry, got {other:?}"),
        }
    }

    #[test]
    fn test_retry_after_raises_delay() {
        let error = FetchError::http_status(
            "https://example.com/p.jpg",
            429,
            Some(Duration::from_secs(12)),
        );
        match policy(3).decide(&error, 1, 0.0) {
            RetryDecision::Retry { delay, .. } => assert_eq!(delay, Duration::from_secs(12)),
            other => panic!("expected Retry, got {other:?}"),
        }
    }

    #[test]
    fn test_retry_after_never_lowers_backoff() {
        let error =
            FetchError::http_status("https://example.com/p.jpg", 503, Some(Duration::ZERO));
        match policy(5).decide(&error, 3, 0.0) {
            RetryDecision::Retry { delay, .. } => assert_eq!(delay, Duration::from_secs(4)),
            other => panic!("expected Retry, got {other:?}"),
        }
    }

    // ==================== Retry-After Parsing Tests ====================

    #[test]
    fn test_parse_retry_after_seconds() {
        assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
        assert_eq!(parse_retry_after(" 5 "), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_parse_retry_after_caps_large_values() {
        assert_eq!(parse_retry_after("86400"), Some(MAX_RETRY_AFTER));
    }

    #[test]
    fn test_parse_retry_after_rejects_invalid() {
        assert_eq!(parse_retry_after("-5"), None);
        assert_eq!(parse_retry_after("soon"), None);
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
    }

    #[test]
    fn test_parse_retry_after_future_http_date() {
        let future = std::time::SystemTime::now() + Duration::from_secs(600);
        let header = httpdate::fmt_http_date(future);
        let parsed = parse_retry_after(&header).unwrap();
        assert!(parsed <= Duration::from_secs(600));
        assert!(parsed >= Duration::from_secs(590));
    }
}
