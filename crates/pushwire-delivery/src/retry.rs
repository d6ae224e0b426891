//! Exponential backoff for retryable delivery failures.
//!
//! A notification that has already failed `r` times waits `2^(r + 1)`
//! seconds before its next attempt: 2s, 4s, 8s and so on. Both the delay cap
//! and the retry budget are optional and unset by default.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Largest exponent evaluated before saturating, 2^40 seconds is already
/// tens of thousands of years.
const MAX_EXPONENT: u32 = 40;

/// Backoff configuration for retryable failures.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Upper bound on the delay between attempts.
    pub max_delay: Option<Duration>,

    /// Number of retries after which a retryable failure becomes permanent.
    pub max_retries: Option<u32>,
}

/// What to do with a notification after a retryable failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again no earlier than `deliver_after`.
    Retry {
        /// Next eligible delivery time.
        deliver_after: DateTime<Utc>,
    },
    /// The retry budget is spent.
    GiveUp,
}

impl BackoffPolicy {
    /// Delay before the next attempt for a notification with `retries`
    /// previous failures.
    pub fn delay(&self, retries: i32) -> Duration {
        let exponent = u32::try_from(retries).unwrap_or(0).saturating_add(1).min(MAX_EXPONENT);
        let delay = Duration::from_secs(2u64.saturating_pow(exponent));
        match self.max_delay {
            Some(max) => delay.min(max),
            None => delay,
        }
    }

    /// Decides when a notification with `retries` previous failures should
    /// be attempted next.
    pub fn decide(&self, retries: i32, now: DateTime<Utc>) -> RetryDecision {
        if let Some(max) = self.max_retries {
            if u32::try_from(retries).unwrap_or(0) >= max {
                return RetryDecision::GiveUp;
            }
        }
        RetryDecision::Retry { deliver_after: offset(now, self.delay(retries)) }
    }
}

/// Adds a std duration to a timestamp, saturating at the maximum instant.
pub fn offset(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_from_two_seconds() {
        let policy = BackoffPolicy::default();
        let delays: Vec<u64> = (0..5).map(|r| policy.delay(r).as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 8, 16, 32]);
    }

    #[test]
    fn delay_respects_cap() {
        let policy = BackoffPolicy { max_delay: Some(Duration::from_secs(10)), ..Default::default() };
        assert_eq!(policy.delay(1), Duration::from_secs(4));
        assert_eq!(policy.delay(5), Duration::from_secs(10));
    }

    #[test]
    fn huge_retry_counts_saturate() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay(i32::MAX), Duration::from_secs(1 << MAX_EXPONENT));
        assert_eq!(policy.delay(-3), Duration::from_secs(2));

        let now = Utc::now();
        assert!(matches!(policy.decide(i32::MAX, now), RetryDecision::Retry { .. }));
    }

    #[test]
    fn gives_up_when_budget_spent() {
        let policy = BackoffPolicy { max_retries: Some(3), ..Default::default() };
        let now = Utc::now();

        assert_eq!(
            policy.decide(2, now),
            RetryDecision::Retry { deliver_after: now + chrono::Duration::seconds(8) }
        );
        assert_eq!(policy.decide(3, now), RetryDecision::GiveUp);
    }
}
