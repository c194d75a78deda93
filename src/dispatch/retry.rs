//! Retry eligibility and exponential backoff.
//!
//! The policy is pure: it reads a message's stored failure count and
//! decides whether and when to reschedule. The count itself is incremented
//! at the failure site (once per failed attempt), never here, so the two
//! can not double-count.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Upper bound on the backoff exponent. With the default 60 s base this
/// caps the delay near twelve days; the attempt cap makes larger exponents
/// unreachable in practice.
const MAX_BACKOFF_EXPONENT: u32 = 14;

/// Retry policy for failed sends.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Maximum failed send attempts before a message is permanently failed.
    pub max_attempts: u32,
    /// Backoff base interval.
    pub base_interval: Duration,
}

/// Outcome of evaluating a failed message against the policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retries remain: reschedule the message to run at `due`.
    Reschedule {
        /// When the next attempt becomes due.
        due: DateTime<Utc>,
    },
    /// Retries are exhausted; the message stays failed. A declined result,
    /// not an error — retrying an exhausted message is a no-op.
    Exhausted,
}

impl RetryPolicy {
    /// Create a policy with the given attempt cap and backoff base.
    pub fn new(max_attempts: u32, base_interval: Duration) -> Self {
        Self {
            max_attempts,
            base_interval,
        }
    }

    /// Whether a message with `retry_count` failed attempts may be retried.
    pub fn eligible(&self, retry_count: i64) -> bool {
        retry_count < i64::from(self.max_attempts)
    }

    /// Backoff delay after the `failed_attempts`-th failure:
    /// `base * 2^(k-1)`, monotonically increasing in `k`.
    pub fn backoff(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts
            .saturating_sub(1)
            .min(MAX_BACKOFF_EXPONENT);
        let factor = 2u64.saturating_pow(exponent);
        Duration::from_secs(self.base_interval.as_secs().saturating_mul(factor))
    }

    /// Evaluate a failed message: reschedule with backoff while attempts
    /// remain, otherwise decline.
    pub fn evaluate(&self, retry_count: i64, now: DateTime<Utc>) -> RetryDecision {
        if !self.eligible(retry_count) {
            return RetryDecision::Exhausted;
        }
        // After the k-th failure the stored count is k; a count of zero
        // (operator retry of a message that never failed a send) gets the
        // base delay.
        let attempts = u32::try_from(retry_count.max(1)).unwrap_or(u32::MAX);
        let delay = self.backoff(attempts);
        let due = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        RetryDecision::Reschedule { due }
    }
}
