//! Reconnection delay strategies for the subscribe loop.

use std::time::Duration;

use rand::RngExt;

use crate::config::ReconnectionPolicy;

const LINEAR_INTERVAL: Duration = Duration::from_secs(3);
const EXPONENTIAL_CAP_SECS: u64 = 32;
const JITTER_MS: i64 = 500;

/// Decides how long to wait before retry number `retry_count` (0-based).
/// `None` means give up.
pub(crate) trait RetryPolicy: Send + Sync {
    fn next_delay(&self, retry_count: u32) -> Option<Duration>;
}

pub(crate) struct NoRetry;

impl RetryPolicy for NoRetry {
    fn next_delay(&self, _retry_count: u32) -> Option<Duration> {
        None
    }
}

pub(crate) struct LinearRetry;

impl RetryPolicy for LinearRetry {
    fn next_delay(&self, _retry_count: u32) -> Option<Duration> {
        Some(LINEAR_INTERVAL)
    }
}

/// `min(2^n, 32)` seconds with ±500 ms of uniform jitter.
pub(crate) struct ExponentialRetry;

impl ExponentialRetry {
    fn base(retry_count: u32) -> Duration {
        let secs = 1u64
            .checked_shl(retry_count)
            .unwrap_or(u64::MAX)
            .min(EXPONENTIAL_CAP_SECS);
        Duration::from_secs(secs)
    }
}

impl RetryPolicy for ExponentialRetry {
    fn next_delay(&self, retry_count: u32) -> Option<Duration> {
        let base = Self::base(retry_count);
        let jitter = rand::rng().random_range(-JITTER_MS..=JITTER_MS);
        let delay = if jitter >= 0 {
            base + Duration::from_millis(jitter.unsigned_abs())
        } else {
            base.saturating_sub(Duration::from_millis(jitter.unsigned_abs()))
        };
        Some(delay)
    }
}

pub(crate) fn policy_for(policy: ReconnectionPolicy) -> Box<dyn RetryPolicy> {
    match policy {
        ReconnectionPolicy::None => Box::new(NoRetry),
        ReconnectionPolicy::Linear => Box::new(LinearRetry),
        ReconnectionPolicy::Exponential => Box::new(ExponentialRetry),
    }
}

/// Whether attempt `retry_count` is still within `max_retries` (-1 is
/// unlimited).
pub(crate) fn within_budget(retry_count: u32, max_retries: i32) -> bool {
    max_retries < 0 || i64::from(retry_count) < i64::from(max_retries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_doubles_up_to_cap() {
        let expected = [1, 2, 4, 8, 16, 32, 32, 32];
        for (n, secs) in expected.iter().enumerate() {
            let base = Duration::from_secs(*secs);
            let delay = ExponentialRetry.next_delay(n as u32).unwrap();
            assert!(delay >= base - Duration::from_millis(500), "{n}: {delay:?}");
            assert!(delay <= base + Duration::from_millis(500), "{n}: {delay:?}");
        }
        assert_eq!(ExponentialRetry::base(200), Duration::from_secs(32));
    }

    #[test]
    fn linear_and_none() {
        assert_eq!(LinearRetry.next_delay(0), Some(Duration::from_secs(3)));
        assert_eq!(LinearRetry.next_delay(10), Some(Duration::from_secs(3)));
        assert_eq!(NoRetry.next_delay(0), None);
        assert!(policy_for(ReconnectionPolicy::None).next_delay(0).is_none());
        assert!(policy_for(ReconnectionPolicy::Linear).next_delay(0).is_some());
    }

    #[test]
    fn retry_budget() {
        assert!(within_budget(1_000, -1));
        assert!(within_budget(0, 3));
        assert!(within_budget(2, 3));
        assert!(!within_budget(3, 3));
        assert!(!within_budget(0, 0));
    }
}
