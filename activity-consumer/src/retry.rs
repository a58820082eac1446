//! # Retry
//!
//! Exponential backoff with full jitter, shared by broker reconnects, record
//! retries and checkpoint commits.
use std::time;

use rand::Rng;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Coefficient to multiply initial_interval with for every past attempt.
    pub backoff_coefficient: u32,
    /// The backoff ceiling for the first retry.
    pub initial_interval: time::Duration,
    /// The maximum possible backoff between retries.
    pub maximum_interval: time::Duration,
}

impl RetryPolicy {
    pub fn new(initial_interval: time::Duration, maximum_interval: time::Duration) -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval,
            maximum_interval,
        }
    }

    /// Broker reconnects: 200ms doubling up to 30s.
    pub fn broker_default() -> Self {
        Self::new(
            time::Duration::from_millis(200),
            time::Duration::from_secs(30),
        )
    }

    /// Retries of a single record inside the dispatcher.
    pub fn record_default() -> Self {
        Self::new(time::Duration::from_millis(100), time::Duration::from_secs(5))
    }

    /// No waiting at all, handy when the caller already paces itself.
    pub fn immediate() -> Self {
        Self::new(time::Duration::ZERO, time::Duration::ZERO)
    }

    /// Upper bound of the wait before retry number `attempt` (starting at 1).
    pub fn ceiling(&self, attempt: u32) -> time::Duration {
        let exponent = attempt.saturating_sub(1);

        self.backoff_coefficient
            .checked_pow(exponent)
            .and_then(|factor| self.initial_interval.checked_mul(factor))
            .map_or(self.maximum_interval, |interval| {
                std::cmp::min(interval, self.maximum_interval)
            })
    }

    /// Full jitter: a uniformly random wait between zero and the ceiling.
    pub fn retry_interval(&self, attempt: u32) -> time::Duration {
        let ceiling = self.ceiling(attempt).as_millis() as u64;
        if ceiling == 0 {
            return time::Duration::ZERO;
        }

        time::Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::broker_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ceiling_grows_exponentially() {
        let policy = RetryPolicy::broker_default();

        assert_eq!(policy.ceiling(1), time::Duration::from_millis(200));
        assert_eq!(policy.ceiling(2), time::Duration::from_millis(400));
        assert_eq!(policy.ceiling(3), time::Duration::from_millis(800));
        assert_eq!(policy.ceiling(8), time::Duration::from_millis(25600));
    }

    #[test]
    fn test_ceiling_is_capped() {
        let policy = RetryPolicy::broker_default();

        assert_eq!(policy.ceiling(9), time::Duration::from_secs(30));
        assert_eq!(policy.ceiling(40), time::Duration::from_secs(30));
        // Would overflow u32 without the checked arithmetic
        assert_eq!(policy.ceiling(u32::MAX), time::Duration::from_secs(30));
    }

    #[test]
    fn test_attempt_zero_behaves_like_first() {
        let policy = RetryPolicy::broker_default();

        assert_eq!(policy.ceiling(0), policy.ceiling(1));
    }

    #[test]
    fn test_retry_interval_stays_within_ceiling() {
        let policy = RetryPolicy::broker_default();

        for attempt in 1..12 {
            let interval = policy.retry_interval(attempt);
            assert!(interval <= policy.ceiling(attempt));
        }
    }

    #[test]
    fn test_immediate_never_waits() {
        let policy = RetryPolicy::immediate();

        assert_eq!(policy.retry_interval(1), time::Duration::ZERO);
        assert_eq!(policy.retry_interval(10), time::Duration::ZERO);
    }
}
