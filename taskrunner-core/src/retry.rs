//! Exponential backoff used to compute a failed job's next `run_at`.

use chrono::Duration;

/// The retry policy a `JobStore` uses to compute `run_at` when a job fails.
///
/// `backoff(attempts)` is monotone non-decreasing, per the store's invariant that a
/// failed job's `run_at` is always strictly in the future.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Multiplier applied to `initial_interval` for every past attempt.
    backoff_coefficient: u32,
    /// The backoff interval for the first retry.
    initial_interval: Duration,
    /// The maximum possible backoff between retries, if bounded.
    maximum_interval: Option<Duration>,
}

impl RetryPolicy {
    pub fn new(backoff_coefficient: u32, initial_interval: Duration, maximum_interval: Option<Duration>) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            maximum_interval,
        }
    }

    /// The delay until the next retry for a job currently at `attempt` attempts.
    pub fn next_run_delay(&self, attempt: u32) -> Duration {
        self.next_run_delay_with_hint(attempt, None)
    }

    /// As `next_run_delay`, but `preferred_delay` (e.g. a `Retry-After` header) is
    /// honored as a floor on the computed delay.
    pub fn next_run_delay_with_hint(&self, attempt: u32, preferred_delay: Option<Duration>) -> Duration {
        let candidate = self.initial_interval * self.backoff_coefficient.pow(attempt) as i32;

        match (preferred_delay, self.maximum_interval) {
            (Some(preferred), Some(max)) => std::cmp::min(std::cmp::max(std::cmp::min(candidate, max), preferred), max),
            (Some(preferred), None) => std::cmp::max(candidate, preferred),
            (None, Some(max)) => std::cmp::min(candidate, max),
            (None, None) => candidate,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: Duration::seconds(1),
            maximum_interval: Some(Duration::hours(1)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_monotone_non_decreasing() {
        let policy = RetryPolicy::default();
        let mut previous = Duration::zero();
        for attempt in 0..10 {
            let delay = policy.next_run_delay(attempt);
            assert!(delay >= previous);
            previous = delay;
        }
    }

    #[test]
    fn backoff_is_capped_at_maximum_interval() {
        let policy = RetryPolicy::new(2, Duration::seconds(1), Some(Duration::seconds(30)));
        assert_eq!(policy.next_run_delay(20), Duration::seconds(30));
    }

    #[test]
    fn preferred_delay_acts_as_a_floor() {
        let policy = RetryPolicy::new(2, Duration::seconds(1), Some(Duration::seconds(30)));
        let delay = policy.next_run_delay_with_hint(0, Some(Duration::seconds(20)));
        assert_eq!(delay, Duration::seconds(20));
    }
}
