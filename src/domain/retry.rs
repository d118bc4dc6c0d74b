//! Retry policy for failed tasks.

use std::time::Duration;

const FALLBACK_BACKOFF: Duration = Duration::from_secs(1);

/// Fixed-delay retry policy.
///
/// Every retry waits the same `backoff`; there is no exponential growth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt, stamped onto new tasks.
    pub max_retries: u32,
    backoff: Duration,
}

impl RetryPolicy {
    pub fn fixed(max_retries: u32, backoff: Duration) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    pub fn none() -> Self {
        Self::fixed(0, FALLBACK_BACKOFF)
    }

    /// Delay before a failed task goes back on the queue. A zero delay is
    /// replaced by one second.
    pub fn backoff(&self) -> Duration {
        if self.backoff.is_zero() {
            FALLBACK_BACKOFF
        } else {
            self.backoff
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_backoff_falls_back_to_one_second() {
        let policy = RetryPolicy::fixed(3, Duration::ZERO);
        assert_eq!(policy.backoff(), Duration::from_secs(1));
    }

    #[test]
    fn configured_backoff_is_kept() {
        let policy = RetryPolicy::fixed(1, Duration::from_millis(25));
        assert_eq!(policy.backoff(), Duration::from_millis(25));
        assert_eq!(policy.max_retries, 1);
    }
}
