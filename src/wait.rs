//! Bounded waiting for conditions that settle asynchronously (a volume
//! finishing its mount, a database coming up after boot).

use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    /// Number of checks before giving up. Always at least one.
    pub attempts: u32,
    /// Pause between checks.
    pub interval: Duration,
}

impl WaitPolicy {
    pub fn new(attempts: u32, interval: Duration) -> Self {
        Self { attempts, interval }
    }

    /// Derive an attempt count from an overall timeout.
    pub fn with_timeout(timeout: Duration, interval: Duration) -> Self {
        let interval_ms = interval.as_millis().max(1);
        let attempts = (timeout.as_millis() / interval_ms) as u32 + 1;
        Self { attempts, interval }
    }

    /// Upper bound on how long `wait_for` can block.
    pub fn budget(&self) -> Duration {
        self.interval * self.attempts.saturating_sub(1)
    }
}

/// Run `check` until it yields a value or the policy is exhausted.
///
/// Sleeps only between checks, never after the last one.
pub fn wait_for<T>(policy: WaitPolicy, mut check: impl FnMut(u32) -> Option<T>) -> Option<T> {
    let attempts = policy.attempts.max(1);
    let started = Instant::now();

    for attempt in 1..=attempts {
        if let Some(value) = check(attempt) {
            if attempt > 1 {
                tracing::debug!(attempt, elapsed_ms = started.elapsed().as_millis() as u64, "wait satisfied");
            }
            return Some(value);
        }
        if attempt < attempts {
            thread::sleep(policy.interval);
        }
    }

    tracing::debug!(attempts, "wait exhausted");
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_returns_first_success() {
        let policy = WaitPolicy::new(5, Duration::from_millis(1));
        let result = wait_for(policy, |attempt| (attempt == 3).then_some(attempt));
        assert_eq!(result, Some(3));
    }

    #[test]
    fn test_gives_up_after_attempts() {
        let policy = WaitPolicy::new(4, Duration::from_millis(1));
        let mut calls = 0;
        let result: Option<()> = wait_for(policy, |_| {
            calls += 1;
            None
        });
        assert!(result.is_none());
        assert_eq!(calls, 4);
    }

    #[test]
    fn test_zero_attempts_still_checks_once() {
        let policy = WaitPolicy::new(0, Duration::from_secs(60));
        let mut calls = 0;
        let _: Option<()> = wait_for(policy, |_| {
            calls += 1;
            None
        });
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_timeout_policy() {
        let policy = WaitPolicy::with_timeout(Duration::from_secs(9), Duration::from_secs(1));
        assert_eq!(policy.attempts, 10);
        assert_eq!(policy.budget(), Duration::from_secs(9));
    }
}
