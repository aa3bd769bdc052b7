//! Exponential backoff with jitter for object store calls.

use std::time::Duration;
use tracing::warn;

use crate::config::RetryConfig;

/// Transport failures, throttling and server errors are worth another attempt.
pub fn is_retryable(err: &ureq::Error) -> bool {
    match err {
        ureq::Error::Transport(_) => true,
        ureq::Error::Status(code, _) => *code == 429 || *code >= 500,
    }
}

/// Delay before attempt `attempt` (1-based), without jitter.
pub fn backoff_delay(retry: &RetryConfig, attempt: usize) -> Duration {
    let mut delay_ms = retry.retry_delay_ms;
    for _ in 1..attempt {
        delay_ms = delay_ms.saturating_mul(2).min(retry.retry_max_delay_ms);
    }
    Duration::from_millis(delay_ms.min(retry.retry_max_delay_ms))
}

/// Call `f` until it succeeds, fails permanently, or the retries run out.
#[allow(clippy::result_large_err)]
pub fn retry_with<T, E: std::fmt::Display>(
    retry: &RetryConfig,
    op_name: &str,
    retryable: impl Fn(&E) -> bool,
    mut f: impl FnMut() -> Result<T, E>,
) -> Result<T, E> {
    let mut attempt = 0;
    loop {
        match f() {
            Ok(val) => return Ok(val),
            Err(e) if retryable(&e) && attempt < retry.max_retries => {
                attempt += 1;
                warn!(
                    "S3 {op_name}: transient error (attempt {}/{}), retrying: {e}",
                    attempt, retry.max_retries,
                );
                let delay = backoff_delay(retry, attempt);
                let jitter = rand::random::<u64>() % (delay.as_millis() as u64).max(1);
                std::thread::sleep(delay + Duration::from_millis(jitter));
            }
            Err(e) => return Err(e),
        }
    }
}

/// [`retry_with`] for plain HTTP calls.
#[allow(clippy::result_large_err)]
pub fn retry_call<T>(
    retry: &RetryConfig,
    op_name: &str,
    f: impl FnMut() -> Result<T, ureq::Error>,
) -> Result<T, ureq::Error> {
    retry_with(retry, op_name, is_retryable, f)
}
