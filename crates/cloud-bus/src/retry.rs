//! Bounded retry with a fixed interval.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// How many times to try and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts in total, first one included. Zero behaves like one.
    pub times: u32,
    pub interval: Duration,
}

impl RetryPolicy {
    pub fn new(times: u32, interval: Duration) -> Self {
        Self { times, interval }
    }
}

/// Runs `work` until it succeeds, fails with an error `is_transient` rejects,
/// or the attempts are used up. The last error is returned.
pub async fn run<T, E, F, Fut, P>(policy: RetryPolicy, is_transient: P, mut work: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let attempts = policy.times.max(1);
    let mut attempt = 1;
    loop {
        match work().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, "succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if attempt < attempts && is_transient(&e) => {
                warn!(
                    attempt,
                    max_attempts = attempts,
                    retry_in_ms = policy.interval.as_millis() as u64,
                    error = %e,
                    "transient failure, retrying"
                );
                tokio::time::sleep(policy.interval).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
