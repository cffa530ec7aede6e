//! Bounded exponential backoff for transient failures.

use crate::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Retry policy: attempt budget plus exponential backoff bounds.
#[derive(Debug, Clone)]
pub struct RetryOptions {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryOptions {
    /// The generous budget used while a coordinator bootstraps against the
    /// meta store.
    pub fn bootstrap() -> Self {
        Self {
            max_attempts: 300,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
        }
    }

    pub fn attempts(max_attempts: u32) -> Self {
        Self { max_attempts, ..Default::default() }
    }
}

/// Run `op` until it succeeds, the error is non-retryable, or the attempt
/// budget is exhausted. The last error is returned on failure.
pub async fn retry<F, Fut, T>(opts: &RetryOptions, name: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = opts.initial_delay;
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => {
                attempt += 1;
                if attempt >= opts.max_attempts {
                    return Err(e);
                }
                warn!(operation = name, attempt, error = %e, "retrying after backoff");
                // Small jitter avoids synchronized retries across coordinators.
                let jitter = Duration::from_millis(rand::random::<u64>() % 20);
                tokio::time::sleep(delay + jitter).await;
                delay = (delay * 2).min(opts.max_delay);
            }
        }
    }
}
