//! Exponential backoff for transient remote failures.

use std::future::Future;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use tracing::{debug, error, warn};

use crate::error::ApiError;

/// Base 1 s, factor 2, cap 30 s, at most 5 attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub multiplier: f64,
    pub max_interval: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            multiplier: 2.0,
            max_interval: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Deterministic schedule: no jitter, no elapsed-time cutoff.
    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.initial_interval,
            initial_interval: self.initial_interval,
            randomization_factor: 0.0,
            multiplier: self.multiplier,
            max_interval: self.max_interval,
            max_elapsed_time: None,
            ..Default::default()
        }
    }

    /// Delays between consecutive attempts.
    pub fn schedule(&self) -> Vec<Duration> {
        let mut backoff = self.backoff();
        (1..self.max_attempts.max(1))
            .filter_map(|_| backoff.next_backoff())
            .collect()
    }
}

/// A retried call that never succeeded.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryFailure {
    pub attempts: u32,
    pub error: ApiError,
}

/// Run `op` until it succeeds, fails permanently, or attempts run out.
pub async fn retry_transient<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut op: F,
) -> Result<T, RetryFailure>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let mut backoff = policy.backoff();
    let mut attempts = 0;

    loop {
        attempts += 1;
        debug!(operation, attempt = attempts, "Calling memory service");

        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_transient() => {
                warn!(operation, error = %e, "Permanent failure, not retrying");
                return Err(RetryFailure { attempts, error: e });
            }
            Err(e) => {
                if attempts >= policy.max_attempts {
                    error!(operation, error = %e, attempts, "Max retries exceeded");
                    return Err(RetryFailure { attempts, error: e });
                }
                match backoff.next_backoff() {
                    Some(delay) => {
                        warn!(
                            operation,
                            error = %e,
                            retry_in_ms = delay.as_millis() as u64,
                            "Call failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        error!(operation, error = %e, "Backoff exhausted");
                        return Err(RetryFailure { attempts, error: e });
                    }
                }
            }
        }
    }
}
