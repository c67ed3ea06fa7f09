use std::{future::Future, time::Duration};

use tracing::{info, warn};

use crate::error::{BackendError, LoadError};

/// Bounded, capped-exponential retry for side-effect-free reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 4,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(4),
            timeout: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, counting from zero.
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31) as u32).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, LoadError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        let attempts = self.attempts.max(1);
        let mut last_err = BackendError::Timeout;
        for attempt in 0..attempts {
            let outcome = match tokio::time::timeout(self.timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(BackendError::Timeout),
            };
            match outcome {
                Ok(value) => {
                    if attempt > 0 {
                        info!(attempt = attempt + 1, "{label}: succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) if err.is_transient() && attempt + 1 < attempts => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        attempt = attempt + 1,
                        max_attempts = attempts,
                        delay_ms = delay.as_millis() as u64,
                        "{label}: transient failure, retrying: {err}"
                    );
                    last_err = err;
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    return Err(LoadError::Backend {
                        attempts: attempt + 1,
                        source: err,
                    });
                }
            }
        }
        Err(LoadError::Backend {
            attempts,
            source: last_err,
        })
    }
}
