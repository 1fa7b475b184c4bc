//! Bounded retry for transient storage faults.

use std::future::Future;
use std::time::Duration;

use crate::error::{AppError, Result};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(50),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based): `base * 2^(retry - 1)`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << exp)
    }
}

/// Run `op` until it succeeds, fails with a non-transient error, or the
/// attempt budget runs out. Exhaustion surfaces as [`AppError::Unavailable`].
///
/// Each attempt must open its own transaction: a failed attempt has already
/// rolled back by the time the next one starts.
pub async fn with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    op_name: &'static str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if e.is_transient() => {
                if attempt >= max_attempts {
                    tracing::error!(
                        op = op_name,
                        attempts = attempt,
                        error = %e,
                        "Storage retries exhausted"
                    );
                    return Err(AppError::Unavailable);
                }
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    op = op_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient storage fault, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}
