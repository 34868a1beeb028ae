use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use tracing::warn;

/// Bounded exponential backoff policy.
#[derive(Debug, Deserialize, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Default: 3.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u8,
    /// Delay before the first retry. Default: 50ms.
    #[serde(default = "default_base_ms")]
    pub base_ms: u64,
    /// Upper bound on any single delay. Default: 2000ms.
    #[serde(default = "default_max_ms")]
    pub max_ms: u64,
}

fn default_max_attempts() -> u8 {
    3
}
fn default_base_ms() -> u64 {
    50
}
fn default_max_ms() -> u64 {
    2000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_ms: default_base_ms(),
            max_ms: default_max_ms(),
        }
    }
}

/// Exponential backoff with up to 25% jitter, capped at `max_ms`.
pub fn calculate_backoff(attempt: u8, base_ms: u64, max_ms: u64) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }

    let exp_factor = 2u64.saturating_pow((attempt - 1) as u32);
    let delay_ms = base_ms.saturating_mul(exp_factor);

    let jitter = if delay_ms > 0 {
        rand::rng().random_range(0..=delay_ms / 4)
    } else {
        0
    };

    let total_delay = delay_ms.saturating_add(jitter).min(max_ms);
    Duration::from_millis(total_delay)
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the policy is exhausted.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy,
    is_retryable: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt: u8 = 0;

    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < max_attempts && is_retryable(&e) => {
                let delay = calculate_backoff(attempt, policy.base_ms, policy.max_ms);
                warn!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
