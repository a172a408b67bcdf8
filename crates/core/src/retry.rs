//! Rate-limit retry with escalating backoff.
//!
//! [`RetryPolicy`] computes delays purely, so backoff behaviour is testable
//! without real time; the actual waiting goes through the [`Sleeper`] seam
//! ([`TokioSleeper`] in production, a recording fake in tests).

use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::config::MigrationConfig;
use crate::errors::DestinationError;

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Escalating-backoff retry policy for rate-limited destination calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts per call, including the first (must be >= 1).
    pub max_attempts: u32,
    /// Delay before the first retry; doubles on each subsequent one.
    pub base_delay: Duration,
    /// Ceiling on any single delay.
    pub max_delay: Duration,
    /// Add a random fraction of the base delay to spread out retry storms.
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn from_config(config: &MigrationConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.backoff_base_ms),
            max_delay: Duration::from_millis(config.backoff_cap_ms),
            jitter: true,
        }
    }

    /// Delay before retry number `retry` (0-based).
    ///
    /// A server-provided `retry_after` (seconds) takes precedence over the
    /// exponential schedule; both are capped at `max_delay`.
    pub fn delay_for(&self, retry: u32, retry_after: Option<u64>) -> Duration {
        let scheduled = match retry_after {
            Some(secs) => Duration::from_secs(secs),
            None => {
                let factor = 2u32.saturating_pow(retry);
                self.base_delay.saturating_mul(factor)
            }
        };
        let mut delay = scheduled.min(self.max_delay);
        if self.jitter {
            let spread = (self.base_delay.as_millis() as u64) / 2;
            if spread > 0 {
                delay += Duration::from_millis(rand::thread_rng().gen_range(0..spread));
            }
        }
        delay
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&MigrationConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Sleeper seam
// ---------------------------------------------------------------------------

/// Abstraction over waiting, so retry loops can be driven in tests without
/// real time passing.
#[allow(async_fn_in_trait)]
pub trait Sleeper {
    async fn sleep(&self, duration: Duration);
}

/// Production sleeper backed by the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

// ---------------------------------------------------------------------------
// Retry loop
// ---------------------------------------------------------------------------

/// Run `op`, retrying on rate-limit responses per `policy`.
///
/// Non-rate-limit errors (conflicts, validation failures) return immediately:
/// they are deterministic and retrying would just re-fail. When the attempt
/// ceiling is exhausted the final rate-limit error is returned and the caller
/// decides what that means for the affected records.
pub async fn with_retry<T, F, Fut, S>(
    policy: &RetryPolicy,
    sleeper: &S,
    what: &str,
    mut op: F,
) -> Result<T, DestinationError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, DestinationError>>,
    S: Sleeper,
{
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match op().await {
            Err(DestinationError::RateLimited { retry_after }) if attempts < policy.max_attempts => {
                let delay = policy.delay_for(attempts - 1, retry_after);
                warn!(
                    what,
                    attempt = attempts,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "rate limited, backing off before retry"
                );
                sleeper.sleep(delay).await;
            }
            other => return other,
        }
    }
}
