//! Backoff, retry and timeout utilities.
//!
//! [`BackoffPolicy`] is shared by the HTTP request retries, the websocket
//! reconnect loop and the stream restart-on-error path.

use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::debug;

/// Exponential backoff with proportional jitter and an optional attempt cap.
#[derive(Clone, Debug, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry (attempt `0`).
    pub base_delay: Duration,
    /// Upper bound applied before jitter.
    pub max_delay: Duration,
    /// Jitter as a fraction of the capped delay, clamped to `[0, 1]`.
    pub jitter_fraction: f64,
    /// Maximum number of attempts, `None` for unbounded.
    pub max_attempts: Option<u32>,
}

impl BackoffPolicy {
    /// Default policy for websocket reconnects: unbounded, capped at 30s.
    pub fn reconnect() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter_fraction: 0.2,
            max_attempts: None,
        }
    }

    /// Low-latency default for short-lived API requests.
    pub fn requests() -> Self {
        Self {
            base_delay: Duration::from_millis(25),
            max_delay: Duration::from_millis(100),
            jitter_fraction: 0.5,
            max_attempts: Some(2),
        }
    }

    /// `min(max_delay, base_delay * 2^attempt)` for a 0-based attempt.
    pub fn capped_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        std::cmp::min(self.base_delay.saturating_mul(factor), self.max_delay)
    }

    /// Capped delay scaled by a random factor in `1 ± jitter_fraction`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.capped_delay(attempt);
        let jitter = self.jitter_fraction.clamp(0.0, 1.0);
        if jitter == 0.0 || delay.is_zero() {
            return delay;
        }

        let factor = 1.0 + jitter * (2.0 * unit_random(attempt) - 1.0);
        delay.mul_f64(factor.max(0.0))
    }

    /// Whether a further attempt is allowed after `attempts_made` attempts.
    pub fn allows_attempt(&self, attempts_made: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempts_made < max)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::reconnect()
    }
}

/// Executes an async operation with retry behavior controlled by `policy`.
///
/// `op` receives the 1-based attempt number. `should_retry` decides whether
/// an error is worth another attempt.
pub async fn retry_async<T, E, Op, Fut, ShouldRetry>(
    policy: &BackoffPolicy,
    mut op: Op,
    mut should_retry: ShouldRetry,
) -> Result<T, E>
where
    Op: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    ShouldRetry: FnMut(&E) -> bool,
{
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if !policy.allows_attempt(attempt) || !should_retry(&error) {
                    return Err(error);
                }

                let delay = policy.delay_for_attempt(attempt - 1);
                debug!(
                    event = "retry_attempt_failed",
                    attempt,
                    max_attempts = ?policy.max_attempts,
                    delay_ms = delay.as_millis() as u64
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                attempt += 1;
            }
        }
    }
}

/// Applies a timeout to an async computation.
pub async fn with_timeout<T, Fut>(
    timeout: Duration,
    future: Fut,
) -> Result<T, tokio::time::error::Elapsed>
where
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, future).await
}

/// Cheap pseudo-random value in `[0, 1]`.
fn unit_random(attempt: u32) -> f64 {
    let now_nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    let mixed = now_nanos ^ (u64::from(attempt).wrapping_mul(0x9E37_79B9_7F4A_7C15));
    (mixed % 10_001) as f64 / 10_000.0
}
