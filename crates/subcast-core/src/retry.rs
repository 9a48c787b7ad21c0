//! Bounded retries with exponential backoff, and hook timeouts.
//!
//! [`retry`] is the prescribed recovery mechanism for transient store and
//! transport errors in non-critical paths. Backoff grows exponentially with
//! jitter and is capped; attempts are bounded. [`with_timeout`] bounds
//! application hooks, turning an overrun into a regular error.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::errors::{Result, SubcastError};

/// Backoff configuration for [`retry`].
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Number of retries after the first attempt.
    pub max_retries: u32,
    /// Base delay; doubles each attempt before jitter.
    pub initial_interval: Duration,
    /// Ceiling on any single backoff delay.
    pub max_interval: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_interval: Duration::from_millis(800),
            max_interval: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// Backoff delay for the given zero-based attempt, with ±45% jitter on
    /// the base interval, capped at `max_interval`.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.initial_interval.as_millis() as f64;
        let exp = base * f64::from(2_u32.saturating_pow(attempt));
        let jitter = base * rand::rng().random_range(-0.45..0.45);
        let delay = (exp + jitter).max(0.0) as u64;
        Duration::from_millis(delay).min(self.max_interval)
    }
}

/// Run `op` until it succeeds or retries are exhausted.
///
/// The final error is returned unchanged; intermediate failures are logged.
pub async fn retry<T, F, Fut>(config: &RetryConfig, label: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < config.max_retries => {
                let delay = config.backoff_delay(attempt);
                warn!(
                    label,
                    attempt = attempt + 1,
                    of = config.max_retries + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying after transient failure"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Await `future` for at most `duration`.
///
/// An overrun yields [`SubcastError::Timeout`], which callers treat exactly
/// like a failure of the wrapped operation.
pub async fn with_timeout<T, Fut>(duration: Duration, future: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(SubcastError::Timeout(duration)),
    }
}
