//! Engine-owned retry policy for the classification call.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::error::ClassificationError;

/// Upper bound on a single wait, including server-suggested delays.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Errors that know whether another attempt could help.
pub trait Retryable {
    fn is_retryable(&self) -> bool;

    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

impl Retryable for ClassificationError {
    fn is_retryable(&self) -> bool {
        ClassificationError::is_retryable(self)
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Service(e) => e.retry_after(),
            Self::Schema(_) => None,
        }
    }
}

/// Exponential backoff with jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_backoff: Duration) -> Self {
        Self {
            max_retries,
            base_backoff,
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    /// Delay before retry number `retry` (0-based): `base * 2^retry`, ±25% jitter.
    pub fn backoff(&self, retry: u32) -> Duration {
        let exp = self
            .base_backoff
            .saturating_mul(2u32.saturating_pow(retry))
            .min(MAX_BACKOFF);
        let jitter = rand::thread_rng().gen_range(0.75..=1.25);
        exp.mul_f64(jitter).min(MAX_BACKOFF)
    }

    /// Run `op` until it succeeds, fails permanently, or the budget is spent.
    ///
    /// `op` receives the 1-based attempt number.
    pub async fn run<T, E, F, Fut>(&self, mut op: F) -> Result<T, E>
    where
        E: Retryable + std::fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut retry = 0;
        loop {
            match op(retry + 1).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && retry < self.max_retries => {
                    let delay = e
                        .retry_after()
                        .map(|d| d.min(MAX_BACKOFF))
                        .unwrap_or_else(|| self.backoff(retry));
                    warn!(
                        attempt = retry + 1,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
