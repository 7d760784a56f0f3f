//! Exponential backoff with cancellation
//!
//! Every wait in the engine goes through [`Backoff::sleep`] so a single
//! cancellation token interrupts readiness polling, transport retries and
//! gateway retries alike.

use crate::{Error, Result};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Backoff policy
#[derive(Debug, Clone)]
pub struct Backoff {
    /// Delay before the first retry
    pub initial: Duration,
    /// Upper bound for a single delay
    pub max: Duration,
    /// Growth factor between attempts
    pub multiplier: f64,
    /// Maximum attempts including the first one (0 = unbounded)
    pub max_attempts: u32,
    /// Randomize each delay between 0.5x and 1.5x
    pub jitter: bool,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff {
            initial: Duration::from_millis(200),
            max: Duration::from_secs(10),
            multiplier: 2.0,
            max_attempts: 5,
            jitter: false,
        }
    }
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, max_attempts: u32) -> Self {
        Backoff {
            initial,
            max,
            max_attempts,
            ..Default::default()
        }
    }

    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    /// Delay to wait after the given failed attempt (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31) as i32;
        let secs = self.initial.as_secs_f64() * self.multiplier.powi(exp);
        let capped = Duration::from_secs_f64(secs.min(self.max.as_secs_f64()));
        if self.jitter {
            let factor = rand::thread_rng().gen_range(0.5..1.5);
            Duration::from_secs_f64(capped.as_secs_f64() * factor)
        } else {
            capped
        }
    }

    /// Whether another attempt is allowed after `attempt` failures
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts == 0 || attempt < self.max_attempts
    }

    /// Sleep for the delay of `attempt`, returning `Cancelled` if the token fires first
    pub async fn sleep(&self, attempt: u32, cancel: &CancellationToken) -> Result<()> {
        sleep_or_cancel(self.delay(attempt), cancel).await
    }
}

/// Sleep unless cancelled
pub async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

/// Run a future unless cancelled
pub async fn or_cancel<T, F>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        res = fut => res,
    }
}

/// Retry an operation while it fails with a retryable error.
///
/// Non-retryable errors and cancellation return immediately; the last error is
/// returned once the attempt budget is spent.
pub async fn retry<F, Fut, T>(
    policy: &Backoff,
    operation_name: &str,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match or_cancel(cancel, operation()).await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => {
                if !policy.allows(attempt) {
                    warn!("{} failed after {} attempts: {}", operation_name, attempt, e);
                    return Err(e);
                }
                debug!("{} failed (attempt {}), retrying: {}", operation_name, attempt, e);
                policy.sleep(attempt, cancel).await?;
            }
        }
    }
}
