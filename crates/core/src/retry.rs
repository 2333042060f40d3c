//! Retry and backoff utilities for transient operations
//!
//! Package-index refreshes and downloads fail for reasons that go away on
//! their own (lock contention, mirror hiccups). Step actions wrap those
//! operations in [`retry_async`] or the boolean [`retry`] helper. Retrying is a
//! building block inside an action; it is never a step of its own.
//!
//! Attempts are counted `1..=max_attempts`. The delay is slept after every
//! failing attempt except the last one.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Spacing between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// Same delay after every failed attempt
    #[default]
    Constant,
    /// Delay doubles after every failed attempt, capped at `max_delay`
    Exponential,
}

/// Jitter strategy for retry delays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// Use the calculated delay as is
    #[default]
    None,
    /// Full jitter: random delay between 0 and calculated delay
    FullJitter,
    /// Equal jitter: half calculated delay plus random half
    EqualJitter,
}

/// Configuration for retry behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total number of attempts, including the first
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Constant or exponential spacing
    pub backoff: BackoffStrategy,
    /// Jitter strategy to apply
    pub jitter: JitterStrategy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            backoff: BackoffStrategy::Constant,
            jitter: JitterStrategy::None,
        }
    }
}

impl RetryConfig {
    /// Create a new RetryConfig with specified parameters
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
        backoff: BackoffStrategy,
        jitter: JitterStrategy,
    ) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            backoff,
            jitter,
        }
    }

    /// Fixed delay between a bounded number of attempts
    pub fn constant(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            backoff: BackoffStrategy::Constant,
            jitter: JitterStrategy::None,
        }
    }

    /// Attempts actually made; a zero configuration still tries once.
    pub fn effective_attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Calculate the delay to sleep after failed attempt `attempt` (1-based)
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        self.apply_jitter(self.undithered_delay(attempt))
    }

    fn undithered_delay(&self, attempt: u32) -> Duration {
        match self.backoff {
            BackoffStrategy::Constant => self.base_delay,
            BackoffStrategy::Exponential => {
                let exponent = attempt.saturating_sub(1).min(31);
                let exponential = self
                    .base_delay
                    .as_millis()
                    .saturating_mul(2_u128.pow(exponent));
                let capped = exponential.min(self.max_delay.as_millis());
                Duration::from_millis(capped as u64)
            }
        }
    }

    fn apply_jitter(&self, delay: Duration) -> Duration {
        match self.jitter {
            JitterStrategy::None => delay,
            JitterStrategy::FullJitter => {
                let jitter_ms = fastrand::u64(0..=delay.as_millis() as u64);
                Duration::from_millis(jitter_ms)
            }
            JitterStrategy::EqualJitter => {
                let half_delay = delay.as_millis() as u64 / 2;
                let jitter_ms = half_delay + fastrand::u64(0..=half_delay);
                Duration::from_millis(jitter_ms)
            }
        }
    }

    #[cfg(test)]
    fn calculate_delay_seeded(&self, attempt: u32, seed: u64) -> Duration {
        let delay = self.undithered_delay(attempt);
        let mut rng = fastrand::Rng::with_seed(seed);
        match self.jitter {
            JitterStrategy::None => delay,
            JitterStrategy::FullJitter => Duration::from_millis(rng.u64(0..=delay.as_millis() as u64)),
            JitterStrategy::EqualJitter => {
                let half_delay = delay.as_millis() as u64 / 2;
                Duration::from_millis(half_delay + rng.u64(0..=half_delay))
            }
        }
    }
}

/// Error classification result for retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry the operation
    Retry,
    /// Do not retry (terminal error)
    Stop,
}

/// Error classifier function type
pub type ErrorClassifier<E> = fn(&E) -> RetryDecision;

/// Default error classifier that retries on all errors
pub fn default_classifier<E>(_error: &E) -> RetryDecision {
    RetryDecision::Retry
}

/// Retry an async operation according to `config`.
///
/// Returns the first success, or the last error once attempts are exhausted
/// or the classifier says stop.
#[instrument(level = "debug", skip(operation, classify_error), fields(max_attempts = config.max_attempts))]
pub async fn retry_async<T, E, Fut, Op>(
    config: &RetryConfig,
    mut operation: Op,
    classify_error: ErrorClassifier<E>,
) -> std::result::Result<T, E>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: std::fmt::Debug,
{
    let max_attempts = config.effective_attempts();
    let mut attempt = 1;

    loop {
        debug!("Attempt {} of {}", attempt, max_attempts);

        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    debug!("Operation succeeded on attempt {}", attempt);
                }
                return Ok(result);
            }
            Err(error) => {
                debug!("Operation failed on attempt {}: {:?}", attempt, error);

                if classify_error(&error) == RetryDecision::Stop {
                    debug!("Error classifier indicated stop, not retrying");
                    return Err(error);
                }

                if attempt >= max_attempts {
                    warn!(
                        "All {} attempts exhausted, final error: {:?}",
                        max_attempts, error
                    );
                    return Err(error);
                }

                let delay = config.calculate_delay(attempt);
                debug!("Sleeping for {:?} before next attempt", delay);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Boolean retry helper: invoke `action` up to `max_attempts` times with a
/// constant `delay` after each failure. Returns `true` on the first success.
pub async fn retry<F, Fut>(action: F, max_attempts: u32, delay: Duration) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let config = RetryConfig::constant(max_attempts, delay);
    let mut action = action;
    retry_async(
        &config,
        || {
            let attempt = action();
            async move {
                if attempt.await {
                    Ok(())
                } else {
                    Err(())
                }
            }
        },
        default_classifier,
    )
    .await
    .is_ok()
}
