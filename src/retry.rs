//! Retry policy with exponential backoff and jitter
//!
//! Delay for attempt `n` (0-indexed) is `min(initial * multiplier^n, max)`,
//! perturbed by uniform jitter in `±jitter_factor` of that value and floored
//! to whole milliseconds. An operation is attempted at most `max_retries + 1`
//! times.

use crate::config::RetryConfig;
use crate::error::AppError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Default maximum number of retries after the first attempt
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Default delay before the first retry
pub const DEFAULT_INITIAL_DELAY_MS: u64 = 1_000;
/// Default cap on the un-jittered delay
pub const DEFAULT_MAX_DELAY_MS: u64 = 10_000;
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
pub const DEFAULT_JITTER_FACTOR: f64 = 0.1;

/// Errors that know whether another attempt may succeed
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for AppError {
    fn is_retryable(&self) -> bool {
        AppError::is_retryable(self)
    }
}

/// Outcome of consulting the policy after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep for the given delay, then try again
    Retry(Duration),
    /// Propagate the failure
    GiveUp,
}

/// Exponential backoff policy
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    initial_delay_ms: u64,
    max_delay_ms: u64,
    backoff_multiplier: f64,
    jitter_factor: f64,
}

impl RetryPolicy {
    /// Create a new retry policy
    ///
    /// # Errors
    /// Returns an error if `backoff_multiplier < 1.0` or `jitter_factor` is
    /// outside `[0.0, 1.0)`.
    pub fn new(
        max_retries: u32,
        initial_delay_ms: u64,
        max_delay_ms: u64,
        backoff_multiplier: f64,
        jitter_factor: f64,
    ) -> Result<Self, &'static str> {
        if !backoff_multiplier.is_finite() || backoff_multiplier < 1.0 {
            return Err("backoff_multiplier must be at least 1.0");
        }
        if !(0.0..1.0).contains(&jitter_factor) {
            return Err("jitter_factor must be in [0.0, 1.0)");
        }
        Ok(Self {
            max_retries,
            initial_delay_ms,
            max_delay_ms,
            backoff_multiplier,
            jitter_factor,
        })
    }

    /// Build from validated configuration
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_delay_ms: config.initial_delay_ms,
            max_delay_ms: config.max_delay_ms,
            backoff_multiplier: config.backoff_multiplier,
            jitter_factor: config.jitter_factor,
        }
    }

    /// Policy that never retries
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            backoff_multiplier: 1.0,
            jitter_factor: 0.0,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn jitter_factor(&self) -> f64 {
        self.jitter_factor
    }

    /// Un-jittered delay in milliseconds for the 0-indexed `attempt`
    ///
    /// Never exceeds `max_delay_ms`, even when the exponential term overflows.
    pub fn base_delay_ms(&self, attempt: u32) -> u64 {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped = raw.min(self.max_delay_ms as f64);
        if capped.is_finite() {
            capped as u64
        } else {
            self.max_delay_ms
        }
    }

    /// Jittered delay for the 0-indexed `attempt`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay_ms(attempt) as f64;
        let spread = if self.jitter_factor > 0.0 {
            rand::rng().random_range(-1.0..=1.0) * self.jitter_factor
        } else {
            0.0
        };
        let jittered = (base * (1.0 + spread)).floor().max(0.0);
        Duration::from_millis(jittered as u64)
    }

    /// Decide what to do after the 0-indexed `attempt` failed
    pub fn decide(&self, attempt: u32, retryable: bool) -> RetryDecision {
        if !retryable || attempt >= self.max_retries {
            RetryDecision::GiveUp
        } else {
            RetryDecision::Retry(self.delay_for_attempt(attempt))
        }
    }

    /// Run `op` until it succeeds, fails permanently, or the budget runs out
    ///
    /// `op` receives the 0-indexed attempt number. Sleeps between attempts
    /// end early when `cancel` fires, in which case the last error is
    /// returned without another attempt.
    pub async fn run<T, E, F, Fut>(&self, cancel: &CancellationToken, mut op: F) -> Result<T, E>
    where
        E: Retryable + std::fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0;
        loop {
            let err = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            match self.decide(attempt, err.is_retryable()) {
                RetryDecision::GiveUp => {
                    tracing::debug!(
                        attempt = attempt,
                        max_retries = self.max_retries,
                        retryable = err.is_retryable(),
                        error = %err,
                        "Giving up on operation"
                    );
                    return Err(err);
                }
                RetryDecision::Retry(delay) => {
                    tracing::warn!(
                        attempt = attempt,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Attempt failed, retrying after backoff"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(err),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
            attempt += 1;
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_delay_ms: DEFAULT_INITIAL_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            jitter_factor: DEFAULT_JITTER_FACTOR,
        }
    }
}
