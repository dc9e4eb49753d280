//! Retry executor with exponential backoff and circuit breaker gating.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::circuit_breaker::{Admission, CircuitBreaker};
use crate::provider::{ProviderError, ProviderErrorKind, ProviderId};
use crate::throttling::ProviderThrottle;
use crate::ValidationError;

/// Backoff strategy for retrying failed requests.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// Uses a fixed delay between retries.
    Fixed {
        /// Delay between retries.
        delay: Duration,
    },
    /// Uses an exponential delay between retries.
    ///
    /// The delay is calculated as `min(base * (factor ^ attempt), max)`.
    Exponential {
        /// The initial backoff duration.
        base: Duration,
        /// The multiplicative factor for each subsequent retry.
        factor: f64,
        /// The maximum duration to wait between retries.
        max: Duration,
        /// Whether to apply random jitter (+/- 50%) to the delay.
        jitter: bool,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Exponential {
            base: Duration::from_millis(1_000),
            factor: 2.0,
            max: Duration::from_secs(10),
            jitter: false,
        }
    }
}

impl Backoff {
    /// Calculate the delay for a given retry attempt.
    ///
    /// # Arguments
    ///
    /// * `attempt` - The attempt that just failed (0-based)
    ///
    /// # Returns
    ///
    /// The calculated delay duration
    pub fn delay(self, attempt: u32) -> Duration {
        match self {
            Self::Fixed { delay } => delay,
            Self::Exponential {
                base,
                factor,
                max,
                jitter,
            } => {
                // Factors that would shrink or poison the delay act as a fixed backoff.
                let factor = if Self::is_valid_factor(factor) { factor } else { 1.0 };
                let scale = factor.powi(attempt.min(i32::MAX as u32) as i32);
                let seconds = base.as_secs_f64() * scale;
                let capped_seconds = seconds.min(max.as_secs_f64());

                let mut delay = Duration::try_from_secs_f64(capped_seconds).unwrap_or(max);

                // +/- 50% of the capped delay
                if jitter {
                    let jitter_ms = (delay.as_millis() as f64 * 0.5) as u64;
                    let random_offset = fastrand::u64(0..=(jitter_ms * 2));
                    let total_ms =
                        delay.as_millis() as i64 + (random_offset as i64 - jitter_ms as i64);
                    delay = Duration::from_millis(total_ms.max(0) as u64);
                }

                delay
            }
        }
    }

    /// Rejects exponential factors below one, NaN or infinite.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match *self {
            Self::Exponential { factor, .. } if !Self::is_valid_factor(factor) => {
                Err(ValidationError::InvalidConfig {
                    key: "retry.backoff.factor",
                    value: factor.to_string(),
                })
            }
            _ => Ok(()),
        }
    }

    fn is_valid_factor(factor: f64) -> bool {
        factor.is_finite() && factor >= 1.0
    }
}

/// Immutable retry configuration for one call site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts per provider, including the first one.
    pub max_attempts: u32,
    /// The backoff strategy to use between attempts.
    pub backoff: Backoff,
    /// HTTP status codes that make a failure retryable regardless of kind.
    pub retry_on_status: Vec<u16>,
    /// Whether malformed or failed generations are retried.
    pub retry_invalid_responses: bool,
    /// Upper bound for a single attempt; exceeding it is a retryable timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::default(),
            retry_on_status: vec![408, 429, 500, 502, 503, 504],
            retry_invalid_responses: true,
            attempt_timeout: None,
        }
    }
}

impl RetryPolicy {
    /// Exponential policy without jitter.
    pub fn exponential(max_attempts: u32, base: Duration, factor: f64, max: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Exponential {
                base,
                factor,
                max,
                jitter: false,
            },
            ..Self::default()
        }
    }

    /// Create a new retry policy with fixed backoff.
    pub fn fixed(delay: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Fixed { delay },
            ..Self::default()
        }
    }

    /// A single attempt, never retried.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    /// Checks the attempt count and the backoff factor.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_attempts == 0 {
            return Err(ValidationError::InvalidConfig {
                key: "retry.max_attempts",
                value: self.max_attempts.to_string(),
            });
        }
        self.backoff.validate()
    }

    /// Check if a given HTTP status code should trigger a retry.
    pub fn should_retry_status(&self, status: u16) -> bool {
        self.retry_on_status.contains(&status)
    }

    /// Classifies a provider failure as retryable or terminal.
    pub fn is_retryable(&self, error: &ProviderError) -> bool {
        match error.kind() {
            ProviderErrorKind::Validation
            | ProviderErrorKind::CircuitOpen
            | ProviderErrorKind::StaleHandle => false,
            // Transport errors carry no status and are always transient.
            ProviderErrorKind::Unavailable
            | ProviderErrorKind::RateLimited
            | ProviderErrorKind::Timeout => error
                .status()
                .map(|status| self.should_retry_status(status))
                .unwrap_or(true),
            ProviderErrorKind::GenerationFailed | ProviderErrorKind::InvalidResponse => {
                self.retry_invalid_responses
            }
            ProviderErrorKind::Internal => error
                .status()
                .map(|status| self.should_retry_status(status))
                .unwrap_or(false),
        }
    }

    /// Delay before the attempt that follows attempt `attempt` (0-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.backoff.delay(attempt)
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Successful execution together with the number of attempts it took.
#[derive(Debug, Clone, PartialEq)]
pub struct Retried<T> {
    pub value: T,
    pub attempts: u32,
}

/// Terminal outcome of [`RetryExecutor::execute`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RetryError {
    #[error("{error} after {attempts} attempt(s)")]
    Exhausted { error: ProviderError, attempts: u32 },
    #[error("operation was cancelled")]
    Cancelled,
}

impl RetryError {
    pub fn provider_error(&self) -> Option<&ProviderError> {
        match self {
            Self::Exhausted { error, .. } => Some(error),
            Self::Cancelled => None,
        }
    }
}

/// Runs one operation against one provider with bounded retries.
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Executes `operation`, consulting `breaker` before every attempt.
    ///
    /// An open breaker fails immediately with a `CircuitOpen` error and
    /// consumes no attempt. Cancellation aborts the in-flight attempt or
    /// backoff wait and leaves the breaker untouched.
    pub async fn execute<T, F, Fut>(
        &self,
        provider: &ProviderId,
        breaker: &CircuitBreaker,
        cancel: &CancellationToken,
        operation: F,
    ) -> Result<Retried<T>, RetryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        self.execute_throttled(provider, breaker, None, cancel, operation)
            .await
    }

    /// Like [`execute`](Self::execute), but waits for `throttle` budget
    /// before each attempt.
    ///
    /// The wait happens outside the attempt timeout and is never recorded
    /// on the breaker.
    pub async fn execute_throttled<T, F, Fut>(
        &self,
        provider: &ProviderId,
        breaker: &CircuitBreaker,
        throttle: Option<&ProviderThrottle>,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<Retried<T>, RetryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let max_attempts = self.policy.attempts();
        let mut last_error: Option<ProviderError> = None;

        for attempt in 0..max_attempts {
            let admission = breaker.admit();
            if admission == Admission::Rejected {
                debug!(%provider, attempt, "circuit open; not calling provider");
                let error = match last_error.take() {
                    Some(error) => error.with_note(format!(
                        "circuit opened after {attempt} attempt(s)"
                    )),
                    None => ProviderError::circuit_open(provider),
                };
                return Err(RetryError::Exhausted {
                    error,
                    attempts: attempt,
                });
            }
            let mut probe = ProbeSlot::new(breaker, admission == Admission::Probe);

            if let Some(throttle) = throttle {
                if !throttle.wait(cancel).await {
                    return Err(RetryError::Cancelled);
                }
            }

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                result = self.run_attempt(operation(attempt)) => result,
            };

            let error = match result {
                Ok(value) => {
                    breaker.record_success();
                    probe.recorded();
                    return Ok(Retried {
                        value,
                        attempts: attempt + 1,
                    });
                }
                Err(error) => error,
            };

            breaker.record_failure();
            probe.recorded();
            let is_last = attempt + 1 >= max_attempts;
            if is_last || !self.policy.is_retryable(&error) {
                warn!(
                    %provider,
                    attempt,
                    code = error.code(),
                    error = %error,
                    "provider call failed terminally"
                );
                return Err(RetryError::Exhausted {
                    error,
                    attempts: attempt + 1,
                });
            }

            let delay = self.policy.delay_for_attempt(attempt);
            debug!(
                %provider,
                attempt,
                delay_ms = delay.as_millis() as u64,
                code = error.code(),
                "retryable provider failure; backing off"
            );
            last_error = Some(error);
            if !cancellable_sleep(delay, cancel).await {
                return Err(RetryError::Cancelled);
            }
        }

        // max_attempts is at least one, so the loop always returns.
        Err(RetryError::Exhausted {
            error: ProviderError::internal("retry loop ended without an attempt"),
            attempts: 0,
        })
    }

    async fn run_attempt<T, Fut>(&self, attempt: Fut) -> Result<T, ProviderError>
    where
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        match self.policy.attempt_timeout {
            Some(limit) => tokio::time::timeout(limit, attempt).await.unwrap_or_else(|_| {
                Err(ProviderError::timeout(format!(
                    "attempt exceeded {} ms",
                    limit.as_millis()
                )))
            }),
            None => attempt.await,
        }
    }
}

/// Releases a claimed half-open probe slot unless an outcome was recorded.
struct ProbeSlot<'a> {
    breaker: &'a CircuitBreaker,
    held: bool,
}

impl<'a> ProbeSlot<'a> {
    fn new(breaker: &'a CircuitBreaker, held: bool) -> Self {
        Self { breaker, held }
    }

    fn recorded(&mut self) {
        self.held = false;
    }
}

impl Drop for ProbeSlot<'_> {
    fn drop(&mut self) {
        if self.held {
            self.breaker.release_probe();
        }
    }
}

/// Sleeps for `delay` unless `cancel` fires first. Returns `false` when
/// cancelled.
pub async fn cancellable_sleep(delay: Duration, cancel: &CancellationToken) -> bool {
    if delay.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
