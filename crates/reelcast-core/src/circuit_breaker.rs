use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::ProviderId;

/// Runtime circuit state for one provider identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Circuit breaker thresholds and timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
        }
    }
}

/// Outcome of asking a breaker whether a call may proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// The single half-open trial call. Its outcome must be recorded, or
    /// the slot released with [`CircuitBreaker::release_probe`].
    Probe,
    Rejected,
}

#[derive(Debug)]
struct CircuitInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

impl Default for CircuitInner {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            probe_in_flight: false,
        }
    }
}

/// Thread-safe circuit breaker guarding a single provider.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<CircuitInner>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(CircuitInner::default()),
        }
    }

    pub fn config(&self) -> CircuitBreakerConfig {
        self.config
    }

    /// Returns `true` when a call must not be sent.
    ///
    /// Same as [`admit`](Self::admit) returning [`Admission::Rejected`];
    /// a `false` answer may claim the half-open probe slot.
    pub fn is_open(&self) -> bool {
        self.admit() == Admission::Rejected
    }

    /// Decides whether one call may proceed.
    ///
    /// Once the reset timeout has elapsed the circuit moves to half-open
    /// and exactly one caller gets [`Admission::Probe`]. Everyone else is
    /// rejected until that probe is recorded or released.
    pub fn admit(&self) -> Admission {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::HalfOpen if inner.probe_in_flight => Admission::Rejected,
            CircuitState::HalfOpen => {
                inner.probe_in_flight = true;
                Admission::Probe
            }
            CircuitState::Open => {
                let can_probe = inner
                    .opened_at
                    .map(|opened_at| opened_at.elapsed() >= self.config.reset_timeout)
                    .unwrap_or(true);

                if can_probe {
                    inner.state = CircuitState::HalfOpen;
                    inner.opened_at = None;
                    inner.probe_in_flight = true;
                    debug!("circuit moved to half-open");
                    Admission::Probe
                } else {
                    Admission::Rejected
                }
            }
        }
    }

    /// Frees the half-open probe slot of a call that ended without an
    /// outcome, e.g. because it was cancelled.
    pub fn release_probe(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.probe_in_flight = false;
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state != CircuitState::Closed {
            debug!(previous = ?inner.state, "circuit closed after successful call");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.probe_in_flight = false;
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();

        if inner.state == CircuitState::HalfOpen {
            inner.state = CircuitState::Open;
            inner.consecutive_failures = self.config.failure_threshold;
            inner.opened_at = Some(Instant::now());
            inner.probe_in_flight = false;
            warn!("half-open probe failed; circuit reopened");
            return;
        }

        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        if inner.state == CircuitState::Closed
            && inner.consecutive_failures >= self.config.failure_threshold
        {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            warn!(
                failures = inner.consecutive_failures,
                "failure threshold reached; circuit opened"
            );
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    pub fn reset(&self) {
        *self.lock() = CircuitInner::default();
    }

    fn lock(&self) -> MutexGuard<'_, CircuitInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Owns one breaker per provider identity.
///
/// Lookup takes a short registry-wide lock; every state change then goes
/// through the per-provider breaker's own lock, so breakers of different
/// providers never contend with each other.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<ProviderId, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Breaker for `provider`, created closed on first use.
    pub fn breaker(&self, provider: &ProviderId) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            breakers
                .entry(provider.clone())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(self.config))),
        )
    }

    pub fn is_open(&self, provider: &ProviderId) -> bool {
        self.breaker(provider).is_open()
    }

    pub fn record_success(&self, provider: &ProviderId) {
        self.breaker(provider).record_success();
    }

    pub fn record_failure(&self, provider: &ProviderId) {
        self.breaker(provider).record_failure();
    }

    /// Current state, `Closed` for providers that were never called.
    pub fn state(&self, provider: &ProviderId) -> CircuitState {
        let breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        breakers
            .get(provider)
            .map(|breaker| breaker.state())
            .unwrap_or(CircuitState::Closed)
    }

    /// Drops every breaker; the next call starts closed.
    pub fn reset(&self) {
        self.breakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(name: &str) -> ProviderId {
        ProviderId::new(name).expect("valid provider id")
    }

    #[test]
    fn opens_after_threshold_failures() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 2,
            reset_timeout: Duration::from_secs(10),
        });

        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(!breaker.is_open());
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.is_open());
    }

    #[test]
    fn success_resets_the_failure_streak() {
        let breaker = CircuitBreaker::default();
        for _ in 0..4 {
            breaker.record_failure();
        }
        breaker.record_success();
        breaker.record_failure();

        assert_eq!(breaker.consecutive_failures(), 1);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn stays_open_until_reset_timeout_elapses() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
        });
        for _ in 0..5 {
            breaker.record_failure();
        }

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(breaker.is_open());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(!breaker.is_open());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_closes_on_success() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            reset_timeout: Duration::from_millis(10),
        });

        breaker.record_failure();
        tokio::time::advance(Duration::from_millis(10)).await;
        assert!(!breaker.is_open());

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.consecutive_failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens_and_restarts_timer() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 3,
            reset_timeout: Duration::from_secs(30),
        });
        for _ in 0..3 {
            breaker.record_failure();
        }
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(!breaker.is_open());

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.consecutive_failures(), 3);

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(breaker.is_open());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(!breaker.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_admits_a_single_trial_call() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            reset_timeout: Duration::from_secs(10),
        });
        breaker.record_failure();
        tokio::time::advance(Duration::from_secs(10)).await;

        assert_eq!(breaker.admit(), Admission::Probe);
        assert_eq!(breaker.admit(), Admission::Rejected);
        assert!(breaker.is_open());

        breaker.record_success();
        assert_eq!(breaker.admit(), Admission::Allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn released_trial_slot_admits_the_next_caller() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            reset_timeout: Duration::from_secs(10),
        });
        breaker.record_failure();
        tokio::time::advance(Duration::from_secs(10)).await;

        assert_eq!(breaker.admit(), Admission::Probe);
        breaker.release_probe();

        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert_eq!(breaker.admit(), Admission::Probe);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_trial_slot() {
        let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            reset_timeout: Duration::from_secs(10),
        }));
        breaker.record_failure();
        tokio::time::advance(Duration::from_secs(10)).await;

        let mut callers = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let breaker = Arc::clone(&breaker);
            callers.spawn(async move { breaker.admit() });
        }
        let mut trial_calls = 0;
        while let Some(admission) = callers.join_next().await {
            if admission.expect("caller completes") == Admission::Probe {
                trial_calls += 1;
            }
        }

        assert_eq!(trial_calls, 1);
    }

    #[test]
    fn registry_keeps_providers_independent() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 1,
            reset_timeout: Duration::from_secs(60),
        });
        let flaky = provider("flaky");
        let steady = provider("steady");

        registry.record_failure(&flaky);

        assert!(registry.is_open(&flaky));
        assert!(!registry.is_open(&steady));
        assert_eq!(registry.state(&steady), CircuitState::Closed);

        registry.reset();
        assert!(!registry.is_open(&flaky));
    }
}
