use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::clock::{Clock, DefaultClock};
use governor::state::direct::NotKeyed;
use governor::state::InMemoryState;
use governor::{Quota, RateLimiter};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::retry::cancellable_sleep;
use crate::ProviderId;

/// Request quota for one provider, e.g. 60 calls per minute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderPolicy {
    pub provider_id: ProviderId,
    pub quota_window: Duration,
    pub quota_limit: u32,
}

impl ProviderPolicy {
    pub fn new(provider_id: ProviderId, quota_window: Duration, quota_limit: u32) -> Self {
        Self {
            provider_id,
            quota_window,
            quota_limit,
        }
    }

    pub fn per_minute(provider_id: ProviderId, quota_limit: u32) -> Self {
        Self::new(provider_id, Duration::from_secs(60), quota_limit)
    }
}

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Rate budget for a single provider.
///
/// Waiting for budget is not a provider failure: it never consumes a
/// retry attempt and never touches the circuit breaker.
#[derive(Clone)]
pub struct ProviderThrottle {
    limiter: Arc<DirectRateLimiter>,
    clock: DefaultClock,
}

impl ProviderThrottle {
    pub fn new(quota_window: Duration, quota_limit: u32) -> Self {
        let clock = DefaultClock::default();
        let quota = quota_from_window(quota_window, quota_limit);
        Self {
            limiter: Arc::new(RateLimiter::direct_with_clock(quota, &clock)),
            clock,
        }
    }

    pub fn from_policy(policy: &ProviderPolicy) -> Self {
        Self::new(policy.quota_window, policy.quota_limit)
    }

    /// Tries to take one unit of budget; on failure returns how long until
    /// the next unit becomes available.
    pub fn acquire(&self) -> Result<(), Duration> {
        self.limiter
            .check()
            .map_err(|not_until| not_until.wait_time_from(self.clock.now()))
    }

    /// Waits until budget is available. Returns `false` when cancelled.
    pub async fn wait(&self, cancel: &CancellationToken) -> bool {
        loop {
            match self.acquire() {
                Ok(()) => return true,
                Err(delay) => {
                    debug!(delay_ms = delay.as_millis() as u64, "provider quota exhausted; waiting");
                    if !cancellable_sleep(delay.max(Duration::from_millis(1)), cancel).await {
                        return false;
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for ProviderThrottle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderThrottle").finish_non_exhaustive()
    }
}

/// Immutable map of per-provider throttles built from policies.
#[derive(Debug, Clone, Default)]
pub struct ThrottleRegistry {
    throttles: HashMap<ProviderId, ProviderThrottle>,
}

impl ThrottleRegistry {
    pub fn from_policies<'a>(policies: impl IntoIterator<Item = &'a ProviderPolicy>) -> Self {
        let throttles = policies
            .into_iter()
            .map(|policy| (policy.provider_id.clone(), ProviderThrottle::from_policy(policy)))
            .collect();
        Self { throttles }
    }

    pub fn get(&self, provider: &ProviderId) -> Option<&ProviderThrottle> {
        self.throttles.get(provider)
    }
}

fn quota_from_window(quota_window: Duration, quota_limit: u32) -> Quota {
    let burst = NonZeroU32::new(quota_limit.max(1)).unwrap_or(NonZeroU32::MIN);

    let seconds_per_cell = (quota_window.as_secs_f64() / f64::from(burst.get())).max(0.001);
    let period = Duration::from_secs_f64(seconds_per_cell);

    Quota::with_period(period)
        .unwrap_or_else(|| Quota::per_second(burst))
        .allow_burst(burst)
}
