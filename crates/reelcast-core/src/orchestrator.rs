//! The dependency-injected entry point that owns all shared state.
//!
//! One [`Orchestrator`] is built at process start and passed around by
//! reference (or `Arc`). It holds the circuit breakers and the result
//! cache, the only state that outlives a single call, plus the immutable
//! fallback chains, retry policy and per-provider throttles.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::aggregate::{AggregateResult, Aggregator, CategoryReport};
use crate::cache::{CacheMode, ResultCache};
use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::config::OrchestratorConfig;
use crate::fallback::{ChainRunner, FallbackChain, ProviderFailure};
use crate::fingerprint::Fingerprint;
use crate::provider::{Capability, Payload, ProviderError, ProviderId, ProviderRole, RawResult};
use crate::retry::RetryExecutor;
use crate::scheduler::{
    BatchPlan, BatchResults, ProviderProbe, RateTier, Scheduler, Task, TaskContext, TaskId,
};
use crate::throttling::{ProviderPolicy, ThrottleRegistry};
use crate::{OrchestratorError, ValidationError};

/// A single orchestrated call.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceRequest {
    pub capability: Capability,
    pub payload: Payload,
    /// Cache key. Requests without one never touch the cache.
    pub fingerprint: Option<Fingerprint>,
    pub cache_mode: CacheMode,
    /// Overrides the configured default TTL.
    pub cache_ttl: Option<Duration>,
}

impl InferenceRequest {
    pub fn new(capability: Capability, payload: Payload) -> Self {
        Self {
            capability,
            payload,
            fingerprint: None,
            cache_mode: CacheMode::Use,
            cache_ttl: None,
        }
    }

    /// Caches under a fingerprint of the whole payload.
    pub fn cached(mut self) -> Self {
        self.fingerprint = Some(Fingerprint::of_payload(self.capability, &self.payload));
        self
    }

    pub fn with_fingerprint(mut self, fingerprint: Fingerprint) -> Self {
        self.fingerprint = Some(fingerprint);
        self
    }

    pub fn with_cache_mode(mut self, cache_mode: CacheMode) -> Self {
        self.cache_mode = cache_mode;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }
}

/// A result tagged with where it came from.
///
/// `provider`, `model` and `strategy` are `None` for cache hits.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Invocation<T> {
    pub data: T,
    pub provider: Option<ProviderId>,
    pub model: Option<String>,
    pub strategy: Option<ProviderRole>,
    pub latency_ms: u64,
    pub cache_hit: bool,
    pub attempts: u32,
    pub failures: Vec<ProviderFailure>,
}

/// Builder for [`Orchestrator`].
#[derive(Default)]
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    chains: Vec<FallbackChain>,
    policies: Vec<ProviderPolicy>,
    probe: Option<Arc<dyn ProviderProbe>>,
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Registers a chain; a later chain for the same capability wins.
    pub fn with_chain(mut self, chain: FallbackChain) -> Self {
        self.chains.push(chain);
        self
    }

    /// Rate quota for one provider. Providers without a policy are unthrottled.
    pub fn with_policy(mut self, policy: ProviderPolicy) -> Self {
        self.policies.push(policy);
        self
    }

    /// Probe used to refresh providers when a task fails on a stale handle.
    pub fn with_probe(mut self, probe: Arc<dyn ProviderProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn build(self) -> Orchestrator {
        let chains = self
            .chains
            .into_iter()
            .map(|chain| (chain.capability(), Arc::new(chain)))
            .collect();

        let mut scheduler = Scheduler::new();
        if let Some(probe) = self.probe {
            scheduler = scheduler.with_probe(probe);
        }

        Orchestrator {
            breakers: CircuitBreakerRegistry::new(self.config.breaker),
            cache: ResultCache::new(self.config.cache),
            executor: RetryExecutor::new(self.config.retry.clone()),
            throttles: ThrottleRegistry::from_policies(&self.policies),
            aggregator: Aggregator::new(self.config.action_cap),
            chains: RwLock::new(chains),
            scheduler,
            config: self.config,
        }
    }
}

/// Resilient multi-provider orchestrator.
pub struct Orchestrator {
    config: OrchestratorConfig,
    breakers: CircuitBreakerRegistry,
    cache: ResultCache,
    executor: RetryExecutor,
    throttles: ThrottleRegistry,
    chains: RwLock<HashMap<Capability, Arc<FallbackChain>>>,
    scheduler: Scheduler,
    aggregator: Aggregator,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    /// The chain currently registered for `capability`.
    pub fn chain(&self, capability: Capability) -> Result<Arc<FallbackChain>, ValidationError> {
        self.chains
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&capability)
            .cloned()
            .ok_or_else(|| ValidationError::UnknownCapability {
                capability: capability.to_string(),
            })
    }

    /// Swaps in a new chain, e.g. after re-probing which models exist.
    /// Calls already running keep the chain they started with.
    pub fn replace_chain(&self, chain: FallbackChain) -> Option<Arc<FallbackChain>> {
        info!(
            capability = %chain.capability(),
            providers = chain.len(),
            "replacing fallback chain"
        );
        self.chains
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(chain.capability(), Arc::new(chain))
    }

    /// Clears every breaker and the result cache.
    pub async fn reset(&self) {
        self.breakers.reset();
        self.cache.clear().await;
    }

    /// Scheduler plan for a user-facing rate tier with the configured delay.
    pub fn plan_for(&self, rate_tier: RateTier) -> BatchPlan {
        BatchPlan::for_rate_tier(rate_tier, self.config.inter_batch_delay)
    }

    /// Runs `request` and returns the raw JSON result.
    pub async fn invoke(
        &self,
        request: &InferenceRequest,
        cancel: &CancellationToken,
    ) -> Result<Invocation<RawResult>, OrchestratorError> {
        self.invoke_with(request, |raw| Ok(raw.clone()), cancel)
            .await
    }

    /// Runs `request` and decodes the result into `T`.
    ///
    /// Output that does not decode counts as an invalid response and is
    /// retried, then falls through to the next provider.
    pub async fn invoke_decoded<T>(
        &self,
        request: &InferenceRequest,
        cancel: &CancellationToken,
    ) -> Result<Invocation<T>, OrchestratorError>
    where
        T: DeserializeOwned,
    {
        self.invoke_with(
            request,
            |raw| {
                T::deserialize(raw).map_err(|error| {
                    ProviderError::invalid_response(format!("result did not decode: {error}"))
                })
            },
            cancel,
        )
        .await
    }

    async fn invoke_with<T, D>(
        &self,
        request: &InferenceRequest,
        decode: D,
        cancel: &CancellationToken,
    ) -> Result<Invocation<T>, OrchestratorError>
    where
        D: Fn(&RawResult) -> Result<T, ProviderError>,
    {
        let started = Instant::now();
        let chain = self.chain(request.capability)?;
        let fingerprint = request.fingerprint.as_ref();

        if let Some(fingerprint) = fingerprint.filter(|_| request.cache_mode.reads()) {
            if let Some(raw) = self.cache.get(fingerprint).await {
                match decode(&raw) {
                    Ok(data) => {
                        debug!(
                            capability = %request.capability,
                            fingerprint = fingerprint.short(),
                            "served from cache"
                        );
                        return Ok(Invocation {
                            data,
                            provider: None,
                            model: None,
                            strategy: None,
                            latency_ms: elapsed_ms(started),
                            cache_hit: true,
                            attempts: 0,
                            failures: Vec::new(),
                        });
                    }
                    Err(error) => {
                        debug!(
                            fingerprint = fingerprint.short(),
                            error = %error,
                            "dropping cache entry that no longer decodes"
                        );
                        self.cache.invalidate(fingerprint).await;
                    }
                }
            }
        }

        let runner = ChainRunner {
            breakers: &self.breakers,
            executor: &self.executor,
            throttles: &self.throttles,
        };
        let success = runner
            .run(&chain, &request.payload, decode, cancel)
            .await?;

        if let Some(fingerprint) = fingerprint.filter(|_| request.cache_mode.writes()) {
            self.cache
                .set(fingerprint.clone(), success.raw, request.cache_ttl)
                .await;
        }

        Ok(Invocation {
            data: success.value,
            provider: Some(success.provider),
            model: Some(success.model),
            strategy: Some(success.strategy),
            latency_ms: elapsed_ms(started),
            cache_hit: false,
            attempts: success.attempts,
            failures: success.failures,
        })
    }

    /// Runs independent tasks at the concurrency of `rate_tier`.
    pub async fn run_batch<T, P>(
        &self,
        tasks: Vec<Task<T>>,
        rate_tier: RateTier,
        on_progress: P,
        cancel: &CancellationToken,
    ) -> Result<BatchResults<T>, ValidationError>
    where
        T: Send + 'static,
        P: Fn(u8, &str),
    {
        self.scheduler
            .run_batch(tasks, &self.plan_for(rate_tier), on_progress, cancel)
            .await
    }

    /// Analyzes each category with the text-analysis chain and folds the
    /// reports into one aggregate.
    ///
    /// Payloads are cached by fingerprint. A re-run after a provider
    /// refresh skips the cached read.
    pub async fn analyze<P>(
        self: &Arc<Self>,
        categories: Vec<(TaskId, Payload)>,
        rate_tier: RateTier,
        on_progress: P,
        cancel: &CancellationToken,
    ) -> Result<AggregateResult, ValidationError>
    where
        P: Fn(u8, &str),
    {
        // Fail fast instead of recording every task as failed.
        self.chain(Capability::TextAnalysis)?;

        let tasks = categories
            .into_iter()
            .map(|(task_id, payload)| {
                let orchestrator = Arc::clone(self);
                let request = Arc::new(InferenceRequest::new(Capability::TextAnalysis, payload).cached());
                Task::new(task_id, move |context: TaskContext| {
                    let orchestrator = Arc::clone(&orchestrator);
                    let request = Arc::clone(&request);
                    async move {
                        let request = if context.refreshed {
                            request.as_ref().clone().with_cache_mode(CacheMode::Refresh)
                        } else {
                            request.as_ref().clone()
                        };
                        orchestrator
                            .invoke_decoded::<CategoryReport>(&request, &context.cancel)
                            .await
                            .map(|invocation| invocation.data)
                    }
                })
            })
            .collect();

        let results = self.run_batch(tasks, rate_tier, on_progress, cancel).await?;
        Ok(self.aggregator.aggregate_batch(results))
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
