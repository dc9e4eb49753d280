//! Ordered provider chains and the sequential fallback walk.

use std::collections::HashSet;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::provider::{
    Capability, Payload, Provider, ProviderError, ProviderErrorKind, ProviderId, ProviderRole,
    RawResult,
};
use crate::retry::{RetryError, RetryExecutor};
use crate::throttling::ThrottleRegistry;
use crate::{OrchestratorError, ValidationError};

/// One provider and its position in a chain.
#[derive(Clone)]
pub struct ChainLink {
    pub provider: Arc<dyn Provider>,
    pub role: ProviderRole,
}

impl std::fmt::Debug for ChainLink {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainLink")
            .field("provider", self.provider.id())
            .field("model", &self.provider.model())
            .field("role", &self.role)
            .finish()
    }
}

/// Immutable, ordered list of interchangeable providers for a capability.
#[derive(Debug, Clone)]
pub struct FallbackChain {
    capability: Capability,
    links: Vec<ChainLink>,
}

impl FallbackChain {
    /// Chain whose first provider is the primary and the rest fallbacks.
    pub fn ordered(
        capability: Capability,
        providers: Vec<Arc<dyn Provider>>,
    ) -> Result<Self, ValidationError> {
        let links = providers
            .into_iter()
            .enumerate()
            .map(|(index, provider)| ChainLink {
                provider,
                role: if index == 0 {
                    ProviderRole::Primary
                } else {
                    ProviderRole::Fallback
                },
            })
            .collect();
        Self::from_links(capability, links)
    }

    pub fn builder(capability: Capability) -> FallbackChainBuilder {
        FallbackChainBuilder {
            capability,
            links: Vec::new(),
        }
    }

    fn from_links(capability: Capability, links: Vec<ChainLink>) -> Result<Self, ValidationError> {
        if links.is_empty() {
            return Err(ValidationError::EmptyChain {
                capability: capability.to_string(),
            });
        }

        let mut seen = HashSet::new();
        for link in &links {
            if !seen.insert(link.provider.id().clone()) {
                return Err(ValidationError::DuplicateProvider {
                    capability: capability.to_string(),
                    provider: link.provider.id().to_string(),
                });
            }
        }

        Ok(Self { capability, links })
    }

    pub const fn capability(&self) -> Capability {
        self.capability
    }

    pub fn links(&self) -> &[ChainLink] {
        &self.links
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn provider_ids(&self) -> Vec<ProviderId> {
        self.links
            .iter()
            .map(|link| link.provider.id().clone())
            .collect()
    }
}

/// Builder for chains with explicit roles.
#[derive(Debug)]
pub struct FallbackChainBuilder {
    capability: Capability,
    links: Vec<ChainLink>,
}

impl FallbackChainBuilder {
    pub fn primary(mut self, provider: Arc<dyn Provider>) -> Self {
        self.links.push(ChainLink {
            provider,
            role: ProviderRole::Primary,
        });
        self
    }

    pub fn fallback(mut self, provider: Arc<dyn Provider>) -> Self {
        self.links.push(ChainLink {
            provider,
            role: ProviderRole::Fallback,
        });
        self
    }

    pub fn build(self) -> Result<FallbackChain, ValidationError> {
        FallbackChain::from_links(self.capability, self.links)
    }
}

/// Why one provider in the chain did not produce a result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderFailure {
    pub provider: ProviderId,
    pub model: String,
    pub role: ProviderRole,
    pub error: ProviderError,
    pub attempts: u32,
}

/// Every provider in a chain failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AllProvidersFailed {
    pub capability: Capability,
    pub failures: Vec<ProviderFailure>,
}

impl AllProvidersFailed {
    /// Number of providers tried; equals the chain length.
    pub fn attempts(&self) -> usize {
        self.failures.len()
    }

    /// Whether any provider reported that its model handle is stale.
    pub fn has_stale_handle(&self) -> bool {
        self.failures
            .iter()
            .any(|failure| failure.error.kind() == ProviderErrorKind::StaleHandle)
    }
}

impl Display for AllProvidersFailed {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "all {} provider(s) failed for '{}'",
            self.failures.len(),
            self.capability
        )?;
        for failure in &self.failures {
            write!(f, "; {}: {}", failure.provider, failure.error)?;
        }
        Ok(())
    }
}

impl std::error::Error for AllProvidersFailed {}

/// Result served by one provider of a chain.
#[derive(Debug, Clone)]
pub struct ChainSuccess<T> {
    pub value: T,
    pub raw: RawResult,
    pub provider: ProviderId,
    pub model: String,
    pub strategy: ProviderRole,
    /// Attempts across every provider tried, including failed ones.
    pub attempts: u32,
    pub failures: Vec<ProviderFailure>,
}

/// Walks a chain with the shared breakers, throttles and retry policy.
#[derive(Debug, Clone, Copy)]
pub struct ChainRunner<'a> {
    pub breakers: &'a CircuitBreakerRegistry,
    pub executor: &'a RetryExecutor,
    pub throttles: &'a ThrottleRegistry,
}

impl ChainRunner<'_> {
    /// Tries each provider in order until one succeeds.
    ///
    /// `decode` runs inside the retry loop, so output that cannot be decoded
    /// is retried like any other malformed response. Providers are never
    /// called concurrently.
    pub async fn run<T, D>(
        &self,
        chain: &FallbackChain,
        payload: &Payload,
        decode: D,
        cancel: &CancellationToken,
    ) -> Result<ChainSuccess<T>, OrchestratorError>
    where
        D: Fn(&RawResult) -> Result<T, ProviderError>,
    {
        let mut failures = Vec::with_capacity(chain.len());
        let mut attempts = 0;
        let decode = &decode;

        for link in chain.links() {
            let provider = link.provider.as_ref();
            let id = provider.id();
            let breaker = self.breakers.breaker(id);
            let throttle = self.throttles.get(id);

            let outcome = self
                .executor
                .execute_throttled(id, &breaker, throttle, cancel, |attempt| async move {
                    debug!(provider = %id, model = provider.model(), attempt, "calling provider");
                    let raw = provider.invoke(payload).await?;
                    let value = decode(&raw)?;
                    Ok((raw, value))
                })
                .await;

            match outcome {
                Ok(retried) => {
                    attempts += retried.attempts;
                    if !failures.is_empty() {
                        warn!(
                            capability = %chain.capability(),
                            provider = %id,
                            failed = failures.len(),
                            "fallback provider served the request"
                        );
                    }
                    let (raw, value) = retried.value;
                    return Ok(ChainSuccess {
                        value,
                        raw,
                        provider: id.clone(),
                        model: provider.model().to_owned(),
                        strategy: link.role,
                        attempts,
                        failures,
                    });
                }
                Err(RetryError::Cancelled) => return Err(OrchestratorError::Cancelled),
                Err(RetryError::Exhausted {
                    error,
                    attempts: used,
                }) => {
                    attempts += used;
                    if error.kind() == ProviderErrorKind::Validation {
                        return Err(ValidationError::Rejected {
                            provider: id.to_string(),
                            message: error.message().to_owned(),
                        }
                        .into());
                    }
                    warn!(
                        capability = %chain.capability(),
                        provider = %id,
                        role = %link.role,
                        code = error.code(),
                        "provider failed; moving to next in chain"
                    );
                    failures.push(ProviderFailure {
                        provider: id.clone(),
                        model: provider.model().to_owned(),
                        role: link.role,
                        error,
                        attempts: used,
                    });
                }
            }
        }

        Err(AllProvidersFailed {
            capability: chain.capability(),
            failures,
        }
        .into())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::adapters::ScriptedProvider;
    use crate::circuit_breaker::CircuitBreakerConfig;
    use crate::retry::RetryPolicy;

    fn id(name: &str) -> ProviderId {
        ProviderId::new(name).expect("valid provider id")
    }

    fn raw(value: &RawResult) -> Result<RawResult, ProviderError> {
        Ok(value.clone())
    }

    struct Harness {
        breakers: CircuitBreakerRegistry,
        executor: RetryExecutor,
        throttles: ThrottleRegistry,
    }

    impl Harness {
        fn new(policy: RetryPolicy) -> Self {
            Self {
                breakers: CircuitBreakerRegistry::new(CircuitBreakerConfig::default()),
                executor: RetryExecutor::new(policy),
                throttles: ThrottleRegistry::default(),
            }
        }

        fn runner(&self) -> ChainRunner<'_> {
            ChainRunner {
                breakers: &self.breakers,
                executor: &self.executor,
                throttles: &self.throttles,
            }
        }
    }

    #[test]
    fn rejects_empty_and_duplicate_chains() {
        let empty = FallbackChain::ordered(Capability::TextAnalysis, Vec::new());
        assert!(matches!(empty, Err(ValidationError::EmptyChain { .. })));

        let twice: Arc<dyn Provider> = Arc::new(ScriptedProvider::echo(id("same")));
        let duplicate =
            FallbackChain::ordered(Capability::TextAnalysis, vec![Arc::clone(&twice), twice]);
        assert!(matches!(duplicate, Err(ValidationError::DuplicateProvider { .. })));
    }

    #[test]
    fn ordered_chain_assigns_roles_by_position() {
        let chain = FallbackChain::ordered(
            Capability::ImageGeneration,
            vec![
                Arc::new(ScriptedProvider::echo(id("imagen"))),
                Arc::new(ScriptedProvider::echo(id("flash"))),
            ],
        )
        .expect("valid chain");

        let roles: Vec<_> = chain.links().iter().map(|link| link.role).collect();
        assert_eq!(roles, vec![ProviderRole::Primary, ProviderRole::Fallback]);
        assert_eq!(chain.provider_ids(), vec![id("imagen"), id("flash")]);
    }

    #[tokio::test]
    async fn primary_success_is_tagged_primary() {
        let harness = Harness::new(RetryPolicy::no_retry());
        let primary = Arc::new(ScriptedProvider::succeeding(id("primary"), json!("ok")));
        let fallback = Arc::new(ScriptedProvider::succeeding(id("fallback"), json!("late")));
        let chain = FallbackChain::ordered(
            Capability::TextAnalysis,
            vec![primary.clone(), fallback.clone()],
        )
        .expect("valid chain");

        let success = harness
            .runner()
            .run(&chain, &json!({}), raw, &CancellationToken::new())
            .await
            .expect("primary succeeds");

        assert_eq!(success.value, json!("ok"));
        assert_eq!(success.strategy, ProviderRole::Primary);
        assert_eq!(fallback.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn falls_back_after_primary_exhausts_retries() {
        let harness = Harness::new(RetryPolicy::fixed(Duration::from_millis(10), 2));
        let primary = Arc::new(ScriptedProvider::failing(
            id("primary"),
            ProviderError::unavailable("down"),
        ));
        let fallback = Arc::new(ScriptedProvider::succeeding(id("fallback"), json!("saved")));
        let chain = FallbackChain::ordered(
            Capability::TextAnalysis,
            vec![primary.clone(), fallback.clone()],
        )
        .expect("valid chain");

        let success = harness
            .runner()
            .run(&chain, &json!({}), raw, &CancellationToken::new())
            .await
            .expect("fallback succeeds");

        assert_eq!(primary.calls(), 2);
        assert_eq!(success.provider, id("fallback"));
        assert_eq!(success.strategy, ProviderRole::Fallback);
        assert_eq!(success.attempts, 3);
        assert_eq!(success.failures.len(), 1);
        assert_eq!(success.failures[0].error.kind(), ProviderErrorKind::Unavailable);
    }

    #[tokio::test]
    async fn exhausted_chain_reports_one_failure_per_provider() {
        let harness = Harness::new(RetryPolicy::no_retry());
        let chain = FallbackChain::ordered(
            Capability::ImageGeneration,
            vec![
                Arc::new(ScriptedProvider::failing(
                    id("a"),
                    ProviderError::generation_failed("blocked"),
                )),
                Arc::new(ScriptedProvider::failing(
                    id("b"),
                    ProviderError::rate_limited("quota"),
                )),
            ],
        )
        .expect("valid chain");

        let error = harness
            .runner()
            .run(&chain, &json!({}), raw, &CancellationToken::new())
            .await
            .expect_err("all fail");

        let failure = error.all_providers_failed().expect("all providers failed");
        assert_eq!(failure.attempts(), 2);
        assert_eq!(failure.failures[0].provider, id("a"));
        assert_eq!(failure.failures[1].error.kind(), ProviderErrorKind::RateLimited);
        assert!(!failure.has_stale_handle());
    }

    #[tokio::test]
    async fn validation_rejection_surfaces_without_fallback() {
        let harness = Harness::new(RetryPolicy::default());
        let fallback = Arc::new(ScriptedProvider::echo(id("fallback")));
        let chain = FallbackChain::ordered(
            Capability::TextAnalysis,
            vec![
                Arc::new(ScriptedProvider::failing(
                    id("primary"),
                    ProviderError::validation("prompt exceeds context window"),
                )),
                fallback.clone(),
            ],
        )
        .expect("valid chain");

        let error = harness
            .runner()
            .run(&chain, &json!({}), raw, &CancellationToken::new())
            .await
            .expect_err("rejected");

        assert!(matches!(
            error,
            OrchestratorError::Validation(ValidationError::Rejected { .. })
        ));
        assert_eq!(fallback.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn undecodable_output_is_retried() {
        let harness = Harness::new(RetryPolicy::fixed(Duration::from_millis(5), 3));
        let provider = Arc::new(
            ScriptedProvider::succeeding(id("primary"), json!({"score": 0.5}))
                .then_ok(json!("not an object")),
        );
        let chain = FallbackChain::ordered(Capability::TextAnalysis, vec![provider.clone()])
            .expect("valid chain");

        let success = harness
            .runner()
            .run(
                &chain,
                &json!({}),
                |raw| {
                    raw.get("score")
                        .and_then(serde_json::Value::as_f64)
                        .ok_or_else(|| ProviderError::invalid_response("missing score"))
                },
                &CancellationToken::new(),
            )
            .await
            .expect("second attempt decodes");

        assert_eq!(success.value, 0.5);
        assert_eq!(success.attempts, 2);
        assert_eq!(provider.calls(), 2);
    }
}
