//! # Reelcast Core
//!
//! Resilient orchestration of calls to external AI model providers.
//!
//! ## Overview
//!
//! Analysis and generation requests fan out to remote models that fail,
//! throttle and drift. This crate wraps every provider call in:
//!
//! - **Retry with exponential backoff** for transient failures
//! - **Per-provider circuit breakers** that stop hammering a dead endpoint
//! - **Ordered fallback chains** from a specialized model to general ones
//! - **A fingerprint-keyed result cache** with TTL and a size cap
//! - **A tiered batch scheduler** that bounds in-flight requests
//! - **An aggregator** that folds per-category reports into one result
//!
//! ## Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`adapters`] | Provider implementations (HTTP JSON, scripted) |
//! | [`aggregate`] | Score, issue and action aggregation |
//! | [`cache`] | TTL result cache with oldest-first eviction |
//! | [`circuit_breaker`] | Per-provider circuit breakers |
//! | [`config`] | Orchestrator configuration and environment overrides |
//! | [`error`] | Core error types |
//! | [`fallback`] | Fallback chains and the sequential chain walk |
//! | [`fingerprint`] | Deterministic cache keys |
//! | [`http_client`] | HTTP transport abstraction |
//! | [`orchestrator`] | Dependency-injected entry point |
//! | [`provider`] | Provider trait, identities and provider errors |
//! | [`retry`] | Retry policy and executor |
//! | [`scheduler`] | Tiered concurrency scheduler |
//! | [`throttling`] | Per-provider rate quotas |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//!
//! use reelcast_core::{
//!     Capability, FallbackChain, InferenceRequest, Orchestrator, ProviderId, ScriptedProvider,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let primary = Arc::new(ScriptedProvider::echo(ProviderId::new("vision-pro")?));
//!     let chain = FallbackChain::ordered(Capability::TextAnalysis, vec![primary])?;
//!     let orchestrator = Orchestrator::builder().with_chain(chain).build();
//!
//!     let request = InferenceRequest::new(Capability::TextAnalysis, serde_json::json!({})).cached();
//!     let invocation = orchestrator.invoke(&request, &CancellationToken::new()).await?;
//!     println!("served by {:?} in {}ms", invocation.provider, invocation.latency_ms);
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │ Caller / Batch  │
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐     ┌──────────────────┐
//! │   Scheduler     │────▶│   Aggregator     │
//! └────────┬────────┘     └──────────────────┘
//!          │ per task
//!          ▼
//! ┌─────────────────┐     ┌──────────────────┐
//! │  Orchestrator   │────▶│  Result Cache    │
//! └────────┬────────┘     └──────────────────┘
//!          │
//!          ▼
//! ┌─────────────────┐     ┌──────────────────┐
//! │ Fallback Chain  │────▶│ Retry Executor   │
//! └────────┬────────┘     └────────┬─────────┘
//!          │                       ▼
//!          │              ┌──────────────────┐
//!          │              │ Circuit Breaker  │
//!          ▼              └──────────────────┘
//! ┌─────────────────┐
//! │ Provider Trait  │
//! │ (HTTP/scripted) │
//! └─────────────────┘
//! ```
//!
//! ## Error Handling
//!
//! Retryable provider failures are absorbed internally. Callers only see
//! validation errors, exhausted chains and cancellation:
//!
//! ```rust
//! use reelcast_core::{OrchestratorError, ProviderErrorKind};
//!
//! fn handle_error(error: OrchestratorError) {
//!     match error {
//!         OrchestratorError::Validation(reason) => {
//!             // Report to user
//!             let _ = reason;
//!         }
//!         OrchestratorError::AllProvidersFailed(failure) => {
//!             for attempt in &failure.failures {
//!                 if attempt.error.kind() == ProviderErrorKind::RateLimited {
//!                     // Suggest a slower tier
//!                 }
//!             }
//!         }
//!         OrchestratorError::Cancelled => {}
//!     }
//! }
//! ```

pub mod adapters;
pub mod aggregate;
pub mod cache;
pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod fallback;
pub mod fingerprint;
pub mod http_client;
pub mod orchestrator;
pub mod provider;
pub mod retry;
pub mod scheduler;
pub mod throttling;

// Re-export commonly used types at crate root for convenience

// Provider implementations
pub use adapters::{HttpJsonProvider, ScriptedProvider, Step};

// Aggregation
pub use aggregate::{AggregateResult, Aggregator, CategoryReport, Issue, Severity};

// Caching
pub use cache::{CacheConfig, CacheMode, CacheStats, ResultCache};
pub use fingerprint::{Fingerprint, FingerprintBuilder};

// Circuit breaker
pub use circuit_breaker::{
    Admission, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState,
};

// Configuration
pub use config::OrchestratorConfig;

// Errors
pub use error::{CoreError, OrchestratorError, ValidationError};

// Fallback chains
pub use fallback::{AllProvidersFailed, ChainLink, FallbackChain, ProviderFailure};

// HTTP transport
pub use http_client::{HttpAuth, HttpClient, HttpError, HttpRequest, HttpResponse, ReqwestHttpClient};

// Orchestrator
pub use orchestrator::{InferenceRequest, Invocation, Orchestrator, OrchestratorBuilder};

// Providers
pub use provider::{
    Capability, Payload, Provider, ProviderError, ProviderErrorKind, ProviderId, ProviderRole,
    RawResult,
};

// Retry
pub use retry::{Backoff, RetryError, RetryExecutor, RetryPolicy};

// Scheduling
pub use scheduler::{
    BatchPlan, BatchResults, ConcurrencyTier, ProviderProbe, RateTier, Scheduler, Task,
    TaskContext, TaskFailure, TaskId, TaskOutcome,
};

// Throttling
pub use throttling::{ProviderPolicy, ProviderThrottle, ThrottleRegistry};
