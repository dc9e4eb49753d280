//! Analyzes a short video script across several categories with a flaky
//! primary model and a general-purpose fallback.
//!
//! Run with `RUST_LOG=reelcast_core=debug cargo run --example category_analysis -- fast`.

use std::sync::Arc;
use std::time::Duration;

use reelcast_core::{
    Capability, CoreError, FallbackChain, Orchestrator, OrchestratorConfig, Provider, ProviderError,
    ProviderId, RateTier, ScriptedProvider, TaskId,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const CATEGORIES: [&str; 5] = ["hook", "pacing", "captions", "audio", "call_to_action"];

#[tokio::main]
async fn main() -> Result<(), CoreError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let rate_tier: RateTier = std::env::args()
        .nth(1)
        .unwrap_or_else(|| String::from("fast"))
        .parse()?;

    let mut config = OrchestratorConfig::from_env()?;
    config.inter_batch_delay = Duration::from_millis(200);
    config.retry = reelcast_core::RetryPolicy::exponential(
        3,
        Duration::from_millis(50),
        2.0,
        Duration::from_millis(400),
    );

    let specialized = ScriptedProvider::succeeding(
        ProviderId::new("video-analyst")?,
        json!({
            "score": 0.82,
            "issues": [{"severity": "minor", "description": "caption contrast is low"}],
            "priority_actions": ["increase caption contrast"]
        }),
    )
    .with_model("video-analyst-pro")
    .with_latency(Duration::from_millis(120))
    .then_err(ProviderError::from_status(503, "model overloaded"))
    .then_err(ProviderError::from_status(503, "model overloaded"))
    .then_err(ProviderError::from_status(503, "model overloaded"));

    let general = ScriptedProvider::succeeding(
        ProviderId::new("general-llm")?,
        json!({
            "score": 0.64,
            "issues": [
                {"severity": "critical", "description": "first three seconds have no hook"},
                {"severity": "suggestion", "description": "add a closing question"}
            ],
            "priority_actions": ["open with the payoff", "increase caption contrast"]
        }),
    )
    .with_model("general-flash")
    .with_latency(Duration::from_millis(80));

    let providers: Vec<Arc<dyn Provider>> = vec![Arc::new(specialized), Arc::new(general)];
    let orchestrator = Arc::new(
        Orchestrator::builder()
            .with_config(config)
            .with_chain(FallbackChain::ordered(Capability::TextAnalysis, providers)?)
            .build(),
    );

    let categories = CATEGORIES
        .into_iter()
        .map(|name| Ok((TaskId::new(name)?, json!({ "category": name, "script": "..." }))))
        .collect::<Result<Vec<_>, reelcast_core::ValidationError>>()?;

    let report = orchestrator
        .analyze(
            categories,
            rate_tier,
            |percent, message| println!("[{percent:>3}%] {message}"),
            &CancellationToken::new(),
        )
        .await?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
