//! Generates a thumbnail through an image chain whose primary model is
//! blocked, then repeats the request to show the cache hit.
//!
//! Run with `RUST_LOG=debug cargo run --example thumbnail_fallback`.

use std::sync::Arc;

use reelcast_core::{
    Capability, CoreError, FallbackChain, Fingerprint, InferenceRequest, Orchestrator, ProviderError,
    ProviderId, ProviderPolicy, ScriptedProvider,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), CoreError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let imagen_id = ProviderId::new("imagen")?;
    let flash_id = ProviderId::new("flash-image")?;

    let chain = FallbackChain::builder(Capability::ImageGeneration)
        .primary(Arc::new(
            ScriptedProvider::failing(
                imagen_id.clone(),
                ProviderError::generation_failed("prompt blocked by safety filter"),
            )
            .with_model("imagen-4"),
        ))
        .fallback(Arc::new(
            ScriptedProvider::echo(flash_id.clone()).with_model("flash-image-2"),
        ))
        .build()?;

    let orchestrator = Orchestrator::builder()
        .with_chain(chain)
        .with_policy(ProviderPolicy::per_minute(imagen_id, 10))
        .with_policy(ProviderPolicy::per_minute(flash_id, 30))
        .build();

    let title = "5 editing tricks nobody tells you";
    let request = InferenceRequest::new(
        Capability::ImageGeneration,
        json!({ "title": title, "style": "bold", "aspect": "16:9" }),
    )
    .with_fingerprint(
        Fingerprint::builder(Capability::ImageGeneration)
            .text(title)
            .field("style", "bold")
            .field("aspect", "16:9")
            .build(),
    );
    let cancel = CancellationToken::new();

    for round in 1..=2 {
        let invocation = orchestrator.invoke(&request, &cancel).await?;
        println!(
            "round {round}: provider={:?} strategy={:?} cache_hit={} latency={}ms failures={}",
            invocation.provider.as_ref().map(ProviderId::as_str),
            invocation.strategy,
            invocation.cache_hit,
            invocation.latency_ms,
            invocation.failures.len()
        );
    }

    println!("cache: {:?}", orchestrator.cache().stats().await);
    Ok(())
}
