use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use reelcast_core::{
    adapters::{HttpJsonProvider, ScriptedProvider},
    HttpClient, HttpError, HttpRequest, HttpResponse, Provider, ProviderError, ProviderErrorKind,
    ProviderId,
};
use serde_json::json;

/// Transport that answers every request with the same status and body.
struct FixedHttpClient {
    status: u16,
    body: &'static str,
}

impl HttpClient for FixedHttpClient {
    fn execute<'a>(
        &'a self,
        _request: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, HttpError>> + Send + 'a>> {
        let response = HttpResponse {
            status: self.status,
            body: self.body.to_owned(),
        };
        Box::pin(async move { Ok(response) })
    }
}

#[derive(Clone)]
struct ProviderCase {
    id: ProviderId,
    healthy: Arc<dyn Provider>,
    overloaded: Arc<dyn Provider>,
    stale: Arc<dyn Provider>,
}

fn id(name: &str) -> ProviderId {
    ProviderId::new(name).expect("valid provider id")
}

fn http_provider(name: &str, status: u16, body: &'static str) -> Arc<dyn Provider> {
    Arc::new(
        HttpJsonProvider::new(id(name), "model-v1", "https://models.example.test/{model}")
            .expect("valid provider")
            .with_http_client(Arc::new(FixedHttpClient { status, body })),
    )
}

fn provider_cases() -> Vec<ProviderCase> {
    vec![
        ProviderCase {
            id: id("http"),
            healthy: http_provider("http", 200, r#"{"ok":true}"#),
            overloaded: http_provider("http", 503, "busy"),
            stale: http_provider("http", 404, "no such model"),
        },
        ProviderCase {
            id: id("scripted"),
            healthy: Arc::new(
                ScriptedProvider::succeeding(id("scripted"), json!({"ok": true}))
                    .with_model("model-v1"),
            ),
            overloaded: Arc::new(ScriptedProvider::failing(
                id("scripted"),
                ProviderError::from_status(503, "busy"),
            )),
            stale: Arc::new(ScriptedProvider::failing(
                id("scripted"),
                ProviderError::from_status(404, "no such model"),
            )),
        },
    ]
}

#[tokio::test]
async fn provider_contract_identity_is_stable_and_non_empty() {
    for case in provider_cases() {
        assert_eq!(case.healthy.id(), &case.id);
        assert!(!case.healthy.model().is_empty(), "{} has no model", case.id);
    }
}

#[tokio::test]
async fn provider_contract_success_returns_json() {
    for case in provider_cases() {
        let result = case.healthy.invoke(&json!({"prompt": "x"})).await;
        assert_eq!(result, Ok(json!({"ok": true})), "{} success", case.id);
    }
}

#[tokio::test]
async fn provider_contract_overload_is_classified_as_unavailable() {
    for case in provider_cases() {
        let error = case
            .overloaded
            .invoke(&json!({}))
            .await
            .expect_err("overloaded");
        assert_eq!(error.kind(), ProviderErrorKind::Unavailable, "{}", case.id);
        assert_eq!(error.status(), Some(503), "{}", case.id);
    }
}

#[tokio::test]
async fn provider_contract_missing_model_is_classified_as_stale_handle() {
    for case in provider_cases() {
        let error = case.stale.invoke(&json!({})).await.expect_err("stale");
        assert_eq!(error.kind(), ProviderErrorKind::StaleHandle, "{}", case.id);
        assert_eq!(error.code(), "provider.stale_handle");
    }
}
