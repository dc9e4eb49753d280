use std::sync::Arc;
use std::time::Duration;

use crate::http_client::{HttpAuth, HttpClient, HttpErrorKind, HttpRequest, ReqwestHttpClient};
use crate::provider::{Payload, Provider, ProviderError, ProviderFuture, ProviderId, RawResult};
use crate::ValidationError;

/// Provider that POSTs the payload as JSON to a model endpoint.
///
/// The URL may contain a `{model}` placeholder which is replaced by the
/// configured model identifier, so one endpoint template can serve a
/// specialized model and a general-purpose fallback.
#[derive(Clone)]
pub struct HttpJsonProvider {
    id: ProviderId,
    model: String,
    url: String,
    auth: HttpAuth,
    timeout: Duration,
    http_client: Arc<dyn HttpClient>,
}

impl HttpJsonProvider {
    pub fn new(
        id: ProviderId,
        model: impl Into<String>,
        url_template: &str,
    ) -> Result<Self, ValidationError> {
        let model = model.into();
        if model.trim().is_empty() {
            return Err(ValidationError::EmptyModel {
                provider: id.to_string(),
            });
        }
        Ok(Self {
            url: url_template.replace("{model}", &model),
            id,
            model,
            auth: HttpAuth::None,
            timeout: Duration::from_secs(60),
            http_client: Arc::new(ReqwestHttpClient::new()),
        })
    }

    pub fn with_auth(mut self, auth: HttpAuth) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_http_client(mut self, http_client: Arc<dyn HttpClient>) -> Self {
        self.http_client = http_client;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn call(&self, payload: &Payload) -> Result<RawResult, ProviderError> {
        let request = HttpRequest::post_json(&self.url, payload.to_string())
            .with_auth(&self.auth)
            .with_timeout(self.timeout);

        let response = self
            .http_client
            .execute(request)
            .await
            .map_err(|error| match error.kind() {
                HttpErrorKind::Timeout => {
                    ProviderError::timeout(format!("{} transport timeout: {error}", self.id))
                }
                HttpErrorKind::Connect | HttpErrorKind::Other => {
                    ProviderError::unavailable(format!("{} transport error: {error}", self.id))
                }
            })?;

        if !response.is_success() {
            return Err(ProviderError::from_status(
                response.status,
                format!("{} upstream returned status {}", self.id, response.status),
            ));
        }

        serde_json::from_str(&response.body).map_err(|error| {
            ProviderError::invalid_response(format!(
                "{} returned a body that is not JSON: {error}",
                self.id
            ))
        })
    }
}

impl Provider for HttpJsonProvider {
    fn id(&self) -> &ProviderId {
        &self.id
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn invoke<'a>(&'a self, payload: &'a Payload) -> ProviderFuture<'a> {
        Box::pin(self.call(payload))
    }
}
