//! Provider trait, identities and provider-level errors.
//!
//! A provider is one remote model endpoint that can serve a
//! [`Capability`]. The orchestrator treats every provider call as an
//! opaque, fallible operation: it hands over a JSON [`Payload`] and gets
//! back a JSON [`RawResult`] or a classified [`ProviderError`].
//!
//! # Error kinds
//!
//! | Kind | Code | Retried by the executor |
//! |------|------|-------------------------|
//! | Validation | `provider.validation` | never |
//! | Unavailable | `provider.unavailable` | yes |
//! | RateLimited | `provider.rate_limited` | yes |
//! | CircuitOpen | `provider.circuit_open` | never |
//! | Timeout | `provider.timeout` | yes |
//! | GenerationFailed | `provider.generation_failed` | when the policy allows |
//! | InvalidResponse | `provider.invalid_response` | when the policy allows |
//! | StaleHandle | `provider.stale_handle` | never (scheduler refreshes) |
//! | Internal | `provider.internal` | never |

use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::ValidationError;

/// Request body handed to a provider.
pub type Payload = serde_json::Value;

/// Undecoded provider output.
pub type RawResult = serde_json::Value;

/// Boxed future returned by [`Provider::invoke`].
pub type ProviderFuture<'a> =
    Pin<Box<dyn Future<Output = Result<RawResult, ProviderError>> + Send + 'a>>;

/// Stable provider identity. One circuit breaker exists per identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderId(Arc<str>);

impl ProviderId {
    pub fn new(value: impl AsRef<str>) -> Result<Self, ValidationError> {
        let value = value.as_ref().trim();
        if value.is_empty() {
            return Err(ValidationError::EmptyProviderId);
        }
        Ok(Self(Arc::from(value)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ProviderId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Orchestrated capability. Each capability owns one fallback chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    TextAnalysis,
    ImageGeneration,
}

impl Capability {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TextAnalysis => "text_analysis",
            Self::ImageGeneration => "image_generation",
        }
    }
}

impl Display for Capability {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Position of a provider in its chain. Also reported as the strategy
/// that served a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderRole {
    Primary,
    Fallback,
}

impl ProviderRole {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Fallback => "fallback",
        }
    }
}

impl Display for ProviderRole {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider-level error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    Validation,
    Unavailable,
    RateLimited,
    CircuitOpen,
    Timeout,
    GenerationFailed,
    InvalidResponse,
    StaleHandle,
    Internal,
}

/// Structured provider error consumed by the retry executor and the
/// fallback chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderError {
    kind: ProviderErrorKind,
    message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    status: Option<u16>,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Validation, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Unavailable, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::RateLimited, message)
    }

    pub fn circuit_open(provider: &ProviderId) -> Self {
        Self::new(
            ProviderErrorKind::CircuitOpen,
            format!("circuit breaker for '{provider}' is open; skipping upstream call"),
        )
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Timeout, message)
    }

    pub fn generation_failed(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::GenerationFailed, message)
    }

    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::InvalidResponse, message)
    }

    pub fn stale_handle(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::StaleHandle, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Internal, message)
    }

    /// Error derived from an upstream HTTP status code.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let kind = match status {
            400 | 422 => ProviderErrorKind::Validation,
            404 | 410 => ProviderErrorKind::StaleHandle,
            408 | 504 => ProviderErrorKind::Timeout,
            429 => ProviderErrorKind::RateLimited,
            500..=599 => ProviderErrorKind::Unavailable,
            _ => ProviderErrorKind::Internal,
        };
        Self::new(kind, message).with_status(status)
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Appends context to the message, keeping kind and status.
    pub fn with_note(mut self, note: impl Display) -> Self {
        self.message = format!("{}; {note}", self.message);
        self
    }

    pub const fn kind(&self) -> ProviderErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub const fn status(&self) -> Option<u16> {
        self.status
    }

    pub const fn code(&self) -> &'static str {
        match self.kind {
            ProviderErrorKind::Validation => "provider.validation",
            ProviderErrorKind::Unavailable => "provider.unavailable",
            ProviderErrorKind::RateLimited => "provider.rate_limited",
            ProviderErrorKind::CircuitOpen => "provider.circuit_open",
            ProviderErrorKind::Timeout => "provider.timeout",
            ProviderErrorKind::GenerationFailed => "provider.generation_failed",
            ProviderErrorKind::InvalidResponse => "provider.invalid_response",
            ProviderErrorKind::StaleHandle => "provider.stale_handle",
            ProviderErrorKind::Internal => "provider.internal",
        }
    }
}

impl Display for ProviderError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(f, "{} ({}, status {status})", self.message, self.code()),
            None => write!(f, "{} ({})", self.message, self.code()),
        }
    }
}

impl std::error::Error for ProviderError {}

/// Remote model provider contract.
///
/// Implementations must be `Send + Sync`; a single provider value is
/// shared by every task of a parallel batch.
pub trait Provider: Send + Sync {
    /// Identity used for circuit breaker bookkeeping.
    fn id(&self) -> &ProviderId;

    /// Model served by this provider, reported for observability.
    fn model(&self) -> &str;

    /// Calls the provider once. Retries, breakers and fallback are the
    /// orchestrator's job.
    fn invoke<'a>(&'a self, payload: &'a Payload) -> ProviderFuture<'a>;
}
