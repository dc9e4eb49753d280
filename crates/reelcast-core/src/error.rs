use thiserror::Error;

use crate::fallback::AllProvidersFailed;

/// Validation and contract errors exposed by `reelcast-core`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("provider id cannot be empty")]
    EmptyProviderId,
    #[error("model identifier cannot be empty for provider '{provider}'")]
    EmptyModel { provider: String },

    #[error("fallback chain for '{capability}' must contain at least one provider")]
    EmptyChain { capability: String },
    #[error("provider '{provider}' appears more than once in the '{capability}' chain")]
    DuplicateProvider { capability: String, provider: String },
    #[error("no fallback chain is registered for capability '{capability}'")]
    UnknownCapability { capability: String },

    #[error("task id cannot be empty")]
    EmptyTaskId,
    #[error("task id '{id}' appears more than once in the batch")]
    DuplicateTaskId { id: String },

    #[error("parallel tier requires at least one concurrent task")]
    ZeroParallelism,
    #[error("invalid rate tier '{value}', expected one of conservative, fast, maximum")]
    InvalidRateTier { value: String },

    #[error("invalid configuration value for '{key}': '{value}'")]
    InvalidConfig { key: &'static str, value: String },

    #[error("provider '{provider}' rejected the request: {message}")]
    Rejected { provider: String, message: String },
}

/// Top-level error type for core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors that surface to callers of the orchestrator.
///
/// Retryable provider failures are absorbed by the retry executor and
/// the fallback chain; only these outcomes ever reach the caller.
#[derive(Debug, Error, Clone)]
pub enum OrchestratorError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    AllProvidersFailed(#[from] AllProvidersFailed),

    #[error("operation was cancelled")]
    Cancelled,
}

impl OrchestratorError {
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn all_providers_failed(&self) -> Option<&AllProvidersFailed> {
        match self {
            Self::AllProvidersFailed(failure) => Some(failure),
            _ => None,
        }
    }
}
