//! Orchestrator configuration.
//!
//! # Environment Variables
//!
//! | Variable | Field | Unit |
//! |----------|-------|------|
//! | `REELCAST_FAILURE_THRESHOLD` | `breaker.failure_threshold` | failures |
//! | `REELCAST_RESET_TIMEOUT_SECS` | `breaker.reset_timeout` | seconds |
//! | `REELCAST_RETRY_ATTEMPTS` | `retry.max_attempts` | attempts |
//! | `REELCAST_RETRY_BASE_DELAY_MS` | base backoff delay | milliseconds |
//! | `REELCAST_RETRY_MAX_DELAY_MS` | backoff cap | milliseconds |
//! | `REELCAST_CACHE_MAX_ENTRIES` | `cache.max_entries` | entries |
//! | `REELCAST_CACHE_TTL_SECS` | `cache.default_ttl` | seconds |
//! | `REELCAST_INTER_BATCH_DELAY_MS` | `inter_batch_delay` | milliseconds |
//! | `REELCAST_ACTION_CAP` | `action_cap` | actions |
//!
//! Unset variables keep their defaults.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::aggregate::DEFAULT_ACTION_CAP;
use crate::cache::CacheConfig;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::retry::{Backoff, RetryPolicy};
use crate::{CoreError, ValidationError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub breaker: CircuitBreakerConfig,
    pub retry: RetryPolicy,
    pub cache: CacheConfig,
    /// Pause between scheduler groups.
    pub inter_batch_delay: Duration,
    /// Maximum number of priority actions in an aggregate.
    pub action_cap: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            breaker: CircuitBreakerConfig::default(),
            retry: RetryPolicy::default(),
            cache: CacheConfig::default(),
            inter_batch_delay: Duration::from_secs(1),
            action_cap: DEFAULT_ACTION_CAP,
        }
    }
}

impl OrchestratorConfig {
    /// Defaults overridden by any `REELCAST_*` variables that are set.
    pub fn from_env() -> Result<Self, ValidationError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ValidationError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(threshold) = parse::<u32>(&lookup, "REELCAST_FAILURE_THRESHOLD")? {
            config.breaker.failure_threshold = positive(threshold, "REELCAST_FAILURE_THRESHOLD")?;
        }
        if let Some(secs) = parse::<u64>(&lookup, "REELCAST_RESET_TIMEOUT_SECS")? {
            config.breaker.reset_timeout = Duration::from_secs(secs);
        }
        if let Some(attempts) = parse::<u32>(&lookup, "REELCAST_RETRY_ATTEMPTS")? {
            config.retry.max_attempts = positive(attempts, "REELCAST_RETRY_ATTEMPTS")?;
        }
        if let Some(ms) = parse::<u64>(&lookup, "REELCAST_RETRY_BASE_DELAY_MS")? {
            let delay = Duration::from_millis(ms);
            config.retry.backoff = match config.retry.backoff {
                Backoff::Fixed { .. } => Backoff::Fixed { delay },
                Backoff::Exponential {
                    factor, max, jitter, ..
                } => Backoff::Exponential {
                    base: delay,
                    factor,
                    max,
                    jitter,
                },
            };
        }
        if let Some(ms) = parse::<u64>(&lookup, "REELCAST_RETRY_MAX_DELAY_MS")? {
            if let Backoff::Exponential { max, .. } = &mut config.retry.backoff {
                *max = Duration::from_millis(ms);
            }
        }
        if let Some(entries) = parse::<usize>(&lookup, "REELCAST_CACHE_MAX_ENTRIES")? {
            config.cache.max_entries = entries;
        }
        if let Some(secs) = parse::<u64>(&lookup, "REELCAST_CACHE_TTL_SECS")? {
            config.cache.default_ttl = Duration::from_secs(secs);
        }
        if let Some(ms) = parse::<u64>(&lookup, "REELCAST_INTER_BATCH_DELAY_MS")? {
            config.inter_batch_delay = Duration::from_millis(ms);
        }
        if let Some(cap) = parse::<usize>(&lookup, "REELCAST_ACTION_CAP")? {
            config.action_cap = cap;
        }

        config.validate()?;
        Ok(config)
    }

    /// Parses a JSON document; missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self, CoreError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the breaker and retry executor cannot run with.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.breaker.failure_threshold == 0 {
            return Err(ValidationError::InvalidConfig {
                key: "breaker.failure_threshold",
                value: self.breaker.failure_threshold.to_string(),
            });
        }
        self.retry.validate()
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ValidationError> {
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    raw.trim()
        .parse()
        .map(Some)
        .map_err(|_| ValidationError::InvalidConfig { key, value: raw })
}

fn positive(value: u32, key: &'static str) -> Result<u32, ValidationError> {
    if value == 0 {
        return Err(ValidationError::InvalidConfig {
            key,
            value: value.to_string(),
        });
    }
    Ok(value)
}
