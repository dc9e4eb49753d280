use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use crate::provider::{Payload, Provider, ProviderError, ProviderFuture, ProviderId, RawResult};

/// One scripted provider response.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Succeed(RawResult),
    Fail(ProviderError),
    /// Returns the payload unchanged.
    Echo,
}

#[derive(Debug)]
struct Script {
    steps: VecDeque<Step>,
    otherwise: Step,
    call_times: Vec<Instant>,
}

/// Deterministic provider that replays a script of responses.
///
/// Steps are consumed in order; once the script is exhausted every call
/// gets the `otherwise` step. Each call is timestamped so callers can
/// observe retry spacing. Clones share the same script and counters.
#[derive(Debug, Clone)]
pub struct ScriptedProvider {
    id: ProviderId,
    model: String,
    latency: Duration,
    script: Arc<Mutex<Script>>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedProvider {
    pub fn new(id: ProviderId, model: impl Into<String>, otherwise: Step) -> Self {
        Self {
            id,
            model: model.into(),
            latency: Duration::ZERO,
            script: Arc::new(Mutex::new(Script {
                steps: VecDeque::new(),
                otherwise,
                call_times: Vec::new(),
            })),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Always succeeds with `value`.
    pub fn succeeding(id: ProviderId, value: RawResult) -> Self {
        Self::new(id, "scripted", Step::Succeed(value))
    }

    /// Always fails with `error`.
    pub fn failing(id: ProviderId, error: ProviderError) -> Self {
        Self::new(id, "scripted", Step::Fail(error))
    }

    /// Always returns the request payload.
    pub fn echo(id: ProviderId) -> Self {
        Self::new(id, "scripted", Step::Echo)
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Every call takes `latency` before answering.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn then(self, step: Step) -> Self {
        self.lock().steps.push_back(step);
        self
    }

    pub fn then_ok(self, value: RawResult) -> Self {
        self.then(Step::Succeed(value))
    }

    pub fn then_err(self, error: ProviderError) -> Self {
        self.then(Step::Fail(error))
    }

    /// Number of times the provider was invoked.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Instant at which each call started.
    pub fn call_times(&self) -> Vec<Instant> {
        self.lock().call_times.clone()
    }

    fn next_step(&self) -> Step {
        let mut script = self.lock();
        script.call_times.push(Instant::now());
        match script.steps.pop_front() {
            Some(step) => step,
            None => script.otherwise.clone(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Provider for ScriptedProvider {
    fn id(&self) -> &ProviderId {
        &self.id
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn invoke<'a>(&'a self, payload: &'a Payload) -> ProviderFuture<'a> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self.next_step();
        Box::pin(async move {
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            match step {
                Step::Succeed(value) => Ok(value),
                Step::Fail(error) => Err(error),
                Step::Echo => Ok(payload.clone()),
            }
        })
    }
}
