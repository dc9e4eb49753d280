//! Tiered batch scheduler.
//!
//! A batch is a list of independent tasks. The scheduler splits it into
//! consecutive groups no wider than the tier allows, runs each group
//! concurrently, waits for the whole group, pauses for the inter-batch
//! delay and moves on. A failing or panicking task is recorded as a
//! missing result and never disturbs its siblings. Dropping a running
//! batch aborts the tasks of its current group.

use std::collections::{HashMap, HashSet};
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::num::NonZeroUsize;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::retry::cancellable_sleep;
use crate::{OrchestratorError, ValidationError};

/// How many tasks may be in flight at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyTier {
    Sequential,
    Parallel(NonZeroUsize),
}

impl ConcurrencyTier {
    pub fn parallel(width: usize) -> Result<Self, ValidationError> {
        NonZeroUsize::new(width)
            .map(Self::Parallel)
            .ok_or(ValidationError::ZeroParallelism)
    }

    /// Maximum group size.
    pub const fn width(self) -> usize {
        match self {
            Self::Sequential => 1,
            Self::Parallel(width) => width.get(),
        }
    }
}

impl Display for ConcurrencyTier {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sequential => f.write_str("sequential"),
            Self::Parallel(width) => write!(f, "parallel({width})"),
        }
    }
}

/// User-facing speed choice matching the rate class of their credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateTier {
    Conservative,
    Fast,
    Maximum,
}

impl RateTier {
    pub const ALL: [Self; 3] = [Self::Conservative, Self::Fast, Self::Maximum];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Conservative => "conservative",
            Self::Fast => "fast",
            Self::Maximum => "maximum",
        }
    }

    pub const fn concurrency(self) -> ConcurrencyTier {
        match self {
            Self::Conservative => ConcurrencyTier::Sequential,
            Self::Fast => ConcurrencyTier::Parallel(NonZeroUsize::MIN.saturating_add(2)),
            Self::Maximum => ConcurrencyTier::Parallel(NonZeroUsize::MIN.saturating_add(7)),
        }
    }
}

impl Display for RateTier {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RateTier {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "conservative" => Ok(Self::Conservative),
            "fast" => Ok(Self::Fast),
            "maximum" => Ok(Self::Maximum),
            other => Err(ValidationError::InvalidRateTier {
                value: other.to_owned(),
            }),
        }
    }
}

/// Concurrency tier plus the pause inserted between groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchPlan {
    pub tier: ConcurrencyTier,
    pub inter_batch_delay: Duration,
}

impl BatchPlan {
    pub const fn new(tier: ConcurrencyTier, inter_batch_delay: Duration) -> Self {
        Self {
            tier,
            inter_batch_delay,
        }
    }

    pub const fn for_rate_tier(rate_tier: RateTier, inter_batch_delay: Duration) -> Self {
        Self::new(rate_tier.concurrency(), inter_batch_delay)
    }
}

/// Identity of one task inside a batch, e.g. an analysis category.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Arc<str>);

impl TaskId {
    pub fn new(value: impl AsRef<str>) -> Result<Self, ValidationError> {
        let value = value.as_ref().trim();
        if value.is_empty() {
            return Err(ValidationError::EmptyTaskId);
        }
        Ok(Self(Arc::from(value)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for TaskId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-run information handed to a task.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: TaskId,
    /// `true` on the single re-run after providers were re-probed.
    pub refreshed: bool,
    pub cancel: CancellationToken,
}

pub type TaskFuture<T> = Pin<Box<dyn Future<Output = Result<T, OrchestratorError>> + Send>>;

type TaskFn<T> = Arc<dyn Fn(TaskContext) -> TaskFuture<T> + Send + Sync>;

/// One independent unit of work.
pub struct Task<T> {
    id: TaskId,
    invoke: TaskFn<T>,
}

impl<T> Task<T> {
    pub fn new<F, Fut>(id: TaskId, invoke: F) -> Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, OrchestratorError>> + Send + 'static,
    {
        Self {
            id,
            invoke: Arc::new(move |context| Box::pin(invoke(context))),
        }
    }

    pub fn id(&self) -> &TaskId {
        &self.id
    }
}

impl<T> std::fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task").field("id", &self.id).finish_non_exhaustive()
    }
}

/// Re-resolves provider handles after a task failed on a stale one.
pub trait ProviderProbe: Send + Sync {
    fn refresh<'a>(&'a self) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
}

/// Why a task produced no result.
#[derive(Debug, Clone)]
pub enum TaskFailure {
    Error(OrchestratorError),
    Panicked,
    /// The batch was cancelled before the task started.
    NotStarted,
}

impl Display for TaskFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error(error) => Display::fmt(error, f),
            Self::Panicked => f.write_str("task panicked"),
            Self::NotStarted => f.write_str("batch was cancelled before the task started"),
        }
    }
}

/// Result slot for one task.
#[derive(Debug, Clone)]
pub struct TaskOutcome<T> {
    pub id: TaskId,
    pub result: Option<T>,
    pub failure: Option<TaskFailure>,
}

/// Per-task results of one batch, in submission order.
#[derive(Debug, Clone)]
pub struct BatchResults<T> {
    pub batch_id: Uuid,
    pub outcomes: Vec<TaskOutcome<T>>,
    pub cancelled: bool,
}

impl<T> BatchResults<T> {
    pub fn get(&self, id: &TaskId) -> Option<&T> {
        self.outcomes
            .iter()
            .find(|outcome| &outcome.id == id)
            .and_then(|outcome| outcome.result.as_ref())
    }

    pub fn total(&self) -> usize {
        self.outcomes.len()
    }

    /// Number of tasks that produced a result.
    pub fn completed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|outcome| outcome.result.is_some())
            .count()
    }

    pub fn failures(&self) -> impl Iterator<Item = (&TaskId, &TaskFailure)> {
        self.outcomes
            .iter()
            .filter_map(|outcome| outcome.failure.as_ref().map(|failure| (&outcome.id, failure)))
    }

    pub fn into_map(self) -> HashMap<TaskId, Option<T>> {
        self.outcomes
            .into_iter()
            .map(|outcome| (outcome.id, outcome.result))
            .collect()
    }
}

/// Runs batches of tasks at a configured concurrency tier.
#[derive(Clone, Default)]
pub struct Scheduler {
    probe: Option<Arc<dyn ProviderProbe>>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("has_probe", &self.probe.is_some())
            .finish()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables the one-time re-run of tasks that failed on a stale
    /// provider handle.
    pub fn with_probe(mut self, probe: Arc<dyn ProviderProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Runs `tasks` according to `plan`.
    ///
    /// `on_progress(percent, message)` fires once per finished task, with
    /// percent derived from finished/total. Fails only on invalid input
    /// (duplicate task ids); task failures are recorded in the results.
    pub async fn run_batch<T, P>(
        &self,
        tasks: Vec<Task<T>>,
        plan: &BatchPlan,
        on_progress: P,
        cancel: &CancellationToken,
    ) -> Result<BatchResults<T>, ValidationError>
    where
        T: Send + 'static,
        P: Fn(u8, &str),
    {
        let mut seen = HashSet::with_capacity(tasks.len());
        for task in &tasks {
            if !seen.insert(task.id.clone()) {
                return Err(ValidationError::DuplicateTaskId {
                    id: task.id.to_string(),
                });
            }
        }

        let batch_id = Uuid::new_v4();
        let total = tasks.len();
        let width = plan.tier.width();
        info!(%batch_id, total, tier = %plan.tier, "starting batch");

        let mut slots: Vec<TaskOutcome<T>> = tasks
            .iter()
            .map(|task| TaskOutcome {
                id: task.id.clone(),
                result: None,
                failure: Some(TaskFailure::NotStarted),
            })
            .collect();
        let mut finished = 0usize;
        let mut cancelled = false;
        let group_count = total.div_ceil(width);

        for (group_index, group) in tasks.chunks(width).enumerate() {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            let offset = group_index * width;
            debug!(%batch_id, group = group_index, size = group.len(), "starting group");

            // Dropping the set aborts every task still running in it.
            let mut running = JoinSet::new();
            let mut positions = HashMap::with_capacity(group.len());
            for (position, task) in group.iter().enumerate() {
                let handle = running.spawn(run_task(
                    task.id.clone(),
                    Arc::clone(&task.invoke),
                    self.probe.clone(),
                    cancel.clone(),
                ));
                positions.insert(handle.id(), offset + position);
            }

            while let Some(joined) = running.join_next_with_id().await {
                let (task, outcome) = match joined {
                    Ok((task, outcome)) => (task, Ok(outcome)),
                    Err(join_error) => (join_error.id(), Err(join_error)),
                };
                let Some(&index) = positions.get(&task) else {
                    continue;
                };
                let slot = &mut slots[index];
                let status = match outcome {
                    Ok(Ok(value)) => {
                        slot.result = Some(value);
                        slot.failure = None;
                        "completed"
                    }
                    Ok(Err(error)) => {
                        warn!(%batch_id, task_id = %slot.id, error = %error, "task failed");
                        slot.failure = Some(TaskFailure::Error(error));
                        "failed"
                    }
                    Err(join_error) => {
                        warn!(%batch_id, task_id = %slot.id, error = %join_error, "task panicked");
                        slot.failure = Some(TaskFailure::Panicked);
                        "failed"
                    }
                };

                finished += 1;
                let percent = (finished * 100 / total.max(1)) as u8;
                on_progress(
                    percent,
                    &format!("{} {status} ({finished}/{total})", slot.id),
                );
            }

            let is_last = group_index + 1 == group_count;
            if !is_last && !cancellable_sleep(plan.inter_batch_delay, cancel).await {
                cancelled = true;
                break;
            }
        }

        if cancel.is_cancelled() {
            cancelled = true;
        }

        let results = BatchResults {
            batch_id,
            outcomes: slots,
            cancelled,
        };
        info!(
            %batch_id,
            completed = results.completed(),
            total,
            cancelled,
            "batch finished"
        );
        Ok(results)
    }
}

async fn run_task<T>(
    task_id: TaskId,
    invoke: TaskFn<T>,
    probe: Option<Arc<dyn ProviderProbe>>,
    cancel: CancellationToken,
) -> Result<T, OrchestratorError> {
    let first = invoke(TaskContext {
        task_id: task_id.clone(),
        refreshed: false,
        cancel: cancel.clone(),
    })
    .await;

    let stale = matches!(
        &first,
        Err(OrchestratorError::AllProvidersFailed(failure)) if failure.has_stale_handle()
    );
    let Some(probe) = probe.filter(|_| stale) else {
        return first;
    };

    info!(%task_id, "stale provider handle; re-probing providers and retrying once");
    tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(OrchestratorError::Cancelled),
        _ = probe.refresh() => {}
    }

    invoke(TaskContext {
        task_id,
        refreshed: true,
        cancel,
    })
    .await
}
