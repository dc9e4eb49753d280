//! Folding per-task reports into one scored, sorted report.

use std::collections::{BTreeMap, HashSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::scheduler::{BatchResults, TaskId};

/// Default number of priority actions kept in an aggregate.
pub const DEFAULT_ACTION_CAP: usize = 5;

/// Issue severity. Declaration order is the sort order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    Major,
    Minor,
    Suggestion,
}

impl Severity {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::Major => "major",
            Self::Minor => "minor",
            Self::Suggestion => "suggestion",
        }
    }
}

impl Display for Severity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub severity: Severity,
    pub description: String,
    /// Task that reported the issue; filled in during aggregation when a
    /// provider leaves it out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

/// Scored output of one task, as returned by a text-analysis provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryReport {
    pub score: f64,
    #[serde(default)]
    pub issues: Vec<Issue>,
    #[serde(default)]
    pub priority_actions: Vec<String>,
}

/// Batch-wide report. Built once and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateResult {
    pub per_task: BTreeMap<TaskId, Option<CategoryReport>>,
    pub overall_score: f64,
    pub issues: Vec<Issue>,
    pub top_actions: Vec<String>,
    pub completed: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Aggregator {
    action_cap: usize,
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new(DEFAULT_ACTION_CAP)
    }
}

impl Aggregator {
    pub const fn new(action_cap: usize) -> Self {
        Self { action_cap }
    }

    pub const fn action_cap(&self) -> usize {
        self.action_cap
    }

    pub fn aggregate_batch(&self, results: BatchResults<CategoryReport>) -> AggregateResult {
        self.aggregate(
            results
                .outcomes
                .into_iter()
                .map(|outcome| (outcome.id, outcome.result)),
        )
    }

    /// Missing reports count toward `total` but not toward the score.
    pub fn aggregate<I>(&self, results: I) -> AggregateResult
    where
        I: IntoIterator<Item = (TaskId, Option<CategoryReport>)>,
    {
        let mut per_task = BTreeMap::new();
        let mut issues = Vec::new();
        let mut actions = Vec::new();
        let mut score_sum = 0.0;
        let mut completed = 0usize;
        let mut total = 0usize;

        for (task_id, report) in results {
            total += 1;
            if let Some(report) = &report {
                completed += 1;
                score_sum += report.score;
                issues.extend(report.issues.iter().cloned().map(|mut issue| {
                    issue
                        .category
                        .get_or_insert_with(|| task_id.as_str().to_owned());
                    issue
                }));
                actions.extend(report.priority_actions.iter().cloned());
            }
            per_task.insert(task_id, report);
        }

        // `sort_by_key` is stable; equal severities keep report order.
        issues.sort_by_key(|issue| issue.severity);

        let overall_score = if completed == 0 {
            0.0
        } else {
            score_sum / completed as f64
        };

        AggregateResult {
            per_task,
            overall_score,
            issues,
            top_actions: dedup_first_seen(actions, self.action_cap),
            completed,
            total,
        }
    }
}

fn dedup_first_seen(values: Vec<String>, cap: usize) -> Vec<String> {
    let mut seen = HashSet::new();
    values
        .into_iter()
        .filter(|value| seen.insert(value.clone()))
        .take(cap)
        .collect()
}
