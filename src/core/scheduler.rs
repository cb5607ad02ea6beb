// Task tree execution with bounded concurrency

use futures_util::future::{BoxFuture, FutureExt};
use futures_util::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};
use tracing::{Instrument, debug, info, info_span, warn};

use crate::core::task::{FailurePolicy, Leaf, Task, TaskContext};
use crate::error::{Error, ErrorKind, Failure, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The run was cancelled before the leaf started.
    Cancelled,
    /// An earlier sibling in a fail-fast sequence failed.
    PriorFailure,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeafOutcome {
    Succeeded,
    Failed(String),
    Skipped(SkipReason),
    /// Submitted, then interrupted before a terminal state was observed.
    /// Must be reconciled by a later run.
    Unresolved,
}

#[derive(Debug, Clone)]
pub struct LeafRecord {
    /// Descriptions of the enclosing groups, outermost first.
    pub path: Vec<String>,
    pub description: String,
    pub outcome: LeafOutcome,
    pub elapsed: Duration,
}

/// Per-leaf outcomes of one run, plus the aggregated error if any.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub records: Vec<LeafRecord>,
    pub error: Option<Error>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn outcome_of(&self, description: &str) -> Option<&LeafOutcome> {
        self.records
            .iter()
            .find(|r| r.description == description)
            .map(|r| &r.outcome)
    }

    fn matching(&self, pred: impl Fn(&LeafOutcome) -> bool) -> Vec<&LeafRecord> {
        self.records.iter().filter(|r| pred(&r.outcome)).collect()
    }

    pub fn succeeded(&self) -> Vec<&LeafRecord> {
        self.matching(|o| matches!(o, LeafOutcome::Succeeded))
    }

    pub fn failed(&self) -> Vec<&LeafRecord> {
        self.matching(|o| matches!(o, LeafOutcome::Failed(_)))
    }

    pub fn skipped(&self) -> Vec<&LeafRecord> {
        self.matching(|o| matches!(o, LeafOutcome::Skipped(_)))
    }

    pub fn unresolved(&self) -> Vec<&LeafRecord> {
        self.matching(|o| matches!(o, LeafOutcome::Unresolved))
    }

    fn interrupted(&self) -> bool {
        self.records.iter().any(|r| {
            matches!(
                r.outcome,
                LeafOutcome::Unresolved | LeafOutcome::Skipped(SkipReason::Cancelled)
            )
        })
    }

    fn descriptions(records: Vec<&LeafRecord>) -> Vec<String> {
        records.into_iter().map(|r| r.description.clone()).collect()
    }
}

/// Executes task trees.
///
/// Holds a pool of `max_in_flight` permits shared by every leaf of every tree
/// it runs; parallel groups add their own per-group bound on top. Composites
/// never hold a permit, so nesting cannot deadlock.
pub struct TaskScheduler {
    permits: Arc<Semaphore>,
    max_in_flight: usize,
}

impl TaskScheduler {
    pub fn new(max_in_flight: usize) -> Self {
        let max_in_flight = max_in_flight.max(1);
        Self {
            permits: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight,
        }
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    /// Run a tree and return the report. Never retries a leaf.
    pub async fn execute(&self, task: &Task, ctx: &TaskContext) -> RunReport {
        let records = Mutex::new(Vec::new());
        info!(run_id = %ctx.run_id, leaves = task.leaf_count(), "executing task tree");
        debug!(tree = %task, "task tree");

        let result = self.run_node(task, Vec::new(), ctx, &records).await;

        let mut report = RunReport {
            records: records.into_inner(),
            error: None,
        };
        report.error = if report.interrupted() {
            Some(Error::new(Failure::Interrupted {
                completed: RunReport::descriptions(report.succeeded()),
                failed: report
                    .failed()
                    .into_iter()
                    .filter_map(|r| match &r.outcome {
                        LeafOutcome::Failed(message) => Some(format!("{}: {}", r.description, message)),
                        _ => None,
                    })
                    .collect(),
                unresolved: RunReport::descriptions(report.unresolved()),
                skipped: RunReport::descriptions(report.skipped()),
            }))
        } else {
            result.err()
        };

        match &report.error {
            None => info!(run_id = %ctx.run_id, "all tasks completed"),
            Some(err) => warn!(run_id = %ctx.run_id, kind = %err.kind(), "task tree failed: {}", err),
        }
        report
    }

    /// Run a tree, turning a failed report into its error.
    pub async fn run(&self, task: &Task, ctx: &TaskContext) -> Result<RunReport> {
        let report = self.execute(task, ctx).await;
        match report.error.clone() {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }

    fn run_node<'a>(
        &'a self,
        task: &'a Task,
        path: Vec<String>,
        ctx: &'a TaskContext,
        records: &'a Mutex<Vec<LeafRecord>>,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            match task {
                Task::Leaf(leaf) => self.run_leaf(leaf, path, ctx, records).await,
                Task::Sequential {
                    description,
                    children,
                    policy,
                } => {
                    self.run_sequential(description, children, *policy, path, ctx, records)
                        .await
                }
                Task::Parallel {
                    description,
                    children,
                    limit,
                } => {
                    self.run_parallel(description, children, *limit, path, ctx, records)
                        .await
                }
            }
        }
        .boxed()
    }

    async fn run_leaf(
        &self,
        leaf: &Leaf,
        path: Vec<String>,
        ctx: &TaskContext,
        records: &Mutex<Vec<LeafRecord>>,
    ) -> Result<()> {
        let description = leaf.description().to_string();

        let permit = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => None,
            permit = self.permits.acquire() => permit.ok(),
        };
        let Some(_permit) = permit.filter(|_| !ctx.is_cancelled()) else {
            debug!(task = %description, "skipping task, run cancelled");
            records.lock().await.push(LeafRecord {
                path,
                description: description.clone(),
                outcome: LeafOutcome::Skipped(SkipReason::Cancelled),
                elapsed: Duration::ZERO,
            });
            return Err(Error::cancelled(description));
        };

        info!(task = %description, "task started");
        let started = Instant::now();
        let result = leaf
            .invoke(ctx.clone())
            .instrument(info_span!("task", description = %description))
            .await;
        let elapsed = started.elapsed();

        let outcome = match &result {
            Ok(()) => {
                info!(task = %description, elapsed_ms = elapsed.as_millis() as u64, "task completed");
                LeafOutcome::Succeeded
            }
            Err(err) if err.kind() == ErrorKind::Cancelled => {
                warn!(task = %description, "task interrupted before reaching a terminal state");
                LeafOutcome::Unresolved
            }
            Err(err) => {
                warn!(task = %description, kind = %err.kind(), "task failed: {}", err);
                LeafOutcome::Failed(err.to_string())
            }
        };
        records.lock().await.push(LeafRecord {
            path,
            description: description.clone(),
            outcome,
            elapsed,
        });

        result.map_err(|err| err.with_context(description))
    }

    async fn run_sequential(
        &self,
        description: &str,
        children: &[Task],
        policy: FailurePolicy,
        path: Vec<String>,
        ctx: &TaskContext,
        records: &Mutex<Vec<LeafRecord>>,
    ) -> Result<()> {
        let child_path = extend(&path, description);
        let mut failures = Vec::new();

        for (i, child) in children.iter().enumerate() {
            if ctx.is_cancelled() {
                skip_all(&children[i..], &child_path, SkipReason::Cancelled, records).await;
                return Err(Error::cancelled(description));
            }
            match self.run_node(child, child_path.clone(), ctx, records).await {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::Cancelled => {
                    skip_all(&children[i + 1..], &child_path, SkipReason::Cancelled, records).await;
                    return Err(err.with_context(description));
                }
                Err(err) => match policy {
                    FailurePolicy::FailFast => {
                        skip_all(&children[i + 1..], &child_path, SkipReason::PriorFailure, records)
                            .await;
                        return Err(err.with_context(description));
                    }
                    FailurePolicy::BestEffort => failures.extend(err.into_failures()),
                },
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::aggregate(failures, leaf_total(children)).with_context(description))
        }
    }

    async fn run_parallel(
        &self,
        description: &str,
        children: &[Task],
        limit: Option<usize>,
        path: Vec<String>,
        ctx: &TaskContext,
        records: &Mutex<Vec<LeafRecord>>,
    ) -> Result<()> {
        if children.is_empty() {
            return Ok(());
        }
        let child_path = extend(&path, description);
        let limit = limit.unwrap_or(children.len()).max(1);
        debug!(group = %description, children = children.len(), limit, "dispatching parallel group");

        let nodes: Vec<BoxFuture<'_, Result<()>>> = children
            .iter()
            .map(|child| self.run_node(child, child_path.clone(), ctx, records))
            .collect();
        let results: Vec<Result<()>> = stream::iter(nodes)
        .buffer_unordered(limit)
        .collect()
        .await;

        let mut cancelled = false;
        let mut failures = Vec::new();
        for result in results {
            match result {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::Cancelled => cancelled = true,
                Err(err) => failures.extend(err.into_failures()),
            }
        }

        if !failures.is_empty() {
            Err(Error::aggregate(failures, leaf_total(children)).with_context(description))
        } else if cancelled {
            Err(Error::cancelled(description))
        } else {
            Ok(())
        }
    }
}

fn leaf_total(children: &[Task]) -> usize {
    children.iter().map(Task::leaf_count).sum()
}

fn extend(path: &[String], description: &str) -> Vec<String> {
    let mut next = path.to_vec();
    next.push(description.to_string());
    next
}

/// Record every leaf under `tasks` as skipped without running it.
async fn skip_all(
    tasks: &[Task],
    path: &[String],
    reason: SkipReason,
    records: &Mutex<Vec<LeafRecord>>,
) {
    let mut stack: Vec<(&Task, Vec<String>)> =
        tasks.iter().rev().map(|t| (t, path.to_vec())).collect();
    let mut guard = records.lock().await;
    while let Some((task, path)) = stack.pop() {
        match task {
            Task::Leaf(leaf) => guard.push(LeafRecord {
                path,
                description: leaf.description().to_string(),
                outcome: LeafOutcome::Skipped(reason),
                elapsed: Duration::ZERO,
            }),
            Task::Sequential {
                description,
                children,
                ..
            }
            | Task::Parallel {
                description,
                children,
                ..
            } => {
                let child_path = extend(&path, description);
                stack.extend(children.iter().rev().map(|c| (c, child_path.clone())));
            }
        }
    }
}
