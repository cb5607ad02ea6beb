//! Task trees: leaves that perform one remote operation, composed into
//! sequential and parallel groups.

use futures_util::future::{BoxFuture, FutureExt};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Error, Failure, Result};
use crate::types::StackName;

/// Named outputs of one stack.
pub type StackOutputs = BTreeMap<String, String>;

/// Outputs published by completed stacks during a run.
///
/// Readers only see outputs of stacks that completed before them, which the
/// tree guarantees by placing the reader sequentially after the producer.
#[derive(Clone, Default)]
pub struct OutputStore {
    inner: Arc<RwLock<HashMap<StackName, StackOutputs>>>,
}

impl OutputStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn publish(&self, stack: StackName, outputs: StackOutputs) {
        self.inner.write().await.insert(stack, outputs);
    }

    pub async fn get(&self, stack: &StackName) -> Option<StackOutputs> {
        self.inner.read().await.get(stack).cloned()
    }

    /// Look up a single output, failing if the stack or key is absent.
    pub async fn require(&self, stack: &StackName, key: &str) -> Result<String> {
        let guard = self.inner.read().await;
        guard
            .get(stack)
            .and_then(|outputs| outputs.get(key))
            .cloned()
            .ok_or_else(|| {
                Error::new(Failure::MissingOutput {
                    stack: stack.clone(),
                    key: key.to_string(),
                })
            })
    }
}

/// Split a comma-separated list output such as `SubnetIds`.
pub fn split_list_output(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Per-run state handed to every leaf.
#[derive(Clone)]
pub struct TaskContext {
    pub run_id: Uuid,
    pub cancel: CancellationToken,
    pub outputs: OutputStore,
}

impl TaskContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            cancel,
            outputs: OutputStore::new(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("run_id", &self.run_id)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

pub type LeafFuture = BoxFuture<'static, Result<()>>;

type LeafAction = dyn Fn(TaskContext) -> LeafFuture + Send + Sync;

/// A single remote operation.
pub struct Leaf {
    description: String,
    action: Arc<LeafAction>,
}

impl Leaf {
    pub fn description(&self) -> &str {
        &self.description
    }

    pub(crate) fn invoke(&self, ctx: TaskContext) -> LeafFuture {
        (self.action)(ctx)
    }
}

/// How a sequential group reacts to a failed child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Stop at the first failure; later children never run.
    FailFast,
    /// Run every child and aggregate failures. Used for deletions.
    BestEffort,
}

pub enum Task {
    Leaf(Leaf),
    Sequential {
        description: String,
        children: Vec<Task>,
        policy: FailurePolicy,
    },
    Parallel {
        description: String,
        children: Vec<Task>,
        /// Maximum children in flight. `None` means unbounded.
        limit: Option<usize>,
    },
}

impl Task {
    pub fn leaf<F, Fut>(description: impl Into<String>, action: F) -> Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Task::Leaf(Leaf {
            description: description.into(),
            action: Arc::new(move |ctx| action(ctx).boxed()),
        })
    }

    pub fn sequential(description: impl Into<String>, children: Vec<Task>) -> Self {
        Task::Sequential {
            description: description.into(),
            children,
            policy: FailurePolicy::FailFast,
        }
    }

    pub fn parallel(description: impl Into<String>, children: Vec<Task>) -> Self {
        Task::Parallel {
            description: description.into(),
            children,
            limit: None,
        }
    }

    /// Switch a sequential group to best-effort continuation. No effect on
    /// other variants.
    pub fn best_effort(self) -> Self {
        match self {
            Task::Sequential {
                description,
                children,
                ..
            } => Task::Sequential {
                description,
                children,
                policy: FailurePolicy::BestEffort,
            },
            other => other,
        }
    }

    /// Bound the number of children a parallel group runs at once. No
    /// effect on other variants.
    pub fn with_limit(self, limit: usize) -> Self {
        match self {
            Task::Parallel {
                description,
                children,
                ..
            } => Task::Parallel {
                description,
                children,
                limit: Some(limit.max(1)),
            },
            other => other,
        }
    }

    pub fn description(&self) -> &str {
        match self {
            Task::Leaf(leaf) => &leaf.description,
            Task::Sequential { description, .. } | Task::Parallel { description, .. } => {
                description
            }
        }
    }

    pub fn leaf_count(&self) -> usize {
        match self {
            Task::Leaf(_) => 1,
            Task::Sequential { children, .. } | Task::Parallel { children, .. } => {
                children.iter().map(Task::leaf_count).sum()
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.leaf_count() == 0
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (description, children, label) = match self {
            Task::Leaf(leaf) => return f.write_str(&leaf.description),
            Task::Sequential {
                description,
                children,
                policy,
            } => {
                let label = match policy {
                    FailurePolicy::FailFast => "sequential tasks",
                    FailurePolicy::BestEffort => "sequential tasks (best effort)",
                };
                (description, children, label)
            }
            Task::Parallel {
                description,
                children,
                ..
            } => (description, children, "parallel sub-tasks"),
        };
        if children.is_empty() {
            return write!(f, "{}: no tasks", description);
        }
        write!(f, "{}: {} {}: {{ ", description, children.len(), label)?;
        for (i, child) in children.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", child)?;
        }
        f.write_str(" }")
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Task({})", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(description: &str) -> Task {
        Task::leaf(description, |_ctx| async { Ok(()) })
    }

    #[test]
    fn test_tree_renders_nested_groups() {
        let tree = Task::sequential(
            "create cluster demo",
            vec![
                noop("create stack eko-demo-network"),
                Task::parallel(
                    "create nodegroups",
                    vec![noop("create nodegroup ng-1"), noop("create nodegroup ng-2")],
                ),
            ],
        );
        assert_eq!(
            tree.to_string(),
            "create cluster demo: 2 sequential tasks: { create stack eko-demo-network, \
             create nodegroups: 2 parallel sub-tasks: { create nodegroup ng-1, create nodegroup ng-2 } }"
        );
        assert_eq!(tree.leaf_count(), 3);
    }

    #[test]
    fn test_builders_only_touch_matching_variants() {
        let leaf = noop("x").best_effort().with_limit(3);
        assert!(matches!(leaf, Task::Leaf(_)));

        let par = Task::parallel("p", vec![]).with_limit(0);
        assert!(matches!(par, Task::Parallel { limit: Some(1), .. }));
        assert!(par.is_empty());

        let seq = Task::sequential("s", vec![noop("a")]).best_effort();
        assert!(matches!(
            seq,
            Task::Sequential {
                policy: FailurePolicy::BestEffort,
                ..
            }
        ));
    }

    #[test]
    fn test_split_list_output() {
        assert_eq!(
            split_list_output("subnet-a, subnet-b,,subnet-c"),
            vec!["subnet-a", "subnet-b", "subnet-c"]
        );
        assert!(split_list_output("").is_empty());
    }

    #[tokio::test]
    async fn test_output_store_require() {
        let store = OutputStore::new();
        let stack = StackName::new("eko-demo-network");
        assert!(store.require(&stack, "VpcId").await.unwrap_err().is_not_found());

        let mut outputs = StackOutputs::new();
        outputs.insert("VpcId".into(), "vpc-123".into());
        store.publish(stack.clone(), outputs).await;
        assert_eq!(store.require(&stack, "VpcId").await.unwrap(), "vpc-123");
    }
}
