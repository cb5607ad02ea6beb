//! Drives stack mutations to a terminal status.
//!
//! Each mutation is handed out as a [`Task`] leaf that has not run yet. When
//! the scheduler runs it, the leaf submits the mutation and then polls the
//! stack through the [`Waiter`] until it is terminal.

use futures_util::future::BoxFuture;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{StackOperation, StackSpec, StackState, StackStatus, StackSummary};
use crate::client::StackClient;
use crate::core::{Observation, StackOutputs, Task, TaskContext, Verdict, WaitConfig, Waiter};
use crate::error::{Error, Failure, Result};
use crate::types::StackName;

#[derive(Clone)]
pub struct StackManager {
    client: Arc<dyn StackClient>,
    wait: WaitConfig,
}

impl StackManager {
    pub fn new(client: Arc<dyn StackClient>, wait: WaitConfig) -> Self {
        Self { client, wait }
    }

    /// Leaf creating `spec`. Fails with AlreadyExists, without issuing the
    /// create call, if a stack with that name exists.
    pub fn create_stack(&self, spec: StackSpec) -> Task {
        let manager = self.clone();
        let spec = Arc::new(spec);
        Task::leaf(format!("create stack {}", spec.name), move |ctx| {
            let manager = manager.clone();
            let spec = spec.clone();
            async move { manager.run_create(&spec, &ctx).await }
        })
    }

    /// Leaf creating a stack whose spec is built when the leaf runs, from the
    /// outputs published earlier in the run.
    pub fn create_stack_with<F>(&self, name: StackName, build: F) -> Task
    where
        F: Fn(&TaskContext) -> BoxFuture<'static, Result<StackSpec>> + Send + Sync + 'static,
    {
        let manager = self.clone();
        let build = Arc::new(build);
        Task::leaf(format!("create stack {}", name), move |ctx| {
            let manager = manager.clone();
            let build = build.clone();
            async move {
                let spec = build(&ctx).await?;
                manager.run_create(&spec, &ctx).await
            }
        })
    }

    pub fn update_stack(&self, spec: StackSpec) -> Task {
        let manager = self.clone();
        let spec = Arc::new(spec);
        Task::leaf(format!("update stack {}", spec.name), move |ctx| {
            let manager = manager.clone();
            let spec = spec.clone();
            async move { manager.run_update(&spec, &ctx).await }
        })
    }

    /// Like [`StackManager::create_stack_with`], for updates.
    pub fn update_stack_with<F>(&self, name: StackName, build: F) -> Task
    where
        F: Fn(&TaskContext) -> BoxFuture<'static, Result<StackSpec>> + Send + Sync + 'static,
    {
        let manager = self.clone();
        let build = Arc::new(build);
        Task::leaf(format!("update stack {}", name), move |ctx| {
            let manager = manager.clone();
            let build = build.clone();
            async move {
                let spec = build(&ctx).await?;
                manager.run_update(&spec, &ctx).await
            }
        })
    }

    /// Leaf deleting `name`. A stack that is already gone counts as deleted.
    pub fn delete_stack(&self, name: StackName) -> Task {
        let manager = self.clone();
        Task::leaf(format!("delete stack {}", name), move |ctx| {
            let manager = manager.clone();
            let name = name.clone();
            async move { manager.run_delete(&name, &ctx).await }
        })
    }

    pub async fn describe_stack(&self, name: &StackName) -> Result<Option<StackState>> {
        match self.client.describe_stack(name).await {
            Ok(state) if state.status == StackStatus::Deleted => Ok(None),
            Ok(state) => Ok(Some(state)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn list_stacks(&self) -> Result<Vec<StackSummary>> {
        let stacks = self.client.list_stacks().await?;
        Ok(stacks
            .into_iter()
            .filter(|s| s.status != StackStatus::Deleted)
            .collect())
    }

    /// Outputs of a completed stack.
    pub async fn outputs(&self, name: &StackName) -> Result<StackOutputs> {
        match self.describe_stack(name).await? {
            Some(state) if state.status == StackStatus::Complete => Ok(state.outputs),
            Some(state) => Err(Error::new(Failure::StackOperation {
                stack: name.clone(),
                status: state.status,
                events: state.recent_failures(),
            })),
            None => Err(Error::not_found(format!("stack {}", name))),
        }
    }

    async fn run_create(&self, spec: &StackSpec, ctx: &TaskContext) -> Result<()> {
        let waiter = self.waiter(ctx);
        let resource = format!("stack {}", spec.name);

        if self.lookup(&waiter, &spec.name).await?.is_some() {
            return Err(Error::already_exists(resource));
        }

        info!(stack = %spec.name, "creating stack");
        waiter
            .submit(&resource, || self.client.create_stack(spec))
            .await?;

        let state = self
            .wait_for(&waiter, &spec.name, StackOperation::Create)
            .await?;
        self.publish(ctx, state).await;
        Ok(())
    }

    async fn run_update(&self, spec: &StackSpec, ctx: &TaskContext) -> Result<()> {
        let waiter = self.waiter(ctx);
        let resource = format!("stack {}", spec.name);

        info!(stack = %spec.name, "updating stack");
        waiter
            .submit(&resource, || self.client.update_stack(spec))
            .await?;

        let state = self
            .wait_for(&waiter, &spec.name, StackOperation::Update)
            .await?;
        self.publish(ctx, state).await;
        Ok(())
    }

    async fn run_delete(&self, name: &StackName, ctx: &TaskContext) -> Result<()> {
        let waiter = self.waiter(ctx);
        let resource = format!("stack {}", name);

        if self.lookup(&waiter, name).await?.is_none() {
            debug!(stack = %name, "stack already deleted");
            return Ok(());
        }

        info!(stack = %name, "deleting stack");
        match waiter.submit(&resource, || self.client.delete_stack(name)).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err),
        }

        let mut last: Option<StackState> = None;
        waiter
            .wait_until(
                &resource,
                || self.client.describe_stack(name),
                |obs| match obs {
                    Observation::Absent => Verdict::Done,
                    Observation::Present(state) => {
                        match judge(name, StackOperation::Delete, &mut last, state) {
                            Ok(done) if done.status == StackStatus::Deleted => Verdict::Done,
                            Ok(done) => Verdict::Failed(stack_failure(name, &done)),
                            Err(status) => Verdict::Pending(status),
                        }
                    }
                },
            )
            .await?;
        info!(stack = %name, "stack deleted");
        Ok(())
    }

    /// Current state through the waiter's retrying read; `None` when gone.
    async fn lookup(&self, waiter: &Waiter, name: &StackName) -> Result<Option<StackState>> {
        let resource = format!("stack {}", name);
        match waiter.read(&resource, || self.client.describe_stack(name)).await {
            Ok(state) if state.status == StackStatus::Deleted => Ok(None),
            Ok(state) => Ok(Some(state)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn wait_for(
        &self,
        waiter: &Waiter,
        name: &StackName,
        operation: StackOperation,
    ) -> Result<StackState> {
        let resource = format!("stack {}", name);
        let mut last: Option<StackState> = None;
        let state = waiter
            .wait_until(
                &resource,
                || self.client.describe_stack(name),
                |obs| match obs {
                    Observation::Absent => Verdict::Failed(Error::not_found(resource.clone())),
                    Observation::Present(state) => match judge(name, operation, &mut last, state) {
                        Ok(done) if done.status == StackStatus::Complete => Verdict::Done,
                        Ok(done) => Verdict::Failed(stack_failure(name, &done)),
                        Err(status) => Verdict::Pending(status),
                    },
                },
            )
            .await?;
        state.ok_or_else(|| Error::not_found(resource))
    }

    async fn publish(&self, ctx: &TaskContext, state: StackState) {
        info!(stack = %state.name, outputs = state.outputs.len(), "stack complete");
        ctx.outputs.publish(state.name, state.outputs).await;
    }

    fn waiter(&self, ctx: &TaskContext) -> Waiter {
        Waiter::new(self.wait.clone(), ctx.cancel.clone())
    }
}

/// Fold one observation into the running view of the operation. Returns the
/// state once terminal, otherwise the status to report while pending.
/// Regressing observations and observations of an older operation keep the
/// wait pending.
fn judge(
    name: &StackName,
    operation: StackOperation,
    last: &mut Option<StackState>,
    observed: &StackState,
) -> std::result::Result<StackState, String> {
    if observed.operation != operation {
        return Err(observed.raw_status());
    }
    match last.as_mut() {
        Some(current) => {
            if !current.advance(observed.clone()) {
                warn!(stack = %name, status = %observed.status, kept = %current.status, "ignoring out-of-order stack status");
            }
        }
        None => *last = Some(observed.clone()),
    }
    match last.as_ref() {
        Some(current) if current.is_terminal() => Ok(current.clone()),
        Some(current) => Err(current.raw_status()),
        None => Err(observed.raw_status()),
    }
}

fn stack_failure(name: &StackName, state: &StackState) -> Error {
    Error::new(Failure::StackOperation {
        stack: name.clone(),
        status: state.status,
        events: state.recent_failures(),
    })
}
