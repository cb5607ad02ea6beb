//! Reading the observed resource set of one cluster.
//!
//! Node groups, Fargate profiles and add-ons are listed by name and then
//! described one by one. IAM service accounts have no direct API; they are
//! read back from the parameters of their stacks.

use futures_util::future::try_join_all;
use std::collections::BTreeMap;
use tracing::{debug, info};

use super::ObservedSet;
use crate::context::CommandContext;
use crate::core::Waiter;
use crate::error::{Error, Result, ResultExt};
use crate::model::{ClusterInfo, ObservedResource, ResourceKind, ResourceSpec, ResourceStatus};
use crate::stack::template::service_account_from_parameters;
use crate::stack::{StackOperation, StackPurpose, StackStatus, StackSummary};
use crate::types::{ResourceName, StackName};

/// Stacks tagged as belonging to the context's cluster, by purpose.
#[derive(Debug, Clone, Default)]
pub struct OwnedStacks {
    pub network: Option<StackName>,
    pub cluster: Option<StackName>,
    pub nodegroups: BTreeMap<ResourceName, StackName>,
    pub service_accounts: Vec<StackSummary>,
}

impl OwnedStacks {
    pub fn is_empty(&self) -> bool {
        self.network.is_none()
            && self.cluster.is_none()
            && self.nodegroups.is_empty()
            && self.service_accounts.is_empty()
    }
}

pub async fn owned_stacks(ctx: &CommandContext, waiter: &Waiter) -> Result<OwnedStacks> {
    let summaries = waiter
        .read("stacks", || ctx.stacks.list_stacks())
        .await
        .context("list stacks")?;

    let mut owned = OwnedStacks::default();
    for summary in summaries {
        if summary.status == StackStatus::Deleted || summary.cluster() != Some(ctx.cluster.as_str()) {
            continue;
        }
        match summary.purpose() {
            Some(StackPurpose::Network) => owned.network = Some(summary.name),
            Some(StackPurpose::Cluster) => owned.cluster = Some(summary.name),
            Some(StackPurpose::NodeGroup(name)) => {
                owned.nodegroups.insert(name, summary.name);
            }
            Some(StackPurpose::ServiceAccount { .. }) => owned.service_accounts.push(summary),
            None => debug!(stack = %summary.name, "ignoring stack without a known purpose"),
        }
    }
    Ok(owned)
}

/// Observed state of every resource of the context's cluster. Fails with
/// NotFound when the cluster itself does not exist.
pub async fn observe(ctx: &CommandContext) -> Result<ObservedSet> {
    observe_cluster(ctx).await.map(|(_, observed)| observed)
}

/// Like [`observe`], together with the control plane itself.
pub async fn observe_cluster(ctx: &CommandContext) -> Result<(ClusterInfo, ObservedSet)> {
    let waiter = ctx.waiter();
    let label = format!("cluster {}", ctx.cluster);
    let info = match waiter
        .read(&label, || ctx.resources.describe_cluster(&ctx.cluster))
        .await
    {
        Ok(info) => info,
        Err(err) if err.is_not_found() => return Err(Error::not_found(label)),
        Err(err) => return Err(err.with_context(format!("describe {}", label))),
    };

    let stacks = owned_stacks(ctx, &waiter).await?;
    let per_kind = try_join_all(
        ResourceKind::ALL
            .into_iter()
            .map(|kind| observe_kind(ctx, &waiter, &stacks, kind)),
    )
    .await?;

    let observed: ObservedSet = per_kind
        .into_iter()
        .flatten()
        .map(|resource| (resource.spec.key(), resource))
        .collect();
    info!(
        cluster = %ctx.cluster,
        version = %info.version,
        resources = observed.len(),
        "observed cluster resources"
    );
    Ok((info, observed))
}

/// Observed resources of one kind, sorted by name.
pub async fn observe_kind(
    ctx: &CommandContext,
    waiter: &Waiter,
    stacks: &OwnedStacks,
    kind: ResourceKind,
) -> Result<Vec<ObservedResource>> {
    let mut resources = match kind {
        ResourceKind::ServiceAccount => service_accounts(ctx, waiter, stacks).await?,
        _ => {
            let names = waiter
                .read(&format!("{} list", kind), || ctx.resources.list(&ctx.cluster, kind))
                .await
                .context(format!("list {}s", kind))?;
            let described = try_join_all(names.iter().map(|name| describe(ctx, waiter, kind, name))).await?;
            described.into_iter().flatten().collect()
        }
    };

    if kind == ResourceKind::NodeGroup {
        for resource in &mut resources {
            resource.owner = stacks.nodegroups.get(&resource.spec.name()).cloned();
        }
    }
    resources.sort_by_key(|r| r.spec.name());
    Ok(resources)
}

async fn describe(
    ctx: &CommandContext,
    waiter: &Waiter,
    kind: ResourceKind,
    name: &ResourceName,
) -> Result<Option<ObservedResource>> {
    let label = format!("{} {}", kind, name);
    match waiter
        .read(&label, || ctx.resources.describe(&ctx.cluster, kind, name))
        .await
    {
        Ok(resource) => Ok(Some(resource)),
        // Deleted between list and describe.
        Err(err) if err.is_not_found() => Ok(None),
        Err(err) => Err(err.with_context(format!("describe {}", label))),
    }
}

async fn service_accounts(
    ctx: &CommandContext,
    waiter: &Waiter,
    stacks: &OwnedStacks,
) -> Result<Vec<ObservedResource>> {
    let described = try_join_all(stacks.service_accounts.iter().map(|summary| async move {
        let label = format!("stack {}", summary.name);
        match waiter.read(&label, || ctx.stacks.describe_stack(&summary.name)).await {
            Ok(state) => Ok(Some(state)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err.with_context(format!("describe {}", label))),
        }
    }))
    .await?;

    Ok(described
        .into_iter()
        .flatten()
        .filter_map(|state| {
            let spec = service_account_from_parameters(&state.parameters)?;
            Some(ObservedResource {
                spec: ResourceSpec::ServiceAccount(spec),
                status: status_from_stack(state.operation, state.status),
                owner: Some(state.name),
            })
        })
        .collect())
}

/// Resource-level status implied by the status of the owning stack.
fn status_from_stack(operation: StackOperation, status: StackStatus) -> ResourceStatus {
    match (operation, status) {
        (_, StackStatus::Complete) => ResourceStatus::Active,
        (StackOperation::Create, StackStatus::Pending | StackStatus::InProgress) => {
            ResourceStatus::Creating
        }
        (StackOperation::Update, StackStatus::Pending | StackStatus::InProgress) => {
            ResourceStatus::Updating
        }
        (StackOperation::Delete, StackStatus::Pending | StackStatus::InProgress) => {
            ResourceStatus::Deleting
        }
        (StackOperation::Delete, _) => ResourceStatus::DeleteFailed,
        (StackOperation::Update, StackStatus::RolledBack) => ResourceStatus::Degraded,
        _ => ResourceStatus::CreateFailed,
    }
}
