//! Command entry points.
//!
//! Every mutating command follows the same path: validate, observe, plan,
//! build a task tree, run it. Read commands stop after observing.

use serde::Serialize;
use tracing::info;

use crate::config::ClusterConfig;
use crate::context::CommandContext;
use crate::core::{RunReport, Task, TaskScheduler};
use crate::error::{Error, Result, ResultExt};
use crate::model::{ObservedResource, ResourceKey, ResourceKind, ResourceSpec, ResourceStatus};
use crate::reconcile::observe::{observe_cluster, observe_kind, owned_stacks};
use crate::reconcile::{
    self, Action, DesiredSet, ObservedSet, Plan, PlannedAction, TaskBuilder, desired_from_config,
    plan_upgrade,
};
use crate::types::{ClusterName, ResourceName, StackName};

/// What a command planned, the tree it built and, unless nothing ran, the
/// report of running it.
#[derive(Debug)]
pub struct CommandOutcome {
    pub plan: Plan,
    pub tree: String,
    /// `None` for dry runs and for plans with nothing to do.
    pub report: Option<RunReport>,
}

impl CommandOutcome {
    pub fn executed(&self) -> bool {
        self.report.is_some()
    }

    /// The run's error, if it had one.
    pub fn into_result(self) -> Result<Self> {
        match self.report.as_ref().and_then(|r| r.error.clone()) {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }
}

/// One row of `get` output.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDescriptor {
    pub cluster: ClusterName,
    pub kind: ResourceKind,
    pub name: ResourceName,
    pub status: ResourceStatus,
    pub owner: Option<StackName>,
    pub summary: String,
    pub spec: ResourceSpec,
}

impl ResourceDescriptor {
    fn new(cluster: &ClusterName, resource: ObservedResource) -> Self {
        Self {
            cluster: cluster.clone(),
            kind: resource.spec.kind(),
            name: resource.spec.name(),
            status: resource.status,
            owner: resource.owner,
            summary: summarize(&resource.spec),
            spec: resource.spec,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterDescriptor {
    pub name: ClusterName,
    pub status: ResourceStatus,
    pub version: String,
    pub owner: Option<StackName>,
}

fn summarize(spec: &ResourceSpec) -> String {
    match spec {
        ResourceSpec::NodeGroup(ng) => {
            let desired = ng
                .desired_capacity
                .map(|d| d.to_string())
                .unwrap_or_else(|| "-".to_string());
            format!(
                "{} min={} max={} desired={}",
                ng.instance_type, ng.min_size, ng.max_size, desired
            )
        }
        ResourceSpec::FargateProfile(fp) => {
            let namespaces: Vec<&str> = fp.selectors.iter().map(|s| s.namespace.as_str()).collect();
            format!("selectors={}", namespaces.join(","))
        }
        ResourceSpec::Addon(addon) => {
            format!("version={}", addon.version.as_deref().unwrap_or("latest"))
        }
        ResourceSpec::ServiceAccount(sa) => {
            let policies: Vec<&str> = sa.attach_policy_arns.iter().map(String::as_str).collect();
            format!("policies={}", policies.join(","))
        }
    }
}

/// Runs commands against the cluster named by its context.
pub struct Orchestrator {
    ctx: CommandContext,
    scheduler: TaskScheduler,
    builder: TaskBuilder,
}

impl Orchestrator {
    pub fn new(ctx: CommandContext) -> Self {
        let scheduler = ctx.scheduler();
        let builder = TaskBuilder::new(&ctx);
        Self {
            ctx,
            scheduler,
            builder,
        }
    }

    pub fn context(&self) -> &CommandContext {
        &self.ctx
    }

    pub async fn observe(&self) -> Result<ObservedSet> {
        reconcile::observe(&self.ctx).await
    }

    /// Validate `config`, observe the cluster and diff the two. Nothing
    /// remote is called when the config is invalid.
    pub async fn plan(&self, config: &ClusterConfig) -> Result<Plan> {
        self.check_config(config)?;
        let (info, observed) = observe_cluster(&self.ctx).await?;
        let mut plan = reconcile::plan(&desired_from_config(config), &observed);
        plan.upgrade = plan_upgrade(&info.version, &config.metadata.version)?;
        info!(cluster = %self.ctx.cluster, actions = plan.len(), "planned changes");
        Ok(plan)
    }

    /// Converge the cluster's resources on `config`.
    pub async fn apply(&self, config: &ClusterConfig, dry_run: bool) -> Result<CommandOutcome> {
        let plan = self.plan(config).await?;
        let tree = self.builder.apply_tree(&plan);
        if dry_run {
            info!(cluster = %self.ctx.cluster, "dry run, nothing executed");
            return Ok(self.outcome(plan, &tree, None));
        }
        if plan.is_empty() {
            info!(cluster = %self.ctx.cluster, "cluster already matches the config");
            return Ok(self.outcome(plan, &tree, None));
        }
        let report = self.run(&tree).await;
        Ok(self.outcome(plan, &tree, Some(report)))
    }

    /// Network stack, control plane, then every resource in `config`.
    pub async fn create_cluster(&self, config: &ClusterConfig) -> Result<CommandOutcome> {
        self.check_config(config)?;
        let label = format!("cluster {}", self.ctx.cluster);
        match self
            .ctx
            .waiter()
            .read(&label, || self.ctx.resources.describe_cluster(&self.ctx.cluster))
            .await
        {
            Ok(_) => return Err(Error::already_exists(label)),
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err.with_context(format!("describe {}", label))),
        }

        let plan = reconcile::plan(&desired_from_config(config), &ObservedSet::new());
        let tree = self
            .builder
            .create_cluster_tree(&config.metadata.version, &plan);
        let report = self.run(&tree).await;
        Ok(self.outcome(plan, &tree, Some(report)))
    }

    /// Delete every resource of the cluster, then the cluster and its network.
    /// Keeps going past individual failures and reports them together.
    pub async fn delete_cluster(&self) -> Result<CommandOutcome> {
        let waiter = self.ctx.waiter();
        let stacks = owned_stacks(&self.ctx, &waiter).await?;
        let observed = match self.observe().await {
            Ok(observed) => Some(observed),
            Err(err) if err.is_not_found() => None,
            Err(err) => return Err(err),
        };
        let cluster_exists = observed.is_some();
        if !cluster_exists && stacks.is_empty() {
            return Err(Error::not_found(format!("cluster {}", self.ctx.cluster)));
        }

        let observed = observed.unwrap_or_default();
        let plan = reconcile::plan(&DesiredSet::new(), &observed);
        let tree = self
            .builder
            .delete_cluster_tree(&observed, &stacks, cluster_exists);
        let report = self.run(&tree).await;
        Ok(self.outcome(plan, &tree, Some(report)))
    }

    pub async fn delete_nodegroup(&self, name: &ResourceName) -> Result<CommandOutcome> {
        let key = ResourceKey::new(ResourceKind::NodeGroup, name.clone());
        let observed = self.observe().await?;
        let current = observed
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::not_found(key.to_string()))?;

        let tree = Task::sequential(
            format!("delete {} from cluster {}", key, self.ctx.cluster),
            vec![self.builder.delete_task(&current)],
        );
        let plan = Plan {
            upgrade: None,
            actions: vec![PlannedAction {
                key,
                action: Action::Delete(current),
                after: None,
            }],
        };
        let report = self.run(&tree).await;
        Ok(self.outcome(plan, &tree, Some(report)))
    }

    /// Resources of one kind, sorted by name.
    pub async fn get(&self, kind: ResourceKind) -> Result<Vec<ResourceDescriptor>> {
        let waiter = self.ctx.waiter();
        let label = format!("cluster {}", self.ctx.cluster);
        match waiter
            .read(&label, || self.ctx.resources.describe_cluster(&self.ctx.cluster))
            .await
        {
            Ok(_) => {}
            Err(err) if err.is_not_found() => return Err(Error::not_found(label)),
            Err(err) => return Err(err.with_context(format!("describe {}", label))),
        }

        let stacks = owned_stacks(&self.ctx, &waiter).await?;
        let resources = observe_kind(&self.ctx, &waiter, &stacks, kind).await?;
        Ok(resources
            .into_iter()
            .map(|r| ResourceDescriptor::new(&self.ctx.cluster, r))
            .collect())
    }

    /// Every cluster in the region, sorted by name.
    pub async fn get_clusters(&self) -> Result<Vec<ClusterDescriptor>> {
        let waiter = self.ctx.waiter();
        let mut names = waiter
            .read("clusters", || self.ctx.resources.list_clusters())
            .await
            .context("list clusters")?;
        names.sort();

        let mut clusters = Vec::with_capacity(names.len());
        for name in names {
            let label = format!("cluster {}", name);
            match waiter
                .read(&label, || self.ctx.resources.describe_cluster(&name))
                .await
            {
                Ok(info) => clusters.push(ClusterDescriptor {
                    name: info.name,
                    status: info.status,
                    version: info.version,
                    owner: info.owner,
                }),
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err.with_context(format!("describe {}", label))),
            }
        }
        Ok(clusters)
    }

    fn check_config(&self, config: &ClusterConfig) -> Result<()> {
        config.validate()?;
        if config.metadata.name != self.ctx.cluster {
            return Err(Error::validation(vec![format!(
                "config describes cluster {} but the command targets {}",
                config.metadata.name, self.ctx.cluster
            )]));
        }
        Ok(())
    }

    async fn run(&self, tree: &Task) -> RunReport {
        info!(
            command_id = %self.ctx.id,
            cluster = %self.ctx.cluster,
            tree = %tree.description(),
            "running"
        );
        self.scheduler.execute(tree, &self.ctx.task_context()).await
    }

    fn outcome(&self, plan: Plan, tree: &Task, report: Option<RunReport>) -> CommandOutcome {
        CommandOutcome {
            plan,
            tree: tree.to_string(),
            report,
        }
    }
}
