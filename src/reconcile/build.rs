//! Turning a [`Plan`] into a task tree.
//!
//! Node groups and IAM service accounts owned by the orchestrator are
//! changed through their stacks. Fargate profiles, add-ons and node groups
//! created elsewhere are changed through the resource API directly. Every
//! mutation is followed by a wait for the resource to settle.

use futures_util::FutureExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use super::observe::OwnedStacks;
use super::{Action, ObservedSet, Plan, PlannedAction};
use crate::client::ResourceClient;
use crate::config::Settings;
use crate::context::CommandContext;
use crate::core::{Observation, Task, TaskContext, Verdict, WaitConfig, Waiter, split_list_output};
use crate::error::{Error, Failure, Result};
use crate::model::{
    NodeGroupSpec, ObservedResource, ResourceKey, ResourceKind, ResourceSpec, ResourceStatus,
};
use crate::stack::template::{self, NodeNetwork};
use crate::stack::{StackManager, StackPurpose, StackStatus};
use crate::types::{ClusterName, ResourceName, StackName};

#[derive(Clone)]
pub struct TaskBuilder {
    cluster: ClusterName,
    stacks: StackManager,
    direct: Direct,
    settings: Settings,
}

impl TaskBuilder {
    pub fn new(ctx: &CommandContext) -> Self {
        Self {
            cluster: ctx.cluster.clone(),
            stacks: ctx.stack_manager(),
            direct: Direct {
                cluster: ctx.cluster.clone(),
                resources: ctx.resources.clone(),
                wait: ctx.settings.resource_wait(),
            },
            settings: ctx.settings.clone(),
        }
    }

    /// A control-plane upgrade first, then node groups, Fargate profiles and
    /// service accounts in parallel, then add-ons, which may depend on nodes
    /// and service-account roles.
    pub fn apply_tree(&self, plan: &Plan) -> Task {
        let compute: Vec<Task> = [
            ResourceKind::NodeGroup,
            ResourceKind::FargateProfile,
            ResourceKind::ServiceAccount,
        ]
        .into_iter()
        .filter_map(|kind| self.kind_group(plan, kind))
        .collect();

        let mut stages = Vec::new();
        if let Some(upgrade) = &plan.upgrade {
            stages.push(self.direct.upgrade_cluster_task(upgrade.to.clone()));
        }
        if !compute.is_empty() {
            stages.push(Task::parallel(
                "reconcile nodegroups, fargate profiles and iamserviceaccounts",
                compute,
            ));
        }
        if let Some(addons) = self.kind_group(plan, ResourceKind::Addon) {
            stages.push(addons);
        }
        Task::sequential(format!("apply changes to cluster {}", self.cluster), stages)
    }

    /// Network stack, then the control plane built from its outputs, then the
    /// wait for the cluster to become ACTIVE, then everything in `plan`.
    pub fn create_cluster_tree(&self, version: &str, plan: &Plan) -> Task {
        let network = template::network_stack(&self.cluster);
        let network_name = network.name.clone();
        let cluster = self.cluster.clone();
        let version = version.to_string();

        let control_plane = self.stacks.create_stack_with(
            StackPurpose::Cluster.stack_name(&self.cluster),
            move |ctx| {
                let outputs = ctx.outputs.clone();
                let network = network_name.clone();
                let cluster = cluster.clone();
                let version = version.clone();
                async move {
                    let outputs = outputs.get(&network).await.ok_or_else(|| {
                        Error::not_found(format!("outputs of stack {}", network))
                    })?;
                    template::cluster_stack(&cluster, &version, &network, &outputs)
                }
                .boxed()
            },
        );

        let mut children = vec![
            self.stacks.create_stack(network),
            control_plane,
            self.wait_cluster_active(),
        ];
        let apply = self.apply_tree(plan);
        if !apply.is_empty() {
            children.push(apply);
        }
        Task::sequential(format!("create cluster {}", self.cluster), children)
    }

    /// Best effort: every dependent resource, then the control plane, then
    /// the network stack. A failure in one step does not stop later steps.
    pub fn delete_cluster_tree(
        &self,
        observed: &ObservedSet,
        stacks: &OwnedStacks,
        cluster_exists: bool,
    ) -> Task {
        let mut groups = Vec::new();
        for kind in [
            ResourceKind::Addon,
            ResourceKind::FargateProfile,
            ResourceKind::NodeGroup,
            ResourceKind::ServiceAccount,
        ] {
            let mut deletes: Vec<Task> = observed
                .values()
                .filter(|r| r.spec.kind() == kind)
                .map(|r| self.delete_task(r))
                .collect();
            // Stacks whose resource never came up or is no longer observed.
            let leftovers: Vec<&StackName> = match kind {
                ResourceKind::NodeGroup => stacks
                    .nodegroups
                    .iter()
                    .filter(|(name, _)| {
                        !observed.contains_key(&ResourceKey::new(kind, (*name).clone()))
                    })
                    .map(|(_, stack)| stack)
                    .collect(),
                ResourceKind::ServiceAccount => stacks
                    .service_accounts
                    .iter()
                    .map(|summary| &summary.name)
                    .filter(|stack| !observed.values().any(|r| r.owner.as_ref() == Some(*stack)))
                    .collect(),
                _ => Vec::new(),
            };
            deletes.extend(
                leftovers
                    .into_iter()
                    .map(|stack| self.stacks.delete_stack(stack.clone())),
            );
            if !deletes.is_empty() {
                groups.push(
                    Task::parallel(format!("delete {}s", kind.label()), deletes)
                        .with_limit(self.settings.limit_for(kind)),
                );
            }
        }

        let mut children = Vec::new();
        if !groups.is_empty() {
            children.push(Task::parallel(
                format!("delete resources of cluster {}", self.cluster),
                groups,
            ));
        }
        match &stacks.cluster {
            Some(stack) => children.push(self.stacks.delete_stack(stack.clone())),
            None if cluster_exists => children.push(self.direct.delete_cluster_task()),
            None => {}
        }
        if let Some(network) = &stacks.network {
            children.push(self.stacks.delete_stack(network.clone()));
        }
        Task::sequential(format!("delete cluster {}", self.cluster), children).best_effort()
    }

    pub fn wait_cluster_active(&self) -> Task {
        let direct = self.direct.clone();
        Task::leaf(
            format!("wait for cluster {} to become ACTIVE", self.cluster),
            move |ctx| {
                let direct = direct.clone();
                async move { direct.wait_cluster_active(&direct.waiter(&ctx)).await }
            },
        )
    }

    /// One parallel group per kind, bounded by the kind's limit. A rolling
    /// replacement becomes a sequence: create the new node group (or wait for
    /// it, when it already exists), then delete the one it replaces.
    fn kind_group(&self, plan: &Plan, kind: ResourceKind) -> Option<Task> {
        let actions: Vec<&PlannedAction> = plan.of_kind(kind).collect();
        if actions.is_empty() {
            return None;
        }

        let mut followers: BTreeMap<&ResourceKey, &PlannedAction> = actions
            .iter()
            .filter_map(|&a| a.after.as_ref().map(|after| (after, a)))
            .collect();
        let mut children = Vec::new();
        for action in actions.iter().filter(|a| a.after.is_none()) {
            let task = self.action_task(action);
            match followers.remove(&action.key) {
                Some(old) => children.push(Task::sequential(
                    format!("replace {} with {}", old.key, action.key),
                    vec![task, self.action_task(old)],
                )),
                None => children.push(task),
            }
        }
        // The replacement exists from an earlier run but is still settling.
        children.extend(followers.into_iter().map(|(successor, old)| {
            Task::sequential(
                format!("replace {} with {}", old.key, successor),
                vec![
                    self.direct.wait_active_task(successor.clone()),
                    self.action_task(old),
                ],
            )
        }));

        Some(
            Task::parallel(format!("reconcile {}s", kind.label()), children)
                .with_limit(self.settings.limit_for(kind)),
        )
    }

    pub fn action_task(&self, planned: &PlannedAction) -> Task {
        match &planned.action {
            Action::Create(spec) => self.create_task(spec),
            Action::Update {
                current, desired, ..
            } => self.update_task(current, desired),
            Action::Replace {
                current, desired, ..
            } => self.replace_task(current, desired),
            Action::Delete(current) => self.delete_task(current),
        }
    }

    fn create_task(&self, spec: &ResourceSpec) -> Task {
        match spec {
            ResourceSpec::NodeGroup(ng) => {
                let key = spec.key();
                Task::sequential(
                    format!("create {}", key),
                    vec![
                        self.nodegroup_stack_task(ng, false),
                        self.direct.wait_active_task(key),
                    ],
                )
            }
            ResourceSpec::ServiceAccount(sa) => self
                .stacks
                .create_stack(template::service_account_stack(&self.cluster, sa)),
            ResourceSpec::FargateProfile(_) | ResourceSpec::Addon(_) => {
                self.direct.create_task(spec.clone())
            }
        }
    }

    fn update_task(&self, current: &ObservedResource, desired: &ResourceSpec) -> Task {
        match desired {
            ResourceSpec::NodeGroup(ng) if current.owner.is_some() => {
                let key = desired.key();
                Task::sequential(
                    format!("update {}", key),
                    vec![
                        self.nodegroup_stack_task(ng, true),
                        self.direct.wait_active_task(key),
                    ],
                )
            }
            ResourceSpec::ServiceAccount(sa) => self
                .stacks
                .update_stack(template::service_account_stack(&self.cluster, sa)),
            // No in-place update exists for Fargate profiles.
            ResourceSpec::FargateProfile(_) => self.replace_task(current, desired),
            ResourceSpec::NodeGroup(_) | ResourceSpec::Addon(_) => {
                self.direct.update_task(desired.clone())
            }
        }
    }

    fn replace_task(&self, current: &ObservedResource, desired: &ResourceSpec) -> Task {
        Task::sequential(
            format!("replace {}", desired.key()),
            vec![self.delete_task(current), self.create_task(desired)],
        )
    }

    /// Delete through the owning stack when there is one.
    pub fn delete_task(&self, current: &ObservedResource) -> Task {
        match (&current.owner, &current.spec) {
            (Some(stack), _) => self.stacks.delete_stack(stack.clone()),
            (None, ResourceSpec::ServiceAccount(sa)) => {
                self.stacks.delete_stack(
                    StackPurpose::ServiceAccount {
                        namespace: sa.namespace.clone(),
                        name: sa.name.clone(),
                    }
                    .stack_name(&self.cluster),
                )
            }
            (None, spec) => self.direct.delete_task(spec.kind(), spec.name()),
        }
    }

    /// Stack leaf for an owned node group. The node role and subnets are
    /// resolved when the leaf runs, so a network stack created earlier in
    /// the same run is visible.
    fn nodegroup_stack_task(&self, ng: &NodeGroupSpec, update: bool) -> Task {
        let name = StackPurpose::NodeGroup(ng.name.clone()).stack_name(&self.cluster);
        let builder = self.clone();
        let ng = ng.clone();
        let build = move |ctx: &TaskContext| {
            let builder = builder.clone();
            let ng = ng.clone();
            let ctx = ctx.clone();
            async move {
                let network = builder.node_network(&ctx, &ng).await?;
                Ok(template::nodegroup_stack(&builder.cluster, &ng, &network))
            }
            .boxed()
        };
        if update {
            self.stacks.update_stack_with(name, build)
        } else {
            self.stacks.create_stack_with(name, build)
        }
    }

    /// Node role and subnets from the network stack's outputs (published in
    /// this run, or read from the stack), falling back to the cluster's own
    /// subnets for clusters created outside the orchestrator.
    async fn node_network(&self, ctx: &TaskContext, ng: &NodeGroupSpec) -> Result<NodeNetwork> {
        let network = StackPurpose::Network.stack_name(&self.cluster);
        let outputs = match ctx.outputs.get(&network).await {
            Some(outputs) => Some(outputs),
            None => match self.stacks.describe_stack(&network).await? {
                Some(state) if state.status == StackStatus::Complete => Some(state.outputs),
                _ => None,
            },
        };

        if let Some(outputs) = outputs {
            let missing = |key: &str| {
                Error::new(Failure::MissingOutput {
                    stack: network.clone(),
                    key: key.to_string(),
                })
            };
            let node_role_arn = match &ng.node_role_arn {
                Some(arn) => arn.clone(),
                None => outputs
                    .get(template::OUTPUT_NODE_ROLE)
                    .cloned()
                    .ok_or_else(|| missing(template::OUTPUT_NODE_ROLE))?,
            };
            let subnets = outputs
                .get(template::OUTPUT_SUBNETS)
                .map(|s| split_list_output(s))
                .ok_or_else(|| missing(template::OUTPUT_SUBNETS))?;
            return Ok(NodeNetwork {
                node_role_arn,
                subnets,
            });
        }

        let waiter = self.direct.waiter(ctx);
        let label = format!("cluster {}", self.cluster);
        let info = waiter
            .read(&label, || self.direct.resources.describe_cluster(&self.cluster))
            .await?;
        let node_role_arn = ng.node_role_arn.clone().ok_or_else(|| {
            Error::validation(vec![format!(
                "nodegroup {}: nodeRoleARN is required because cluster {} has no network stack",
                ng.name, self.cluster
            )])
        })?;
        Ok(NodeNetwork {
            node_role_arn,
            subnets: info.subnets,
        })
    }
}

/// Operations through the resource API, each followed by a wait.
#[derive(Clone)]
struct Direct {
    cluster: ClusterName,
    resources: Arc<dyn ResourceClient>,
    wait: WaitConfig,
}

impl Direct {
    fn waiter(&self, ctx: &TaskContext) -> Waiter {
        Waiter::new(self.wait.clone(), ctx.cancel.clone())
    }

    fn create_task(&self, spec: ResourceSpec) -> Task {
        let direct = self.clone();
        Task::leaf(format!("create {}", spec.key()), move |ctx| {
            let direct = direct.clone();
            let spec = spec.clone();
            async move {
                let waiter = direct.waiter(&ctx);
                let label = spec.key().to_string();
                info!(resource = %label, "creating");
                waiter
                    .submit(&label, || direct.resources.create(&direct.cluster, &spec))
                    .await?;
                direct.wait_active(&waiter, &spec.key()).await
            }
        })
    }

    fn update_task(&self, spec: ResourceSpec) -> Task {
        let direct = self.clone();
        Task::leaf(format!("update {}", spec.key()), move |ctx| {
            let direct = direct.clone();
            let spec = spec.clone();
            async move {
                let waiter = direct.waiter(&ctx);
                let label = spec.key().to_string();
                info!(resource = %label, "updating");
                waiter
                    .submit(&label, || direct.resources.update(&direct.cluster, &spec))
                    .await?;
                direct.wait_active(&waiter, &spec.key()).await
            }
        })
    }

    fn delete_task(&self, kind: ResourceKind, name: ResourceName) -> Task {
        let direct = self.clone();
        let key = ResourceKey::new(kind, name);
        Task::leaf(format!("delete {}", key), move |ctx| {
            let direct = direct.clone();
            let key = key.clone();
            async move {
                let waiter = direct.waiter(&ctx);
                let label = key.to_string();
                info!(resource = %label, "deleting");
                match waiter
                    .submit(&label, || direct.resources.delete(&direct.cluster, key.kind, &key.name))
                    .await
                {
                    Ok(()) => {}
                    Err(err) if err.is_not_found() => return Ok(()),
                    Err(err) => return Err(err),
                }
                waiter
                    .wait_until(
                        &label,
                        || direct.resources.describe(&direct.cluster, key.kind, &key.name),
                        |obs| match obs {
                            Observation::Absent => Verdict::Done,
                            Observation::Present(r) if r.status == ResourceStatus::DeleteFailed => {
                                Verdict::Failed(Error::new(Failure::ResourceFailed {
                                    resource: label.clone(),
                                    status: r.status,
                                }))
                            }
                            Observation::Present(r) => Verdict::Pending(r.status.to_string()),
                        },
                    )
                    .await?;
                Ok(())
            }
        })
    }

    fn wait_active_task(&self, key: ResourceKey) -> Task {
        let direct = self.clone();
        Task::leaf(format!("wait for {} to become ACTIVE", key), move |ctx| {
            let direct = direct.clone();
            let key = key.clone();
            async move { direct.wait_active(&direct.waiter(&ctx), &key).await }
        })
    }

    async fn wait_active(&self, waiter: &Waiter, key: &ResourceKey) -> Result<()> {
        let label = key.to_string();
        waiter
            .wait_until(
                &label,
                || self.resources.describe(&self.cluster, key.kind, &key.name),
                |obs| match obs {
                    Observation::Present(r) => settled(&label, r.status),
                    Observation::Absent => Verdict::Failed(Error::not_found(label.clone())),
                },
            )
            .await?;
        Ok(())
    }

    async fn wait_cluster_active(&self, waiter: &Waiter) -> Result<()> {
        let label = format!("cluster {}", self.cluster);
        waiter
            .wait_until(
                &label,
                || self.resources.describe_cluster(&self.cluster),
                |obs| match obs {
                    Observation::Present(info) => settled(&label, info.status),
                    Observation::Absent => Verdict::Failed(Error::not_found(label.clone())),
                },
            )
            .await?;
        Ok(())
    }

    /// In-place control-plane version change, then the wait for ACTIVE.
    fn upgrade_cluster_task(&self, version: String) -> Task {
        let direct = self.clone();
        Task::leaf(
            format!("upgrade cluster {} to {}", self.cluster, version),
            move |ctx| {
                let direct = direct.clone();
                let version = version.clone();
                async move {
                    let waiter = direct.waiter(&ctx);
                    let label = format!("cluster {}", direct.cluster);
                    info!(cluster = %direct.cluster, version = %version, "upgrading control plane");
                    waiter
                        .submit(&label, || {
                            direct.resources.update_cluster_version(&direct.cluster, &version)
                        })
                        .await?;
                    direct.wait_cluster_active(&waiter).await
                }
            },
        )
    }

    /// Removal of a control plane that no stack owns.
    fn delete_cluster_task(&self) -> Task {
        let direct = self.clone();
        Task::leaf(format!("delete cluster {}", self.cluster), move |ctx| {
            let direct = direct.clone();
            async move {
                let waiter = direct.waiter(&ctx);
                let label = format!("cluster {}", direct.cluster);
                match waiter
                    .submit(&label, || direct.resources.delete_cluster(&direct.cluster))
                    .await
                {
                    Ok(()) => {}
                    Err(err) if err.is_not_found() => return Ok(()),
                    Err(err) => return Err(err),
                }
                waiter
                    .wait_until(
                        &label,
                        || direct.resources.describe_cluster(&direct.cluster),
                        |obs| match obs {
                            Observation::Absent => Verdict::Done,
                            Observation::Present(info) => Verdict::Pending(info.status.to_string()),
                        },
                    )
                    .await?;
                Ok(())
            }
        })
    }
}

fn settled(label: &str, status: ResourceStatus) -> Verdict {
    if status == ResourceStatus::Active {
        Verdict::Done
    } else if status.is_failed() {
        Verdict::Failed(Error::new(Failure::ResourceFailed {
            resource: label.to_string(),
            status,
        }))
    } else {
        Verdict::Pending(status.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::InMemoryCloud;
    use crate::model::{AddonSpec, ServiceAccountSpec};
    use crate::reconcile::{DesiredSet, plan};
    use crate::types::Region;
    use std::collections::BTreeSet;

    fn context() -> CommandContext {
        let cloud = Arc::new(InMemoryCloud::new());
        CommandContext::new(
            ClusterName::new("demo"),
            Region::new("eu-west-1"),
            cloud.clone(),
            cloud,
        )
    }

    fn nodegroup(name: &str, replaces: Option<&str>) -> ResourceSpec {
        ResourceSpec::NodeGroup(NodeGroupSpec {
            name: ResourceName::new(name),
            instance_type: "m5.large".into(),
            min_size: 1,
            max_size: 2,
            desired_capacity: None,
            labels: BTreeMap::new(),
            node_role_arn: None,
            version: None,
            replaces: replaces.map(ResourceName::new),
        })
    }

    fn addon(name: &str) -> ResourceSpec {
        ResourceSpec::Addon(AddonSpec {
            name: ResourceName::new(name),
            version: None,
            service_account_role_arn: None,
        })
    }

    fn service_account() -> ResourceSpec {
        ResourceSpec::ServiceAccount(ServiceAccountSpec {
            namespace: "kube-system".into(),
            name: "aws-node".into(),
            attach_policy_arns: BTreeSet::from(["arn:policy/cni".to_string()]),
            role_name: None,
        })
    }

    fn owned(spec: &ResourceSpec) -> ObservedResource {
        ObservedResource {
            spec: spec.clone(),
            status: ResourceStatus::Active,
            owner: Some(StackPurpose::NodeGroup(spec.name()).stack_name(&ClusterName::new("demo"))),
        }
    }

    fn desired(specs: &[ResourceSpec]) -> DesiredSet {
        specs.iter().map(|s| (s.key(), s.clone())).collect()
    }

    #[test]
    fn test_apply_tree_shape() {
        let builder = TaskBuilder::new(&context());
        let plan = plan(
            &desired(&[nodegroup("ng-1", None), addon("vpc-cni"), service_account()]),
            &ObservedSet::new(),
        );
        let tree = builder.apply_tree(&plan);
        assert_eq!(
            tree.to_string(),
            "apply changes to cluster demo: 2 sequential tasks: { \
             reconcile nodegroups, fargate profiles and iamserviceaccounts: 2 parallel sub-tasks: { \
             reconcile nodegroups: 1 parallel sub-tasks: { create nodegroup ng-1: 2 sequential tasks: { \
             create stack eko-demo-nodegroup-ng-1, wait for nodegroup ng-1 to become ACTIVE } }, \
             reconcile iamserviceaccounts: 1 parallel sub-tasks: { \
             create stack eko-demo-addon-iamserviceaccount-kube-system-aws-node } }, \
             reconcile addons: 1 parallel sub-tasks: { create addon vpc-cni } }"
        );
    }

    #[test]
    fn test_rolling_replacement_is_sequenced() {
        let builder = TaskBuilder::new(&context());
        let old = nodegroup("ng-1", None);
        let observed: ObservedSet = [(old.key(), owned(&old))].into_iter().collect();
        let plan = plan(&desired(&[nodegroup("ng-2", Some("ng-1"))]), &observed);

        let tree = builder.apply_tree(&plan);
        let rendered = tree.to_string();
        let create = rendered.find("create stack eko-demo-nodegroup-ng-2").unwrap();
        let delete = rendered.find("delete stack eko-demo-nodegroup-ng-1").unwrap();
        assert!(create < delete);
        assert!(rendered.contains("replace nodegroup ng-1 with nodegroup ng-2: 2 sequential tasks"));
    }

    #[test]
    fn test_upgrade_runs_before_resources() {
        let builder = TaskBuilder::new(&context());
        let mut plan = plan(&desired(&[addon("vpc-cni")]), &ObservedSet::new());
        plan.upgrade = Some(crate::reconcile::VersionUpgrade {
            from: "1.29".into(),
            to: "1.30".into(),
        });

        assert_eq!(
            builder.apply_tree(&plan).to_string(),
            "apply changes to cluster demo: 2 sequential tasks: { \
             upgrade cluster demo to 1.30, \
             reconcile addons: 1 parallel sub-tasks: { create addon vpc-cni } }"
        );
    }

    #[test]
    fn test_settling_replacement_is_awaited_before_delete() {
        let builder = TaskBuilder::new(&context());
        let old = nodegroup("ng-1", None);
        let new = nodegroup("ng-1b", Some("ng-1"));
        let mut settling = owned(&new);
        settling.status = ResourceStatus::Creating;
        let observed: ObservedSet = [(old.key(), owned(&old)), (new.key(), settling)]
            .into_iter()
            .collect();

        let tree = builder.apply_tree(&plan(&desired(&[new]), &observed));
        assert_eq!(
            tree.to_string(),
            "apply changes to cluster demo: 1 sequential tasks: { \
             reconcile nodegroups, fargate profiles and iamserviceaccounts: 1 parallel sub-tasks: { \
             reconcile nodegroups: 1 parallel sub-tasks: { \
             replace nodegroup ng-1 with nodegroup ng-1b: 2 sequential tasks: { \
             wait for nodegroup ng-1b to become ACTIVE, delete stack eko-demo-nodegroup-ng-1 } } } }"
        );
    }

    #[test]
    fn test_unowned_nodegroups_change_directly() {
        let builder = TaskBuilder::new(&context());
        let mut current = owned(&nodegroup("ng-1", None));
        current.owner = None;
        let task = builder.delete_task(&current);
        assert_eq!(task.description(), "delete nodegroup ng-1");

        let task = builder.delete_task(&owned(&nodegroup("ng-1", None)));
        assert_eq!(task.description(), "delete stack eko-demo-nodegroup-ng-1");
    }

    #[test]
    fn test_delete_cluster_tree_is_best_effort() {
        let builder = TaskBuilder::new(&context());
        let ng = nodegroup("ng-1", None);
        let observed: ObservedSet = [(ng.key(), owned(&ng))].into_iter().collect();
        let stacks = OwnedStacks {
            network: Some(StackPurpose::Network.stack_name(&ClusterName::new("demo"))),
            cluster: Some(StackPurpose::Cluster.stack_name(&ClusterName::new("demo"))),
            ..OwnedStacks::default()
        };

        let tree = builder.delete_cluster_tree(&observed, &stacks, true);
        assert!(matches!(
            tree,
            Task::Sequential {
                policy: crate::core::FailurePolicy::BestEffort,
                ..
            }
        ));
        let rendered = tree.to_string();
        let ng = rendered.find("delete stack eko-demo-nodegroup-ng-1").unwrap();
        let cluster = rendered.find("delete stack eko-demo-cluster").unwrap();
        let network = rendered.find("delete stack eko-demo-network").unwrap();
        assert!(ng < cluster && cluster < network);
    }

    #[tokio::test(start_paused = true)]
    async fn test_control_plane_without_network_outputs_names_them() {
        let cloud = Arc::new(InMemoryCloud::new());
        let ctx = CommandContext::new(
            ClusterName::new("demo"),
            Region::new("eu-west-1"),
            cloud.clone(),
            cloud.clone(),
        );
        let tree = TaskBuilder::new(&ctx).create_cluster_tree("1.30", &Plan::default());
        let Task::Sequential { children, .. } = &tree else {
            panic!("unexpected tree: {tree}");
        };
        let control_plane = &children[1];
        assert_eq!(control_plane.description(), "create stack eko-demo-cluster");

        let err = crate::core::TaskScheduler::new(4)
            .run(control_plane, &ctx.task_context())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(err.to_string().contains("outputs of stack eko-demo-network not found"));
        assert_eq!(cloud.calls("create_stack").await, 0);
    }
}
