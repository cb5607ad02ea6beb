//! Desired vs. observed resources, and the plan that closes the gap.
//!
//! Planning is pure: [`plan`] only compares two sets. Reading the observed
//! side is [`observe`]'s job and turning a plan into tasks is [`build`]'s.

pub mod build;
pub mod observe;

use std::collections::BTreeMap;
use std::fmt;

use crate::config::ClusterConfig;
use crate::error::{Error, Result};
use crate::model::{
    ObservedResource, ResourceKey, ResourceKind, ResourceSpec, ResourceStatus, parse_version,
};

pub use build::TaskBuilder;
pub use observe::observe;

pub type DesiredSet = BTreeMap<ResourceKey, ResourceSpec>;
pub type ObservedSet = BTreeMap<ResourceKey, ObservedResource>;

pub fn desired_from_config(config: &ClusterConfig) -> DesiredSet {
    let specs = config
        .node_groups
        .iter()
        .cloned()
        .map(ResourceSpec::NodeGroup)
        .chain(config.fargate_profiles.iter().cloned().map(ResourceSpec::FargateProfile))
        .chain(config.addons.iter().cloned().map(ResourceSpec::Addon))
        .chain(
            config
                .iam
                .service_accounts
                .iter()
                .cloned()
                .map(ResourceSpec::ServiceAccount),
        );
    specs.map(|spec| (spec.key(), spec)).collect()
}

/// One differing field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldChange {
    pub field: &'static str,
    pub from: String,
    pub to: String,
    /// The field can not be changed in place.
    pub requires_replacement: bool,
}

impl fmt::Display for FieldChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} -> {}", self.field, self.from, self.to)?;
        if self.requires_replacement {
            f.write_str(" (forces replacement)")?;
        }
        Ok(())
    }
}

struct Differ {
    changes: Vec<FieldChange>,
}

impl Differ {
    fn new() -> Self {
        Self { changes: Vec::new() }
    }

    fn field<T: PartialEq + fmt::Debug>(&mut self, field: &'static str, from: &T, to: &T, replace: bool) {
        if from != to {
            self.changes.push(FieldChange {
                field,
                from: format!("{:?}", from),
                to: format!("{:?}", to),
                requires_replacement: replace,
            });
        }
    }

    /// Compare only when the desired side pins a value.
    fn pinned<T: PartialEq + fmt::Debug>(
        &mut self,
        field: &'static str,
        from: &Option<T>,
        to: &Option<T>,
        replace: bool,
    ) {
        if to.is_some() {
            self.field(field, from, to, replace);
        }
    }
}

/// Field-level differences between an observed and a desired spec of the
/// same kind. Specs of different kinds never share a key.
pub fn diff(observed: &ResourceSpec, desired: &ResourceSpec) -> Vec<FieldChange> {
    let mut d = Differ::new();
    match (observed, desired) {
        (ResourceSpec::NodeGroup(from), ResourceSpec::NodeGroup(to)) => {
            d.field("instanceType", &from.instance_type, &to.instance_type, true);
            d.pinned("nodeRoleARN", &from.node_role_arn, &to.node_role_arn, true);
            d.field("minSize", &from.min_size, &to.min_size, false);
            d.field("maxSize", &from.max_size, &to.max_size, false);
            d.pinned("desiredCapacity", &from.desired_capacity, &to.desired_capacity, false);
            d.field("labels", &from.labels, &to.labels, false);
            d.pinned("version", &from.version, &to.version, false);
        }
        (ResourceSpec::FargateProfile(from), ResourceSpec::FargateProfile(to)) => {
            let mut from_selectors = from.selectors.clone();
            let mut to_selectors = to.selectors.clone();
            from_selectors.sort();
            to_selectors.sort();
            d.field("selectors", &from_selectors, &to_selectors, true);
            d.pinned("podExecutionRoleARN", &from.pod_execution_role_arn, &to.pod_execution_role_arn, true);
            if !to.subnets.is_empty() {
                d.field("subnets", &from.subnets, &to.subnets, true);
            }
        }
        (ResourceSpec::Addon(from), ResourceSpec::Addon(to)) => {
            d.pinned("version", &from.version, &to.version, false);
            d.field(
                "serviceAccountRoleARN",
                &from.service_account_role_arn,
                &to.service_account_role_arn,
                false,
            );
        }
        (ResourceSpec::ServiceAccount(from), ResourceSpec::ServiceAccount(to)) => {
            d.field("attachPolicyARNs", &from.attach_policy_arns, &to.attach_policy_arns, false);
            d.pinned("roleName", &from.role_name, &to.role_name, true);
        }
        _ => d.field("kind", &observed.kind(), &desired.kind(), true),
    }
    d.changes
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Create(ResourceSpec),
    Update {
        current: ObservedResource,
        desired: ResourceSpec,
        changes: Vec<FieldChange>,
    },
    /// Delete then recreate under the same name.
    Replace {
        current: ObservedResource,
        desired: ResourceSpec,
        changes: Vec<FieldChange>,
    },
    Delete(ObservedResource),
}

impl Action {
    fn symbol(&self) -> &'static str {
        match self {
            Action::Create(_) => "+",
            Action::Update { .. } => "~",
            Action::Replace { .. } => "-/+",
            Action::Delete(_) => "-",
        }
    }

    pub fn changes(&self) -> &[FieldChange] {
        match self {
            Action::Update { changes, .. } | Action::Replace { changes, .. } => changes,
            Action::Create(_) | Action::Delete(_) => &[],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlannedAction {
    pub key: ResourceKey,
    pub action: Action,
    /// Must not start before this resource has been created and is ACTIVE.
    pub after: Option<ResourceKey>,
}

impl fmt::Display for PlannedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.action.symbol(), self.key)?;
        if let Some(after) = &self.after {
            write!(f, " (after {})", after)?;
        }
        for change in self.action.changes() {
            write!(f, "\n    {}", change)?;
        }
        Ok(())
    }
}

/// In-place upgrade of the control plane's Kubernetes version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionUpgrade {
    pub from: String,
    pub to: String,
}

impl fmt::Display for VersionUpgrade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "~ control plane\n    version: {} -> {}", self.from, self.to)
    }
}

/// Upgrade from the running control-plane version to `desired`. Versions
/// only move forward, one minor release at a time.
pub fn plan_upgrade(current: &str, desired: &str) -> Result<Option<VersionUpgrade>> {
    if current == desired {
        return Ok(None);
    }
    let (Some(from), Some(to)) = (parse_version(current), parse_version(desired)) else {
        return Err(Error::validation(vec![format!(
            "can not compare cluster version {:?} with {:?}",
            current, desired
        )]));
    };
    if from == to {
        return Ok(None);
    }
    if to < from {
        return Err(Error::validation(vec![format!(
            "cluster runs {} and can not be downgraded to {}",
            current, desired
        )]));
    }
    if to.0 != from.0 || to.1 != from.1 + 1 {
        return Err(Error::validation(vec![format!(
            "cluster runs {} and can only be upgraded one minor version at a time, not to {}",
            current, desired
        )]));
    }
    Ok(Some(VersionUpgrade {
        from: current.to_string(),
        to: desired.to_string(),
    }))
}

/// Ordered actions, at most one per resource.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Plan {
    /// Runs before every resource action.
    pub upgrade: Option<VersionUpgrade>,
    pub actions: Vec<PlannedAction>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.upgrade.is_none() && self.actions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.actions.len() + usize::from(self.upgrade.is_some())
    }

    pub fn of_kind(&self, kind: ResourceKind) -> impl Iterator<Item = &PlannedAction> {
        self.actions.iter().filter(move |a| a.key.kind == kind)
    }

    pub fn get(&self, key: &ResourceKey) -> Option<&PlannedAction> {
        self.actions.iter().find(|a| &a.key == key)
    }

    fn count(&self, pred: impl Fn(&Action) -> bool) -> usize {
        self.actions.iter().filter(|a| pred(&a.action)).count()
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("no changes");
        }
        if let Some(upgrade) = &self.upgrade {
            writeln!(f, "{}", upgrade)?;
        }
        for action in &self.actions {
            writeln!(f, "{}", action)?;
        }
        write!(
            f,
            "{} to create, {} to update, {} to replace, {} to delete",
            self.count(|a| matches!(a, Action::Create(_))),
            self.count(|a| matches!(a, Action::Update { .. })) + usize::from(self.upgrade.is_some()),
            self.count(|a| matches!(a, Action::Replace { .. })),
            self.count(|a| matches!(a, Action::Delete(_))),
        )
    }
}

/// Diff the two sets into a plan. Keys only in `desired` are created, keys
/// only in `observed` are deleted, shared keys with differing specs are
/// updated or, when an immutable field differs, replaced.
pub fn plan(desired: &DesiredSet, observed: &ObservedSet) -> Plan {
    let mut actions = Vec::new();

    for (key, spec) in desired {
        let action = match observed.get(key) {
            None => Action::Create(spec.clone()),
            Some(current) => {
                let changes = diff(&current.spec, spec);
                if changes.is_empty() {
                    continue;
                }
                if changes.iter().any(|c| c.requires_replacement) {
                    Action::Replace {
                        current: current.clone(),
                        desired: spec.clone(),
                        changes,
                    }
                } else {
                    Action::Update {
                        current: current.clone(),
                        desired: spec.clone(),
                        changes,
                    }
                }
            }
        };
        actions.push(PlannedAction {
            key: key.clone(),
            action,
            after: None,
        });
    }

    for (key, current) in observed {
        if desired.contains_key(key) {
            continue;
        }
        actions.push(PlannedAction {
            key: key.clone(),
            action: Action::Delete(current.clone()),
            after: successor_of(key, desired, observed),
        });
    }

    Plan {
        upgrade: None,
        actions,
    }
}

/// The node group that declares `replaces: key` and is not yet ACTIVE,
/// either because this plan creates it or because an earlier run left it
/// settling.
fn successor_of(key: &ResourceKey, desired: &DesiredSet, observed: &ObservedSet) -> Option<ResourceKey> {
    if key.kind != ResourceKind::NodeGroup {
        return None;
    }
    desired.iter().find_map(|(candidate, spec)| match spec {
        ResourceSpec::NodeGroup(ng) if ng.replaces.as_ref() == Some(&key.name) => {
            match observed.get(candidate) {
                Some(current) if current.status == ResourceStatus::Active => None,
                _ => Some(candidate.clone()),
            }
        }
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        AddonSpec, FargateProfileSpec, FargateSelector, NodeGroupSpec, ResourceStatus,
        ServiceAccountSpec,
    };
    use crate::types::{ResourceName, StackName};
    use std::collections::{BTreeSet, HashSet};

    fn nodegroup(name: &str, min: u32, max: u32) -> ResourceSpec {
        ResourceSpec::NodeGroup(NodeGroupSpec {
            name: ResourceName::new(name),
            instance_type: "m5.large".into(),
            min_size: min,
            max_size: max,
            desired_capacity: None,
            labels: BTreeMap::new(),
            node_role_arn: None,
            version: None,
            replaces: None,
        })
    }

    fn observed(spec: &ResourceSpec) -> ObservedResource {
        ObservedResource {
            spec: spec.clone(),
            status: ResourceStatus::Active,
            owner: Some(StackName::new(format!("eko-demo-nodegroup-{}", spec.name()))),
        }
    }

    fn desired_set(specs: &[ResourceSpec]) -> DesiredSet {
        specs.iter().map(|s| (s.key(), s.clone())).collect()
    }

    fn observed_set(specs: &[ResourceSpec]) -> ObservedSet {
        specs.iter().map(|s| (s.key(), observed(s))).collect()
    }

    #[test]
    fn test_plan_creates_updates_and_deletes() {
        let desired = desired_set(&[nodegroup("ng-1", 2, 4), nodegroup("ng-3", 1, 1)]);
        let observed = observed_set(&[nodegroup("ng-1", 1, 3), nodegroup("ng-2", 1, 3)]);

        let plan = plan(&desired, &observed);
        let rendered: Vec<String> = plan
            .actions
            .iter()
            .map(|a| format!("{} {}", a.action.symbol(), a.key))
            .collect();
        assert_eq!(
            rendered,
            vec!["~ nodegroup ng-1", "+ nodegroup ng-3", "- nodegroup ng-2"]
        );
        let changes = plan.actions[0].action.changes();
        assert_eq!(changes.len(), 2);
        assert!(changes.iter().all(|c| !c.requires_replacement));
    }

    #[test]
    fn test_plan_is_disjoint() {
        let desired = desired_set(&[
            nodegroup("a", 1, 2),
            nodegroup("b", 1, 3),
            nodegroup("c", 1, 1),
        ]);
        let observed = observed_set(&[nodegroup("b", 1, 2), nodegroup("c", 1, 1), nodegroup("d", 1, 1)]);
        let plan = plan(&desired, &observed);

        let keys: HashSet<&ResourceKey> = plan.actions.iter().map(|a| &a.key).collect();
        assert_eq!(keys.len(), plan.len());
        assert!(plan.get(&ResourceKey::new(ResourceKind::NodeGroup, "c")).is_none());
    }

    #[test]
    fn test_converged_state_plans_nothing() {
        let specs = [nodegroup("a", 1, 2), nodegroup("b", 1, 3)];
        let plan = plan(&desired_set(&specs), &observed_set(&specs));
        assert!(plan.is_empty());
        assert_eq!(plan.to_string(), "no changes");
    }

    #[test]
    fn test_instance_type_change_forces_replacement() {
        let current = nodegroup("ng-1", 1, 3);
        let mut desired = current.clone();
        if let ResourceSpec::NodeGroup(ng) = &mut desired {
            ng.instance_type = "c5.large".into();
        }
        let plan = plan(&desired_set(&[desired]), &observed_set(&[current]));
        assert!(matches!(plan.actions[0].action, Action::Replace { .. }));
        assert!(plan.to_string().contains("(forces replacement)"));
    }

    #[test]
    fn test_unpinned_fields_are_not_diffed() {
        let mut current = nodegroup("ng-1", 1, 3);
        if let ResourceSpec::NodeGroup(ng) = &mut current {
            ng.desired_capacity = Some(2);
            ng.node_role_arn = Some("arn:role/node".into());
        }
        let desired = nodegroup("ng-1", 1, 3);
        assert!(diff(&current, &desired).is_empty());
    }

    #[test]
    fn test_rolling_replacement_orders_delete_after_create() {
        let mut new_group = nodegroup("ng-2", 1, 3);
        if let ResourceSpec::NodeGroup(ng) = &mut new_group {
            ng.replaces = Some(ResourceName::new("ng-1"));
        }
        let plan = plan(&desired_set(&[new_group]), &observed_set(&[nodegroup("ng-1", 1, 3)]));
        let delete = plan
            .get(&ResourceKey::new(ResourceKind::NodeGroup, "ng-1"))
            .unwrap();
        assert!(matches!(delete.action, Action::Delete(_)));
        assert_eq!(delete.after, Some(ResourceKey::new(ResourceKind::NodeGroup, "ng-2")));
    }

    #[test]
    fn test_rolling_replacement_waits_for_settling_successor() {
        let mut new_group = nodegroup("ng-1b", 1, 3);
        if let ResourceSpec::NodeGroup(ng) = &mut new_group {
            ng.replaces = Some(ResourceName::new("ng-1"));
        }
        let old_key = ResourceKey::new(ResourceKind::NodeGroup, "ng-1");
        let mut observed = observed_set(&[nodegroup("ng-1", 1, 3), new_group.clone()]);
        observed.get_mut(&new_group.key()).unwrap().status = ResourceStatus::Creating;

        let settling = plan(&desired_set(&[new_group.clone()]), &observed);
        assert_eq!(settling.len(), 1);
        let delete = settling.get(&old_key).unwrap();
        assert_eq!(delete.after, Some(new_group.key()));
        assert_eq!(delete.to_string(), "- nodegroup ng-1 (after nodegroup ng-1b)");

        observed.get_mut(&new_group.key()).unwrap().status = ResourceStatus::Active;
        let settled = plan(&desired_set(&[new_group]), &observed);
        assert_eq!(settled.get(&old_key).unwrap().after, None);
    }

    #[test]
    fn test_nodegroup_version_updates_in_place() {
        let current = nodegroup("ng-1", 1, 3);
        let mut desired = current.clone();
        if let ResourceSpec::NodeGroup(ng) = &mut desired {
            ng.version = Some("1.30".into());
        }
        let plan = plan(&desired_set(&[desired]), &observed_set(&[current]));
        assert!(matches!(plan.actions[0].action, Action::Update { .. }));
        assert_eq!(plan.actions[0].action.changes()[0].field, "version");
    }

    #[test]
    fn test_cluster_upgrades_one_minor_version_forward() {
        assert_eq!(plan_upgrade("1.30", "1.30").unwrap(), None);
        let upgrade = plan_upgrade("1.29", "1.30").unwrap().unwrap();
        assert_eq!(upgrade.to, "1.30");

        let plan = Plan {
            upgrade: Some(upgrade),
            ..Plan::default()
        };
        assert_eq!(plan.len(), 1);
        assert_eq!(
            plan.to_string(),
            "~ control plane\n    version: 1.29 -> 1.30\n0 to create, 1 to update, 0 to replace, 0 to delete"
        );

        for (current, desired) in [("1.30", "1.29"), ("1.28", "1.30"), ("1.30", "2.0"), ("1.30", "next")] {
            let err = plan_upgrade(current, desired).unwrap_err();
            assert_eq!(err.kind(), crate::error::ErrorKind::Validation, "{current} -> {desired}");
        }
    }

    #[test]
    fn test_kind_specific_diffs() {
        let fp = |ns: &str| {
            ResourceSpec::FargateProfile(FargateProfileSpec {
                name: ResourceName::new("fp"),
                selectors: vec![FargateSelector {
                    namespace: ns.into(),
                    labels: BTreeMap::new(),
                }],
                pod_execution_role_arn: None,
                subnets: Vec::new(),
            })
        };
        let changes = diff(&fp("default"), &fp("kube-system"));
        assert!(changes[0].requires_replacement);

        let addon = |v: Option<&str>| {
            ResourceSpec::Addon(AddonSpec {
                name: ResourceName::new("vpc-cni"),
                version: v.map(str::to_string),
                service_account_role_arn: None,
            })
        };
        assert!(diff(&addon(Some("v1")), &addon(None)).is_empty());
        let changes = diff(&addon(Some("v1")), &addon(Some("v2")));
        assert_eq!(changes.len(), 1);
        assert!(!changes[0].requires_replacement);

        let sa = |policies: &[&str]| {
            ResourceSpec::ServiceAccount(ServiceAccountSpec {
                namespace: "kube-system".into(),
                name: "aws-node".into(),
                attach_policy_arns: policies.iter().map(|p| p.to_string()).collect::<BTreeSet<_>>(),
                role_name: None,
            })
        };
        let changes = diff(&sa(&["a"]), &sa(&["a", "b"]));
        assert_eq!(changes[0].field, "attachPolicyARNs");
        assert!(!changes[0].requires_replacement);
    }
}
