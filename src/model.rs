//! Resource model shared by the clients, the reconciler and the config.
//!
//! The set of resource kinds is closed: every place that needs per-kind
//! behavior matches on [`ResourceKind`] or [`ResourceSpec`] exhaustively.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::types::{ClusterName, ResourceName, StackName};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    NodeGroup,
    FargateProfile,
    Addon,
    ServiceAccount,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 4] = [
        ResourceKind::NodeGroup,
        ResourceKind::FargateProfile,
        ResourceKind::Addon,
        ResourceKind::ServiceAccount,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Self::NodeGroup => "nodegroup",
            Self::FargateProfile => "fargate profile",
            Self::Addon => "addon",
            Self::ServiceAccount => "iamserviceaccount",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Identity of a resource within a cluster.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    pub kind: ResourceKind,
    pub name: ResourceName,
}

impl ResourceKey {
    pub fn new(kind: ResourceKind, name: impl Into<ResourceName>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.name)
    }
}

/// A managed pool of worker instances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeGroupSpec {
    pub name: ResourceName,
    #[serde(default = "default_instance_type")]
    pub instance_type: String,
    pub min_size: u32,
    pub max_size: u32,
    /// Left to the autoscaler when unset.
    #[serde(default)]
    pub desired_capacity: Option<u32>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Node instance role. Falls back to the network stack's `NodeRoleARN`.
    #[serde(default, rename = "nodeRoleARN")]
    pub node_role_arn: Option<String>,
    /// Kubernetes version of the nodes. Follows the control plane when unset.
    #[serde(default)]
    pub version: Option<String>,
    /// Name of an existing group this one supersedes. The old group is
    /// deleted once this one is ACTIVE.
    #[serde(default)]
    pub replaces: Option<ResourceName>,
}

fn default_instance_type() -> String {
    "m5.large".to_string()
}

/// `(major, minor)` of a Kubernetes version such as `1.30`.
pub fn parse_version(version: &str) -> Option<(u32, u32)> {
    let mut parts = version.trim().split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FargateSelector {
    pub namespace: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Routes pods matching any selector to serverless compute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FargateProfileSpec {
    pub name: ResourceName,
    pub selectors: Vec<FargateSelector>,
    #[serde(default, rename = "podExecutionRoleARN")]
    pub pod_execution_role_arn: Option<String>,
    #[serde(default)]
    pub subnets: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddonSpec {
    pub name: ResourceName,
    /// Latest available when unset.
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default, rename = "serviceAccountRoleARN")]
    pub service_account_role_arn: Option<String>,
}

/// A Kubernetes service account bound to an IAM role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceAccountSpec {
    pub namespace: String,
    pub name: String,
    #[serde(default, rename = "attachPolicyARNs")]
    pub attach_policy_arns: BTreeSet<String>,
    #[serde(default)]
    pub role_name: Option<String>,
}

impl ServiceAccountSpec {
    pub fn resource_name(&self) -> ResourceName {
        ResourceName::new(format!("{}/{}", self.namespace, self.name))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ResourceSpec {
    NodeGroup(NodeGroupSpec),
    FargateProfile(FargateProfileSpec),
    Addon(AddonSpec),
    ServiceAccount(ServiceAccountSpec),
}

impl ResourceSpec {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::NodeGroup(_) => ResourceKind::NodeGroup,
            Self::FargateProfile(_) => ResourceKind::FargateProfile,
            Self::Addon(_) => ResourceKind::Addon,
            Self::ServiceAccount(_) => ResourceKind::ServiceAccount,
        }
    }

    pub fn name(&self) -> ResourceName {
        match self {
            Self::NodeGroup(ng) => ng.name.clone(),
            Self::FargateProfile(fp) => fp.name.clone(),
            Self::Addon(addon) => addon.name.clone(),
            Self::ServiceAccount(sa) => sa.resource_name(),
        }
    }

    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(self.kind(), self.name())
    }
}

/// Lifecycle status reported by the remote API for clusters and
/// cluster-scoped resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceStatus {
    Creating,
    Active,
    Updating,
    Deleting,
    CreateFailed,
    DeleteFailed,
    Degraded,
}

impl ResourceStatus {
    pub fn is_failed(self) -> bool {
        matches!(
            self,
            Self::CreateFailed | Self::DeleteFailed | Self::Degraded
        )
    }
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Creating => "CREATING",
            Self::Active => "ACTIVE",
            Self::Updating => "UPDATING",
            Self::Deleting => "DELETING",
            Self::CreateFailed => "CREATE_FAILED",
            Self::DeleteFailed => "DELETE_FAILED",
            Self::Degraded => "DEGRADED",
        };
        f.write_str(s)
    }
}

/// A resource as currently seen remotely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedResource {
    pub spec: ResourceSpec,
    pub status: ResourceStatus,
    /// Stack that manages the resource. `None` for resources created
    /// outside the orchestrator or through the direct API.
    pub owner: Option<StackName>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub name: ClusterName,
    pub status: ResourceStatus,
    pub version: String,
    pub owner: Option<StackName>,
    /// Subnets the control plane was placed in.
    #[serde(default)]
    pub subnets: Vec<String>,
}
