//! Infrastructure-as-code stacks: specs, observed state, naming, and the
//! manager that drives them to a terminal status.

pub mod manager;
pub mod template;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::types::{ClusterName, ResourceName, StackName};

pub use manager::StackManager;

pub const STACK_PREFIX: &str = "eko";
pub const TAG_CLUSTER: &str = "eko.io/cluster-name";
pub const TAG_PURPOSE: &str = "eko.io/purpose";
pub const TAG_RESOURCE: &str = "eko.io/resource-name";

/// Events attached to a [`crate::error::Failure::StackOperation`].
const MAX_REPORTED_EVENTS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StackStatus {
    Pending,
    InProgress,
    Complete,
    Failed,
    RolledBack,
    Deleted,
}

impl StackStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Complete | Self::Failed | Self::RolledBack | Self::Deleted
        )
    }

    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::InProgress => 1,
            _ => 2,
        }
    }

    /// Whether polling may observe `next` after `self` within one operation.
    /// Terminal statuses only repeat; otherwise status never moves backwards.
    pub fn can_advance_to(self, next: StackStatus) -> bool {
        if self.is_terminal() {
            return self == next;
        }
        next.rank() >= self.rank()
    }
}

impl fmt::Display for StackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Complete => "COMPLETE",
            Self::Failed => "FAILED",
            Self::RolledBack => "ROLLED_BACK",
            Self::Deleted => "DELETED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StackOperation {
    Create,
    Update,
    Delete,
}

impl fmt::Display for StackOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Capability {
    Iam,
    NamedIam,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackEvent {
    pub timestamp: DateTime<Utc>,
    /// Logical id of the stack resource the event is about.
    pub resource: String,
    pub status: String,
    pub reason: Option<String>,
}

impl StackEvent {
    pub fn is_failure(&self) -> bool {
        self.status.ends_with("FAILED")
    }
}

impl fmt::Display for StackEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.resource, self.status)?;
        if let Some(reason) = &self.reason {
            write!(f, ": {}", reason)?;
        }
        Ok(())
    }
}

/// Desired stack. Immutable once submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackSpec {
    pub name: StackName,
    pub template: serde_json::Value,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// Stack as last observed by polling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackState {
    pub name: StackName,
    pub operation: StackOperation,
    pub status: StackStatus,
    #[serde(default)]
    pub status_reason: Option<String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
    /// Oldest first.
    #[serde(default)]
    pub events: Vec<StackEvent>,
}

impl StackState {
    /// Status in the remote API's vocabulary, e.g. `UPDATE_ROLLBACK_COMPLETE`.
    pub fn raw_status(&self) -> String {
        match (self.operation, self.status) {
            (_, StackStatus::Deleted) => "DELETE_COMPLETE".to_string(),
            (op, StackStatus::RolledBack) if op == StackOperation::Create => {
                "ROLLBACK_COMPLETE".to_string()
            }
            (op, StackStatus::RolledBack) => format!("{}_ROLLBACK_COMPLETE", op),
            (op, status) => format!("{}_{}", op, status),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Fold a newer observation into this one. Observations that would move
    /// the status backwards within the same operation are ignored and
    /// `false` is returned.
    pub fn advance(&mut self, next: StackState) -> bool {
        let accepted = if next.operation == self.operation {
            self.status.can_advance_to(next.status)
        } else {
            // A different operation is only visible after a new submission.
            self.is_terminal()
        };
        if accepted {
            *self = next;
        }
        accepted
    }

    /// Latest failure events, oldest first. Falls back to the latest events
    /// of any kind when none failed.
    pub fn recent_failures(&self) -> Vec<StackEvent> {
        let failed: Vec<&StackEvent> = self.events.iter().filter(|e| e.is_failure()).collect();
        let source: Vec<&StackEvent> = if failed.is_empty() {
            self.events.iter().collect()
        } else {
            failed
        };
        let skip = source.len().saturating_sub(MAX_REPORTED_EVENTS);
        source.into_iter().skip(skip).cloned().collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackSummary {
    pub name: StackName,
    pub operation: StackOperation,
    pub status: StackStatus,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl StackSummary {
    pub fn cluster(&self) -> Option<&str> {
        self.tags.get(TAG_CLUSTER).map(String::as_str)
    }

    pub fn purpose(&self) -> Option<StackPurpose> {
        StackPurpose::from_tags(&self.tags)
    }
}

/// What a stack is for. Together with the cluster name it determines the
/// stack name, which keeps names unique per cluster and purpose.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StackPurpose {
    /// VPC, subnets and IAM roles.
    Network,
    /// The control plane.
    Cluster,
    NodeGroup(ResourceName),
    ServiceAccount { namespace: String, name: String },
}

impl StackPurpose {
    pub fn stack_name(&self, cluster: &ClusterName) -> StackName {
        let suffix = match self {
            Self::Network => "network".to_string(),
            Self::Cluster => "cluster".to_string(),
            Self::NodeGroup(name) => format!("nodegroup-{}", name),
            Self::ServiceAccount { namespace, name } => {
                format!("addon-iamserviceaccount-{}-{}", namespace, name)
            }
        };
        StackName::new(format!("{}-{}-{}", STACK_PREFIX, cluster, suffix))
    }

    pub fn tag_value(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Cluster => "cluster",
            Self::NodeGroup(_) => "nodegroup",
            Self::ServiceAccount { .. } => "iamserviceaccount",
        }
    }

    pub fn resource_name(&self) -> Option<ResourceName> {
        match self {
            Self::Network | Self::Cluster => None,
            Self::NodeGroup(name) => Some(name.clone()),
            Self::ServiceAccount { namespace, name } => {
                Some(ResourceName::new(format!("{}/{}", namespace, name)))
            }
        }
    }

    /// Ownership tags stamped on every stack the orchestrator creates.
    pub fn tags(&self, cluster: &ClusterName) -> BTreeMap<String, String> {
        let mut tags = BTreeMap::new();
        tags.insert(TAG_CLUSTER.to_string(), cluster.to_string());
        tags.insert(TAG_PURPOSE.to_string(), self.tag_value().to_string());
        if let Some(resource) = self.resource_name() {
            tags.insert(TAG_RESOURCE.to_string(), resource.into_inner());
        }
        tags
    }

    pub fn from_tags(tags: &BTreeMap<String, String>) -> Option<Self> {
        let resource = tags.get(TAG_RESOURCE);
        match tags.get(TAG_PURPOSE)?.as_str() {
            "network" => Some(Self::Network),
            "cluster" => Some(Self::Cluster),
            "nodegroup" => Some(Self::NodeGroup(ResourceName::new(resource?.clone()))),
            "iamserviceaccount" => {
                let (namespace, name) = resource?.split_once('/')?;
                Some(Self::ServiceAccount {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                })
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(operation: StackOperation, status: StackStatus) -> StackState {
        StackState {
            name: StackName::new("eko-demo-network"),
            operation,
            status,
            status_reason: None,
            parameters: BTreeMap::new(),
            tags: BTreeMap::new(),
            outputs: BTreeMap::new(),
            events: Vec::new(),
        }
    }

    fn event(status: &str) -> StackEvent {
        StackEvent {
            timestamp: Utc::now(),
            resource: "NodeGroup".into(),
            status: status.into(),
            reason: Some("quota exceeded".into()),
        }
    }

    #[test]
    fn test_status_is_monotonic() {
        use StackStatus::*;
        assert!(Pending.can_advance_to(InProgress));
        assert!(InProgress.can_advance_to(Complete));
        assert!(InProgress.can_advance_to(InProgress));
        assert!(!InProgress.can_advance_to(Pending));
        assert!(!Complete.can_advance_to(InProgress));
        assert!(!Failed.can_advance_to(Complete));
        assert!(Deleted.can_advance_to(Deleted));
    }

    #[test]
    fn test_advance_ignores_regressions() {
        let mut current = state(StackOperation::Update, StackStatus::InProgress);
        assert!(!current.advance(state(StackOperation::Update, StackStatus::Pending)));
        assert_eq!(current.status, StackStatus::InProgress);

        assert!(current.advance(state(StackOperation::Update, StackStatus::RolledBack)));
        assert_eq!(current.status, StackStatus::RolledBack);

        // New submission after a terminal status.
        assert!(current.advance(state(StackOperation::Delete, StackStatus::InProgress)));
        assert_eq!(current.operation, StackOperation::Delete);
    }

    #[test]
    fn test_raw_status() {
        assert_eq!(
            state(StackOperation::Create, StackStatus::InProgress).raw_status(),
            "CREATE_IN_PROGRESS"
        );
        assert_eq!(
            state(StackOperation::Update, StackStatus::RolledBack).raw_status(),
            "UPDATE_ROLLBACK_COMPLETE"
        );
        assert_eq!(
            state(StackOperation::Create, StackStatus::RolledBack).raw_status(),
            "ROLLBACK_COMPLETE"
        );
        assert_eq!(
            state(StackOperation::Delete, StackStatus::Deleted).raw_status(),
            "DELETE_COMPLETE"
        );
    }

    #[test]
    fn test_recent_failures_are_capped() {
        let mut s = state(StackOperation::Create, StackStatus::Failed);
        s.events.push(event("CREATE_IN_PROGRESS"));
        for _ in 0..7 {
            s.events.push(event("CREATE_FAILED"));
        }
        let recent = s.recent_failures();
        assert_eq!(recent.len(), MAX_REPORTED_EVENTS);
        assert!(recent.iter().all(StackEvent::is_failure));
    }

    #[test]
    fn test_purpose_naming_and_tags_round_trip() {
        let cluster = ClusterName::new("demo");
        let purposes = vec![
            StackPurpose::Network,
            StackPurpose::Cluster,
            StackPurpose::NodeGroup(ResourceName::new("ng-1")),
            StackPurpose::ServiceAccount {
                namespace: "kube-system".into(),
                name: "aws-node".into(),
            },
        ];
        let names: Vec<String> = purposes
            .iter()
            .map(|p| p.stack_name(&cluster).into_inner())
            .collect();
        assert_eq!(
            names,
            vec![
                "eko-demo-network",
                "eko-demo-cluster",
                "eko-demo-nodegroup-ng-1",
                "eko-demo-addon-iamserviceaccount-kube-system-aws-node",
            ]
        );
        for purpose in purposes {
            let tags = purpose.tags(&cluster);
            assert_eq!(StackPurpose::from_tags(&tags), Some(purpose));
        }
    }
}
