//! A deterministic simulated cloud.
//!
//! Implements both client traits against in-process state. Every mutation
//! starts an in-progress status that settles after a fixed number of describe
//! calls, so waits behave like they do against the real API without any
//! wall-clock dependence. Faults (failed stack operations, failed resources,
//! throttling) are injected per call.

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use tokio::sync::Mutex;
use tracing::debug;

use super::{
    ClientError, ClientErrorKind, ClientResult, ResourceClient, StackClient,
};
use crate::core::split_list_output;
use crate::model::{
    ClusterInfo, NodeGroupSpec, ObservedResource, ResourceKind, ResourceSpec, ResourceStatus,
};
use crate::stack::template::{EKS_CLUSTER_TYPE, EKS_NODEGROUP_TYPE};
use crate::stack::{
    StackEvent, StackOperation, StackSpec, StackState, StackStatus, StackSummary,
};
use crate::types::{ClusterName, ResourceName, StackName};

const DEFAULT_SETTLE_POLLS: u32 = 2;
const ACCOUNT_ID: &str = "000000000000";
const SEED_SUBNETS: [&str; 2] = ["subnet-seed-a", "subnet-seed-b"];

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SimStack {
    spec: StackSpec,
    state: StackState,
    /// Spec restored if the in-flight update rolls back.
    #[serde(default)]
    previous: Option<StackSpec>,
    #[serde(default)]
    pending: u32,
    #[serde(default)]
    fail_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SimResource {
    cluster: ClusterName,
    observed: ObservedResource,
    #[serde(default)]
    pending: u32,
    #[serde(default)]
    fail: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SimCluster {
    info: ClusterInfo,
    #[serde(default)]
    pending: u32,
}

#[derive(Debug, Default)]
struct Faults {
    stacks: HashMap<StackName, String>,
    resources: HashSet<String>,
    throttle: u32,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CloudState {
    settle_polls: u32,
    stacks: BTreeMap<StackName, SimStack>,
    clusters: BTreeMap<ClusterName, SimCluster>,
    resources: BTreeMap<String, SimResource>,
    #[serde(skip)]
    calls: HashMap<&'static str, usize>,
    #[serde(skip)]
    faults: Faults,
}

fn resource_id(cluster: &ClusterName, kind: ResourceKind, name: &ResourceName) -> String {
    format!("{}/{}/{}", cluster, kind.label(), name)
}

/// Short deterministic suffix for physical ids.
fn short_id(seed: &str) -> String {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in seed.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x100000001b3);
    }
    format!("{:08x}", hash as u32)
}

pub struct InMemoryCloud {
    state: Mutex<CloudState>,
}

impl Default for InMemoryCloud {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCloud {
    pub fn new() -> Self {
        Self::with_settle_polls(DEFAULT_SETTLE_POLLS)
    }

    /// `polls` describe calls observe an operation in progress; the last of
    /// them observes it terminal.
    pub fn with_settle_polls(polls: u32) -> Self {
        Self {
            state: Mutex::new(CloudState {
                settle_polls: polls.max(1),
                ..CloudState::default()
            }),
        }
    }

    /// Restore a snapshot written by [`InMemoryCloud::save`]. A missing file
    /// yields an empty cloud.
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read cloud state {}", path.display()))?;
        let mut state: CloudState = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse cloud state {}", path.display()))?;
        state.settle_polls = state.settle_polls.max(1);
        Ok(Self {
            state: Mutex::new(state),
        })
    }

    pub async fn save(&self, path: &Path) -> anyhow::Result<()> {
        let raw = {
            let state = self.state.lock().await;
            serde_json::to_string_pretty(&*state)?
        };
        tokio::fs::write(path, raw)
            .await
            .with_context(|| format!("Failed to write cloud state {}", path.display()))
    }

    /// Number of calls made to `method`, including throttled ones.
    pub async fn calls(&self, method: &str) -> usize {
        let state = self.state.lock().await;
        state.calls.get(method).copied().unwrap_or(0)
    }

    /// The next operation submitted on `stack` ends FAILED (create, delete)
    /// or ROLLED_BACK (update).
    pub async fn fail_next_stack_operation(&self, stack: &StackName, reason: &str) {
        let mut state = self.state.lock().await;
        state.faults.stacks.insert(stack.clone(), reason.to_string());
    }

    /// The next direct create or update of the resource ends in a failed
    /// status.
    pub async fn fail_next_resource_operation(
        &self,
        cluster: &ClusterName,
        kind: ResourceKind,
        name: &ResourceName,
    ) {
        let mut state = self.state.lock().await;
        state
            .faults
            .resources
            .insert(resource_id(cluster, kind, name));
    }

    /// The next `count` calls, of any method, are throttled.
    pub async fn throttle_next(&self, count: u32) {
        self.state.lock().await.faults.throttle = count;
    }

    /// An ACTIVE cluster created outside any stack.
    pub async fn seed_cluster(&self, name: &ClusterName, version: &str) {
        let mut state = self.state.lock().await;
        state.clusters.insert(
            name.clone(),
            SimCluster {
                info: ClusterInfo {
                    name: name.clone(),
                    status: ResourceStatus::Active,
                    version: version.to_string(),
                    owner: None,
                    subnets: SEED_SUBNETS.iter().map(|s| s.to_string()).collect(),
                },
                pending: 0,
            },
        );
    }

    /// An ACTIVE resource, optionally attributed to a stack.
    pub async fn seed_resource(
        &self,
        cluster: &ClusterName,
        spec: ResourceSpec,
        owner: Option<StackName>,
    ) {
        let mut state = self.state.lock().await;
        let id = resource_id(cluster, spec.kind(), &spec.name());
        state.resources.insert(
            id,
            SimResource {
                cluster: cluster.clone(),
                observed: ObservedResource {
                    spec,
                    status: ResourceStatus::Active,
                    owner,
                },
                pending: 0,
                fail: false,
            },
        );
    }

    /// A stack already in CREATE_COMPLETE, with its resources in place.
    pub async fn seed_stack(&self, spec: StackSpec) {
        let mut state = self.state.lock().await;
        let mut stack = SimStack {
            state: StackState {
                name: spec.name.clone(),
                operation: StackOperation::Create,
                status: StackStatus::InProgress,
                status_reason: None,
                parameters: spec.parameters.clone(),
                tags: spec.tags.clone(),
                outputs: BTreeMap::new(),
                events: Vec::new(),
            },
            spec,
            previous: None,
            pending: 0,
            fail_reason: None,
        };
        state.complete_stack(&mut stack);
        state.stacks.insert(stack.spec.name.clone(), stack);
    }

    async fn enter(&self, method: &'static str) -> ClientResult<tokio::sync::MutexGuard<'_, CloudState>> {
        let mut state = self.state.lock().await;
        *state.calls.entry(method).or_default() += 1;
        if state.faults.throttle > 0 {
            state.faults.throttle -= 1;
            debug!(method, "simulated throttling");
            return Err(ClientError::throttled(format!("{}: rate exceeded", method)));
        }
        Ok(state)
    }
}

impl CloudState {
    fn stack_event(stack: &mut SimStack, resource: &str, status: String, reason: Option<String>) {
        stack.state.events.push(StackEvent {
            timestamp: chrono::Utc::now(),
            resource: resource.to_string(),
            status,
            reason,
        });
    }

    fn begin_stack(&mut self, stack: &mut SimStack, operation: StackOperation) {
        stack.state.operation = operation;
        stack.state.status = StackStatus::InProgress;
        stack.state.status_reason = None;
        stack.pending = self.settle_polls;
        stack.fail_reason = self.faults.stacks.remove(&stack.spec.name);
        let name = stack.spec.name.to_string();
        Self::stack_event(stack, &name, format!("{}_IN_PROGRESS", operation), None);
    }

    /// Advance one poll. Returns `false` once the stack is gone.
    fn tick_stack(&mut self, name: &StackName) -> bool {
        let Some(mut stack) = self.stacks.remove(name) else {
            return false;
        };
        if stack.state.status == StackStatus::InProgress {
            stack.pending = stack.pending.saturating_sub(1);
            if stack.pending == 0 {
                match (stack.state.operation, stack.fail_reason.take()) {
                    (StackOperation::Delete, None) => {
                        self.remove_owned(name);
                        return false;
                    }
                    (operation, Some(reason)) => self.fail_stack(&mut stack, operation, reason),
                    (_, None) => self.complete_stack(&mut stack),
                }
            }
        }
        self.stacks.insert(name.clone(), stack);
        true
    }

    fn fail_stack(&mut self, stack: &mut SimStack, operation: StackOperation, reason: String) {
        let logical = stack
            .spec
            .template
            .get("Resources")
            .and_then(Value::as_object)
            .and_then(|r| r.keys().last().cloned())
            .unwrap_or_else(|| "Stack".to_string());
        Self::stack_event(stack, &logical, format!("{}_FAILED", operation), Some(reason.clone()));
        stack.state.status_reason = Some(reason);
        let status = match operation {
            StackOperation::Update => {
                if let Some(previous) = stack.previous.take() {
                    stack.spec = previous;
                    stack.state.parameters = stack.spec.parameters.clone();
                }
                let name = stack.spec.name.to_string();
                Self::stack_event(stack, &name, "UPDATE_ROLLBACK_COMPLETE".into(), None);
                StackStatus::RolledBack
            }
            StackOperation::Create | StackOperation::Delete => {
                let name = stack.spec.name.to_string();
                Self::stack_event(stack, &name, format!("{}_FAILED", operation), None);
                StackStatus::Failed
            }
        };
        stack.state.status = status;
    }

    fn complete_stack(&mut self, stack: &mut SimStack) {
        let resolver = Resolver { spec: &stack.spec };
        stack.state.outputs = resolver.outputs();
        for (cluster, resource) in resolver.nodegroups() {
            let id = resource_id(&cluster, ResourceKind::NodeGroup, &resource.spec.name());
            self.resources.insert(
                id,
                SimResource {
                    cluster,
                    observed: resource,
                    pending: 0,
                    fail: false,
                },
            );
        }
        if let Some(info) = resolver.cluster() {
            self.clusters.insert(info.name.clone(), SimCluster { info, pending: 0 });
        }
        stack.previous = None;
        stack.state.status = StackStatus::Complete;
        stack.state.parameters = stack.spec.parameters.clone();
        let name = stack.spec.name.to_string();
        Self::stack_event(stack, &name, format!("{}_COMPLETE", stack.state.operation), None);
    }

    fn remove_owned(&mut self, stack: &StackName) {
        self.resources
            .retain(|_, r| r.observed.owner.as_ref() != Some(stack));
        self.clusters
            .retain(|_, c| c.info.owner.as_ref() != Some(stack));
    }

    fn tick_resource(&mut self, id: &str) -> Option<ObservedResource> {
        let resource = self.resources.get_mut(id)?;
        if matches!(
            resource.observed.status,
            ResourceStatus::Creating | ResourceStatus::Updating | ResourceStatus::Deleting
        ) {
            resource.pending = resource.pending.saturating_sub(1);
            if resource.pending == 0 {
                let settled = match (resource.observed.status, resource.fail) {
                    (ResourceStatus::Deleting, _) => None,
                    (ResourceStatus::Creating, true) => Some(ResourceStatus::CreateFailed),
                    (ResourceStatus::Updating, true) => Some(ResourceStatus::Degraded),
                    _ => Some(ResourceStatus::Active),
                };
                match settled {
                    Some(status) => {
                        resource.observed.status = status;
                        resource.fail = false;
                    }
                    None => {
                        self.resources.remove(id);
                        return None;
                    }
                }
            }
        }
        Some(resource.observed.clone())
    }

    fn tick_cluster(&mut self, name: &ClusterName) -> Option<ClusterInfo> {
        let cluster = self.clusters.get_mut(name)?;
        if matches!(
            cluster.info.status,
            ResourceStatus::Creating | ResourceStatus::Updating | ResourceStatus::Deleting
        ) {
            cluster.pending = cluster.pending.saturating_sub(1);
            if cluster.pending == 0 {
                if cluster.info.status == ResourceStatus::Deleting {
                    self.clusters.remove(name);
                    return None;
                }
                cluster.info.status = ResourceStatus::Active;
            }
        }
        Some(cluster.info.clone())
    }

    fn require_cluster(&self, name: &ClusterName) -> ClientResult<()> {
        if self.clusters.contains_key(name) {
            Ok(())
        } else {
            Err(ClientError::not_found(format!("cluster {}", name)))
        }
    }

    fn busy_fargate_profile(&self, cluster: &ClusterName) -> Option<ResourceName> {
        self.resources.values().find_map(|r| {
            let busy = r.cluster == *cluster
                && r.observed.spec.kind() == ResourceKind::FargateProfile
                && matches!(
                    r.observed.status,
                    ResourceStatus::Creating | ResourceStatus::Deleting
                );
            busy.then(|| r.observed.spec.name())
        })
    }
}

/// Resolves the intrinsics of one stack's template against its parameters.
struct Resolver<'a> {
    spec: &'a StackSpec,
}

impl Resolver<'_> {
    fn resources(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.spec
            .template
            .get("Resources")
            .and_then(Value::as_object)
            .into_iter()
            .flat_map(|r| r.iter())
    }

    fn physical_id(&self, logical: &str) -> String {
        let seed = format!("{}/{}", self.spec.name, logical);
        let kind = self
            .spec
            .template
            .pointer(&format!("/Resources/{}/Type", logical))
            .and_then(Value::as_str)
            .unwrap_or_default();
        match kind {
            "AWS::EC2::VPC" => format!("vpc-{}", short_id(&seed)),
            "AWS::EC2::Subnet" => format!("subnet-{}", short_id(&seed)),
            EKS_CLUSTER_TYPE => self
                .spec
                .template
                .pointer(&format!("/Resources/{}/Properties/Name", logical))
                .and_then(Value::as_str)
                .unwrap_or(logical)
                .to_string(),
            _ => format!("{}-{}", self.spec.name, logical),
        }
    }

    fn resolve(&self, value: &Value) -> String {
        match value {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Object(map) => {
                if let Some(target) = map.get("Ref").and_then(Value::as_str) {
                    return match self.spec.parameters.get(target) {
                        Some(param) => param.clone(),
                        None => self.physical_id(target),
                    };
                }
                if let Some(args) = map.get("Fn::GetAtt").and_then(Value::as_array) {
                    let logical = args.first().and_then(Value::as_str).unwrap_or_default();
                    return format!(
                        "arn:aws:iam::{}:role/{}-{}",
                        ACCOUNT_ID, self.spec.name, logical
                    );
                }
                if let Some(args) = map.get("Fn::Join").and_then(Value::as_array) {
                    let separator = args.first().and_then(Value::as_str).unwrap_or_default();
                    let parts: Vec<String> = args
                        .get(1)
                        .and_then(Value::as_array)
                        .map(|items| items.iter().map(|v| self.resolve(v)).collect())
                        .unwrap_or_default();
                    return parts.join(separator);
                }
                String::new()
            }
            _ => String::new(),
        }
    }

    fn outputs(&self) -> BTreeMap<String, String> {
        self.spec
            .template
            .get("Outputs")
            .and_then(Value::as_object)
            .map(|outputs| {
                outputs
                    .iter()
                    .filter_map(|(key, output)| {
                        output.get("Value").map(|v| (key.clone(), self.resolve(v)))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn property(&self, resource: &Value, name: &str) -> Option<String> {
        resource.pointer(&format!("/Properties/{}", name)).map(|v| self.resolve(v))
    }

    fn cluster(&self) -> Option<ClusterInfo> {
        let (_, resource) = self
            .resources()
            .find(|(_, r)| r["Type"] == EKS_CLUSTER_TYPE)?;
        let subnets = resource
            .pointer("/Properties/ResourcesVpcConfig/SubnetIds")
            .map(|v| split_list_output(&self.resolve(v)))
            .unwrap_or_default();
        Some(ClusterInfo {
            name: ClusterName::new(self.property(resource, "Name")?),
            status: ResourceStatus::Active,
            version: self.property(resource, "Version").unwrap_or_default(),
            owner: Some(self.spec.name.clone()),
            subnets,
        })
    }

    fn nodegroups(&self) -> Vec<(ClusterName, ObservedResource)> {
        self.resources()
            .filter(|(_, r)| r["Type"] == EKS_NODEGROUP_TYPE)
            .filter_map(|(_, r)| {
                let props = r.get("Properties")?;
                let scaling = props.get("ScalingConfig")?;
                let size = |key: &str| {
                    scaling
                        .get(key)
                        .and_then(Value::as_u64)
                        .and_then(|n| u32::try_from(n).ok())
                };
                let spec = NodeGroupSpec {
                    name: ResourceName::new(self.property(r, "NodegroupName")?),
                    instance_type: props
                        .pointer("/InstanceTypes/0")
                        .and_then(Value::as_str)?
                        .to_string(),
                    min_size: size("MinSize")?,
                    max_size: size("MaxSize")?,
                    desired_capacity: size("DesiredSize"),
                    labels: props
                        .get("Labels")
                        .and_then(|l| serde_json::from_value(l.clone()).ok())
                        .unwrap_or_default(),
                    node_role_arn: self.property(r, "NodeRole"),
                    version: self.property(r, "Version"),
                    replaces: None,
                };
                let cluster = ClusterName::new(self.property(r, "ClusterName")?);
                Some((
                    cluster,
                    ObservedResource {
                        spec: ResourceSpec::NodeGroup(spec),
                        status: ResourceStatus::Active,
                        owner: Some(self.spec.name.clone()),
                    },
                ))
            })
            .collect()
    }
}

#[async_trait]
impl StackClient for InMemoryCloud {
    async fn create_stack(&self, spec: &StackSpec) -> ClientResult<()> {
        let mut state = self.enter("create_stack").await?;
        if state.stacks.contains_key(&spec.name) {
            return Err(ClientError::already_exists(format!(
                "stack {} already exists",
                spec.name
            )));
        }
        let mut stack = SimStack {
            state: StackState {
                name: spec.name.clone(),
                operation: StackOperation::Create,
                status: StackStatus::Pending,
                status_reason: None,
                parameters: spec.parameters.clone(),
                tags: spec.tags.clone(),
                outputs: BTreeMap::new(),
                events: Vec::new(),
            },
            spec: spec.clone(),
            previous: None,
            pending: 0,
            fail_reason: None,
        };
        state.begin_stack(&mut stack, StackOperation::Create);
        state.stacks.insert(spec.name.clone(), stack);
        Ok(())
    }

    async fn update_stack(&self, spec: &StackSpec) -> ClientResult<()> {
        let mut state = self.enter("update_stack").await?;
        let Some(mut stack) = state.stacks.remove(&spec.name) else {
            return Err(ClientError::not_found(format!("stack {} does not exist", spec.name)));
        };
        if !stack.state.status.is_terminal() {
            let message = format!(
                "stack {} is in {} state and can not be updated",
                spec.name,
                stack.state.raw_status()
            );
            state.stacks.insert(spec.name.clone(), stack);
            return Err(ClientError::conflict(message));
        }
        stack.previous = Some(std::mem::replace(&mut stack.spec, spec.clone()));
        stack.state.tags = spec.tags.clone();
        state.begin_stack(&mut stack, StackOperation::Update);
        state.stacks.insert(spec.name.clone(), stack);
        Ok(())
    }

    async fn delete_stack(&self, name: &StackName) -> ClientResult<()> {
        let mut state = self.enter("delete_stack").await?;
        let Some(mut stack) = state.stacks.remove(name) else {
            return Err(ClientError::not_found(format!("stack {} does not exist", name)));
        };
        if stack.state.operation != StackOperation::Delete || stack.state.is_terminal() {
            state.begin_stack(&mut stack, StackOperation::Delete);
        }
        state.stacks.insert(name.clone(), stack);
        Ok(())
    }

    async fn describe_stack(&self, name: &StackName) -> ClientResult<StackState> {
        let mut state = self.enter("describe_stack").await?;
        if !state.tick_stack(name) {
            return Err(ClientError::not_found(format!("stack {} does not exist", name)));
        }
        state
            .stacks
            .get(name)
            .map(|s| s.state.clone())
            .ok_or_else(|| ClientError::not_found(format!("stack {} does not exist", name)))
    }

    async fn list_stacks(&self) -> ClientResult<Vec<StackSummary>> {
        let state = self.enter("list_stacks").await?;
        Ok(state
            .stacks
            .values()
            .map(|s| StackSummary {
                name: s.state.name.clone(),
                operation: s.state.operation,
                status: s.state.status,
                tags: s.state.tags.clone(),
            })
            .collect())
    }
}

#[async_trait]
impl ResourceClient for InMemoryCloud {
    async fn create(&self, cluster: &ClusterName, spec: &ResourceSpec) -> ClientResult<()> {
        let mut state = self.enter("create").await?;
        state.require_cluster(cluster)?;
        let kind = spec.kind();
        if kind == ResourceKind::ServiceAccount {
            return Err(ClientError::new(
                ClientErrorKind::Unknown,
                "iamserviceaccounts are managed through stacks",
            ));
        }
        let id = resource_id(cluster, kind, &spec.name());
        if state.resources.contains_key(&id) {
            return Err(ClientError::already_exists(format!("{} {} already exists", kind, spec.name())));
        }
        if kind == ResourceKind::FargateProfile {
            if let Some(busy) = state.busy_fargate_profile(cluster) {
                return Err(ClientError::conflict(format!(
                    "cannot create fargate profile {} while {} is being created or deleted",
                    spec.name(),
                    busy
                )));
            }
        }
        let fail = state.faults.resources.remove(&id);
        let pending = state.settle_polls;
        state.resources.insert(
            id,
            SimResource {
                cluster: cluster.clone(),
                observed: ObservedResource {
                    spec: spec.clone(),
                    status: ResourceStatus::Creating,
                    owner: None,
                },
                pending,
                fail,
            },
        );
        Ok(())
    }

    async fn describe(
        &self,
        cluster: &ClusterName,
        kind: ResourceKind,
        name: &ResourceName,
    ) -> ClientResult<ObservedResource> {
        let mut state = self.enter("describe").await?;
        state
            .tick_resource(&resource_id(cluster, kind, name))
            .ok_or_else(|| ClientError::not_found(format!("{} {} not found", kind, name)))
    }

    async fn list(&self, cluster: &ClusterName, kind: ResourceKind) -> ClientResult<Vec<ResourceName>> {
        let state = self.enter("list").await?;
        state.require_cluster(cluster)?;
        Ok(state
            .resources
            .values()
            .filter(|r| r.cluster == *cluster && r.observed.spec.kind() == kind)
            .map(|r| r.observed.spec.name())
            .collect())
    }

    async fn update(&self, cluster: &ClusterName, spec: &ResourceSpec) -> ClientResult<()> {
        let mut state = self.enter("update").await?;
        let kind = spec.kind();
        if matches!(kind, ResourceKind::FargateProfile | ResourceKind::ServiceAccount) {
            return Err(ClientError::new(
                ClientErrorKind::Unknown,
                format!("{} {} can not be updated in place", kind, spec.name()),
            ));
        }
        let id = resource_id(cluster, kind, &spec.name());
        let fail = state.faults.resources.remove(&id);
        let pending = state.settle_polls;
        let resource = state
            .resources
            .get_mut(&id)
            .ok_or_else(|| ClientError::not_found(format!("{} {} not found", kind, spec.name())))?;
        if resource.observed.status != ResourceStatus::Active {
            return Err(ClientError::conflict(format!(
                "{} {} is {}",
                kind,
                spec.name(),
                resource.observed.status
            )));
        }
        resource.observed.spec = spec.clone();
        resource.observed.status = ResourceStatus::Updating;
        resource.pending = pending;
        resource.fail = fail;
        Ok(())
    }

    async fn delete(
        &self,
        cluster: &ClusterName,
        kind: ResourceKind,
        name: &ResourceName,
    ) -> ClientResult<()> {
        let mut state = self.enter("delete").await?;
        let id = resource_id(cluster, kind, name);
        if kind == ResourceKind::FargateProfile {
            if let Some(busy) = state.busy_fargate_profile(cluster).filter(|b| b != name) {
                return Err(ClientError::conflict(format!(
                    "cannot delete fargate profile {} while {} is being created or deleted",
                    name, busy
                )));
            }
        }
        let pending = state.settle_polls;
        let resource = state
            .resources
            .get_mut(&id)
            .ok_or_else(|| ClientError::not_found(format!("{} {} not found", kind, name)))?;
        if resource.observed.status != ResourceStatus::Deleting {
            resource.observed.status = ResourceStatus::Deleting;
            resource.pending = pending;
        }
        Ok(())
    }

    async fn describe_cluster(&self, name: &ClusterName) -> ClientResult<ClusterInfo> {
        let mut state = self.enter("describe_cluster").await?;
        state
            .tick_cluster(name)
            .ok_or_else(|| ClientError::not_found(format!("cluster {} not found", name)))
    }

    async fn list_clusters(&self) -> ClientResult<Vec<ClusterName>> {
        let state = self.enter("list_clusters").await?;
        Ok(state.clusters.keys().cloned().collect())
    }

    async fn create_cluster(&self, info: &ClusterInfo) -> ClientResult<()> {
        let mut state = self.enter("create_cluster").await?;
        if state.clusters.contains_key(&info.name) {
            return Err(ClientError::already_exists(format!("cluster {} already exists", info.name)));
        }
        let pending = state.settle_polls;
        let mut info = info.clone();
        info.status = ResourceStatus::Creating;
        if info.subnets.is_empty() {
            info.subnets = SEED_SUBNETS.iter().map(|s| s.to_string()).collect();
        }
        state
            .clusters
            .insert(info.name.clone(), SimCluster { info, pending });
        Ok(())
    }

    async fn delete_cluster(&self, name: &ClusterName) -> ClientResult<()> {
        let mut state = self.enter("delete_cluster").await?;
        if let Some(remaining) = state.resources.values().find(|r| {
            r.cluster == *name
                && matches!(
                    r.observed.spec.kind(),
                    ResourceKind::NodeGroup | ResourceKind::FargateProfile
                )
        }) {
            return Err(ClientError::conflict(format!(
                "cluster {} has {} {} attached",
                name,
                remaining.observed.spec.kind(),
                remaining.observed.spec.name()
            )));
        }
        let pending = state.settle_polls;
        let cluster = state
            .clusters
            .get_mut(name)
            .ok_or_else(|| ClientError::not_found(format!("cluster {} not found", name)))?;
        cluster.info.status = ResourceStatus::Deleting;
        cluster.pending = pending;
        Ok(())
    }

    async fn update_cluster_version(&self, name: &ClusterName, version: &str) -> ClientResult<()> {
        let mut state = self.enter("update_cluster_version").await?;
        let pending = state.settle_polls;
        let cluster = state
            .clusters
            .get_mut(name)
            .ok_or_else(|| ClientError::not_found(format!("cluster {} not found", name)))?;
        if cluster.info.status != ResourceStatus::Active {
            return Err(ClientError::conflict(format!(
                "cluster {} is {}",
                name, cluster.info.status
            )));
        }
        cluster.info.version = version.to_string();
        cluster.info.status = ResourceStatus::Updating;
        cluster.pending = pending;
        Ok(())
    }
}
