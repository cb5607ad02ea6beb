use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use std::time::Duration;
use std::{env, fs, path::Path, path::PathBuf};

use crate::core::WaitConfig;
use crate::error::{Error, Result};
use crate::model::{
    AddonSpec, FargateProfileSpec, NodeGroupSpec, ResourceKind, ServiceAccountSpec, parse_version,
};
use crate::stack::StackPurpose;
use crate::types::{ClusterName, Region};

const MAX_STACK_NAME_LEN: usize = 128;
const MAX_CLUSTER_NAME_LEN: usize = 100;
const MAX_FARGATE_SELECTORS: usize = 5;

/// Declarative description of one cluster and everything that hangs off it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    pub metadata: ClusterMetadata,
    #[serde(default)]
    pub node_groups: Vec<NodeGroupSpec>,
    #[serde(default)]
    pub fargate_profiles: Vec<FargateProfileSpec>,
    #[serde(default)]
    pub addons: Vec<AddonSpec>,
    #[serde(default)]
    pub iam: IamConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterMetadata {
    pub name: ClusterName,
    pub region: Region,
    #[serde(default = "default_version")]
    pub version: String,
}

fn default_version() -> String {
    "1.30".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IamConfig {
    #[serde(default)]
    pub service_accounts: Vec<ServiceAccountSpec>,
}

impl ClusterConfig {
    /// Parse YAML (or JSON) after expanding `${VAR}` references.
    pub fn from_yaml(raw: &str) -> anyhow::Result<Self> {
        let expanded = expand_env_vars(raw);
        let cfg: ClusterConfig = serde_yaml::from_str(&expanded)?;
        Ok(cfg)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
        Self::from_yaml(&raw)
            .map_err(|e| anyhow::anyhow!("Failed to parse {}: {}", path.display(), e))
    }

    /// Check internal consistency. Every problem found is reported, not just
    /// the first.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();
        let cluster = &self.metadata.name;

        if let Err(problem) = check_name("cluster", cluster.as_str(), MAX_CLUSTER_NAME_LEN) {
            problems.push(problem);
        }
        if self.metadata.region.as_str().is_empty() {
            problems.push("metadata.region must be set".to_string());
        }
        let control_plane = parse_version(&self.metadata.version);
        if control_plane.is_none() {
            problems.push(format!(
                "metadata.version {:?} is not a Kubernetes version",
                self.metadata.version
            ));
        }

        let mut seen = BTreeSet::new();
        let group_names: BTreeSet<&str> = self.node_groups.iter().map(|ng| ng.name.as_str()).collect();
        let mut replaced = BTreeMap::new();
        for ng in &self.node_groups {
            let label = format!("nodegroup {}", ng.name);
            if let Err(problem) = check_name("nodegroup", ng.name.as_str(), MAX_CLUSTER_NAME_LEN) {
                problems.push(problem);
            }
            if !seen.insert(ng.name.as_str()) {
                problems.push(format!("{} is declared more than once", label));
            }
            if ng.instance_type.trim().is_empty() {
                problems.push(format!("{}: instanceType must not be empty", label));
            }
            if ng.max_size == 0 {
                problems.push(format!("{}: maxSize must be at least 1", label));
            }
            if ng.min_size > ng.max_size {
                problems.push(format!(
                    "{}: minSize ({}) exceeds maxSize ({})",
                    label, ng.min_size, ng.max_size
                ));
            }
            if let Some(desired) = ng.desired_capacity {
                if desired < ng.min_size || desired > ng.max_size {
                    problems.push(format!(
                        "{}: desiredCapacity ({}) must be within [{}, {}]",
                        label, desired, ng.min_size, ng.max_size
                    ));
                }
            }
            if let Some(version) = &ng.version {
                match parse_version(version) {
                    None => problems.push(format!(
                        "{}: version {:?} is not a Kubernetes version",
                        label, version
                    )),
                    Some(nodes) if control_plane.is_some_and(|cp| nodes > cp) => {
                        problems.push(format!(
                            "{}: version {} is newer than the control plane ({})",
                            label, version, self.metadata.version
                        ))
                    }
                    Some(_) => {}
                }
            }
            if let Some(old) = &ng.replaces {
                if old == &ng.name {
                    problems.push(format!("{} can not replace itself", label));
                } else if group_names.contains(old.as_str()) {
                    problems.push(format!(
                        "{} replaces nodegroup {}, which is still declared",
                        label, old
                    ));
                }
                if let Some(other) = replaced.insert(old.as_str(), ng.name.as_str()) {
                    problems.push(format!(
                        "nodegroup {} is replaced by both {} and {}",
                        old, other, ng.name
                    ));
                }
            }
            check_stack_name(
                cluster,
                StackPurpose::NodeGroup(ng.name.clone()),
                &mut problems,
            );
        }

        let mut seen = BTreeSet::new();
        for fp in &self.fargate_profiles {
            let label = format!("fargate profile {}", fp.name);
            if let Err(problem) = check_name("fargate profile", fp.name.as_str(), MAX_CLUSTER_NAME_LEN) {
                problems.push(problem);
            }
            if !seen.insert(fp.name.as_str()) {
                problems.push(format!("{} is declared more than once", label));
            }
            if fp.selectors.is_empty() || fp.selectors.len() > MAX_FARGATE_SELECTORS {
                problems.push(format!(
                    "{}: between 1 and {} selectors are required, got {}",
                    label,
                    MAX_FARGATE_SELECTORS,
                    fp.selectors.len()
                ));
            }
            if fp.selectors.iter().any(|s| s.namespace.trim().is_empty()) {
                problems.push(format!("{}: every selector needs a namespace", label));
            }
        }

        let mut seen = BTreeSet::new();
        for addon in &self.addons {
            if addon.name.as_str().trim().is_empty() {
                problems.push("addon name must not be empty".to_string());
            }
            if !seen.insert(addon.name.as_str()) {
                problems.push(format!("addon {} is declared more than once", addon.name));
            }
        }

        let mut seen = BTreeSet::new();
        for sa in &self.iam.service_accounts {
            let label = format!("iamserviceaccount {}/{}", sa.namespace, sa.name);
            if sa.namespace.trim().is_empty() || sa.name.trim().is_empty() {
                problems.push(format!("{}: namespace and name are required", label));
            }
            if !seen.insert((sa.namespace.as_str(), sa.name.as_str())) {
                problems.push(format!("{} is declared more than once", label));
            }
            if sa.attach_policy_arns.is_empty() {
                problems.push(format!("{}: at least one attachPolicyARNs entry is required", label));
            }
            check_stack_name(
                cluster,
                StackPurpose::ServiceAccount {
                    namespace: sa.namespace.clone(),
                    name: sa.name.clone(),
                },
                &mut problems,
            );
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::validation(problems))
        }
    }
}

fn check_name(what: &str, name: &str, max_len: usize) -> std::result::Result<(), String> {
    let valid = !name.is_empty()
        && name.len() <= max_len
        && name.starts_with(|c: char| c.is_ascii_alphabetic())
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
    if valid {
        Ok(())
    } else {
        Err(format!(
            "{} name {:?} must start with a letter, contain only letters, digits and hyphens, and be at most {} characters",
            what, name, max_len
        ))
    }
}

fn check_stack_name(cluster: &ClusterName, purpose: StackPurpose, problems: &mut Vec<String>) {
    let name = purpose.stack_name(cluster);
    if name.as_str().len() > MAX_STACK_NAME_LEN {
        problems.push(format!(
            "stack name {} exceeds {} characters",
            name, MAX_STACK_NAME_LEN
        ));
    }
}

/// Config path from the command line, then `EKO_CONFIG`, then `./cluster.yaml`.
pub fn resolve_config_path(explicit: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    if let Some(p) = explicit {
        return Ok(p);
    }

    if let Ok(p) = env::var("EKO_CONFIG") {
        return Ok(PathBuf::from(p));
    }

    let candidate = PathBuf::from("cluster.yaml");
    if candidate.exists() {
        return Ok(candidate);
    }

    Err(anyhow::anyhow!(
        "Could not find a cluster config (pass --file, set EKO_CONFIG or create ./cluster.yaml)"
    ))
}

fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next(); // consume '{'
            let mut name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                name.push(c);
            }
            if let Ok(val) = env::var(&name) {
                out.push_str(&val);
            } else {
                out.push_str("${");
                out.push_str(&name);
                out.push('}');
            }
        } else {
            out.push(ch);
        }
    }

    out
}

/// Runtime knobs for a command. Defaults come from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Leaves in flight across a whole tree.
    pub max_in_flight: usize,
    /// Children in flight per parallel group.
    pub parallel_limit: usize,
    pub poll_interval: Duration,
    pub stack_timeout: Duration,
    pub resource_timeout: Duration,
    pub max_transient_retries: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_in_flight: env_or("EKO_MAX_IN_FLIGHT", 8),
            parallel_limit: env_or("EKO_PARALLEL_LIMIT", 4),
            poll_interval: Duration::from_secs(env_or("EKO_POLL_INTERVAL_SECS", 20)),
            stack_timeout: Duration::from_secs(env_or("EKO_STACK_TIMEOUT_SECS", 25 * 60)),
            resource_timeout: Duration::from_secs(env_or("EKO_RESOURCE_TIMEOUT_SECS", 20 * 60)),
            max_transient_retries: env_or("EKO_MAX_RETRIES", 5),
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Settings {
    pub fn stack_wait(&self) -> WaitConfig {
        self.wait(self.stack_timeout)
    }

    pub fn resource_wait(&self) -> WaitConfig {
        self.wait(self.resource_timeout)
    }

    fn wait(&self, timeout: Duration) -> WaitConfig {
        let defaults = WaitConfig::new(self.poll_interval, timeout);
        let (base, max) = (defaults.retry_base_delay, defaults.retry_max_delay);
        defaults.with_retries(self.max_transient_retries, base, max)
    }

    /// Parallel bound for a group of one resource kind. Fargate profiles of a
    /// cluster can only be created or deleted one at a time.
    pub fn limit_for(&self, kind: ResourceKind) -> usize {
        match kind {
            ResourceKind::FargateProfile => 1,
            _ => self.parallel_limit.max(1),
        }
    }
}
