//! Remote API seams.
//!
//! [`ResourceClient`] covers clusters and cluster-scoped resources,
//! [`StackClient`] covers infrastructure-as-code stacks. Both classify
//! failures into [`ClientErrorKind`] so nothing upstream inspects transport
//! text.

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::model::{ClusterInfo, ObservedResource, ResourceKind, ResourceSpec};
use crate::stack::{StackSpec, StackState, StackSummary};
use crate::types::{ClusterName, ResourceName, StackName};

pub use memory::InMemoryCloud;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClientErrorKind {
    NotFound,
    AlreadyExists,
    Throttled,
    Conflict,
    ServerError,
    Unknown,
}

impl ClientErrorKind {
    /// Worth retrying after a pause.
    pub fn is_transient(self) -> bool {
        matches!(self, Self::Throttled | Self::ServerError)
    }
}

impl fmt::Display for ClientErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotFound => "not found",
            Self::AlreadyExists => "already exists",
            Self::Throttled => "throttled",
            Self::Conflict => "conflict",
            Self::ServerError => "server error",
            Self::Unknown => "unknown error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct ClientError {
    pub kind: ClientErrorKind,
    pub message: String,
}

impl ClientError {
    pub fn new(kind: ClientErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ClientErrorKind::NotFound, message)
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(ClientErrorKind::AlreadyExists, message)
    }

    pub fn throttled(message: impl Into<String>) -> Self {
        Self::new(ClientErrorKind::Throttled, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ClientErrorKind::Conflict, message)
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == ClientErrorKind::NotFound
    }
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Direct API for clusters and cluster-scoped resources.
#[async_trait]
pub trait ResourceClient: Send + Sync {
    async fn create(&self, cluster: &ClusterName, spec: &ResourceSpec) -> ClientResult<()>;

    async fn describe(
        &self,
        cluster: &ClusterName,
        kind: ResourceKind,
        name: &ResourceName,
    ) -> ClientResult<ObservedResource>;

    async fn list(&self, cluster: &ClusterName, kind: ResourceKind)
    -> ClientResult<Vec<ResourceName>>;

    async fn update(&self, cluster: &ClusterName, spec: &ResourceSpec) -> ClientResult<()>;

    async fn delete(
        &self,
        cluster: &ClusterName,
        kind: ResourceKind,
        name: &ResourceName,
    ) -> ClientResult<()>;

    async fn describe_cluster(&self, name: &ClusterName) -> ClientResult<ClusterInfo>;

    async fn list_clusters(&self) -> ClientResult<Vec<ClusterName>>;

    /// Create a cluster outside any stack.
    async fn create_cluster(&self, info: &ClusterInfo) -> ClientResult<()>;

    async fn delete_cluster(&self, name: &ClusterName) -> ClientResult<()>;

    /// Move the control plane to another Kubernetes version in place.
    async fn update_cluster_version(&self, name: &ClusterName, version: &str) -> ClientResult<()>;
}

/// Infrastructure-as-code stack API.
#[async_trait]
pub trait StackClient: Send + Sync {
    async fn create_stack(&self, spec: &StackSpec) -> ClientResult<()>;

    async fn update_stack(&self, spec: &StackSpec) -> ClientResult<()>;

    async fn delete_stack(&self, name: &StackName) -> ClientResult<()>;

    async fn describe_stack(&self, name: &StackName) -> ClientResult<StackState>;

    async fn list_stacks(&self) -> ClientResult<Vec<StackSummary>>;
}
