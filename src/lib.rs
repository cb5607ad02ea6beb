// Core modules
pub mod client;
pub mod config;
pub mod context;
pub mod core;
pub mod error;
pub mod model;
pub mod types;

// Stacks, reconciliation and the commands built on them
pub mod orchestrator;
pub mod reconcile;
pub mod stack;

// Re-export key types and functions
pub use client::{InMemoryCloud, ResourceClient, StackClient};
pub use config::{ClusterConfig, Settings, resolve_config_path};
pub use context::CommandContext;
pub use core::{LeafOutcome, RunReport, SkipReason, Task, TaskContext, TaskScheduler};
pub use error::{Error, ErrorKind, Failure, Result};
pub use model::{ResourceKind, ResourceSpec, ResourceStatus};
pub use orchestrator::{ClusterDescriptor, CommandOutcome, Orchestrator, ResourceDescriptor};
pub use reconcile::{Plan, plan};
pub use stack::StackManager;
pub use types::{ClusterName, Region, ResourceName, StackName};
