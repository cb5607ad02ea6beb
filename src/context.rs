use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::client::{ResourceClient, StackClient};
use crate::config::Settings;
use crate::core::{TaskContext, TaskScheduler, Waiter};
use crate::stack::StackManager;
use crate::types::{ClusterName, Region};

/// Everything one command needs: the target cluster, the clients, runtime
/// settings and the cancellation token shared by every task it runs.
#[derive(Clone)]
pub struct CommandContext {
    pub id: Uuid,
    pub cluster: ClusterName,
    pub region: Region,
    pub resources: Arc<dyn ResourceClient>,
    pub stacks: Arc<dyn StackClient>,
    pub settings: Settings,
    pub cancel: CancellationToken,
}

impl CommandContext {
    pub fn new(
        cluster: ClusterName,
        region: Region,
        resources: Arc<dyn ResourceClient>,
        stacks: Arc<dyn StackClient>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            cluster,
            region,
            resources,
            stacks,
            settings: Settings::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Fresh per-run state: new run id and an empty output store.
    pub fn task_context(&self) -> TaskContext {
        TaskContext::new(self.cancel.clone())
    }

    pub fn stack_manager(&self) -> StackManager {
        StackManager::new(self.stacks.clone(), self.settings.stack_wait())
    }

    /// Waiter for direct resource operations.
    pub fn waiter(&self) -> Waiter {
        Waiter::new(self.settings.resource_wait(), self.cancel.clone())
    }

    pub fn scheduler(&self) -> TaskScheduler {
        TaskScheduler::new(self.settings.max_in_flight)
    }
}

impl std::fmt::Debug for CommandContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandContext")
            .field("id", &self.id)
            .field("cluster", &self.cluster)
            .field("region", &self.region)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}
