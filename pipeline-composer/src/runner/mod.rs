// Runner Module
// Executes a compiled manifest against pluggable backends

pub mod cache;
pub mod callable;
pub mod container;
pub mod events;
pub mod executor;
pub mod result;

// Re-export key types
pub use cache::{CacheConfig, CacheError, CacheRecord, ExecutionCache};
pub use callable::{CallableBackend, StageCallable};
pub use container::{ContainerBackend, ContainerConfig, ContainerError, ImagePullPolicy};
pub use events::{progress_channel, EventSender, ProgressReceiver, ProgressSender, RunEvent};
pub use executor::{Runner, RunnerConfig};
pub use result::{RunResult, SkipReason, StageReport, StageStatus};

use crate::compiler::StageExecution;

use std::sync::Arc;

/// What a backend reports after running one stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageOutcome {
    pub success: bool,
    pub failure_reason: Option<String>,
    /// Where the stage's produced data (or its manifest) can be found
    pub produced_manifest_ref: Option<String>,
}

impl StageOutcome {
    pub fn succeeded(produced_manifest_ref: Option<String>) -> Self {
        Self {
            success: true,
            failure_reason: None,
            produced_manifest_ref,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            failure_reason: Some(reason.into()),
            produced_manifest_ref: None,
        }
    }
}

/// Trait for stage execution backends
///
/// Backends must be idempotent with respect to a stage's cache key: running
/// the same execution twice must be safe.
#[async_trait::async_trait]
pub trait Backend: Send + Sync {
    /// Execute one stage and report the outcome
    async fn execute(&self, stage: &StageExecution) -> StageOutcome;
}

#[async_trait::async_trait]
impl<B: Backend + ?Sized> Backend for Arc<B> {
    async fn execute(&self, stage: &StageExecution) -> StageOutcome {
        (**self).execute(stage).await
    }
}

/// Dispatches each stage to a backend by executable kind
#[derive(Debug, Clone, Default)]
pub struct RoutingBackend {
    container: Option<ContainerBackend>,
    callable: Option<CallableBackend>,
}

impl RoutingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route image stages to a container backend
    pub fn with_container_backend(mut self, backend: ContainerBackend) -> Self {
        self.container = Some(backend);
        self
    }

    /// Route callable stages to a callable backend
    pub fn with_callable_backend(mut self, backend: CallableBackend) -> Self {
        self.callable = Some(backend);
        self
    }

    pub fn container(&self) -> Option<&ContainerBackend> {
        self.container.as_ref()
    }

    pub fn callable(&self) -> Option<&CallableBackend> {
        self.callable.as_ref()
    }
}

#[async_trait::async_trait]
impl Backend for RoutingBackend {
    async fn execute(&self, stage: &StageExecution) -> StageOutcome {
        use crate::stage::ExecutableRef;

        match &stage.executable {
            ExecutableRef::Image { .. } => match &self.container {
                Some(backend) => backend.execute(stage).await,
                None => StageOutcome::failed("no container backend configured"),
            },
            ExecutableRef::Callable { .. } => match &self.callable {
                Some(backend) => backend.execute(stage).await,
                None => StageOutcome::failed("no callable backend configured"),
            },
        }
    }
}
