// Callable Backend
// Runs stages backed by in-process functions

use crate::compiler::StageExecution;
use crate::runner::{Backend, StageOutcome};
use crate::stage::ExecutableRef;

use std::collections::HashMap;
use std::sync::Arc;

/// An in-process stage implementation
///
/// Returns the produced manifest reference on success, or a failure reason.
pub trait StageCallable: Send + Sync {
    fn call(&self, stage: &StageExecution) -> Result<Option<String>, String>;
}

impl<F> StageCallable for F
where
    F: Fn(&StageExecution) -> Result<Option<String>, String> + Send + Sync,
{
    fn call(&self, stage: &StageExecution) -> Result<Option<String>, String> {
        self(stage)
    }
}

/// Registry of named callables for `ExecutableRef::Callable` stages
#[derive(Clone, Default)]
pub struct CallableBackend {
    callables: HashMap<String, Arc<dyn StageCallable>>,
}

impl CallableBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a closure under `name`
    pub fn register<F>(self, name: impl Into<String>, function: F) -> Self
    where
        F: Fn(&StageExecution) -> Result<Option<String>, String> + Send + Sync + 'static,
    {
        self.register_callable(name, function)
    }

    pub fn register_callable(
        mut self,
        name: impl Into<String>,
        callable: impl StageCallable + 'static,
    ) -> Self {
        self.callables.insert(name.into(), Arc::new(callable));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.callables.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.callables.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for CallableBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallableBackend")
            .field("callables", &self.names())
            .finish()
    }
}

#[async_trait::async_trait]
impl Backend for CallableBackend {
    async fn execute(&self, stage: &StageExecution) -> StageOutcome {
        let name = match &stage.executable {
            ExecutableRef::Callable { name } => name,
            other => {
                return StageOutcome::failed(format!(
                    "callable backend cannot run {} executables",
                    other.kind()
                ))
            }
        };

        let Some(callable) = self.callables.get(name) else {
            return StageOutcome::failed(format!("no callable registered under '{}'", name));
        };

        match callable.call(stage) {
            Ok(produced) => StageOutcome::succeeded(produced),
            Err(reason) => StageOutcome::failed(reason),
        }
    }
}
