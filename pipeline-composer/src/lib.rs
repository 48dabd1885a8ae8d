// Pipeline Composer Library
// Declarative DAG composition of dataset stages: schema negotiation,
// validation, compilation to a manifest, and cached concurrent execution

pub mod compiler;
pub mod definition;
pub mod error;
pub mod graph;
pub mod runner;
pub mod schema;
pub mod stage;
pub mod validation;

// Re-export error types
pub use error::{
    ArgumentError, BuildError, CycleError, FrozenGraphError, ResourceError, SchemaError,
    ValidationErrors,
};

// Re-export schema types
pub use schema::{check_subset, is_subset, union_of, Field, FieldType, Schema, SchemaMismatch, Subset};

// Re-export stage types
pub use stage::{
    ArgumentSpec, ArgumentType, ArgumentValue, Capability, ExecutableRef, GenericStage,
    ResourceRequest, StageDescriptor,
};

// Re-export graph types
pub use graph::{GraphStage, PipelineBuilder, PipelineGraph, StageHandle};

// Re-export compiler types
pub use compiler::{compile, CacheKey, ExecutionManifest, ManifestDiff, ManifestError, StageExecution};

// Re-export runner types
pub use runner::{
    progress_channel, Backend, CallableBackend, ContainerBackend, ExecutionCache, RoutingBackend,
    RunEvent, RunResult, Runner, RunnerConfig, SkipReason, StageOutcome, StageStatus,
};

// Re-export definition types
pub use definition::{ComponentCatalog, ComponentSpec, DefinitionError, PipelineDefinition};
