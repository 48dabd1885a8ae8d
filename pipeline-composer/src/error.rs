// Error Types
// Build-time error taxonomy for pipeline construction and validation

use crate::schema::{FieldType, SchemaMismatch};
use crate::stage::ArgumentType;

use std::fmt;
use thiserror::Error;

/// Incompatible, missing or conflicting fields and subsets
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SchemaError {
    #[error("stage '{stage}' consumes data its upstreams do not produce: {}", join(.mismatches))]
    Incompatible {
        stage: String,
        mismatches: Vec<SchemaMismatch>,
    },

    #[error("source stage '{stage}' must not consume anything, but consumes: {}", .subsets.join(", "))]
    SourceConsumes { stage: String, subsets: Vec<String> },

    #[error("stage '{stage}' has upstream stages but does not consume any subset")]
    DependentWithoutConsumes { stage: String },

    #[error(
        "stage '{stage}' consumes subset '{subset}', which is produced by more than one upstream: {}",
        .providers.join(", ")
    )]
    AmbiguousSubset {
        stage: String,
        subset: String,
        providers: Vec<String>,
    },

    #[error("field '{subset}.{field}' is already defined as {existing}, cannot redefine it as {requested}")]
    FieldRedefined {
        subset: String,
        field: String,
        existing: FieldType,
        requested: FieldType,
    },

    #[error("schema override for generic stage '{stage}' is insufficient: {}", .unmet.join("; "))]
    UnsatisfiedCapabilities { stage: String, unmet: Vec<String> },

    #[error("stage '{stage}' is not generic; its consumes/produces cannot be overridden")]
    NotGeneric { stage: String },
}

impl SchemaError {
    /// Names of the fields reported missing, as `subset.field`
    pub fn missing_fields(&self) -> Vec<String> {
        match self {
            SchemaError::Incompatible { mismatches, .. } => mismatches
                .iter()
                .filter(|m| m.actual().is_none())
                .map(|m| match m.field() {
                    Some(field) => format!("{}.{}", m.subset(), field),
                    None => m.subset().to_string(),
                })
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// The graph has no valid topological order
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("circular dependency detected: {}", .cycle.join(" -> "))]
pub struct CycleError {
    /// Stage names along the cycle; the first name is repeated at the end
    pub cycle: Vec<String>,
}

/// Missing, unknown or mistyped stage argument
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ArgumentError {
    #[error("stage '{stage}' is missing required argument '{argument}'")]
    Missing { stage: String, argument: String },

    #[error("stage '{stage}' has unknown argument '{argument}' (known: {})", .known.join(", "))]
    Unknown {
        stage: String,
        argument: String,
        known: Vec<String>,
    },

    #[error("stage '{stage}' argument '{argument}' expects {expected}, got {actual}")]
    TypeMismatch {
        stage: String,
        argument: String,
        expected: ArgumentType,
        actual: String,
    },

    #[error("stage '{stage}' declares a default for '{argument}' that is not a {expected} (got {actual})")]
    InvalidDefault {
        stage: String,
        argument: String,
        expected: ArgumentType,
        actual: String,
    },

    #[error("stage '{stage}' argument '{argument}' is required and cannot be null")]
    NullNotAllowed { stage: String, argument: String },

    #[error("stage '{stage}' argument '{argument}' contains a non-finite number")]
    NonFinite { stage: String, argument: String },
}

/// Invalid accelerator or memory request
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResourceError {
    #[error("stage '{stage}' requests {count} accelerator(s) without naming an accelerator kind")]
    MissingAcceleratorKind { stage: String, count: u32 },

    #[error("stage '{stage}' has an empty accelerator kind")]
    EmptyAcceleratorKind { stage: String },

    #[error("stage '{stage}' has an invalid memory limit '{value}': {reason}")]
    InvalidMemoryLimit {
        stage: String,
        value: String,
        reason: String,
    },
}

/// Mutation attempted after `finalize()`
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("pipeline graph is frozen; cannot {operation} after finalize")]
pub struct FrozenGraphError {
    pub operation: &'static str,
}

/// Any error raised while building or validating a pipeline graph
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BuildError {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Cycle(#[from] CycleError),

    #[error(transparent)]
    Argument(#[from] ArgumentError),

    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error(transparent)]
    Frozen(#[from] FrozenGraphError),

    #[error("a stage named '{0}' already exists in this pipeline")]
    DuplicateStage(String),

    #[error("stage handle #{0} does not belong to this pipeline")]
    UnknownStage(usize),

    #[error("stage '{stage}' depends on unknown stage '{upstream}'")]
    UnknownUpstream { stage: String, upstream: String },

    #[error("stage '{0}' was added as a dependent but no upstream stage was given")]
    NoUpstreams(String),

    #[error("replacement stage is named '{found}', expected '{expected}'")]
    NameMismatch { expected: String, found: String },
}

/// Every build-time problem found in one validation pass
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ValidationErrors(Vec<BuildError>);

impl ValidationErrors {
    pub fn new(errors: Vec<BuildError>) -> Self {
        Self(errors)
    }

    pub fn single(error: impl Into<BuildError>) -> Self {
        Self(vec![error.into()])
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, BuildError> {
        self.0.iter()
    }

    pub fn into_inner(self) -> Vec<BuildError> {
        self.0
    }

    pub fn schema_errors(&self) -> impl Iterator<Item = &SchemaError> {
        self.0.iter().filter_map(|e| match e {
            BuildError::Schema(err) => Some(err),
            _ => None,
        })
    }

    pub fn cycle_errors(&self) -> impl Iterator<Item = &CycleError> {
        self.0.iter().filter_map(|e| match e {
            BuildError::Cycle(err) => Some(err),
            _ => None,
        })
    }

    pub fn argument_errors(&self) -> impl Iterator<Item = &ArgumentError> {
        self.0.iter().filter_map(|e| match e {
            BuildError::Argument(err) => Some(err),
            _ => None,
        })
    }

    pub fn resource_errors(&self) -> impl Iterator<Item = &ResourceError> {
        self.0.iter().filter_map(|e| match e {
            BuildError::Resource(err) => Some(err),
            _ => None,
        })
    }

    pub fn has_cycle(&self) -> bool {
        self.cycle_errors().next().is_some()
    }

    pub fn is_frozen(&self) -> bool {
        self.0.iter().any(|e| matches!(e, BuildError::Frozen(_)))
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} validation error(s)", self.0.len())?;
        for error in &self.0 {
            write!(f, "\n  - {}", error)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationErrors {}

impl IntoIterator for ValidationErrors {
    type Item = BuildError;
    type IntoIter = std::vec::IntoIter<BuildError>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a ValidationErrors {
    type Item = &'a BuildError;
    type IntoIter = std::slice::Iter<'a, BuildError>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl From<BuildError> for ValidationErrors {
    fn from(error: BuildError) -> Self {
        Self(vec![error])
    }
}

fn join<T: fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(|item| item.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
