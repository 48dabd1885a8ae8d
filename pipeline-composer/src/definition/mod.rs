// Definition Module
// Declarative YAML surface: component files and pipeline files

pub mod component;
pub mod error;
pub mod pipeline;

pub use component::{default_stage_name, ComponentCatalog, ComponentSpec, ComponentStage, GenericRequirements};
pub use error::{ComponentError, DefinitionError, ParseError, StageEntryError};
pub use pipeline::{After, PipelineDefinition, StageEntry};
