// Pipeline Graph Module
// Builder, ordering algorithms and the frozen graph

pub mod builder;
pub mod order;
pub mod pipeline;

pub use builder::{PendingStage, PipelineBuilder, StageHandle, DEFAULT_BASE_PATH};
pub use pipeline::{GraphStage, PipelineGraph};
