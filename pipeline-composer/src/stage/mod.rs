// Stage Module
// Stage contracts, arguments, resources and generic templates

pub mod arguments;
pub mod descriptor;
pub mod generic;
pub mod resources;

pub use arguments::{resolve_arguments, ArgumentSpec, ArgumentType, ArgumentValue};
pub use descriptor::{ExecutableRef, StageDescriptor, StageDescriptorBuilder};
pub use generic::{Capability, GenericStage};
pub use resources::{parse_byte_size, ResourceRequest};
