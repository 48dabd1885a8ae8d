// Schema Module
// Dataset field types and subset-compatibility checks

pub mod registry;
pub mod types;

pub use registry::{check_subset, is_subset, union_of, SchemaMismatch, SchemaUnion};
pub use types::{Field, FieldType, Schema, Subset};
