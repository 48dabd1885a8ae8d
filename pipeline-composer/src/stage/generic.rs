// Generic Stages
// Schema-less stage templates that are bound to concrete schemas once

use crate::error::SchemaError;
use crate::schema::{FieldType, Schema};
use crate::stage::arguments::ArgumentSpec;
use crate::stage::descriptor::{ExecutableRef, StageDescriptor};
use crate::stage::resources::ResourceRequest;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Minimum requirement a schema override must meet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Capability {
    /// A subset with this name must be present
    Subset { name: String },
    /// A specific field with a specific type must be present
    Field {
        subset: String,
        name: String,
        #[serde(rename = "type")]
        field_type: FieldType,
    },
    /// At least `count` fields of this type, in any subsets
    AtLeast {
        #[serde(rename = "type")]
        field_type: FieldType,
        count: usize,
    },
    /// The schema must declare at least one subset
    NonEmpty,
}

impl Capability {
    pub fn is_met_by(&self, schema: &Schema) -> bool {
        match self {
            Capability::Subset { name } => schema.contains_subset(name),
            Capability::Field {
                subset,
                name,
                field_type,
            } => schema
                .subset(subset)
                .and_then(|s| s.get(name))
                .map(|ty| ty == field_type)
                .unwrap_or(false),
            Capability::AtLeast { field_type, count } => {
                schema
                    .fields()
                    .filter(|(_, _, ty)| *ty == field_type)
                    .count()
                    >= *count
            }
            Capability::NonEmpty => !schema.is_empty(),
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Subset { name } => write!(f, "subset '{}'", name),
            Capability::Field {
                subset,
                name,
                field_type,
            } => write!(f, "field {}.{} ({})", subset, name, field_type),
            Capability::AtLeast { field_type, count } => {
                write!(f, "at least {} {} field(s)", count, field_type)
            }
            Capability::NonEmpty => write!(f, "at least one subset"),
        }
    }
}

/// Reusable stage template without a fixed schema
///
/// Each call to [`GenericStage::instantiate`] produces an independent
/// [`StageDescriptor`]; the descriptor itself can never be overridden again.
#[derive(Debug, Clone, PartialEq)]
pub struct GenericStage {
    name: String,
    executable: ExecutableRef,
    arguments: IndexMap<String, ArgumentSpec>,
    resources: ResourceRequest,
    consumes_requires: Vec<Capability>,
    produces_requires: Vec<Capability>,
}

impl GenericStage {
    pub fn new(name: impl Into<String>, executable: ExecutableRef) -> Self {
        Self {
            name: name.into(),
            executable,
            arguments: IndexMap::new(),
            resources: ResourceRequest::default(),
            consumes_requires: Vec::new(),
            produces_requires: Vec::new(),
        }
    }

    pub fn argument(mut self, name: impl Into<String>, spec: ArgumentSpec) -> Self {
        self.arguments.insert(name.into(), spec);
        self
    }

    pub fn arguments(mut self, specs: IndexMap<String, ArgumentSpec>) -> Self {
        self.arguments.extend(specs);
        self
    }

    /// Default resource request for every instance
    pub fn resources(mut self, resources: ResourceRequest) -> Self {
        self.resources = resources;
        self
    }

    pub fn requires_consumes(mut self, capability: Capability) -> Self {
        self.consumes_requires.push(capability);
        self
    }

    pub fn requires_produces(mut self, capability: Capability) -> Self {
        self.produces_requires.push(capability);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn executable(&self) -> &ExecutableRef {
        &self.executable
    }

    pub fn consumes_requirements(&self) -> &[Capability] {
        &self.consumes_requires
    }

    pub fn produces_requirements(&self) -> &[Capability] {
        &self.produces_requires
    }

    /// Bind the template to concrete schemas under the template's own name
    pub fn instantiate(
        &self,
        consumes: Schema,
        produces: Schema,
    ) -> Result<StageDescriptor, SchemaError> {
        self.instantiate_as(self.name.clone(), consumes, produces)
    }

    /// Bind the template under a new stage name, for reuse within one pipeline
    pub fn instantiate_as(
        &self,
        name: impl Into<String>,
        consumes: Schema,
        produces: Schema,
    ) -> Result<StageDescriptor, SchemaError> {
        let name = name.into();

        let mut unmet: Vec<String> = self
            .consumes_requires
            .iter()
            .filter(|c| !c.is_met_by(&consumes))
            .map(|c| format!("consumes needs {}", c))
            .collect();
        unmet.extend(
            self.produces_requires
                .iter()
                .filter(|c| !c.is_met_by(&produces))
                .map(|c| format!("produces needs {}", c)),
        );

        if !unmet.is_empty() {
            return Err(SchemaError::UnsatisfiedCapabilities { stage: name, unmet });
        }

        Ok(StageDescriptor::from_template(
            &self.name,
            name,
            self.executable.clone(),
            consumes,
            produces,
            self.arguments.clone(),
            self.resources.clone(),
        ))
    }
}
