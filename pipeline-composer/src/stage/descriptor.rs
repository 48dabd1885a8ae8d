// Stage Descriptor
// Immutable contract of one pipeline stage

use crate::schema::Schema;
use crate::stage::arguments::{ArgumentSpec, ArgumentValue};
use crate::stage::resources::ResourceRequest;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Opaque reference to the code a stage runs
///
/// The composer never looks behind it; backends decide how to run it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutableRef {
    /// Container image reference
    Image { image: String },
    /// Name of an in-process callable registered with a backend
    Callable { name: String },
}

impl ExecutableRef {
    pub fn image(image: impl Into<String>) -> Self {
        ExecutableRef::Image {
            image: image.into(),
        }
    }

    pub fn callable(name: impl Into<String>) -> Self {
        ExecutableRef::Callable { name: name.into() }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ExecutableRef::Image { .. } => "image",
            ExecutableRef::Callable { .. } => "callable",
        }
    }

    /// Stable textual identity used in cache keys
    pub fn fingerprint(&self) -> String {
        match self {
            ExecutableRef::Image { image } => format!("image:{}", image),
            ExecutableRef::Callable { name } => format!("callable:{}", name),
        }
    }
}

impl fmt::Display for ExecutableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.fingerprint())
    }
}

/// One stage's declared contract: schemas, arguments, resources, executable
#[derive(Debug, Clone, PartialEq)]
pub struct StageDescriptor {
    name: String,
    consumes: Schema,
    produces: Schema,
    arguments: IndexMap<String, ArgumentSpec>,
    values: BTreeMap<String, ArgumentValue>,
    resources: ResourceRequest,
    executable: ExecutableRef,
    template: Option<String>,
}

impl StageDescriptor {
    pub fn builder(name: impl Into<String>, executable: ExecutableRef) -> StageDescriptorBuilder {
        StageDescriptorBuilder {
            descriptor: StageDescriptor {
                name: name.into(),
                consumes: Schema::new(),
                produces: Schema::new(),
                arguments: IndexMap::new(),
                values: BTreeMap::new(),
                resources: ResourceRequest::default(),
                executable,
                template: None,
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn consumes(&self) -> &Schema {
        &self.consumes
    }

    pub fn produces(&self) -> &Schema {
        &self.produces
    }

    /// Declared argument schema
    pub fn argument_specs(&self) -> &IndexMap<String, ArgumentSpec> {
        &self.arguments
    }

    /// Argument values as supplied, before defaults are applied
    pub fn argument_values(&self) -> &BTreeMap<String, ArgumentValue> {
        &self.values
    }

    pub fn resources(&self) -> &ResourceRequest {
        &self.resources
    }

    pub fn executable(&self) -> &ExecutableRef {
        &self.executable
    }

    /// Name of the generic template this stage was instantiated from
    pub fn template(&self) -> Option<&str> {
        self.template.as_deref()
    }

    pub fn is_source(&self) -> bool {
        self.consumes.is_empty()
    }

    /// Supply argument values, replacing any given earlier under the same name
    pub fn with_arguments<I, K, V>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<ArgumentValue>,
    {
        for (name, value) in values {
            self.values.insert(name.into(), value.into());
        }
        self
    }

    pub fn with_argument(mut self, name: impl Into<String>, value: impl Into<ArgumentValue>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    /// Replace the resource request wholesale
    pub fn with_resources(mut self, resources: ResourceRequest) -> Self {
        self.resources = resources;
        self
    }

    pub(crate) fn from_template(
        template: &str,
        name: String,
        executable: ExecutableRef,
        consumes: Schema,
        produces: Schema,
        arguments: IndexMap<String, ArgumentSpec>,
        resources: ResourceRequest,
    ) -> Self {
        Self {
            name,
            consumes,
            produces,
            arguments,
            values: BTreeMap::new(),
            resources,
            executable,
            template: Some(template.to_string()),
        }
    }
}

/// Builder for [`StageDescriptor`]
#[derive(Debug, Clone)]
pub struct StageDescriptorBuilder {
    descriptor: StageDescriptor,
}

impl StageDescriptorBuilder {
    pub fn consumes(mut self, schema: Schema) -> Self {
        self.descriptor.consumes = schema;
        self
    }

    pub fn produces(mut self, schema: Schema) -> Self {
        self.descriptor.produces = schema;
        self
    }

    pub fn argument(mut self, name: impl Into<String>, spec: ArgumentSpec) -> Self {
        self.descriptor.arguments.insert(name.into(), spec);
        self
    }

    pub fn arguments(mut self, specs: IndexMap<String, ArgumentSpec>) -> Self {
        self.descriptor.arguments.extend(specs);
        self
    }

    pub fn value(mut self, name: impl Into<String>, value: impl Into<ArgumentValue>) -> Self {
        self.descriptor.values.insert(name.into(), value.into());
        self
    }

    pub fn resources(mut self, resources: ResourceRequest) -> Self {
        self.descriptor.resources = resources;
        self
    }

    pub fn build(self) -> StageDescriptor {
        self.descriptor
    }
}
