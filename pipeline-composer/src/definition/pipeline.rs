// Pipeline Definitions
// YAML pipeline files turned into a PipelineBuilder

use crate::definition::component::{default_stage_name, ComponentCatalog, ComponentStage};
use crate::definition::error::{DefinitionError, ParseError, StageEntryError};
use crate::error::SchemaError;
use crate::graph::{PipelineBuilder, DEFAULT_BASE_PATH};
use crate::schema::Schema;
use crate::stage::{ArgumentValue, ResourceRequest, StageDescriptor};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// A pipeline file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "default_base_path")]
    pub base_path: String,
    #[serde(default)]
    pub stages: Vec<StageEntry>,
}

fn default_base_path() -> String {
    DEFAULT_BASE_PATH.to_string()
}

/// One stage of a pipeline file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageEntry {
    /// Defaults to the last segment of `component`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub component: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub arguments: BTreeMap<String, ArgumentValue>,
    /// Upstream stages; absent means the previous stage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<After>,
    /// Schema overrides, generic components only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumes: Option<Schema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub produces: Option<Schema>,
    /// Replaces the component's resource request entirely
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequest>,
}

/// `after: name` or `after: [a, b]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum After {
    Single(String),
    Multiple(Vec<String>),
}

impl After {
    pub fn as_vec(&self) -> Vec<String> {
        match self {
            After::Single(name) => vec![name.clone()],
            After::Multiple(names) => names.clone(),
        }
    }
}

impl StageEntry {
    pub fn stage_name(&self) -> &str {
        self.name
            .as_deref()
            .unwrap_or_else(|| default_stage_name(&self.component))
    }

    fn build(
        &self,
        catalog: &mut ComponentCatalog,
        base_dir: Option<&Path>,
    ) -> Result<StageDescriptor, StageEntryError> {
        let name = self.stage_name();
        let spec = catalog
            .resolve(&self.component, base_dir)
            .map_err(|source| StageEntryError::Component {
                stage: name.to_string(),
                source,
            })?;
        let component = spec.to_stage(name).map_err(|source| StageEntryError::Component {
            stage: name.to_string(),
            source,
        })?;

        let bound = match component {
            ComponentStage::Concrete(descriptor) => {
                if self.consumes.is_some() || self.produces.is_some() {
                    Err(SchemaError::NotGeneric {
                        stage: name.to_string(),
                    })
                } else {
                    Ok(descriptor)
                }
            }
            ComponentStage::Generic {
                template,
                consumes,
                produces,
            } => template.instantiate_as(
                name,
                self.consumes.clone().unwrap_or(consumes),
                self.produces.clone().unwrap_or(produces),
            ),
        };

        let mut descriptor = bound.map_err(|e| StageEntryError::Build {
            stage: name.to_string(),
            source: e.into(),
        })?;

        descriptor = descriptor.with_arguments(self.arguments.clone());
        if let Some(resources) = &self.resources {
            descriptor = descriptor.with_resources(resources.clone());
        }
        Ok(descriptor)
    }
}

impl PipelineDefinition {
    pub fn parse(content: &str) -> Result<Self, ParseError> {
        serde_yaml::from_str(content).map_err(|e| ParseError::from_yaml_error(&e, content))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, DefinitionError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| DefinitionError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::parse(&content)?)
    }

    /// Upstream names for each entry, applying the previous-stage default
    pub fn upstreams(&self) -> Vec<(String, Vec<String>)> {
        let mut previous: Option<&str> = None;
        self.stages
            .iter()
            .map(|entry| {
                let after = match &entry.after {
                    Some(after) => after.as_vec(),
                    None => previous.map(|p| vec![p.to_string()]).unwrap_or_default(),
                };
                previous = Some(entry.stage_name());
                (entry.stage_name().to_string(), after)
            })
            .collect()
    }

    /// Resolve every component and declare every stage
    ///
    /// All per-stage problems are collected. Graph-level checks (schemas,
    /// cycles, arguments) happen when the returned builder is finalized.
    pub fn into_builder(
        &self,
        catalog: &mut ComponentCatalog,
        base_dir: Option<&Path>,
    ) -> Result<PipelineBuilder, DefinitionError> {
        let mut builder = PipelineBuilder::new(&self.name).with_base_path(&self.base_path);
        if let Some(description) = &self.description {
            builder = builder.with_description(description);
        }

        let mut errors = Vec::new();
        for (entry, (name, after)) in self.stages.iter().zip(self.upstreams()) {
            let descriptor = match entry.build(catalog, base_dir) {
                Ok(descriptor) => descriptor,
                Err(e) => {
                    errors.push(e);
                    continue;
                }
            };

            let after: Vec<&str> = after.iter().map(String::as_str).collect();
            if let Err(e) = builder.declare(descriptor, &after) {
                errors.push(StageEntryError::Build {
                    stage: name,
                    source: e,
                });
            }
        }

        if !errors.is_empty() {
            tracing::warn!(pipeline = %self.name, errors = errors.len(), "pipeline definition rejected");
            return Err(DefinitionError::Stages(errors));
        }

        tracing::debug!(pipeline = %self.name, stages = builder.len(), "pipeline definition loaded");
        Ok(builder)
    }

    /// Read a pipeline file and declare its stages
    ///
    /// Component paths resolve relative to the file's directory.
    pub fn load(
        path: impl AsRef<Path>,
        catalog: &mut ComponentCatalog,
    ) -> Result<PipelineBuilder, DefinitionError> {
        let path = path.as_ref();
        let definition = Self::from_file(path)?;
        definition.into_builder(catalog, path.parent())
    }
}

impl std::str::FromStr for PipelineDefinition {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
