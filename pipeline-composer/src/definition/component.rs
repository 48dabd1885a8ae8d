// Components
// Reusable stage definitions loaded from component.yaml files

use crate::definition::error::{ComponentError, ParseError};
use crate::schema::Schema;
use crate::stage::{ArgumentSpec, Capability, ExecutableRef, GenericStage, ResourceRequest, StageDescriptor};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Contents of a `component.yaml`
///
/// ```yaml
/// name: caption_images
/// image: ghcr.io/ml-foundations/caption_images:latest
/// consumes:
///   images: { data: binary }
/// produces:
///   captions: { text: string }
/// args:
///   model_id: { type: str, default: Salesforce/blip-image-captioning-base }
///   batch_size: { type: int, default: 8 }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ComponentSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callable: Option<String>,
    #[serde(default)]
    pub consumes: Schema,
    #[serde(default)]
    pub produces: Schema,
    #[serde(default)]
    pub args: IndexMap<String, ArgumentSpec>,
    #[serde(default, skip_serializing_if = "ResourceRequest::is_empty")]
    pub resources: ResourceRequest,
    /// Present on components whose schemas are chosen per pipeline
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generic: Option<GenericRequirements>,
}

/// Capabilities a generic component's schema overrides must provide
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GenericRequirements {
    #[serde(default)]
    pub consumes: Vec<Capability>,
    #[serde(default)]
    pub produces: Vec<Capability>,
}

/// A component turned into something a pipeline can place
#[derive(Debug, Clone)]
pub enum ComponentStage {
    Concrete(StageDescriptor),
    /// Template plus the component's declared schemas, used when a stage
    /// entry gives no override
    Generic {
        template: GenericStage,
        consumes: Schema,
        produces: Schema,
    },
}

impl ComponentSpec {
    pub fn from_yaml(content: &str) -> Result<Self, ParseError> {
        serde_yaml::from_str(content).map_err(|e| ParseError::from_yaml_error(&e, content))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ComponentError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content).map_err(|source| ComponentError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn is_generic(&self) -> bool {
        self.generic.is_some()
    }

    pub fn executable(&self) -> Result<ExecutableRef, ComponentError> {
        match (&self.image, &self.callable) {
            (Some(image), None) => Ok(ExecutableRef::image(image)),
            (None, Some(callable)) => Ok(ExecutableRef::callable(callable)),
            _ => Err(ComponentError::InvalidExecutable(self.name.clone())),
        }
    }

    /// Build the stage this component describes, named `stage_name`
    pub fn to_stage(&self, stage_name: &str) -> Result<ComponentStage, ComponentError> {
        let executable = self.executable()?;

        match &self.generic {
            Some(requirements) => {
                let template = requirements.consumes.iter().cloned().fold(
                    GenericStage::new(&self.name, executable)
                        .arguments(self.args.clone())
                        .resources(self.resources.clone()),
                    GenericStage::requires_consumes,
                );
                let template = requirements
                    .produces
                    .iter()
                    .cloned()
                    .fold(template, GenericStage::requires_produces);

                Ok(ComponentStage::Generic {
                    template,
                    consumes: self.consumes.clone(),
                    produces: self.produces.clone(),
                })
            }
            None => Ok(ComponentStage::Concrete(
                StageDescriptor::builder(stage_name, executable)
                    .consumes(self.consumes.clone())
                    .produces(self.produces.clone())
                    .arguments(self.args.clone())
                    .resources(self.resources.clone())
                    .build(),
            )),
        }
    }
}

/// Where component definitions come from
///
/// Registered specs win over files. Files are looked up as
/// `{dir}/{component}/component.yaml`, then `{dir}/{component}.yaml`, for each
/// search directory in order. References containing `/` are paths relative
/// to the definition being loaded.
#[derive(Debug, Clone, Default)]
pub struct ComponentCatalog {
    components: HashMap<String, ComponentSpec>,
    search_dirs: Vec<PathBuf>,
    loaded: HashMap<PathBuf, ComponentSpec>,
}

impl ComponentCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_search_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.search_dirs.push(dir.into());
        self
    }

    /// Register a spec under its own name
    pub fn register(&mut self, spec: ComponentSpec) {
        self.components.insert(spec.name.clone(), spec);
    }

    pub fn with_component(mut self, spec: ComponentSpec) -> Self {
        self.register(spec);
        self
    }

    pub fn get(&self, name: &str) -> Option<&ComponentSpec> {
        self.components.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.components.contains_key(name)
    }

    pub fn search_dirs(&self) -> &[PathBuf] {
        &self.search_dirs
    }

    /// Find the spec for `reference`; files are parsed once and then reused
    pub fn resolve(
        &mut self,
        reference: &str,
        relative_to: Option<&Path>,
    ) -> Result<ComponentSpec, ComponentError> {
        if let Some(spec) = self.components.get(reference) {
            return Ok(spec.clone());
        }

        let candidates = self.candidates(reference, relative_to);
        for path in &candidates {
            if let Some(spec) = self.loaded.get(path) {
                return Ok(spec.clone());
            }
            if path.is_file() {
                tracing::debug!(component = %reference, path = %path.display(), "loading component");
                let spec = ComponentSpec::from_file(path)?;
                self.loaded.insert(path.clone(), spec.clone());
                return Ok(spec);
            }
        }

        Err(ComponentError::NotFound {
            reference: reference.to_string(),
            searched: candidates,
        })
    }

    fn candidates(&self, reference: &str, relative_to: Option<&Path>) -> Vec<PathBuf> {
        let files_in = |base: PathBuf| {
            if is_yaml(&base) {
                vec![base]
            } else {
                vec![base.join("component.yaml"), base.with_extension("yaml")]
            }
        };

        if reference.contains('/') {
            let path = Path::new(reference);
            let base = match relative_to {
                Some(dir) if path.is_relative() => dir.join(path),
                _ => path.to_path_buf(),
            };
            return files_in(base);
        }

        self.search_dirs
            .iter()
            .flat_map(|dir| files_in(dir.join(reference)))
            .collect()
    }
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}

/// Stage name implied by a component reference: its last path segment
pub fn default_stage_name(reference: &str) -> &str {
    let last = reference
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(reference);
    last.strip_suffix(".yaml")
        .or_else(|| last.strip_suffix(".yml"))
        .unwrap_or(last)
}
