// Execution Manifest
// Serializable, self-contained execution plan produced by the compiler

use crate::compiler::cache_key::CacheKey;
use crate::schema::Schema;
use crate::stage::{ArgumentValue, ExecutableRef, ResourceRequest};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

pub const MANIFEST_VERSION: u32 = 1;

/// Errors reading or writing a persisted manifest
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("Failed to read or write manifest: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse manifest JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Failed to parse manifest YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Manifest not found at: {0}")]
    NotFound(String),

    #[error("Unsupported manifest version {found}, expected {expected}")]
    UnsupportedVersion { found: u32, expected: u32 },
}

/// Everything a backend needs to run one stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageExecution {
    pub name: String,

    /// Position in the total topological order
    pub position: usize,

    /// Dependency depth; stages on the same level may run concurrently
    pub level: usize,

    pub cache_key: CacheKey,

    pub executable: ExecutableRef,

    /// Resolved arguments, defaults applied
    #[serde(default)]
    pub arguments: BTreeMap<String, ArgumentValue>,

    #[serde(default)]
    pub consumes: Schema,

    #[serde(default)]
    pub produces: Schema,

    /// Direct upstream stage names
    #[serde(default)]
    pub upstreams: Vec<String>,

    /// Consumed subset -> output location of the upstream bound to it
    #[serde(default)]
    pub inputs: IndexMap<String, PathBuf>,

    pub output_path: PathBuf,

    #[serde(default, skip_serializing_if = "ResourceRequest::is_empty")]
    pub resources: ResourceRequest,
}

/// Ordered list of stage executions for one pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionManifest {
    pub version: u32,
    pub pipeline: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub base_path: String,
    /// Stages in topological order
    pub stages: Vec<StageExecution>,
}

/// Stage-level differences between two manifests
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    /// Present in both, with a different cache key
    pub changed: Vec<String>,
    pub unchanged: Vec<String>,
}

impl ManifestDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

impl FromStr for ExecutionManifest {
    type Err = ManifestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_json(s)
    }
}

impl ExecutionManifest {
    pub fn stage(&self, name: &str) -> Option<&StageExecution> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }

    /// Stage name -> cache key
    pub fn cache_keys(&self) -> BTreeMap<&str, &CacheKey> {
        self.stages
            .iter()
            .map(|s| (s.name.as_str(), &s.cache_key))
            .collect()
    }

    /// Stages grouped by level, topological order kept within each group
    ///
    /// Empty levels are left out, so hand-edited level numbers never
    /// produce more groups than there are stages.
    pub fn levels(&self) -> Vec<Vec<&StageExecution>> {
        let mut levels: BTreeMap<usize, Vec<&StageExecution>> = BTreeMap::new();
        for stage in &self.stages {
            levels.entry(stage.level).or_default().push(stage);
        }
        levels.into_values().collect()
    }

    pub fn diff(&self, other: &ExecutionManifest) -> ManifestDiff {
        let mut diff = ManifestDiff::default();

        for stage in &other.stages {
            match self.stage(&stage.name) {
                None => diff.added.push(stage.name.clone()),
                Some(previous) if previous.cache_key != stage.cache_key => {
                    diff.changed.push(stage.name.clone())
                }
                Some(_) => diff.unchanged.push(stage.name.clone()),
            }
        }

        for stage in &self.stages {
            if other.stage(&stage.name).is_none() {
                diff.removed.push(stage.name.clone());
            }
        }

        diff
    }

    pub fn to_json(&self) -> Result<String, ManifestError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn to_yaml(&self) -> Result<String, ManifestError> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn from_json(content: &str) -> Result<Self, ManifestError> {
        let manifest: ExecutionManifest = serde_json::from_str(content)?;
        manifest.check_version()
    }

    pub fn from_yaml(content: &str) -> Result<Self, ManifestError> {
        let manifest: ExecutionManifest = serde_yaml::from_str(content)?;
        manifest.check_version()
    }

    /// Write as YAML for `.yaml`/`.yml` paths, JSON otherwise
    pub fn write_to(&self, path: impl AsRef<Path>) -> Result<(), ManifestError> {
        let path = path.as_ref();
        let content = if is_yaml(path) {
            self.to_yaml()?
        } else {
            self.to_json()?
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, content)?;
        Ok(())
    }

    pub fn read_from(path: impl AsRef<Path>) -> Result<Self, ManifestError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ManifestError::NotFound(path.display().to_string()));
        }

        let content = fs::read_to_string(path)?;
        if is_yaml(path) {
            Self::from_yaml(&content)
        } else {
            Self::from_json(&content)
        }
    }

    fn check_version(self) -> Result<Self, ManifestError> {
        if self.version != MANIFEST_VERSION {
            return Err(ManifestError::UnsupportedVersion {
                found: self.version,
                expected: MANIFEST_VERSION,
            });
        }
        Ok(self)
    }
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("yaml") | Some("yml")
    )
}
