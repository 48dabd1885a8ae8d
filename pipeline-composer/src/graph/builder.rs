// Pipeline Builder
// Mutable construction phase of a pipeline graph

use crate::error::{BuildError, CycleError, FrozenGraphError, SchemaError, ValidationErrors};
use crate::graph::order;
use crate::graph::pipeline::{GraphStage, PipelineGraph};
use crate::stage::StageDescriptor;
use crate::validation::{check_stage_schema, Validator};

use std::collections::HashMap;

/// Default root for stage outputs
pub const DEFAULT_BASE_PATH: &str = "./data_dir";

/// Reference to a stage added to a [`PipelineBuilder`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StageHandle(usize);

impl StageHandle {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// A stage with its not-yet-resolved upstream names
#[derive(Debug, Clone, PartialEq)]
pub struct PendingStage {
    descriptor: StageDescriptor,
    after: Vec<String>,
}

impl PendingStage {
    pub fn new(descriptor: StageDescriptor, after: Vec<String>) -> Self {
        Self { descriptor, after }
    }

    pub fn descriptor(&self) -> &StageDescriptor {
        &self.descriptor
    }

    /// Upstream stage names in edge-declaration order
    pub fn after(&self) -> &[String] {
        &self.after
    }
}

/// Builds a pipeline stage by stage, then freezes it with [`finalize`](Self::finalize)
#[derive(Debug, Clone)]
pub struct PipelineBuilder {
    name: String,
    description: Option<String>,
    base_path: String,
    stages: Vec<PendingStage>,
    indices: HashMap<String, usize>,
    frozen: bool,
}

impl PipelineBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            base_path: DEFAULT_BASE_PATH.to_string(),
            stages: Vec::new(),
            indices: HashMap::new(),
            frozen: false,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_base_path(mut self, base_path: impl Into<String>) -> Self {
        self.base_path = base_path.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn handle(&self, name: &str) -> Option<StageHandle> {
        self.indices.get(name).map(|&i| StageHandle(i))
    }

    pub fn stage(&self, handle: StageHandle) -> Option<&StageDescriptor> {
        self.stages.get(handle.0).map(PendingStage::descriptor)
    }

    /// Current upstream names of a stage
    pub fn upstreams(&self, handle: StageHandle) -> Option<&[String]> {
        self.stages.get(handle.0).map(PendingStage::after)
    }

    /// Add a stage without upstreams; it must not consume anything
    pub fn add_source(&mut self, stage: StageDescriptor) -> Result<StageHandle, BuildError> {
        self.ensure_mutable("add a stage")?;
        self.ensure_unique(stage.name())?;

        if !stage.consumes().is_empty() {
            return Err(SchemaError::SourceConsumes {
                stage: stage.name().to_string(),
                subsets: stage.consumes().subset_names(),
            }
            .into());
        }

        Ok(self.push(stage, Vec::new()))
    }

    /// Add a stage fed by `upstreams`, checking its consumed schema right away
    ///
    /// Ambiguous providers of a consumed subset are reported by `finalize`.
    pub fn add_dependent(
        &mut self,
        stage: StageDescriptor,
        upstreams: &[StageHandle],
    ) -> Result<StageHandle, BuildError> {
        self.ensure_mutable("add a stage")?;
        self.ensure_unique(stage.name())?;

        if upstreams.is_empty() {
            return Err(BuildError::NoUpstreams(stage.name().to_string()));
        }

        let after = self.upstream_names(upstreams)?;
        self.check_schema(&stage, &after)?;

        Ok(self.push(stage, after))
    }

    /// Add a stage by upstream names, which may refer to stages declared later
    ///
    /// Nothing is checked until `finalize`.
    pub fn declare(&mut self, stage: StageDescriptor, after: &[&str]) -> Result<StageHandle, BuildError> {
        self.ensure_mutable("declare a stage")?;
        self.ensure_unique(stage.name())?;
        let after = after.iter().map(|name| name.to_string()).collect();
        Ok(self.push(stage, after))
    }

    /// Replace the upstreams of an existing stage
    ///
    /// On error the builder is left unchanged.
    pub fn reattach(&mut self, handle: StageHandle, upstreams: &[StageHandle]) -> Result<(), BuildError> {
        self.ensure_mutable("reattach a stage")?;
        let target = self.pending(handle)?;
        let after = self.upstream_names(upstreams)?;

        let mut graph: Vec<Vec<usize>> = self
            .stages
            .iter()
            .map(|s| {
                s.after
                    .iter()
                    .filter_map(|name| self.indices.get(name).copied())
                    .collect()
            })
            .collect();
        graph[handle.0] = upstreams.iter().map(|h| h.0).collect();

        if let Some(cycle) = order::find_cycle(&graph) {
            return Err(CycleError {
                cycle: cycle
                    .into_iter()
                    .map(|i| self.stages[i].descriptor.name().to_string())
                    .collect(),
            }
            .into());
        }

        self.check_schema(&target.descriptor, &after)?;

        self.stages[handle.0].after = after;
        Ok(())
    }

    /// Swap in a new descriptor under the same name, keeping its upstreams
    pub fn replace(&mut self, handle: StageHandle, stage: StageDescriptor) -> Result<(), BuildError> {
        self.ensure_mutable("replace a stage")?;
        let existing = self.pending(handle)?;

        if existing.descriptor.name() != stage.name() {
            return Err(BuildError::NameMismatch {
                expected: existing.descriptor.name().to_string(),
                found: stage.name().to_string(),
            });
        }

        self.stages[handle.0].descriptor = stage;
        Ok(())
    }

    /// Validate the whole graph and freeze it
    ///
    /// On failure every problem is returned and the builder is untouched, so
    /// it can be fixed and finalized again. On success the builder is frozen.
    pub fn finalize(&mut self) -> Result<PipelineGraph, ValidationErrors> {
        if self.frozen {
            return Err(ValidationErrors::single(FrozenGraphError {
                operation: "finalize",
            }));
        }

        let validated = match Validator::new(&self.stages).validate() {
            Ok(validated) => validated,
            Err(errors) => {
                tracing::warn!(
                    pipeline = %self.name,
                    errors = errors.len(),
                    "pipeline failed validation"
                );
                return Err(errors);
            }
        };

        let pending = std::mem::take(&mut self.stages);
        self.frozen = true;

        let names: Vec<String> = pending
            .iter()
            .map(|p| p.descriptor.name().to_string())
            .collect();

        let stages: Vec<GraphStage> = pending
            .into_iter()
            .zip(validated.stages)
            .map(|(pending, validated)| GraphStage {
                upstream_names: validated
                    .upstreams
                    .iter()
                    .map(|&i| names[i].clone())
                    .collect(),
                bindings: validated
                    .bindings
                    .into_iter()
                    .map(|(subset, i)| (subset, names[i].clone()))
                    .collect(),
                upstreams: validated.upstreams,
                arguments: validated.arguments,
                descriptor: pending.descriptor,
            })
            .collect();

        tracing::info!(
            pipeline = %self.name,
            stages = stages.len(),
            "pipeline finalized"
        );

        Ok(PipelineGraph::new(
            self.name.clone(),
            self.description.clone(),
            self.base_path.clone(),
            stages,
            validated.order,
        ))
    }

    fn push(&mut self, descriptor: StageDescriptor, after: Vec<String>) -> StageHandle {
        let index = self.stages.len();
        self.indices.insert(descriptor.name().to_string(), index);
        self.stages.push(PendingStage { descriptor, after });
        StageHandle(index)
    }

    fn pending(&self, handle: StageHandle) -> Result<&PendingStage, BuildError> {
        self.stages
            .get(handle.0)
            .ok_or(BuildError::UnknownStage(handle.0))
    }

    fn ensure_mutable(&self, operation: &'static str) -> Result<(), BuildError> {
        if self.frozen {
            return Err(FrozenGraphError { operation }.into());
        }
        Ok(())
    }

    fn ensure_unique(&self, name: &str) -> Result<(), BuildError> {
        if self.indices.contains_key(name) {
            return Err(BuildError::DuplicateStage(name.to_string()));
        }
        Ok(())
    }

    fn upstream_names(&self, upstreams: &[StageHandle]) -> Result<Vec<String>, BuildError> {
        let mut names: Vec<String> = Vec::with_capacity(upstreams.len());
        for handle in upstreams {
            let name = self.pending(*handle)?.descriptor.name().to_string();
            if !names.contains(&name) {
                names.push(name);
            }
        }
        Ok(names)
    }

    fn check_schema(&self, stage: &StageDescriptor, after: &[String]) -> Result<(), BuildError> {
        let upstreams: Vec<&StageDescriptor> = after
            .iter()
            .filter_map(|name| self.indices.get(name))
            .map(|&i| &self.stages[i].descriptor)
            .collect();

        match check_stage_schema(stage, &upstreams)
            .into_iter()
            .find(|e| !matches!(e, SchemaError::AmbiguousSubset { .. }))
        {
            Some(error) => Err(error.into()),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Field, FieldType, Schema};
    use crate::stage::{ArgumentSpec, ArgumentType, ArgumentValue, ExecutableRef};

    fn schema(subset: &str, field: &str, ty: FieldType) -> Schema {
        Schema::new()
            .with_subset(subset, [Field::new(field, ty)])
            .unwrap()
    }

    fn stage(name: &str, consumes: Schema, produces: Schema) -> StageDescriptor {
        StageDescriptor::builder(name, ExecutableRef::image(format!("ghcr.io/ml/{}:latest", name)))
            .consumes(consumes)
            .produces(produces)
            .build()
    }

    fn prompts() -> StageDescriptor {
        stage(
            "generate_prompts",
            Schema::new(),
            schema("prompts", "text", FieldType::String),
        )
    }

    fn retrieve() -> StageDescriptor {
        stage(
            "retrieve_laion_by_prompt",
            schema("prompts", "text", FieldType::String),
            schema("images", "url", FieldType::String),
        )
    }

    fn download() -> StageDescriptor {
        stage(
            "download_images",
            schema("images", "url", FieldType::String),
            schema("images", "data", FieldType::Binary),
        )
    }

    #[test]
    fn test_source_with_consumes_rejected() {
        let mut builder = PipelineBuilder::new("controlnet");
        let err = builder.add_source(retrieve()).unwrap_err();
        assert!(matches!(
            err,
            BuildError::Schema(SchemaError::SourceConsumes { .. })
        ));
        assert!(builder.is_empty());
    }

    #[test]
    fn test_dependent_schema_checked_eagerly() {
        let mut builder = PipelineBuilder::new("controlnet");
        let p = builder.add_source(prompts()).unwrap();

        let err = builder.add_dependent(download(), &[p]).unwrap_err();
        match err {
            BuildError::Schema(schema_err) => {
                assert_eq!(schema_err.missing_fields(), vec!["images.url".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(builder.len(), 1);

        assert!(matches!(
            builder.add_dependent(retrieve(), &[]),
            Err(BuildError::NoUpstreams(_))
        ));
    }

    #[test]
    fn test_duplicate_names_and_unknown_handles() {
        let mut builder = PipelineBuilder::new("controlnet");
        builder.add_source(prompts()).unwrap();
        assert!(matches!(
            builder.add_source(prompts()),
            Err(BuildError::DuplicateStage(name)) if name == "generate_prompts"
        ));
        assert!(matches!(
            builder.add_dependent(retrieve(), &[StageHandle(7)]),
            Err(BuildError::UnknownStage(7))
        ));
    }

    #[test]
    fn test_finalize_freezes_builder() {
        let mut builder = PipelineBuilder::new("controlnet").with_base_path("/tmp/data");
        let p = builder.add_source(prompts()).unwrap();
        let r = builder.add_dependent(retrieve(), &[p]).unwrap();
        builder.add_dependent(download(), &[r]).unwrap();

        let graph = builder.finalize().unwrap();
        assert_eq!(graph.len(), 3);
        assert_eq!(graph.base_path(), "/tmp/data");
        assert!(builder.is_frozen());

        let err = builder.finalize().unwrap_err();
        assert!(err.is_frozen());
        assert!(matches!(
            builder.add_source(prompts()),
            Err(BuildError::Frozen(_))
        ));
    }

    #[test]
    fn test_failed_finalize_leaves_builder_usable() {
        let mut builder = PipelineBuilder::new("controlnet");
        let caption = StageDescriptor::builder("caption_images", ExecutableRef::image("caption"))
            .consumes(schema("prompts", "text", FieldType::String))
            .produces(schema("captions", "text", FieldType::String))
            .argument("model_id", ArgumentSpec::required(ArgumentType::Str))
            .build();

        let p = builder.add_source(prompts()).unwrap();
        let c = builder.add_dependent(caption.clone(), &[p]).unwrap();

        let errors = builder.finalize().unwrap_err();
        assert_eq!(errors.argument_errors().count(), 1);
        assert!(!builder.is_frozen());
        assert_eq!(builder.len(), 2);

        builder
            .replace(c, caption.with_argument("model_id", "Salesforce/blip"))
            .unwrap();
        let graph = builder.finalize().unwrap();
        assert_eq!(
            graph.stage("caption_images").unwrap().arguments().get("model_id"),
            Some(&ArgumentValue::from("Salesforce/blip"))
        );
    }

    #[test]
    fn test_replace_requires_same_name() {
        let mut builder = PipelineBuilder::new("controlnet");
        let p = builder.add_source(prompts()).unwrap();
        assert!(matches!(
            builder.replace(p, download()),
            Err(BuildError::NameMismatch { .. })
        ));
    }

    #[test]
    fn test_reattach_rejects_cycle_without_mutation() {
        let passthrough = |name: &str| {
            stage(
                name,
                schema("prompts", "text", FieldType::String),
                schema("prompts", "text", FieldType::String),
            )
        };

        let mut builder = PipelineBuilder::new("loop");
        let p = builder.add_source(prompts()).unwrap();
        let a = builder.add_dependent(passthrough("a"), &[p]).unwrap();
        let b = builder.add_dependent(passthrough("b"), &[a]).unwrap();

        let err = builder.reattach(a, &[b]).unwrap_err();
        match err {
            BuildError::Cycle(cycle) => assert_eq!(cycle.cycle, vec!["a", "b", "a"]),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(builder.upstreams(a), Some(&["generate_prompts".to_string()][..]));

        // A valid reattach goes through
        let c = builder.add_dependent(passthrough("c"), &[p]).unwrap();
        builder.reattach(b, &[c]).unwrap();
        assert_eq!(builder.upstreams(b), Some(&["c".to_string()][..]));
    }

    #[test]
    fn test_declare_with_forward_references() {
        let mut builder = PipelineBuilder::new("controlnet");
        builder
            .declare(download(), &["retrieve_laion_by_prompt"])
            .unwrap();
        builder
            .declare(retrieve(), &["generate_prompts"])
            .unwrap();
        builder.declare(prompts(), &[]).unwrap();

        let graph = builder.finalize().unwrap();
        let order: Vec<_> = graph.topological_order().iter().map(|s| s.name()).collect();
        assert_eq!(
            order,
            vec!["generate_prompts", "retrieve_laion_by_prompt", "download_images"]
        );
        // Declaration order is kept for stages()
        assert_eq!(graph.stages()[0].name(), "download_images");
    }

    #[test]
    fn test_declare_unknown_upstream_fails_at_finalize() {
        let mut builder = PipelineBuilder::new("controlnet");
        builder.declare(retrieve(), &["nowhere"]).unwrap();
        let errors = builder.finalize().unwrap_err();
        assert!(errors
            .iter()
            .any(|e| matches!(e, BuildError::UnknownUpstream { .. })));
    }

    #[test]
    fn test_graph_queries() {
        let mut builder = PipelineBuilder::new("fan");
        let p = builder.add_source(prompts()).unwrap();
        let r = builder.add_dependent(retrieve(), &[p]).unwrap();
        let d = builder.add_dependent(download(), &[r]).unwrap();
        let side = builder
            .add_dependent(
                stage(
                    "count_prompts",
                    schema("prompts", "text", FieldType::String),
                    schema("stats", "count", FieldType::Integer),
                ),
                &[p],
            )
            .unwrap();
        builder
            .add_dependent(
                stage(
                    "report",
                    schema("images", "data", FieldType::Binary)
                        .with_subset("stats", [Field::new("count", FieldType::Integer)])
                        .unwrap(),
                    schema("report", "path", FieldType::String),
                ),
                &[d, side],
            )
            .unwrap();

        let graph = builder.finalize().unwrap();

        assert_eq!(graph.edges().len(), 5);
        assert_eq!(
            graph.upstreams_of("report"),
            Some(vec!["download_images", "count_prompts"])
        );
        assert_eq!(
            graph.downstream_closure("retrieve_laion_by_prompt"),
            Some(vec!["download_images", "report"])
        );

        let levels: Vec<Vec<&str>> = graph
            .parallel_levels()
            .iter()
            .map(|level| level.iter().map(|s| s.name()).collect())
            .collect();
        assert_eq!(
            levels,
            vec![
                vec!["generate_prompts"],
                vec!["retrieve_laion_by_prompt", "count_prompts"],
                vec!["download_images"],
                vec!["report"],
            ]
        );

        let report = graph.stage("report").unwrap();
        assert_eq!(
            report.bindings().get("stats").map(String::as_str),
            Some("count_prompts")
        );
        assert_eq!(
            report.bindings().get("images").map(String::as_str),
            Some("download_images")
        );
    }
}
