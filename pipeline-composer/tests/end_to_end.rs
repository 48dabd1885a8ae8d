// End-to-end scenarios: build, validate, compile and run whole pipelines

use pipeline_composer::compiler::compile;
use pipeline_composer::definition::{ComponentCatalog, PipelineDefinition};
use pipeline_composer::error::{BuildError, SchemaError};
use pipeline_composer::graph::{PipelineBuilder, PipelineGraph};
use pipeline_composer::runner::{
    Backend, ExecutionCache, Runner, RunnerConfig, SkipReason, StageOutcome, StageStatus,
};
use pipeline_composer::schema::{Field, FieldType, Schema};
use pipeline_composer::stage::{
    ArgumentSpec, ArgumentType, ArgumentValue, ExecutableRef, StageDescriptor,
};
use pipeline_composer::StageExecution;

use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

fn schema(subset: &str, field: &str, ty: FieldType) -> Schema {
    Schema::new()
        .with_subset(subset, [Field::new(field, ty)])
        .unwrap()
}

fn stage(name: &str) -> pipeline_composer::stage::StageDescriptorBuilder {
    StageDescriptor::builder(name, ExecutableRef::image(format!("ghcr.io/ml/{}:latest", name)))
}

/// prompts -> urls -> images -> captions
fn linear_pipeline(model_id: &str) -> PipelineGraph {
    let mut builder = PipelineBuilder::new("linear").with_base_path("/data");

    let prompts = builder
        .add_source(
            stage("generate_prompts")
                .produces(schema("prompts", "prompt", FieldType::String))
                .build(),
        )
        .unwrap();
    let urls = builder
        .add_dependent(
            stage("retrieve_urls")
                .consumes(schema("prompts", "prompt", FieldType::String))
                .produces(schema("urls", "url", FieldType::String))
                .build(),
            &[prompts],
        )
        .unwrap();
    let images = builder
        .add_dependent(
            stage("download_images")
                .consumes(schema("urls", "url", FieldType::String))
                .produces(schema("images", "data", FieldType::Binary))
                .build(),
            &[urls],
        )
        .unwrap();
    builder
        .add_dependent(
            stage("caption_images")
                .consumes(schema("images", "data", FieldType::Binary))
                .produces(schema("captions", "text", FieldType::String))
                .argument("model_id", ArgumentSpec::required(ArgumentType::Str))
                .build()
                .with_argument("model_id", model_id),
            &[images],
        )
        .unwrap();

    builder.finalize().unwrap()
}

#[test]
fn linear_pipeline_compiles_in_source_order() {
    let manifest = compile(&linear_pipeline("Salesforce/blip-image-captioning-base"));

    assert_eq!(manifest.len(), 4);
    assert_eq!(
        manifest.stage_names(),
        vec![
            "generate_prompts",
            "retrieve_urls",
            "download_images",
            "caption_images"
        ]
    );
    assert_eq!(
        manifest.stage("caption_images").unwrap().inputs.get("images"),
        Some(&manifest.stage("download_images").unwrap().output_path)
    );
}

#[test]
fn changing_last_stage_arguments_changes_only_its_key() {
    let before = compile(&linear_pipeline("Salesforce/blip-image-captioning-base"));
    let after = compile(&linear_pipeline("Salesforce/blip-image-captioning-large"));

    let diff = before.diff(&after);
    assert_eq!(diff.changed, vec!["caption_images"]);
    assert_eq!(
        diff.unchanged,
        vec!["generate_prompts", "retrieve_urls", "download_images"]
    );
}

#[test]
fn renamed_field_fails_naming_the_missing_field() {
    let mut builder = PipelineBuilder::new("mismatch");
    let captions = builder
        .add_source(
            stage("generate_captions")
                .produces(schema("captions", "text", FieldType::String))
                .build(),
        )
        .unwrap();

    let err = builder
        .add_dependent(
            stage("write_captions")
                .consumes(schema("captions", "caption", FieldType::String))
                .build(),
            &[captions],
        )
        .unwrap_err();

    let BuildError::Schema(schema_error) = &err else {
        panic!("expected a schema error, got {:?}", err);
    };
    assert!(matches!(schema_error, SchemaError::Incompatible { .. }));
    assert_eq!(schema_error.missing_fields(), vec!["captions.caption"]);

    // Declared without the eager check, the same problem surfaces at finalize
    builder
        .declare(
            stage("write_captions")
                .consumes(schema("captions", "caption", FieldType::String))
                .build(),
            &["generate_captions"],
        )
        .unwrap();
    let errors = builder.finalize().unwrap_err();
    let missing: Vec<String> = errors
        .schema_errors()
        .flat_map(SchemaError::missing_fields)
        .collect();
    assert_eq!(missing, vec!["captions.caption"]);
}

const COMPONENTS: &[(&str, &str)] = &[
    (
        "generate_prompts",
        r#"
name: generate_prompts
image: ghcr.io/ml/generate_prompts:latest
produces:
  prompts:
    text: string
args:
  n_rows_to_load: { type: int, default: null }
"#,
    ),
    (
        "retrieve_laion_by_prompt",
        r#"
name: retrieve_laion_by_prompt
image: ghcr.io/ml/retrieve_laion_by_prompt:latest
consumes:
  prompts:
    text: string
produces:
  images:
    url: string
args:
  num_images: { type: int }
  aesthetic_score: { type: int, default: 9 }
  aesthetic_weight: { type: float, default: 0.5 }
"#,
    ),
    (
        "download_images",
        r#"
name: download_images
image: ghcr.io/ml/download_images:latest
consumes:
  images:
    url: string
produces:
  images:
    data: binary
    width: integer
    height: integer
args:
  timeout: { type: int, default: 10 }
  retries: { type: int, default: 0 }
  image_size: { type: int, default: 256 }
  resize_mode: { type: str, default: border }
  resize_only_if_bigger: { type: bool, default: false }
  min_image_size: { type: int, default: 0 }
  max_aspect_ratio: { type: float, default: 3.0 }
"#,
    ),
    (
        "caption_images",
        r#"
name: caption_images
image: ghcr.io/ml/caption_images:latest
consumes:
  images:
    data: binary
produces:
  captions:
    text: string
args:
  model_id: { type: str, default: Salesforce/blip-image-captioning-base }
  batch_size: { type: int, default: 8 }
  max_new_tokens: { type: int, default: 50 }
resources:
  accelerator_count: 1
  accelerator_kind: GPU
"#,
    ),
    (
        "segment_images",
        r#"
name: segment_images
image: ghcr.io/ml/segment_images:latest
consumes:
  images:
    data: binary
produces:
  segmentations:
    data: binary
args:
  model_id: { type: str, default: openmmlab/upernet-convnext-small }
  batch_size: { type: int, default: 8 }
resources:
  accelerator_count: 1
  accelerator_kind: GPU
"#,
    ),
    (
        "write_to_hub",
        r#"
name: write_to_hub
image: ghcr.io/ml/write_to_hub:latest
args:
  username: { type: str }
  dataset_name: { type: str }
  hf_token: { type: str, default: null }
  image_column_names: { type: list, default: [] }
  column_name_mapping: { type: dict, default: {} }
generic:
  consumes:
    - kind: subset
      name: images
"#,
    ),
];

const CONTROLNET: &str = r#"
name: controlnet-pipeline
description: Pipeline that collects data to train ControlNet
base_path: ./data_dir
stages:
  - component: components/generate_prompts
    arguments:
      n_rows_to_load: 10
  - component: components/retrieve_laion_by_prompt
    arguments:
      num_images: 2
      aesthetic_score: 9
      aesthetic_weight: 0.5
  - component: components/download_images
    arguments:
      timeout: 1
      retries: 0
      image_size: 512
      resize_mode: center_crop
      resize_only_if_bigger: false
      min_image_size: 0
      max_aspect_ratio: 2.5
  - component: components/caption_images
    arguments:
      model_id: Salesforce/blip-image-captioning-base
      batch_size: 8
      max_new_tokens: 50
  - component: components/segment_images
    after: download_images
    arguments:
      model_id: openmmlab/upernet-convnext-small
      batch_size: 8
  - name: write
    component: components/write_to_hub
    after: [download_images, caption_images, segment_images]
    arguments:
      username: test_user
      dataset_name: segmentation_kids
      image_column_names: [image]
    consumes:
      images:
        data: binary
      captions:
        text: string
      segmentations:
        data: binary
"#;

fn write_controlnet(dir: &Path) -> std::path::PathBuf {
    for (name, yaml) in COMPONENTS {
        let component_dir = dir.join("components").join(name);
        std::fs::create_dir_all(&component_dir).unwrap();
        std::fs::write(component_dir.join("component.yaml"), yaml).unwrap();
    }
    let path = dir.join("pipeline.yaml");
    std::fs::write(&path, CONTROLNET).unwrap();
    path
}

fn controlnet_graph(dir: &Path) -> PipelineGraph {
    let path = write_controlnet(dir);
    let mut catalog = ComponentCatalog::new();
    let mut builder = PipelineDefinition::load(&path, &mut catalog).unwrap();
    builder.finalize().unwrap()
}

#[test]
fn controlnet_definition_loads_validates_and_compiles() {
    let temp_dir = TempDir::new().unwrap();
    let graph = controlnet_graph(temp_dir.path());

    assert_eq!(graph.name(), "controlnet-pipeline");
    assert_eq!(
        graph.description(),
        Some("Pipeline that collects data to train ControlNet")
    );
    assert_eq!(graph.len(), 6);

    let levels: Vec<Vec<&str>> = graph
        .parallel_levels()
        .iter()
        .map(|level| level.iter().map(|s| s.name()).collect())
        .collect();
    assert_eq!(
        levels,
        vec![
            vec!["generate_prompts"],
            vec!["retrieve_laion_by_prompt"],
            vec!["download_images"],
            vec!["caption_images", "segment_images"],
            vec!["write"],
        ]
    );

    let write = graph.stage("write").unwrap();
    assert_eq!(write.bindings()["images"], "download_images");
    assert_eq!(write.bindings()["captions"], "caption_images");
    assert_eq!(write.bindings()["segmentations"], "segment_images");

    let manifest = compile(&graph);
    let download = manifest.stage("download_images").unwrap();
    assert_eq!(download.arguments["image_size"], ArgumentValue::Int(512));
    assert_eq!(
        download.arguments["max_aspect_ratio"],
        ArgumentValue::Float(2.5)
    );
    assert_eq!(
        manifest.stage("caption_images").unwrap().resources.accelerator_count,
        1
    );

    let reloaded = compile(&controlnet_graph(temp_dir.path()));
    assert!(manifest.diff(&reloaded).changed.is_empty());
}

#[test]
fn controlnet_missing_argument_is_reported_at_finalize() {
    let temp_dir = TempDir::new().unwrap();
    let path = write_controlnet(temp_dir.path());
    let without_username = CONTROLNET.replace("      username: test_user\n", "");
    std::fs::write(&path, without_username).unwrap();

    let mut catalog = ComponentCatalog::new();
    let mut builder = PipelineDefinition::load(&path, &mut catalog).unwrap();
    let errors = builder.finalize().unwrap_err();

    assert_eq!(errors.argument_errors().count(), 1);
    assert!(errors.to_string().contains("username"));
    assert!(!builder.is_frozen());
}

/// Records each stage it runs; fails the stages it is told to
#[derive(Default)]
struct RecordingBackend {
    ran: Mutex<Vec<String>>,
    failing: Vec<&'static str>,
}

#[async_trait::async_trait]
impl Backend for RecordingBackend {
    async fn execute(&self, stage: &StageExecution) -> StageOutcome {
        self.ran.lock().unwrap().push(stage.name.clone());
        if self.failing.contains(&stage.name.as_str()) {
            StageOutcome::failed(format!("{} exited with status 1", stage.name))
        } else {
            StageOutcome::succeeded(Some(stage.output_path.display().to_string()))
        }
    }
}

#[tokio::test]
async fn failed_branch_skips_only_its_dependents() {
    let temp_dir = TempDir::new().unwrap();
    let manifest = compile(&controlnet_graph(temp_dir.path()));

    let backend = Arc::new(RecordingBackend {
        failing: vec!["segment_images"],
        ..Default::default()
    });
    let result = Runner::new(Arc::clone(&backend)).run(&manifest).await;

    assert!(!result.success());
    assert_eq!(result.failed(), vec!["segment_images"]);
    assert_eq!(result.status("caption_images"), Some(&StageStatus::Succeeded));
    assert_eq!(
        result.status("write"),
        Some(&StageStatus::Skipped(SkipReason::UpstreamFailed {
            upstream: "segment_images".to_string()
        }))
    );
    assert!(!backend.ran.lock().unwrap().contains(&"write".to_string()));
}

#[tokio::test]
async fn persistent_cache_skips_unchanged_stages() {
    let temp_dir = TempDir::new().unwrap();
    let cache_dir = temp_dir.path().join("cache");
    let manifest = compile(&controlnet_graph(temp_dir.path()));

    let first = Arc::new(RecordingBackend::default());
    let result = Runner::new(Arc::clone(&first))
        .with_cache(ExecutionCache::with_cache_dir(&cache_dir))
        .run(&manifest)
        .await;
    assert!(result.success());
    assert_eq!(first.ran.lock().unwrap().len(), 6);

    // A fresh cache instance over the same directory sees every record
    let second = Arc::new(RecordingBackend::default());
    let result = Runner::new(Arc::clone(&second))
        .with_cache(ExecutionCache::with_cache_dir(&cache_dir))
        .with_config(RunnerConfig {
            max_parallel_stages: 2,
            use_cache: true,
        })
        .run(&manifest)
        .await;
    assert!(result.success());
    assert_eq!(result.cached().len(), 6);
    assert!(second.ran.lock().unwrap().is_empty());
}

#[tokio::test]
async fn cancelled_run_executes_nothing() {
    let temp_dir = TempDir::new().unwrap();
    let manifest = compile(&controlnet_graph(temp_dir.path()));

    let backend = Arc::new(RecordingBackend::default());
    let runner = Runner::new(Arc::clone(&backend));
    runner.cancellation_token().cancel();

    let result = runner.run(&manifest).await;
    assert!(result.cancelled);
    assert_eq!(result.skipped().len(), 6);
    assert!(backend.ran.lock().unwrap().is_empty());
}

/// Writes each stage's output directory and refuses inputs that were never written
#[derive(Default)]
struct DiskBackend {
    inputs: Mutex<Vec<(String, std::path::PathBuf)>>,
}

#[async_trait::async_trait]
impl Backend for DiskBackend {
    async fn execute(&self, stage: &StageExecution) -> StageOutcome {
        for path in stage.inputs.values() {
            if !path.exists() {
                return StageOutcome::failed(format!("input {} was never written", path.display()));
            }
            self.inputs
                .lock()
                .unwrap()
                .push((stage.name.clone(), path.clone()));
        }
        if let Err(e) = std::fs::create_dir_all(&stage.output_path) {
            return StageOutcome::failed(e.to_string());
        }
        StageOutcome::succeeded(Some(stage.output_path.display().to_string()))
    }
}

/// generate_prompts -> embed_prompts
fn embedding_pipeline(name: &str, base_path: &Path, model_id: &str) -> PipelineGraph {
    let mut builder = PipelineBuilder::new(name).with_base_path(base_path.display().to_string());

    let prompts = builder
        .add_source(
            stage("generate_prompts")
                .produces(schema("prompts", "prompt", FieldType::String))
                .build(),
        )
        .unwrap();
    builder
        .add_dependent(
            stage("embed_prompts")
                .consumes(schema("prompts", "prompt", FieldType::String))
                .produces(schema("embeddings", "data", FieldType::Binary))
                .argument("model_id", ArgumentSpec::required(ArgumentType::Str))
                .build()
                .with_argument("model_id", model_id),
            &[prompts],
        )
        .unwrap();

    builder.finalize().unwrap()
}

#[tokio::test]
async fn cached_stage_output_feeds_a_dependent_that_runs() {
    let temp_dir = TempDir::new().unwrap();
    let data_dir = temp_dir.path().join("data");
    let cache_dir = temp_dir.path().join("cache");

    let first = compile(&embedding_pipeline("p1", &data_dir, "all-MiniLM-L6-v2"));
    let result = Runner::new(DiskBackend::default())
        .with_cache(ExecutionCache::with_cache_dir(&cache_dir))
        .run(&first)
        .await;
    assert!(result.success());

    // Another pipeline shares the prompts stage but embeds with another model
    let second = compile(&embedding_pipeline("p2", &data_dir, "all-mpnet-base-v2"));
    let p1_prompts = first.stage("generate_prompts").unwrap().output_path.clone();
    let p2_prompts = second.stage("generate_prompts").unwrap().output_path.clone();
    assert_ne!(p1_prompts, p2_prompts);

    let backend = Arc::new(DiskBackend::default());
    let result = Runner::new(Arc::clone(&backend))
        .with_cache(ExecutionCache::with_cache_dir(&cache_dir))
        .run(&second)
        .await;

    assert!(result.success(), "{:?}", result.failed());
    assert_eq!(result.status("generate_prompts"), Some(&StageStatus::Cached));
    assert_eq!(result.status("embed_prompts"), Some(&StageStatus::Succeeded));
    assert_eq!(
        *backend.inputs.lock().unwrap(),
        vec![("embed_prompts".to_string(), p1_prompts)]
    );
    assert!(!p2_prompts.exists());
    assert!(second.stage("embed_prompts").unwrap().output_path.exists());
}
