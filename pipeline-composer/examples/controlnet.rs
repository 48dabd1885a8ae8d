use pipeline_composer::compiler::compile;
use pipeline_composer::graph::PipelineBuilder;
use pipeline_composer::runner::{progress_channel, CallableBackend, RunEvent, Runner};
use pipeline_composer::schema::{Field, FieldType, Schema};
use pipeline_composer::stage::{ArgumentSpec, ArgumentType, ExecutableRef, StageDescriptor};
use pipeline_composer::StageExecution;

fn schema(subset: &str, fields: &[(&str, FieldType)]) -> Schema {
    Schema::new()
        .with_subset(
            subset,
            fields.iter().map(|(name, ty)| Field::new(*name, ty.clone())),
        )
        .expect("field names are unique")
}

fn stage(name: &str) -> pipeline_composer::stage::StageDescriptorBuilder {
    StageDescriptor::builder(name, ExecutableRef::callable(name))
}

fn pretend(stage: &StageExecution) -> Result<Option<String>, String> {
    Ok(Some(stage.output_path.display().to_string()))
}

#[tokio::main]
async fn main() {
    let mut builder = PipelineBuilder::new("controlnet-pipeline")
        .with_description("Pipeline that collects data to train ControlNet");

    let prompts = builder
        .add_source(
            stage("generate_prompts")
                .produces(schema("prompts", &[("text", FieldType::String)]))
                .argument("n_rows_to_load", ArgumentSpec::optional(ArgumentType::Int))
                .build()
                .with_argument("n_rows_to_load", 10_i64),
        )
        .expect("source stage");
    let urls = builder
        .add_dependent(
            stage("retrieve_laion_by_prompt")
                .consumes(schema("prompts", &[("text", FieldType::String)]))
                .produces(schema("images", &[("url", FieldType::String)]))
                .argument("num_images", ArgumentSpec::required(ArgumentType::Int))
                .build()
                .with_argument("num_images", 2_i64),
            &[prompts],
        )
        .expect("retrieve stage");
    let images = builder
        .add_dependent(
            stage("download_images")
                .consumes(schema("images", &[("url", FieldType::String)]))
                .produces(schema("images", &[("data", FieldType::Binary)]))
                .build(),
            &[urls],
        )
        .expect("download stage");
    builder
        .add_dependent(
            stage("caption_images")
                .consumes(schema("images", &[("data", FieldType::Binary)]))
                .produces(schema("captions", &[("text", FieldType::String)]))
                .build(),
            &[images],
        )
        .expect("caption stage");

    let graph = match builder.finalize() {
        Ok(graph) => graph,
        Err(errors) => {
            eprintln!("{}", errors);
            std::process::exit(1);
        }
    };
    println!("✓ Validated pipeline: {} ({} stages)", graph.name(), graph.len());

    let manifest = compile(&graph);
    for stage in &manifest.stages {
        println!("  {} [{}] -> {}", stage.name, stage.cache_key.short(), stage.output_path.display());
    }

    let backend = manifest
        .stage_names()
        .into_iter()
        .fold(CallableBackend::new(), |backend, name| backend.register(name, pretend));

    let (tx, mut rx) = progress_channel();
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                RunEvent::StageCompleted { stage, success, .. } => {
                    println!("  {} {}", if success { "✓" } else { "✗" }, stage)
                }
                RunEvent::StageCached { stage, .. } => println!("  ↺ {} (cached)", stage),
                RunEvent::PipelineCompleted { success, duration, .. } => {
                    println!("\n✅ Finished (success: {}) in {:?}", success, duration)
                }
                _ => {}
            }
        }
    });

    let runner = Runner::new(backend).with_progress(tx);
    println!("\n🚀 Running pipeline...\n");
    runner.run(&manifest).await;
    println!("\n🚀 Running again (everything cached)...\n");
    runner.run(&manifest).await;

    drop(runner);
    let _ = printer.await;
}
