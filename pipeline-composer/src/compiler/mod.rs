// Pipeline Compiler
// Turns a frozen pipeline graph into an execution manifest

pub mod cache_key;
pub mod manifest;

pub use cache_key::{compute_cache_key, CacheKey};
pub use manifest::{ExecutionManifest, ManifestDiff, ManifestError, StageExecution, MANIFEST_VERSION};

use crate::graph::PipelineGraph;

use indexmap::IndexMap;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Output location of a stage: `{base_path}/{pipeline}/{stage}/{cache_key}`
pub fn output_path(base_path: &str, pipeline: &str, stage: &str, key: &CacheKey) -> PathBuf {
    Path::new(base_path)
        .join(pipeline)
        .join(stage)
        .join(key.as_str())
}

/// Compile a validated graph; the same graph always yields the same manifest
pub fn compile(graph: &PipelineGraph) -> ExecutionManifest {
    let mut keys: HashMap<usize, CacheKey> = HashMap::new();
    let mut outputs: HashMap<&str, PathBuf> = HashMap::new();
    let mut stages = Vec::with_capacity(graph.len());

    for &index in graph.order_indices() {
        let stage = &graph.stages()[index];
        let descriptor = stage.descriptor();

        let upstream_keys: Vec<&CacheKey> = stage
            .upstreams
            .iter()
            .filter_map(|up| keys.get(up))
            .collect();

        let key = compute_cache_key(
            descriptor.executable(),
            stage.arguments(),
            descriptor.consumes(),
            descriptor.produces(),
            &upstream_keys,
        );

        let output = output_path(graph.base_path(), graph.name(), stage.name(), &key);

        let inputs: IndexMap<String, PathBuf> = stage
            .bindings()
            .iter()
            .filter_map(|(subset, upstream)| {
                outputs
                    .get(upstream.as_str())
                    .map(|path| (subset.clone(), path.clone()))
            })
            .collect();

        tracing::debug!(
            pipeline = %graph.name(),
            stage = %stage.name(),
            cache_key = %key.short(),
            "compiled stage"
        );

        stages.push(StageExecution {
            name: stage.name().to_string(),
            position: graph.position_of(index),
            level: graph.level_of(index),
            cache_key: key.clone(),
            executable: descriptor.executable().clone(),
            arguments: stage.arguments().clone(),
            consumes: descriptor.consumes().clone(),
            produces: descriptor.produces().clone(),
            upstreams: stage.upstreams().to_vec(),
            inputs,
            output_path: output.clone(),
            resources: descriptor.resources().clone(),
        });

        outputs.insert(stage.name(), output);
        keys.insert(index, key);
    }

    tracing::info!(
        pipeline = %graph.name(),
        stages = stages.len(),
        "pipeline compiled"
    );

    ExecutionManifest {
        version: MANIFEST_VERSION,
        pipeline: graph.name().to_string(),
        description: graph.description().map(str::to_string),
        base_path: graph.base_path().to_string(),
        stages,
    }
}
