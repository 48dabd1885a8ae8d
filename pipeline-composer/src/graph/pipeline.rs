// Pipeline Graph
// Frozen, validated DAG of stages handed to the compiler

use crate::graph::order;
use crate::stage::{ArgumentValue, StageDescriptor};

use indexmap::IndexMap;
use std::collections::{BTreeMap, HashMap};

/// A stage inside a validated graph
#[derive(Debug, Clone, PartialEq)]
pub struct GraphStage {
    pub(crate) descriptor: StageDescriptor,
    pub(crate) upstreams: Vec<usize>,
    pub(crate) upstream_names: Vec<String>,
    pub(crate) arguments: BTreeMap<String, ArgumentValue>,
    pub(crate) bindings: IndexMap<String, String>,
}

impl GraphStage {
    pub fn name(&self) -> &str {
        self.descriptor.name()
    }

    pub fn descriptor(&self) -> &StageDescriptor {
        &self.descriptor
    }

    /// Direct upstream stage names in edge-declaration order
    pub fn upstreams(&self) -> &[String] {
        &self.upstream_names
    }

    /// Arguments after defaults and type normalization
    pub fn arguments(&self) -> &BTreeMap<String, ArgumentValue> {
        &self.arguments
    }

    /// Consumed subset -> upstream stage that provides it
    pub fn bindings(&self) -> &IndexMap<String, String> {
        &self.bindings
    }

    pub fn is_source(&self) -> bool {
        self.upstreams.is_empty()
    }
}

/// Immutable result of [`PipelineBuilder::finalize`](crate::graph::PipelineBuilder::finalize)
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineGraph {
    name: String,
    description: Option<String>,
    base_path: String,
    stages: Vec<GraphStage>,
    order: Vec<usize>,
    levels: Vec<usize>,
    indices: HashMap<String, usize>,
}

impl PipelineGraph {
    pub(crate) fn new(
        name: String,
        description: Option<String>,
        base_path: String,
        stages: Vec<GraphStage>,
        order: Vec<usize>,
    ) -> Self {
        let upstreams: Vec<Vec<usize>> = stages.iter().map(|s| s.upstreams.clone()).collect();
        let levels = order::levels(&upstreams, &order);
        let indices = stages
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name().to_string(), i))
            .collect();

        Self {
            name,
            description,
            base_path,
            stages,
            order,
            levels,
            indices,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
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

    /// Stages in declaration order
    pub fn stages(&self) -> &[GraphStage] {
        &self.stages
    }

    pub fn stage(&self, name: &str) -> Option<&GraphStage> {
        self.indices.get(name).map(|&i| &self.stages[i])
    }

    /// `(upstream, downstream)` pairs, grouped by downstream in declaration order
    pub fn edges(&self) -> Vec<(&str, &str)> {
        self.stages
            .iter()
            .flat_map(|stage| {
                stage
                    .upstream_names
                    .iter()
                    .map(move |up| (up.as_str(), stage.name()))
            })
            .collect()
    }

    /// Total order; ties between independent stages follow declaration order
    pub fn topological_order(&self) -> Vec<&GraphStage> {
        self.order.iter().map(|&i| &self.stages[i]).collect()
    }

    /// Stages grouped by dependency depth; each group can run concurrently
    pub fn parallel_levels(&self) -> Vec<Vec<&GraphStage>> {
        order::group_by_level(&self.levels, &self.order)
            .into_iter()
            .map(|level| level.into_iter().map(|i| &self.stages[i]).collect())
            .collect()
    }

    pub fn upstreams_of(&self, name: &str) -> Option<Vec<&str>> {
        self.stage(name)
            .map(|s| s.upstream_names.iter().map(String::as_str).collect())
    }

    /// Every stage transitively downstream of `name`, in topological order
    pub fn downstream_closure(&self, name: &str) -> Option<Vec<&str>> {
        let index = *self.indices.get(name)?;
        let closure = order::downstream_closure(&self.upstream_indices(), index);
        Some(
            self.order
                .iter()
                .filter(|i| closure.contains(i))
                .map(|&i| self.stages[i].name())
                .collect(),
        )
    }

    pub(crate) fn position_of(&self, index: usize) -> usize {
        self.order.iter().position(|&i| i == index).unwrap_or(index)
    }

    pub(crate) fn level_of(&self, index: usize) -> usize {
        self.levels.get(index).copied().unwrap_or(0)
    }

    pub(crate) fn order_indices(&self) -> &[usize] {
        &self.order
    }

    fn upstream_indices(&self) -> Vec<Vec<usize>> {
        self.stages.iter().map(|s| s.upstreams.clone()).collect()
    }
}
