// Pipeline Validator
// Whole-graph checks run at finalize, collecting every problem in one pass

use crate::error::{BuildError, CycleError, SchemaError, ValidationErrors};
use crate::graph::{order, PendingStage};
use crate::schema::{check_subset, union_of};
use crate::stage::{resolve_arguments, ArgumentValue, StageDescriptor};

use indexmap::IndexMap;
use std::collections::{BTreeMap, HashMap};

/// Per-stage result of a successful validation
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedStage {
    /// Upstream indices, deduplicated, in edge-declaration order
    pub upstreams: Vec<usize>,
    /// Arguments with defaults applied
    pub arguments: BTreeMap<String, ArgumentValue>,
    /// Consumed subset -> index of the upstream bound to it
    pub bindings: IndexMap<String, usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedPipeline {
    pub stages: Vec<ValidatedStage>,
    pub order: Vec<usize>,
}

/// Schema problems of one stage against its direct upstreams
///
/// Checks the source invariant in both directions, ambiguous providers of a
/// consumed subset, and structural compatibility of the consumed schema with
/// the first-wins union of the upstreams' produced schemas.
pub fn check_stage_schema(
    stage: &StageDescriptor,
    upstreams: &[&StageDescriptor],
) -> Vec<SchemaError> {
    let mut errors = Vec::new();

    if upstreams.is_empty() {
        if !stage.consumes().is_empty() {
            errors.push(SchemaError::SourceConsumes {
                stage: stage.name().to_string(),
                subsets: stage.consumes().subset_names(),
            });
        }
        return errors;
    }

    if stage.consumes().is_empty() {
        errors.push(SchemaError::DependentWithoutConsumes {
            stage: stage.name().to_string(),
        });
        return errors;
    }

    let union = union_of(upstreams.iter().map(|up| (up.name(), up.produces())));

    for (subset, providers) in union.ambiguous() {
        if stage.consumes().contains_subset(subset) {
            errors.push(SchemaError::AmbiguousSubset {
                stage: stage.name().to_string(),
                subset: subset.to_string(),
                providers: providers.to_vec(),
            });
        }
    }

    let mismatches = check_subset(stage.consumes(), &union.schema);
    if !mismatches.is_empty() {
        errors.push(SchemaError::Incompatible {
            stage: stage.name().to_string(),
            mismatches,
        });
    }

    errors
}

/// Consumed subset -> position within `upstreams` of its first provider
pub fn bind_inputs(
    stage: &StageDescriptor,
    upstreams: &[&StageDescriptor],
) -> IndexMap<String, usize> {
    stage
        .consumes()
        .subsets()
        .filter_map(|(subset, _)| {
            upstreams
                .iter()
                .position(|up| up.produces().contains_subset(subset))
                .map(|pos| (subset.to_string(), pos))
        })
        .collect()
}

/// Validates a set of pending stages as one pipeline
pub struct Validator<'a> {
    stages: &'a [PendingStage],
}

impl<'a> Validator<'a> {
    pub fn new(stages: &'a [PendingStage]) -> Self {
        Self { stages }
    }

    /// Run every check: structure, acyclicity, schemas, arguments, resources
    pub fn validate(&self) -> Result<ValidatedPipeline, ValidationErrors> {
        let mut errors: Vec<BuildError> = Vec::new();

        let (upstreams, unresolved) = self.resolve_upstreams(&mut errors);

        let order = match order::topological_order(&upstreams) {
            Ok(order) => Some(order),
            Err(_) => {
                let cycle = order::find_cycle(&upstreams).unwrap_or_default();
                errors.push(
                    CycleError {
                        cycle: cycle
                            .into_iter()
                            .map(|i| self.stages[i].descriptor().name().to_string())
                            .collect(),
                    }
                    .into(),
                );
                None
            }
        };

        let mut validated = Vec::with_capacity(self.stages.len());

        for (index, pending) in self.stages.iter().enumerate() {
            let stage = pending.descriptor();
            let ups: Vec<&StageDescriptor> = upstreams[index]
                .iter()
                .map(|&i| self.stages[i].descriptor())
                .collect();

            let mut bindings = IndexMap::new();
            if !unresolved[index] {
                let schema_errors = check_stage_schema(stage, &ups);
                if schema_errors.is_empty() {
                    bindings = bind_inputs(stage, &ups)
                        .into_iter()
                        .map(|(subset, pos)| (subset, upstreams[index][pos]))
                        .collect();
                }
                errors.extend(schema_errors.into_iter().map(BuildError::from));
            }

            let arguments = match resolve_arguments(
                stage.name(),
                stage.argument_specs(),
                stage.argument_values(),
            ) {
                Ok(arguments) => arguments,
                Err(argument_errors) => {
                    errors.extend(argument_errors.into_iter().map(BuildError::from));
                    BTreeMap::new()
                }
            };

            errors.extend(
                stage
                    .resources()
                    .validate(stage.name())
                    .into_iter()
                    .map(BuildError::from),
            );

            validated.push(ValidatedStage {
                upstreams: upstreams[index].clone(),
                arguments,
                bindings,
            });
        }

        match order {
            Some(order) if errors.is_empty() => {
                tracing::debug!(stages = validated.len(), "pipeline validated");
                Ok(ValidatedPipeline {
                    stages: validated,
                    order,
                })
            }
            _ => {
                tracing::debug!(errors = errors.len(), "pipeline validation failed");
                Err(ValidationErrors::new(errors))
            }
        }
    }

    /// Map upstream names to indices; flags stages with unknown upstreams
    fn resolve_upstreams(&self, errors: &mut Vec<BuildError>) -> (Vec<Vec<usize>>, Vec<bool>) {
        let mut indices: HashMap<&str, usize> = HashMap::new();
        for (i, pending) in self.stages.iter().enumerate() {
            let name = pending.descriptor().name();
            if indices.contains_key(name) {
                errors.push(BuildError::DuplicateStage(name.to_string()));
            } else {
                indices.insert(name, i);
            }
        }

        let mut upstreams = Vec::with_capacity(self.stages.len());
        let mut unresolved = Vec::with_capacity(self.stages.len());

        for pending in self.stages {
            let mut resolved: Vec<usize> = Vec::new();
            let mut missing = false;
            for name in pending.after() {
                match indices.get(name.as_str()) {
                    Some(&i) => {
                        if !resolved.contains(&i) {
                            resolved.push(i);
                        }
                    }
                    None => {
                        missing = true;
                        errors.push(BuildError::UnknownUpstream {
                            stage: pending.descriptor().name().to_string(),
                            upstream: name.clone(),
                        });
                    }
                }
            }
            upstreams.push(resolved);
            unresolved.push(missing);
        }

        (upstreams, unresolved)
    }
}
