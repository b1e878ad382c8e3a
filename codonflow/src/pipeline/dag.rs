//! Stage dependency graph.
//!
//! Dependencies are not declared by name. They are derived from artifact
//! kinds: a stage depends on the unique producer of each kind it consumes.
//! The graph is validated and ordered once, before any unit runs.

use super::StageSpec;
use crate::core::ArtifactKind;
use crate::errors::{CodonflowError, ContractErrorInfo, CycleDetectedError, PipelineValidationError};
use std::collections::{BTreeSet, HashMap, HashSet};

/// A validated, topologically ordered set of stages.
#[derive(Debug, Clone)]
pub struct StageGraph {
    /// Stages in execution order.
    stages: Vec<StageSpec>,
    /// Which stage produces each kind.
    producers: HashMap<ArtifactKind, String>,
    /// Upstream stage names per stage.
    dependencies: HashMap<String, BTreeSet<String>>,
}

impl StageGraph {
    /// Validates `stages` and orders them.
    ///
    /// Ordering is a depth-first topological sort visiting stages in
    /// declaration order, so independent stages keep their declared order.
    ///
    /// # Errors
    ///
    /// Returns a validation error for an invalid stage, a duplicate stage
    /// name, a kind with two producers, or an input nobody produces, and
    /// [`CodonflowError::CycleDetected`] for a dependency cycle.
    pub fn build(declared: Vec<StageSpec>) -> Result<Self, CodonflowError> {
        if declared.is_empty() {
            return Err(PipelineValidationError::new("Pipeline has no stages").into());
        }

        let mut names = HashSet::new();
        let mut producers: HashMap<ArtifactKind, String> = HashMap::new();
        for stage in &declared {
            stage.validate()?;
            if !names.insert(stage.name.clone()) {
                return Err(PipelineValidationError::new(format!("Duplicate stage name '{}'", stage.name))
                    .with_stages(vec![stage.name.clone()])
                    .into());
            }
            for kind in stage.output_kinds() {
                if kind == ArtifactKind::RawSequences {
                    return Err(PipelineValidationError::new(format!(
                        "Stage '{}' cannot produce the source kind '{kind}'",
                        stage.name
                    ))
                    .with_stages(vec![stage.name.clone()])
                    .into());
                }
                if let Some(previous) = producers.insert(kind.clone(), stage.name.clone()) {
                    return Err(PipelineValidationError::new(format!(
                        "Artifact kind '{kind}' is produced by both '{previous}' and '{}'",
                        stage.name
                    ))
                    .with_stages(vec![previous, stage.name.clone()])
                    .with_error_info(ContractErrorInfo::new(
                        "CONTRACT-002-PRODUCER",
                        format!("Kind '{kind}' has more than one producer"),
                    ))
                    .into());
                }
            }
        }

        let mut dependencies = HashMap::new();
        for stage in &declared {
            let mut upstream = BTreeSet::new();
            for kind in &stage.inputs {
                if *kind == ArtifactKind::RawSequences {
                    continue;
                }
                let Some(producer) = producers.get(kind) else {
                    return Err(PipelineValidationError::new(format!(
                        "Stage '{}' requires '{kind}' but no stage produces it",
                        stage.name
                    ))
                    .with_stages(vec![stage.name.clone()])
                    .with_error_info(
                        ContractErrorInfo::new("CONTRACT-001-UNPRODUCED", format!("No producer for '{kind}'"))
                            .with_fix_hint("Add a stage that outputs this kind or remove the input."),
                    )
                    .into());
                };
                upstream.insert(producer.clone());
            }
            dependencies.insert(stage.name.clone(), upstream);
        }

        let order = topological_sort(&declared, &dependencies)?;
        let mut by_name: HashMap<String, StageSpec> =
            declared.into_iter().map(|s| (s.name.clone(), s)).collect();
        let stages = order.iter().filter_map(|name| by_name.remove(name)).collect();

        Ok(Self {
            stages,
            producers,
            dependencies,
        })
    }

    /// Returns stages in execution order.
    #[must_use]
    pub fn stages(&self) -> &[StageSpec] {
        &self.stages
    }

    /// Returns the number of stages.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Returns stage names in execution order.
    #[must_use]
    pub fn execution_order(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }

    /// Returns the producer map used to resolve inputs.
    #[must_use]
    pub fn producers(&self) -> &HashMap<ArtifactKind, String> {
        &self.producers
    }

    /// Returns the upstream stages of `stage`.
    #[must_use]
    pub fn dependencies_of(&self, stage: &str) -> Option<&BTreeSet<String>> {
        self.dependencies.get(stage)
    }
}

/// Performs topological sort on the stage graph, reporting the first cycle found.
fn topological_sort(
    declared: &[StageSpec],
    dependencies: &HashMap<String, BTreeSet<String>>,
) -> Result<Vec<String>, CycleDetectedError> {
    fn visit(
        node: &str,
        dependencies: &HashMap<String, BTreeSet<String>>,
        visited: &mut HashSet<String>,
        path: &mut Vec<String>,
        result: &mut Vec<String>,
    ) -> Result<(), CycleDetectedError> {
        if visited.contains(node) {
            return Ok(());
        }
        if let Some(pos) = path.iter().position(|n| n == node) {
            let mut cycle = path[pos..].to_vec();
            cycle.push(node.to_string());
            return Err(CycleDetectedError::new(cycle));
        }

        path.push(node.to_string());
        if let Some(deps) = dependencies.get(node) {
            for dep in deps {
                visit(dep, dependencies, visited, path, result)?;
            }
        }
        path.pop();

        visited.insert(node.to_string());
        result.push(node.to_string());
        Ok(())
    }

    let mut result = Vec::new();
    let mut visited = HashSet::new();
    let mut path = Vec::new();

    // Visit in declaration order for determinism
    for stage in declared {
        visit(&stage.name, dependencies, &mut visited, &mut path, &mut result)?;
    }

    Ok(result)
}
