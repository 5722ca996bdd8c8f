//! Pipeline builder with validation.

use super::{StageGraph, StageSpec};
use crate::errors::{ContractErrorInfo, CycleDetectedError, PipelineValidationError};
use crate::stages::Stage;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

const DEFAULT_WORKERS: usize = 4;

/// Builder for creating validated pipelines.
///
/// Stages must be added after their dependencies, so a builder can never
/// hold a dangling reference; cycles are still checked on every insert.
#[derive(Debug, Clone)]
pub struct PipelineBuilder {
    name: String,
    stages: HashMap<String, StageSpec>,
    /// Insertion order for stages.
    stage_order: Vec<String>,
    workers: usize,
}

impl PipelineBuilder {
    /// Creates a new pipeline builder.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: HashMap::new(),
            stage_order: Vec::new(),
            workers: DEFAULT_WORKERS,
        }
    }

    /// Sets the maximum number of concurrently running stages.
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Adds a stage with strict dependencies.
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails (missing dependency, cycle, etc.)
    pub fn stage(
        mut self,
        name: impl Into<String>,
        runner: Arc<dyn Stage>,
        dependencies: &[&str],
    ) -> Result<Self, PipelineValidationError> {
        let spec = StageSpec::new(name, runner).with_dependencies(dependencies.iter().copied());
        self.add_stage_spec(spec)?;
        Ok(self)
    }

    /// Adds a stage with a full specification.
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails.
    pub fn add_stage_spec(&mut self, spec: StageSpec) -> Result<(), PipelineValidationError> {
        spec.validate()?;

        if self.stages.contains_key(&spec.name) {
            return Err(PipelineValidationError::new(format!(
                "Stage '{}' is defined twice",
                spec.name
            ))
            .with_stages(vec![spec.name.clone()])
            .with_error_info(
                ContractErrorInfo::new("PIPELINE-DUPLICATE", format!("Duplicate stage '{}'", spec.name))
                    .with_fix_hint("Give every fan-out instance a distinct name, e.g. by suffixing its target."),
            ));
        }

        for dep in &spec.dependencies {
            if !self.stages.contains_key(dep) {
                return Err(PipelineValidationError::new(format!(
                    "Stage '{}' depends on unknown stage '{}'",
                    spec.name, dep
                ))
                .with_stages(vec![spec.name.clone(), dep.clone()])
                .with_error_info(
                    ContractErrorInfo::new(
                        "PIPELINE-MISSING_DEP",
                        format!("Dependency '{dep}' not found"),
                    )
                    .with_context_entry("stage", spec.name.clone())
                    .with_fix_hint("Ensure the dependency is added before the stage that depends on it."),
                ));
            }
        }

        self.stage_order.push(spec.name.clone());
        self.stages.insert(spec.name.clone(), spec);

        if let Err(cycle) = self.detect_cycles() {
            if let Some(name) = self.stage_order.pop() {
                self.stages.remove(&name);
            }
            return Err(cycle.into());
        }

        Ok(())
    }

    /// Builds the pipeline.
    ///
    /// # Errors
    ///
    /// Returns an error if the builder has no stages or no workers.
    pub fn build(self) -> Result<StageGraph, PipelineValidationError> {
        if self.stages.is_empty() {
            return Err(PipelineValidationError::new("Pipeline has no stages").with_error_info(
                ContractErrorInfo::new("PIPELINE-EMPTY", "Cannot build an empty pipeline")
                    .with_fix_hint("Add at least one stage to the pipeline before building."),
            ));
        }
        if self.workers == 0 {
            return Err(PipelineValidationError::new("Pipeline needs at least one worker"));
        }

        Ok(StageGraph::new(self.name, self.stages, &self.stage_order, self.workers))
    }

    /// Returns the pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of stages.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    fn detect_cycles(&self) -> Result<(), CycleDetectedError> {
        let mut visited = HashSet::new();
        let mut rec_stack = HashSet::new();
        let mut path = Vec::new();

        for name in &self.stage_order {
            if !visited.contains(name) {
                if let Some(cycle) = self.dfs_cycle(name, &mut visited, &mut rec_stack, &mut path) {
                    return Err(CycleDetectedError::new(cycle));
                }
            }
        }

        Ok(())
    }

    fn dfs_cycle(
        &self,
        node: &str,
        visited: &mut HashSet<String>,
        rec_stack: &mut HashSet<String>,
        path: &mut Vec<String>,
    ) -> Option<Vec<String>> {
        visited.insert(node.to_string());
        rec_stack.insert(node.to_string());
        path.push(node.to_string());

        if let Some(spec) = self.stages.get(node) {
            for dep in &spec.dependencies {
                if !visited.contains(dep) {
                    if let Some(cycle) = self.dfs_cycle(dep, visited, rec_stack, path) {
                        return Some(cycle);
                    }
                } else if rec_stack.contains(dep) {
                    let start = path.iter().position(|n| n == dep).unwrap_or(0);
                    let mut cycle: Vec<String> = path[start..].to_vec();
                    cycle.push(dep.clone());
                    return Some(cycle);
                }
            }
        }

        path.pop();
        rec_stack.remove(node);
        None
    }
}
