//! Stage specifications.

use crate::context::RunContext;
use crate::core::StageKind;
use crate::errors::PipelineValidationError;
use crate::stages::Stage;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// How a stage waits on its dependencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinMode {
    /// Strict AND-join: every dependency must succeed, otherwise the stage
    /// is skipped without running.
    #[default]
    Success,
    /// Completion join: the stage runs once every dependency has run to
    /// success or failure, and decides for itself what a failed dependency
    /// means. If any dependency was skipped or cancelled the stage is
    /// skipped.
    Completion,
}

/// A run-level predicate evaluated once when the run starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunCondition {
    /// The run was triggered by a version tag.
    VersionTag,
}

impl RunCondition {
    /// Returns `None` if the condition holds, or the reason it does not.
    #[must_use]
    pub fn evaluate(&self, run: &RunContext) -> Option<String> {
        match self {
            Self::VersionTag if run.is_release_run() => None,
            Self::VersionTag => Some(format!("{} is not a version tag", run.trigger())),
        }
    }
}

impl fmt::Display for RunCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::VersionTag => write!(f, "version-tag"),
        }
    }
}

/// Specification for a single stage in a pipeline.
#[derive(Debug, Clone)]
pub struct StageSpec {
    /// The unique name of the stage.
    pub name: String,
    /// The stage implementation.
    pub runner: Arc<dyn Stage>,
    /// Names of stages this stage depends on.
    pub dependencies: BTreeSet<String>,
    /// How dependencies are joined.
    pub join: JoinMode,
    /// Bundles the stage is allowed to read.
    pub consumes: BTreeSet<String>,
    /// Run-level precondition, if any.
    pub condition: Option<RunCondition>,
    /// The kind of stage.
    pub kind: StageKind,
}

impl StageSpec {
    /// Creates a new stage specification.
    #[must_use]
    pub fn new(name: impl Into<String>, runner: Arc<dyn Stage>) -> Self {
        Self {
            name: name.into(),
            runner,
            dependencies: BTreeSet::new(),
            join: JoinMode::Success,
            consumes: BTreeSet::new(),
            condition: None,
            kind: StageKind::Work,
        }
    }

    /// Sets the dependencies.
    #[must_use]
    pub fn with_dependencies(mut self, deps: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Adds a dependency.
    #[must_use]
    pub fn with_dependency(mut self, dep: impl Into<String>) -> Self {
        self.dependencies.insert(dep.into());
        self
    }

    /// Sets the join mode.
    #[must_use]
    pub fn with_join(mut self, join: JoinMode) -> Self {
        self.join = join;
        self
    }

    /// Declares a consumed bundle.
    #[must_use]
    pub fn consumes(mut self, bundle: impl Into<String>) -> Self {
        self.consumes.insert(bundle.into());
        self
    }

    /// Attaches a run-level precondition.
    #[must_use]
    pub fn when(mut self, condition: RunCondition) -> Self {
        self.condition = Some(condition);
        self
    }

    /// Sets the stage kind.
    #[must_use]
    pub fn with_kind(mut self, kind: StageKind) -> Self {
        self.kind = kind;
        self
    }

    /// Validates the stage specification.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is blank or the stage depends on itself.
    pub fn validate(&self) -> Result<(), PipelineValidationError> {
        if self.name.trim().is_empty() {
            return Err(PipelineValidationError::new("Stage name cannot be empty"));
        }
        if self.dependencies.contains(&self.name) {
            return Err(PipelineValidationError::new(format!(
                "Stage '{}' cannot depend on itself",
                self.name
            ))
            .with_stages(vec![self.name.clone()]));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::NoOpStage;
    use crate::version::Trigger;

    #[test]
    fn test_stage_spec_creation() {
        let spec = StageSpec::new("merge-macos", Arc::new(NoOpStage::new("merge-macos")))
            .with_dependencies(["build-macos-x86_64", "build-macos-aarch64"])
            .with_join(JoinMode::Completion)
            .consumes("native-libs")
            .with_kind(StageKind::Merge);

        assert_eq!(spec.dependencies.len(), 2);
        assert_eq!(spec.join, JoinMode::Completion);
        assert!(spec.consumes.contains("native-libs"));
        assert_eq!(spec.kind, StageKind::Merge);
    }

    #[test]
    fn test_stage_spec_self_dependency() {
        let spec = StageSpec::new("a", Arc::new(NoOpStage::new("a"))).with_dependency("a");
        assert!(spec.validate().is_err());
        assert!(StageSpec::new(" ", Arc::new(NoOpStage::new(" "))).validate().is_err());
    }

    #[test]
    fn test_version_tag_condition() {
        let tag = RunContext::new(Trigger::Tag("v1.0.0".to_string()));
        let branch = RunContext::new(Trigger::Branch("main".to_string()));

        assert_eq!(RunCondition::VersionTag.evaluate(&tag), None);
        let reason = RunCondition::VersionTag.evaluate(&branch).unwrap();
        assert!(reason.contains("branch main"));
    }
}
