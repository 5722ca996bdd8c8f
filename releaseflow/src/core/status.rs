//! Stage status and kind enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of work a stage performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// A stage that gates the whole run (e.g., version verification).
    Gate,
    /// A stage that compiles native artifacts for one target.
    Build,
    /// A stage that joins per-architecture artifacts into universal ones.
    Merge,
    /// A stage that produces a distributable package.
    Package,
    /// A stage that exercises a built package.
    Validate,
    /// A stage with external side effects on the hosting service.
    Publish,
    /// Any other unit of work.
    Work,
}

impl Default for StageKind {
    fn default() -> Self {
        Self::Work
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gate => write!(f, "gate"),
            Self::Build => write!(f, "build"),
            Self::Merge => write!(f, "merge"),
            Self::Package => write!(f, "package"),
            Self::Validate => write!(f, "validate"),
            Self::Publish => write!(f, "publish"),
            Self::Work => write!(f, "work"),
        }
    }
}

/// The execution status of a stage.
///
/// A stage moves from `Pending` to `Running` and then to exactly one
/// terminal state; it never leaves a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Stage is waiting for its dependencies.
    Pending,
    /// Stage is currently running.
    Running,
    /// Stage completed successfully.
    Success,
    /// Stage failed.
    Failure,
    /// Stage was skipped without running.
    Skipped,
    /// Stage was cancelled.
    Cancelled,
}

impl Default for StageStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Success => write!(f, "success"),
            Self::Failure => write!(f, "failure"),
            Self::Skipped => write!(f, "skipped"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl StageStatus {
    /// Returns true if the status represents a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Success | Self::Failure | Self::Skipped | Self::Cancelled
        )
    }

    /// Returns true if the status indicates success.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Returns true if the status indicates failure.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure)
    }

    /// Returns true if the stage reached a verdict by actually running.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Success | Self::Failure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_kind_display() {
        assert_eq!(StageKind::Gate.to_string(), "gate");
        assert_eq!(StageKind::Build.to_string(), "build");
        assert_eq!(StageKind::Merge.to_string(), "merge");
        assert_eq!(StageKind::Publish.to_string(), "publish");
    }

    #[test]
    fn test_stage_status_display() {
        assert_eq!(StageStatus::Success.to_string(), "success");
        assert_eq!(StageStatus::Failure.to_string(), "failure");
        assert_eq!(StageStatus::Skipped.to_string(), "skipped");
    }

    #[test]
    fn test_stage_status_is_terminal() {
        assert!(StageStatus::Success.is_terminal());
        assert!(StageStatus::Skipped.is_terminal());
        assert!(StageStatus::Failure.is_terminal());
        assert!(StageStatus::Cancelled.is_terminal());
        assert!(!StageStatus::Pending.is_terminal());
        assert!(!StageStatus::Running.is_terminal());
    }

    #[test]
    fn test_stage_status_is_completed() {
        assert!(StageStatus::Success.is_completed());
        assert!(StageStatus::Failure.is_completed());
        assert!(!StageStatus::Skipped.is_completed());
        assert!(!StageStatus::Cancelled.is_completed());
    }

    #[test]
    fn test_stage_status_serialize() {
        let json = serde_json::to_string(&StageStatus::Success).unwrap();
        assert_eq!(json, r#""success""#);

        let deserialized: StageStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, StageStatus::Success);
    }
}
