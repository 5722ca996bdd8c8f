//! Error types for releaseflow.
//!
//! The release taxonomy (`ReleaseError`) describes why a stage failed; the
//! remaining types cover pipeline definition, external tools and bundle
//! access. `ReleaseflowError` unifies them for callers.

use crate::core::{Os, Target};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// The main error type for releaseflow operations.
#[derive(Debug, Error)]
pub enum ReleaseflowError {
    /// A pipeline validation error occurred.
    #[error("{0}")]
    Validation(#[from] PipelineValidationError),

    /// A cycle was detected in the pipeline.
    #[error("{0}")]
    CycleDetected(#[from] CycleDetectedError),

    /// A release stage failed.
    #[error("{0}")]
    Release(#[from] ReleaseError),

    /// An external tool failed.
    #[error("{0}")]
    Tool(#[from] ToolError),

    /// A stage read a bundle it did not declare.
    #[error("{0}")]
    UndeclaredBundle(#[from] UndeclaredBundleError),

    /// Configuration could not be loaded.
    #[error("{0}")]
    Config(#[from] crate::config::ConfigError),

    /// The run was cancelled.
    #[error("Run cancelled: {0}")]
    Cancelled(String),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a release stage failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReleaseError {
    /// The tag's version does not equal the authoritative version.
    #[error("Version mismatch: tag '{tag}' encodes '{found}' but the authoritative version is '{expected}'")]
    VersionMismatch {
        /// The triggering tag.
        tag: String,
        /// The authoritative version.
        expected: String,
        /// The version encoded in the tag.
        found: String,
    },

    /// The authoritative version could not be read.
    #[error("Version unavailable: {0}")]
    MissingVersion(String),

    /// The native toolchain failed for one target.
    #[error("Build failed for {target}: {diagnostic}")]
    BuildFailure {
        /// The target being built.
        target: Target,
        /// Toolchain diagnostic output.
        diagnostic: String,
    },

    /// Universal artifacts could not be produced for an OS.
    #[error("Merge failed for {os}: {reason}")]
    MergeFailure {
        /// The operating system being merged.
        os: Os,
        /// What went wrong.
        reason: String,
    },

    /// The binding package could not be produced.
    #[error("Packaging failed: {reason}")]
    PackagingFailure {
        /// What went wrong.
        reason: String,
    },

    /// One validation matrix cell failed.
    #[error("Validation failed on {os} with runtime {runtime}: {diagnostic}")]
    ValidationFailure {
        /// The operating system of the cell.
        os: Os,
        /// The runtime version of the cell.
        runtime: String,
        /// Smoke test diagnostic.
        diagnostic: String,
    },

    /// A release entry for the tag already exists.
    #[error("Release for tag '{tag}' already exists; refusing to overwrite")]
    PublishConflict {
        /// The tag.
        tag: String,
    },

    /// An asset upload failed after all retries.
    #[error("Upload of asset '{asset}' failed: {reason}")]
    UploadFailure {
        /// The asset name.
        asset: String,
        /// What went wrong.
        reason: String,
    },

    /// A stage tried to replace another stage's artifact.
    #[error("Artifact '{key}' in bundle '{bundle}' already exists with different content")]
    ArtifactConflict {
        /// The bundle name.
        bundle: String,
        /// The artifact key.
        key: String,
    },
}

impl ReleaseError {
    /// Returns a stable code identifying the error kind.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::VersionMismatch { .. } => "VERSION_MISMATCH",
            Self::MissingVersion(_) => "MISSING_VERSION",
            Self::BuildFailure { .. } => "BUILD_FAILURE",
            Self::MergeFailure { .. } => "MERGE_FAILURE",
            Self::PackagingFailure { .. } => "PACKAGING_FAILURE",
            Self::ValidationFailure { .. } => "VALIDATION_FAILURE",
            Self::PublishConflict { .. } => "PUBLISH_CONFLICT",
            Self::UploadFailure { .. } => "UPLOAD_FAILURE",
            Self::ArtifactConflict { .. } => "ARTIFACT_CONFLICT",
        }
    }

    /// Returns true if the operation may be retried locally.
    ///
    /// Only asset uploads are retried; a publish conflict in particular
    /// always requires manual intervention.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::UploadFailure { .. })
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("code".to_string(), serde_json::json!(self.code()));
        map.insert("message".to_string(), serde_json::json!(self.to_string()));
        map.insert("retryable".to_string(), serde_json::json!(self.is_retryable()));
        match self {
            Self::BuildFailure { target, .. } => {
                map.insert("target".to_string(), serde_json::json!(target.to_string()));
            }
            Self::MergeFailure { os, .. } => {
                map.insert("os".to_string(), serde_json::json!(os));
            }
            Self::ValidationFailure { os, runtime, .. } => {
                map.insert("os".to_string(), serde_json::json!(os));
                map.insert("runtime".to_string(), serde_json::json!(runtime));
            }
            Self::PublishConflict { tag } | Self::VersionMismatch { tag, .. } => {
                map.insert("tag".to_string(), serde_json::json!(tag));
            }
            Self::UploadFailure { asset, .. } => {
                map.insert("asset".to_string(), serde_json::json!(asset));
            }
            _ => {}
        }
        map
    }
}

/// Errors reported by external tools.
///
/// Callers fold every variant into the stage's own failure kind; a timeout
/// is not treated differently from a reported failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ToolError {
    /// The tool ran and reported failure.
    #[error("{tool} failed: {diagnostic}")]
    Failed {
        /// The tool name.
        tool: String,
        /// Diagnostic output.
        diagnostic: String,
    },

    /// The tool did not finish within its timeout.
    #[error("{tool} timed out after {}s", timeout.as_secs_f64())]
    TimedOut {
        /// The tool name.
        tool: String,
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// The tool finished but an expected output is absent.
    #[error("{tool} did not produce expected output '{path}'")]
    MissingOutput {
        /// The tool name.
        tool: String,
        /// The missing output path.
        path: String,
    },

    /// The invocation was abandoned because the run was cancelled.
    #[error("{tool} cancelled: {reason}")]
    Cancelled {
        /// The tool name.
        tool: String,
        /// The cancellation reason.
        reason: String,
    },
}

impl ToolError {
    /// Creates a failed error.
    #[must_use]
    pub fn failed(tool: impl Into<String>, diagnostic: impl Into<String>) -> Self {
        Self::Failed {
            tool: tool.into(),
            diagnostic: diagnostic.into(),
        }
    }

    /// Creates a missing output error.
    #[must_use]
    pub fn missing_output(tool: impl Into<String>, path: impl Into<String>) -> Self {
        Self::MissingOutput {
            tool: tool.into(),
            path: path.into(),
        }
    }

    /// Returns true if the error came from cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// Error raised when a stage reads a bundle it did not declare.
#[derive(Debug, Clone, Error)]
#[error("Undeclared bundle: stage '{stage}' attempted to read '{bundle}' which it does not consume")]
pub struct UndeclaredBundleError {
    /// The stage attempting access.
    pub stage: String,
    /// The undeclared bundle.
    pub bundle: String,
}

impl UndeclaredBundleError {
    /// Creates a new undeclared bundle error.
    #[must_use]
    pub fn new(stage: impl Into<String>, bundle: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            bundle: bundle.into(),
        }
    }
}

/// Metadata about a pipeline definition error for better diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ContractErrorInfo {
    /// Error code (e.g., "PIPELINE-CYCLE").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ContractErrorInfo {
    /// Creates a new contract error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: HashMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Error raised when pipeline validation fails.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct PipelineValidationError {
    /// The error message.
    pub message: String,
    /// The stages involved in the error.
    pub stages: Vec<String>,
    /// Optional contract error info.
    pub error_info: Option<ContractErrorInfo>,
}

impl PipelineValidationError {
    /// Creates a new pipeline validation error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stages: Vec::new(),
            error_info: None,
        }
    }

    /// Sets the stages involved.
    #[must_use]
    pub fn with_stages(mut self, stages: Vec<String>) -> Self {
        self.stages = stages;
        self
    }

    /// Sets the contract error info.
    #[must_use]
    pub fn with_error_info(mut self, info: ContractErrorInfo) -> Self {
        self.error_info = Some(info);
        self
    }

    /// Returns the error code, if any.
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        self.error_info.as_ref().map(|info| info.code.as_str())
    }
}

/// Error raised when a cycle is detected in the pipeline graph.
#[derive(Debug, Clone, Error)]
#[error("Cycle detected in pipeline: {}", cycle_path.join(" -> "))]
pub struct CycleDetectedError {
    /// The path of stages forming the cycle.
    pub cycle_path: Vec<String>,
    /// Contract error info.
    pub error_info: ContractErrorInfo,
}

impl CycleDetectedError {
    /// Creates a new cycle detected error.
    #[must_use]
    pub fn new(cycle_path: Vec<String>) -> Self {
        let info = ContractErrorInfo::new(
            "PIPELINE-CYCLE",
            format!("Pipeline contains a dependency cycle: {}", cycle_path.join(" -> ")),
        )
        .with_fix_hint("Remove one of the dependencies in the cycle to break it.");

        Self {
            cycle_path,
            error_info: info,
        }
    }
}

impl From<CycleDetectedError> for PipelineValidationError {
    fn from(err: CycleDetectedError) -> Self {
        Self {
            message: err.to_string(),
            stages: err.cycle_path.clone(),
            error_info: Some(err.error_info),
        }
    }
}
