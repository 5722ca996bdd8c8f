//! Stage output type with factory methods.

use super::StageStatus;
use crate::errors::ReleaseError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The output of a stage execution.
///
/// `StageOutput` is immutable once created and provides factory methods
/// for creating outputs with different statuses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageOutput {
    /// The status of the stage execution.
    pub status: StageStatus,

    /// Keys of the artifacts this stage uploaded, per bundle.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub uploads: HashMap<String, Vec<String>>,

    /// Additional metadata.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,

    /// Error message (for failed executions).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Stable error code (for failed executions).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,

    /// Individual failures aggregated into this output (e.g. matrix cells).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<String>,

    /// Skip reason (for skipped executions).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,

    /// Cancel reason (for cancelled executions).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<String>,
}

impl Default for StageOutput {
    fn default() -> Self {
        Self::success()
    }
}

impl StageOutput {
    fn with_status(status: StageStatus) -> Self {
        Self {
            status,
            uploads: HashMap::new(),
            metadata: HashMap::new(),
            error: None,
            error_code: None,
            failures: Vec::new(),
            skip_reason: None,
            cancel_reason: None,
        }
    }

    /// Creates a successful output.
    #[must_use]
    pub fn success() -> Self {
        Self::with_status(StageStatus::Success)
    }

    /// Creates a failure output from a plain message.
    #[must_use]
    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::with_status(StageStatus::Failure)
        }
    }

    /// Creates a failure output from a release error.
    #[must_use]
    pub fn from_error(err: &ReleaseError) -> Self {
        Self {
            error: Some(err.to_string()),
            error_code: Some(err.code().to_string()),
            ..Self::with_status(StageStatus::Failure)
        }
        .with_metadata("error", serde_json::json!(err.to_dict()))
    }

    /// Creates a skip output with a reason.
    #[must_use]
    pub fn skip(reason: impl Into<String>) -> Self {
        Self {
            skip_reason: Some(reason.into()),
            ..Self::with_status(StageStatus::Skipped)
        }
    }

    /// Creates a cancel output with a reason.
    #[must_use]
    pub fn cancel(reason: impl Into<String>) -> Self {
        Self {
            cancel_reason: Some(reason.into()),
            ..Self::with_status(StageStatus::Cancelled)
        }
    }

    /// Records uploaded artifact keys for a bundle.
    #[must_use]
    pub fn with_uploads(mut self, bundle: impl Into<String>, keys: Vec<String>) -> Self {
        self.uploads.entry(bundle.into()).or_default().extend(keys);
        self
    }

    /// Adds metadata.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Adds aggregated failure details.
    #[must_use]
    pub fn with_failures(mut self, failures: Vec<String>) -> Self {
        self.failures = failures;
        self
    }

    /// Returns true if the stage succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Returns true if the stage failed.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        self.status.is_failure()
    }

    /// Returns a human-readable reason for a non-success output.
    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        match self.status {
            StageStatus::Failure => self.error.as_deref(),
            StageStatus::Skipped => self.skip_reason.as_deref(),
            StageStatus::Cancelled => self.cancel_reason.as_deref(),
            _ => None,
        }
    }
}
