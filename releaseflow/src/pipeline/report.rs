//! Run reports.

use crate::artifacts::ArtifactStore;
use crate::core::{ArtifactKind, StageKind, StageOutput, StageStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Write as _;
use uuid::Uuid;

/// Aggregate outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every stage that ran succeeded.
    Success,
    /// At least one stage failed.
    Failure,
    /// The run was cancelled before completing.
    Cancelled,
}

/// The terminal record of one stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    /// The stage name.
    pub name: String,
    /// The stage kind.
    pub kind: StageKind,
    /// The terminal status.
    pub status: StageStatus,
    /// Why the stage did not succeed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Stable error code for failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    /// Individual failures aggregated by the stage.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<String>,
    /// Uploaded artifact keys per bundle.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub uploads: HashMap<String, Vec<String>>,
    /// Stage metadata.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
    /// When the stage started running; `None` if it never ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the stage reached its terminal state.
    pub finished_at: DateTime<Utc>,
}

impl StageRecord {
    /// Creates a record from a stage output.
    #[must_use]
    pub fn from_output(
        name: impl Into<String>,
        kind: StageKind,
        output: StageOutput,
        started_at: Option<DateTime<Utc>>,
    ) -> Self {
        let reason = output.reason().map(str::to_string);
        Self {
            name: name.into(),
            kind,
            status: output.status,
            reason,
            error_code: output.error_code,
            failures: output.failures,
            uploads: output.uploads,
            metadata: output.metadata,
            started_at,
            finished_at: Utc::now(),
        }
    }

    /// Returns true if the stage actually ran.
    #[must_use]
    pub fn ran(&self) -> bool {
        self.started_at.is_some()
    }

    /// Returns the stage duration in milliseconds, if it ran.
    #[must_use]
    pub fn duration_ms(&self) -> Option<i64> {
        self.started_at
            .map(|start| (self.finished_at - start).num_milliseconds())
    }
}

/// What happened on the hosting service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PublicationState {
    /// The publisher did not run; nothing external was touched.
    NothingPublished,
    /// The release entry exists with every asset.
    Published {
        /// The release tag.
        tag: String,
        /// Uploaded asset names.
        assets: Vec<String>,
    },
    /// The publisher ran and failed.
    PublicationFailed {
        /// Whether a release entry was created before the failure.
        release_created: bool,
        /// Assets that were uploaded.
        uploaded: Vec<String>,
        /// Assets that are missing from the release entry.
        missing: Vec<String>,
        /// Why publication failed.
        reason: String,
    },
}

impl PublicationState {
    fn from_record(record: Option<&StageRecord>) -> Self {
        let Some(record) = record else {
            return Self::NothingPublished;
        };
        let strings = |key: &str| -> Vec<String> {
            record
                .metadata
                .get(key)
                .and_then(|v| serde_json::from_value(v.clone()).ok())
                .unwrap_or_default()
        };
        match record.status {
            StageStatus::Success => Self::Published {
                tag: record
                    .metadata
                    .get("tag")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                assets: strings("uploaded"),
            },
            StageStatus::Failure => Self::PublicationFailed {
                release_created: record
                    .metadata
                    .get("release_created")
                    .and_then(serde_json::Value::as_bool)
                    .unwrap_or(false),
                uploaded: strings("uploaded"),
                missing: strings("missing"),
                reason: record.reason.clone().unwrap_or_default(),
            },
            _ => Self::NothingPublished,
        }
    }

    /// Returns true if the hosting service may hold a partial release.
    #[must_use]
    pub fn needs_attention(&self) -> bool {
        matches!(
            self,
            Self::PublicationFailed {
                release_created: true,
                ..
            }
        )
    }
}

/// Summary of one artifact present at the end of the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactSummary {
    /// The bundle holding the artifact.
    pub bundle: String,
    /// The artifact key.
    pub key: String,
    /// The artifact kind.
    pub kind: ArtifactKind,
    /// File name.
    pub file_name: String,
    /// Hex SHA-256.
    pub digest: String,
    /// Size in bytes.
    pub size: u64,
    /// Producing stage.
    pub produced_by: String,
}

/// Final state of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    /// The run id.
    pub run_id: Uuid,
    /// The pipeline name.
    pub pipeline: String,
    /// The trigger, rendered.
    pub trigger: String,
    /// The verified version, if the gate passed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// The aggregate outcome.
    pub outcome: RunOutcome,
    /// Stage records in topological order.
    pub stages: Vec<StageRecord>,
    /// What happened on the hosting service.
    pub publication: PublicationState,
    /// Artifacts present at the end of the run.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<ArtifactSummary>,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run finished.
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn assemble(
        run_id: Uuid,
        pipeline: &str,
        trigger: String,
        version: Option<String>,
        stages: Vec<StageRecord>,
        cancelled: bool,
        store: &ArtifactStore,
        started_at: DateTime<Utc>,
    ) -> Self {
        let outcome = if stages.iter().any(|s| s.status == StageStatus::Failure) {
            RunOutcome::Failure
        } else if cancelled || stages.iter().any(|s| s.status == StageStatus::Cancelled) {
            RunOutcome::Cancelled
        } else {
            RunOutcome::Success
        };
        let publication =
            PublicationState::from_record(stages.iter().find(|s| s.kind == StageKind::Publish));

        Self {
            run_id,
            pipeline: pipeline.to_string(),
            trigger,
            version,
            outcome,
            stages,
            publication,
            artifacts: summarize(store),
            started_at,
            finished_at: Utc::now(),
        }
    }

    /// Returns true if the run succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcome == RunOutcome::Success
    }

    /// Returns the record of `name`.
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&StageRecord> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Returns the terminal status of `name`.
    #[must_use]
    pub fn status_of(&self, name: &str) -> Option<StageStatus> {
        self.stage(name).map(|s| s.status)
    }

    /// Returns every failed stage.
    #[must_use]
    pub fn failed_stages(&self) -> Vec<&StageRecord> {
        self.stages
            .iter()
            .filter(|s| s.status == StageStatus::Failure)
            .collect()
    }

    /// Returns the names of stages in `status`.
    #[must_use]
    pub fn stages_with(&self, status: StageStatus) -> Vec<&str> {
        self.stages
            .iter()
            .filter(|s| s.status == status)
            .map(|s| s.name.as_str())
            .collect()
    }

    /// Returns the names of stages that actually ran.
    #[must_use]
    pub fn executed_stages(&self) -> Vec<&str> {
        self.stages
            .iter()
            .filter(|s| s.ran())
            .map(|s| s.name.as_str())
            .collect()
    }

    /// Returns the process exit code for this report.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        i32::from(!self.is_success())
    }

    /// Renders a human-readable summary.
    #[must_use]
    pub fn summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "run {} ({}) for {}: {:?}",
            self.run_id,
            self.pipeline,
            self.trigger,
            self.outcome
        );
        if let Some(version) = &self.version {
            let _ = writeln!(out, "version: {version}");
        }
        for stage in &self.stages {
            match &stage.reason {
                Some(reason) => {
                    let _ = writeln!(out, "  {:<24} {:<10} {reason}", stage.name, stage.status);
                }
                None => {
                    let _ = writeln!(out, "  {:<24} {}", stage.name, stage.status);
                }
            }
            for failure in &stage.failures {
                let _ = writeln!(out, "    - {failure}");
            }
        }
        match &self.publication {
            PublicationState::NothingPublished => {
                let _ = writeln!(out, "publication: nothing was published");
            }
            PublicationState::Published { tag, assets } => {
                let _ = writeln!(out, "publication: {tag} with {}", assets.join(", "));
            }
            PublicationState::PublicationFailed {
                release_created,
                uploaded,
                missing,
                reason,
            } => {
                let _ = writeln!(
                    out,
                    "publication failed: {reason} (release created: {release_created}, uploaded: [{}], missing: [{}])",
                    uploaded.join(", "),
                    missing.join(", ")
                );
                if *release_created {
                    let _ = writeln!(
                        out,
                        "  remove the partial release entry, then re-run `releaseflow publish`"
                    );
                }
            }
        }
        out
    }
}

fn summarize(store: &ArtifactStore) -> Vec<ArtifactSummary> {
    let mut names = store.bundle_names();
    names.sort();
    names
        .iter()
        .filter_map(|name| store.download(name))
        .flat_map(|bundle| {
            let name = bundle.name().to_string();
            bundle
                .iter()
                .map(|a| ArtifactSummary {
                    bundle: name.clone(),
                    key: a.key.clone(),
                    kind: a.kind,
                    file_name: a.file_name.clone(),
                    digest: a.digest.clone(),
                    size: a.size,
                    produced_by: a.produced_by.clone(),
                })
                .collect::<Vec<_>>()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn record(name: &str, kind: StageKind, output: StageOutput) -> StageRecord {
        StageRecord::from_output(name, kind, output, Some(Utc::now()))
    }

    fn report(stages: Vec<StageRecord>, cancelled: bool) -> RunReport {
        RunReport::assemble(
            Uuid::new_v4(),
            "release",
            "tag v1.2.3".to_string(),
            Some("1.2.3".to_string()),
            stages,
            cancelled,
            &ArtifactStore::new(),
            Utc::now(),
        )
    }

    #[test]
    fn test_outcome_aggregation() {
        let ok = report(
            vec![
                record("version", StageKind::Gate, StageOutput::success()),
                record("publish", StageKind::Publish, StageOutput::skip("branch main is not a version tag")),
            ],
            false,
        );
        assert_eq!(ok.outcome, RunOutcome::Success);
        assert_eq!(ok.exit_code(), 0);
        assert_eq!(ok.publication, PublicationState::NothingPublished);

        let failed = report(
            vec![
                record("version", StageKind::Gate, StageOutput::fail("mismatch")),
                record("build", StageKind::Build, StageOutput::skip("dependency failed")),
            ],
            false,
        );
        assert_eq!(failed.outcome, RunOutcome::Failure);
        assert_eq!(failed.exit_code(), 1);
        assert_eq!(failed.failed_stages().len(), 1);

        let cancelled = report(
            vec![record("version", StageKind::Gate, StageOutput::cancel("operator abort"))],
            true,
        );
        assert_eq!(cancelled.outcome, RunOutcome::Cancelled);
    }

    #[test]
    fn test_publication_failed_state() {
        let output = StageOutput::fail("Upload of asset 'oso-java-1.2.3.zip' failed: reset")
            .with_metadata("release_created", serde_json::json!(true))
            .with_metadata("uploaded", serde_json::json!(["oso-lib-1.2.3.zip"]))
            .with_metadata("missing", serde_json::json!(["oso-java-1.2.3.zip"]));
        let report = report(vec![record("publish", StageKind::Publish, output)], false);

        match &report.publication {
            PublicationState::PublicationFailed {
                release_created,
                uploaded,
                missing,
                ..
            } => {
                assert!(release_created);
                assert_eq!(uploaded, &vec!["oso-lib-1.2.3.zip".to_string()]);
                assert_eq!(missing, &vec!["oso-java-1.2.3.zip".to_string()]);
            }
            other => panic!("unexpected state: {other:?}"),
        }
        assert!(report.publication.needs_attention());
        assert!(report.summary().contains("releaseflow publish"));
    }

    #[test]
    fn test_record_without_start_did_not_run() {
        let record = StageRecord::from_output("merge-macos", StageKind::Merge, StageOutput::skip("x"), None);
        assert!(!record.ran());
        assert_eq!(record.duration_ms(), None);
        assert_eq!(record.reason.as_deref(), Some("x"));
    }
}
