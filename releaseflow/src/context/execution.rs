//! Run-wide and per-stage execution contexts.

use crate::artifacts::{ArtifactStore, BundleSnapshot};
use crate::cancellation::CancellationToken;
use crate::core::{Artifact, StageStatus};
use crate::errors::{ReleaseError, ReleaseflowError, UndeclaredBundleError};
use crate::events::{EventSink, NoOpEventSink, PipelineEvent};
use crate::version::{Trigger, Version};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock};
use uuid::Uuid;

/// Shared, read-mostly state of one pipeline run.
///
/// The version is written exactly once by the gate stage and read by
/// every other stage; the artifact store is append-only.
pub struct RunContext {
    run_id: Uuid,
    trigger: Trigger,
    /// Evaluated once when the run is created.
    release_run: bool,
    version: OnceLock<Version>,
    artifacts: Arc<ArtifactStore>,
    event_sink: Arc<dyn EventSink>,
    cancel: Arc<CancellationToken>,
    started_at: DateTime<Utc>,
}

impl RunContext {
    /// Creates a new run context for `trigger`.
    #[must_use]
    pub fn new(trigger: Trigger) -> Self {
        let release_run = trigger.is_version_tag();
        Self {
            run_id: Uuid::new_v4(),
            trigger,
            release_run,
            version: OnceLock::new(),
            artifacts: Arc::new(ArtifactStore::new()),
            event_sink: Arc::new(NoOpEventSink),
            cancel: Arc::new(CancellationToken::new()),
            started_at: Utc::now(),
        }
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Uses an existing artifact store (e.g. one loaded from disk).
    #[must_use]
    pub fn with_artifact_store(mut self, store: Arc<ArtifactStore>) -> Self {
        self.artifacts = store;
        self
    }

    /// Shares a cancellation token with the caller.
    #[must_use]
    pub fn with_cancellation(mut self, token: Arc<CancellationToken>) -> Self {
        self.cancel = token;
        self
    }

    /// Returns the run id.
    #[must_use]
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Returns the trigger.
    #[must_use]
    pub fn trigger(&self) -> &Trigger {
        &self.trigger
    }

    /// Returns true if this run was triggered by a version tag.
    #[must_use]
    pub fn is_release_run(&self) -> bool {
        self.release_run
    }

    /// Returns when the run started.
    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Returns the verified version.
    ///
    /// # Errors
    ///
    /// Returns `MissingVersion` if the gate stage has not published it.
    pub fn version(&self) -> Result<&Version, ReleaseError> {
        self.version.get().ok_or_else(|| {
            ReleaseError::MissingVersion("version has not been verified for this run".to_string())
        })
    }

    /// Publishes the verified version. Publishing the same value twice is
    /// allowed; a different value is an error.
    ///
    /// # Errors
    ///
    /// Returns an internal error if a different version was already set.
    pub fn publish_version(&self, version: Version) -> Result<(), ReleaseflowError> {
        let current = self.version.get_or_init(|| version.clone());
        if *current != version {
            return Err(ReleaseflowError::Internal(format!(
                "version already set to '{current}', refusing '{version}'"
            )));
        }
        Ok(())
    }

    /// Returns the artifact store.
    #[must_use]
    pub fn artifacts(&self) -> &Arc<ArtifactStore> {
        &self.artifacts
    }

    /// Returns the cancellation token.
    #[must_use]
    pub fn cancellation(&self) -> &Arc<CancellationToken> {
        &self.cancel
    }

    /// Returns true if the run was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Emits a lifecycle event.
    pub fn emit(&self, event_type: &str, stage: Option<&str>, data: serde_json::Value) {
        self.event_sink
            .emit(&PipelineEvent::new(self.run_id, event_type, stage, data));
    }
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("run_id", &self.run_id)
            .field("trigger", &self.trigger)
            .field("version", &self.version.get())
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// The view of a run given to one executing stage.
///
/// Bundle reads are restricted to the bundles the stage declared it
/// consumes.
#[derive(Debug, Clone)]
pub struct StageContext {
    run: Arc<RunContext>,
    stage_name: String,
    consumes: HashSet<String>,
    dependencies: HashMap<String, StageStatus>,
}

impl StageContext {
    /// Creates a new stage context.
    #[must_use]
    pub fn new(
        run: Arc<RunContext>,
        stage_name: impl Into<String>,
        consumes: HashSet<String>,
        dependencies: HashMap<String, StageStatus>,
    ) -> Self {
        Self {
            run,
            stage_name: stage_name.into(),
            consumes,
            dependencies,
        }
    }

    /// Returns the stage name.
    #[must_use]
    pub fn stage_name(&self) -> &str {
        &self.stage_name
    }

    /// Returns the run context.
    #[must_use]
    pub fn run(&self) -> &Arc<RunContext> {
        &self.run
    }

    /// Returns the verified version.
    ///
    /// # Errors
    ///
    /// Returns `MissingVersion` if the gate stage has not run.
    pub fn version(&self) -> Result<&Version, ReleaseError> {
        self.run.version()
    }

    /// Downloads a declared bundle.
    ///
    /// # Errors
    ///
    /// Returns `UndeclaredBundleError` if the stage did not declare `bundle`.
    pub fn bundle(&self, bundle: &str) -> Result<Option<BundleSnapshot>, UndeclaredBundleError> {
        if !self.consumes.contains(bundle) {
            return Err(UndeclaredBundleError::new(&self.stage_name, bundle));
        }
        Ok(self.run.artifacts().download(bundle))
    }

    /// Uploads artifacts into a bundle, stamping this stage as producer.
    ///
    /// # Errors
    ///
    /// Returns `ArtifactConflict` if an artifact would replace another.
    pub fn upload(&self, bundle: &str, artifacts: Vec<Artifact>) -> Result<Vec<String>, ReleaseError> {
        let stamped = artifacts
            .into_iter()
            .map(|a| a.produced_by(&self.stage_name))
            .collect();
        self.run.artifacts().upload(bundle, stamped)
    }

    /// Returns the terminal status of a dependency.
    #[must_use]
    pub fn dependency_status(&self, stage: &str) -> Option<StageStatus> {
        self.dependencies.get(stage).copied()
    }

    /// Returns the names of dependencies that did not succeed, sorted.
    #[must_use]
    pub fn failed_dependencies(&self) -> Vec<String> {
        let mut failed: Vec<String> = self
            .dependencies
            .iter()
            .filter(|(_, status)| !status.is_success())
            .map(|(name, _)| name.clone())
            .collect();
        failed.sort();
        failed
    }

    /// Returns true if the run was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.run.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ArtifactKind, Platform};
    use crate::events::CollectingEventSink;

    fn tag_run() -> Arc<RunContext> {
        Arc::new(RunContext::new(Trigger::Tag("v1.2.3".to_string())))
    }

    #[test]
    fn test_release_run_predicate() {
        assert!(tag_run().is_release_run());
        assert!(!RunContext::new(Trigger::Branch("main".to_string())).is_release_run());
        assert!(!RunContext::new(Trigger::Tag("nightly".to_string())).is_release_run());
    }

    #[test]
    fn test_version_is_set_once() {
        let run = tag_run();
        assert!(run.version().is_err());

        run.publish_version(Version::parse("1.2.3").unwrap()).unwrap();
        run.publish_version(Version::parse("1.2.3").unwrap()).unwrap();
        assert!(run.publish_version(Version::parse("1.2.4").unwrap()).is_err());
        assert_eq!(run.version().unwrap().as_str(), "1.2.3");
    }

    #[test]
    fn test_stage_context_enforces_declared_bundles() {
        let run = tag_run();
        let ctx = StageContext::new(
            run,
            "merge-macos",
            HashSet::from(["native-libs".to_string()]),
            HashMap::new(),
        );

        assert!(ctx.bundle("native-libs").unwrap().is_none());
        let err = ctx.bundle("package").unwrap_err();
        assert_eq!(err.bundle, "package");
    }

    #[test]
    fn test_upload_stamps_producer() {
        let run = tag_run();
        let ctx = StageContext::new(run.clone(), "build-linux-x86_64", HashSet::new(), HashMap::new());
        let header = Artifact::new("header", ArtifactKind::Header, Platform::Shared, "oso.h", vec![1]);

        ctx.upload("native-libs", vec![header]).unwrap();
        let bundle = run.artifacts().download("native-libs").unwrap();
        assert_eq!(bundle.get("header").unwrap().produced_by, "build-linux-x86_64");
    }

    #[test]
    fn test_failed_dependencies() {
        let ctx = StageContext::new(
            tag_run(),
            "merge-macos",
            HashSet::new(),
            HashMap::from([
                ("build-macos-x86_64".to_string(), StageStatus::Success),
                ("build-macos-aarch64".to_string(), StageStatus::Failure),
            ]),
        );
        assert_eq!(ctx.failed_dependencies(), vec!["build-macos-aarch64".to_string()]);
        assert_eq!(ctx.dependency_status("build-macos-x86_64"), Some(StageStatus::Success));
    }

    #[test]
    fn test_emit_reaches_sink() {
        let sink = Arc::new(CollectingEventSink::new());
        let run = RunContext::new(Trigger::Branch("main".to_string())).with_event_sink(sink.clone());
        run.emit("run.started", None, serde_json::json!({}));
        assert_eq!(sink.events()[0].run_id, run.run_id());
    }
}
