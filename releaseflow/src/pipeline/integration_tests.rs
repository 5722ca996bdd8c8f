//! End-to-end tests of the standard release DAG against in-memory tools.

#[cfg(test)]
mod tests {
    use crate::artifacts::{ArtifactStore, MERGED_LIBS, NATIVE_LIBS, RELEASE};
    use crate::cancellation::CancellationToken;
    use crate::config::ReleaseConfig;
    use crate::context::RunContext;
    use crate::core::{Arch, Os, StageStatus, Target};
    use crate::events::{CollectingEventSink, PipelineEvent};
    use crate::pipeline::{PublicationState, RetryConfig, RunOutcome, RunReport, StageGraph};
    use crate::release::{publish_graph, release_graph, ReleaseTools};
    use crate::stages::ValidationCell;
    use crate::testing::fixtures::{BINDING, PROJECT};
    use crate::testing::{
        FakeArchiver, FakeBindingTool, FakeEnvironmentRunner, FakeLinker, FakeToolchain,
        InMemoryReleaseHost,
    };
    use crate::version::{StaticVersionSource, Trigger};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::time::Duration;

    const LIB_ASSET: &str = "oso-lib-1.2.3.zip";
    const BINDING_ASSET: &str = "oso-java-1.2.3.zip";

    struct Harness {
        config: ReleaseConfig,
        version: String,
        toolchain: Arc<FakeToolchain>,
        linker: Arc<FakeLinker>,
        binding: Arc<FakeBindingTool>,
        runner: Arc<FakeEnvironmentRunner>,
        archiver: Arc<FakeArchiver>,
        host: Arc<InMemoryReleaseHost>,
    }

    impl Harness {
        fn new() -> Self {
            let mut config = ReleaseConfig::new(PROJECT);
            config.project.binding = BINDING.to_string();
            config.validate.cells = vec![
                ValidationCell::new(Os::Linux, "11"),
                ValidationCell::new(Os::Linux, "17"),
                ValidationCell::new(Os::Macos, "11"),
                ValidationCell::new(Os::Macos, "17"),
            ];
            config.execution.upload_retry = RetryConfig::new()
                .with_base_delay_ms(1)
                .with_max_delay_ms(5);

            Self {
                config,
                version: "1.2.3".to_string(),
                toolchain: Arc::new(FakeToolchain::new()),
                linker: Arc::new(FakeLinker::new()),
                binding: Arc::new(FakeBindingTool::new()),
                runner: Arc::new(FakeEnvironmentRunner::new()),
                archiver: Arc::new(FakeArchiver::new()),
                host: Arc::new(InMemoryReleaseHost::new()),
            }
        }

        fn with_version(mut self, version: &str) -> Self {
            self.version = version.to_string();
            self
        }

        fn with_toolchain(mut self, toolchain: FakeToolchain) -> Self {
            self.toolchain = Arc::new(toolchain);
            self
        }

        fn with_runner(mut self, runner: FakeEnvironmentRunner) -> Self {
            self.runner = Arc::new(runner);
            self
        }

        fn with_host(mut self, host: InMemoryReleaseHost) -> Self {
            self.host = Arc::new(host);
            self
        }

        fn tools(&self) -> ReleaseTools {
            ReleaseTools {
                version_source: Arc::new(StaticVersionSource(self.version.clone())),
                toolchain: self.toolchain.clone(),
                linker: self.linker.clone(),
                binding: self.binding.clone(),
                runner: self.runner.clone(),
                archiver: self.archiver.clone(),
                host: self.host.clone(),
            }
        }

        fn graph(&self) -> StageGraph {
            release_graph(&self.config, &self.tools()).unwrap()
        }

        async fn run(&self, git_ref: &str) -> RunReport {
            let run = Arc::new(RunContext::new(Trigger::from_ref(git_ref)));
            self.graph().execute(run).await
        }
    }

    fn sorted(mut names: Vec<&str>) -> Vec<&str> {
        names.sort_unstable();
        names
    }

    fn position(events: &[PipelineEvent], stage: &str, types: &[&str]) -> usize {
        events
            .iter()
            .position(|e| e.stage.as_deref() == Some(stage) && types.contains(&e.event_type.as_str()))
            .unwrap_or_else(|| panic!("no {types:?} event for {stage}"))
    }

    #[tokio::test]
    async fn test_full_release_publishes_two_assets() {
        let harness = Harness::new();
        let report = harness.run("refs/tags/v1.2.3").await;

        assert_eq!(report.outcome, RunOutcome::Success, "{}", report.summary());
        assert_eq!(report.version.as_deref(), Some("1.2.3"));
        assert_eq!(report.executed_stages().len(), 10);

        let entry = harness.host.entry("v1.2.3").unwrap();
        assert!(entry.prerelease);
        assert!(!entry.draft);
        assert_eq!(harness.host.release_count(), 1);
        assert_eq!(harness.host.assets("v1.2.3"), vec![BINDING_ASSET, LIB_ASSET]);
        assert_eq!(
            report.publication,
            PublicationState::Published {
                tag: "v1.2.3".to_string(),
                assets: vec![LIB_ASSET.to_string(), BINDING_ASSET.to_string()],
            }
        );

        // One universal pair per multi-arch OS.
        assert_eq!(harness.linker.calls(), 4);
        let merged = report
            .artifacts
            .iter()
            .filter(|a| a.bundle == MERGED_LIBS)
            .map(|a| a.key.as_str())
            .collect::<Vec<_>>();
        for key in ["linux-fat", "linux-fat-static", "macos-fat", "macos-fat-static"] {
            assert!(merged.contains(&key), "{key} missing from {merged:?}");
        }

        let versions: Vec<String> = harness
            .binding
            .packaged_versions()
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(versions, vec!["1.2.3"]);
        assert_eq!(harness.runner.calls().len(), 4);

        let archives = harness.archiver.archives();
        let (_, lib_keys) = archives.iter().find(|(name, _)| name == LIB_ASSET).unwrap();
        for key in ["linux", "linux-arm", "linux-static", "macos-fat", "macos-fat-static", "header"] {
            assert!(lib_keys.contains(&key.to_string()), "{key} missing from {lib_keys:?}");
        }
        let (_, binding_keys) = archives.iter().find(|(name, _)| name == BINDING_ASSET).unwrap();
        assert_eq!(binding_keys, &vec![BINDING.to_string()]);
    }

    #[tokio::test]
    async fn test_builder_failure_names_exactly_three_stages() {
        let failing = Target::new(Os::Macos, Arch::Aarch64);
        let harness = Harness::new().with_toolchain(FakeToolchain::new().failing_on(failing));
        let report = harness.run("refs/tags/v1.2.3").await;

        assert_eq!(report.outcome, RunOutcome::Failure);
        let failed: Vec<&str> = report.failed_stages().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(sorted(failed), vec!["build-macos-aarch64", "merge-macos", "package"]);

        assert_eq!(report.status_of("build-macos-x86_64"), Some(StageStatus::Success));
        assert_eq!(report.status_of("merge-linux"), Some(StageStatus::Success));
        assert_eq!(report.status_of("validate"), Some(StageStatus::Skipped));
        assert_eq!(report.status_of("publish"), Some(StageStatus::Skipped));

        let merge = report.stage("merge-macos").unwrap();
        assert_eq!(merge.error_code.as_deref(), Some("MERGE_FAILURE"));
        assert!(merge.reason.as_deref().unwrap_or_default().contains("build-macos-aarch64"));
        assert_eq!(
            report.stage("package").unwrap().error_code.as_deref(),
            Some("PACKAGING_FAILURE")
        );

        // Only the Linux pair reached the linker; no partial macOS merge.
        assert_eq!(harness.linker.calls(), 2);
        assert!(harness.runner.calls().is_empty());
        assert_eq!(harness.host.release_count(), 0);
        assert_eq!(report.publication, PublicationState::NothingPublished);
        assert_eq!(report.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_version_mismatch_runs_nothing_downstream() {
        let harness = Harness::new().with_version("1.2.4");
        let report = harness.run("refs/tags/v1.2.3").await;

        assert_eq!(report.outcome, RunOutcome::Failure);
        assert_eq!(report.executed_stages(), vec!["version"]);
        assert_eq!(
            report.stage("version").unwrap().error_code.as_deref(),
            Some("VERSION_MISMATCH")
        );
        for stage in report.stages.iter().filter(|s| s.name != "version") {
            assert_eq!(stage.status, StageStatus::Skipped, "{} should be skipped", stage.name);
        }

        assert!(harness.toolchain.requests().is_empty());
        assert_eq!(harness.linker.calls(), 0);
        assert!(harness.binding.packaged_versions().is_empty());
        assert_eq!(harness.host.release_count(), 0);
        assert_eq!(report.publication, PublicationState::NothingPublished);
    }

    #[tokio::test]
    async fn test_branch_runs_never_create_a_release() {
        let harness = Harness::new();

        for _ in 0..2 {
            let report = harness.run("refs/heads/main").await;
            assert_eq!(report.outcome, RunOutcome::Success, "{}", report.summary());
            assert_eq!(report.status_of("validate"), Some(StageStatus::Success));
            assert_eq!(report.status_of("publish"), Some(StageStatus::Skipped));
            assert!(!report.stage("publish").unwrap().ran());
        }

        assert_eq!(harness.host.release_count(), 0);
        assert!(harness.host.upload_attempts().is_empty());
        assert!(harness.archiver.archives().is_empty());
    }

    #[tokio::test]
    async fn test_rerun_on_published_tag_conflicts_without_uploads() {
        let harness = Harness::new();
        let first = harness.run("refs/tags/v1.2.3").await;
        assert!(first.is_success());
        let attempts = harness.host.upload_attempts().len();

        let second = harness.run("refs/tags/v1.2.3").await;

        assert_eq!(second.outcome, RunOutcome::Failure);
        assert_eq!(second.failed_stages().len(), 1);
        let publish = second.stage("publish").unwrap();
        assert_eq!(publish.error_code.as_deref(), Some("PUBLISH_CONFLICT"));
        assert_eq!(harness.host.upload_attempts().len(), attempts);
        assert_eq!(harness.host.release_count(), 1);
        assert!(matches!(
            second.publication,
            PublicationState::PublicationFailed { release_created: false, .. }
        ));
        assert!(!second.publication.needs_attention());
    }

    #[tokio::test]
    async fn test_pre_existing_release_is_never_overwritten() {
        let harness = Harness::new().with_host(InMemoryReleaseHost::new().with_release("v1.2.3"));
        let report = harness.run("refs/tags/v1.2.3").await;

        assert_eq!(
            report.stage("publish").unwrap().error_code.as_deref(),
            Some("PUBLISH_CONFLICT")
        );
        assert!(harness.host.upload_attempts().is_empty());
        assert!(harness.host.assets("v1.2.3").is_empty());
    }

    #[tokio::test]
    async fn test_validation_cells_aggregate_independently() {
        let harness = Harness::new().with_runner(FakeEnvironmentRunner::new().failing_on(Os::Macos, "17"));
        let report = harness.run("refs/tags/v1.2.3").await;

        assert_eq!(report.outcome, RunOutcome::Failure);
        assert_eq!(harness.runner.calls().len(), 4);

        let validate = report.stage("validate").unwrap();
        assert_eq!(validate.status, StageStatus::Failure);
        assert_eq!(validate.failures.len(), 1);
        assert!(validate.failures[0].contains("macos with runtime 17"));
        let cells = &validate.metadata["cells"];
        assert_eq!(cells["linux/11"]["status"], "passed");
        assert_eq!(cells["linux/17"]["status"], "passed");
        assert_eq!(cells["macos/11"]["status"], "passed");
        assert_eq!(cells["macos/17"]["status"], "failed");

        assert_eq!(report.status_of("publish"), Some(StageStatus::Skipped));
        assert_eq!(harness.host.release_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_merger_waits_for_every_sibling_builder() {
        let harness = Harness::new().with_toolchain(FakeToolchain::new().with_delay(Duration::from_secs(5)));
        let sink = Arc::new(CollectingEventSink::new());
        let run = Arc::new(RunContext::new(Trigger::from_ref("refs/heads/main")).with_event_sink(sink.clone()));

        let report = harness.graph().execute(run).await;
        assert!(report.is_success(), "{}", report.summary());

        let events = sink.events();
        let terminal = ["stage.completed", "stage.failed", "stage.skipped", "stage.cancelled"];
        for (merge, builders) in [
            ("merge-linux", ["build-linux-x86_64", "build-linux-aarch64"]),
            ("merge-macos", ["build-macos-x86_64", "build-macos-aarch64"]),
        ] {
            let started = position(&events, merge, &["stage.started"]);
            for builder in builders {
                assert!(position(&events, builder, &terminal) < started, "{merge} started before {builder} finished");
            }
        }
        let publish_at = position(&events, "publish", &terminal);
        assert!(position(&events, "validate", &terminal) < publish_at);
    }

    #[tokio::test]
    async fn test_transient_upload_failures_are_retried() {
        let harness = Harness::new().with_host(InMemoryReleaseHost::new().failing_upload(LIB_ASSET, 2));
        let report = harness.run("refs/tags/v1.2.3").await;

        assert!(report.is_success(), "{}", report.summary());
        let lib_attempts = harness
            .host
            .upload_attempts()
            .iter()
            .filter(|name| *name == LIB_ASSET)
            .count();
        assert_eq!(lib_attempts, 3);
        assert_eq!(harness.host.assets("v1.2.3").len(), 2);
    }

    #[tokio::test]
    async fn test_exhausted_upload_reports_partial_release_and_publish_recovers() {
        let harness = Harness::new().with_host(InMemoryReleaseHost::new().always_failing_upload(BINDING_ASSET));
        let store = Arc::new(ArtifactStore::new());
        let run = Arc::new(
            RunContext::new(Trigger::from_ref("refs/tags/v1.2.3")).with_artifact_store(store.clone()),
        );
        let report = harness.graph().execute(run).await;

        assert_eq!(report.outcome, RunOutcome::Failure);
        assert_eq!(report.failed_stages().len(), 1);
        assert_eq!(
            report.stage("publish").unwrap().error_code.as_deref(),
            Some("UPLOAD_FAILURE")
        );
        match &report.publication {
            PublicationState::PublicationFailed {
                release_created,
                uploaded,
                missing,
                ..
            } => {
                assert!(*release_created);
                assert_eq!(uploaded, &vec![LIB_ASSET.to_string()]);
                assert_eq!(missing, &vec![BINDING_ASSET.to_string()]);
            }
            other => panic!("unexpected publication state {other:?}"),
        }
        assert!(report.publication.needs_attention());
        assert!(report.summary().contains("re-run `releaseflow publish`"));

        // The operator removes the partial entry and publishes from the
        // persisted store without rebuilding.
        let dir = tempfile::tempdir().unwrap();
        store.persist(dir.path()).unwrap();
        let loaded = Arc::new(ArtifactStore::load(dir.path()).unwrap());
        assert!(loaded.download(RELEASE).is_some());
        assert!(loaded.download(NATIVE_LIBS).is_some());

        let retry = Harness::new();
        let graph = publish_graph(&retry.config, &retry.tools()).unwrap();
        let run = Arc::new(RunContext::new(Trigger::from_ref("refs/tags/v1.2.3")).with_artifact_store(loaded));
        let report = graph.execute(run).await;

        assert!(report.is_success(), "{}", report.summary());
        assert_eq!(report.executed_stages(), vec!["version", "publish"]);
        assert!(retry.toolchain.requests().is_empty());
        assert!(retry.archiver.archives().is_empty());
        assert_eq!(retry.host.assets("v1.2.3"), vec![BINDING_ASSET, LIB_ASSET]);
    }

    #[tokio::test]
    async fn test_cancelled_run_starts_nothing() {
        let harness = Harness::new();
        let token = Arc::new(CancellationToken::new());
        token.cancel("superseded by a newer push");
        let run = Arc::new(RunContext::new(Trigger::from_ref("refs/tags/v1.2.3")).with_cancellation(token));

        let report = harness.graph().execute(run).await;

        assert_eq!(report.outcome, RunOutcome::Cancelled);
        assert!(report.executed_stages().is_empty());
        assert!(report.stages.iter().all(|s| s.status == StageStatus::Cancelled));
        assert!(harness.toolchain.requests().is_empty());
        assert_eq!(report.publication, PublicationState::NothingPublished);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_during_builds_publishes_nothing() {
        let harness = Harness::new().with_toolchain(FakeToolchain::new().with_delay(Duration::from_secs(60)));
        let token = Arc::new(CancellationToken::new());
        let run = Arc::new(
            RunContext::new(Trigger::from_ref("refs/tags/v1.2.3")).with_cancellation(token.clone()),
        );

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            token.cancel("operator abort");
        });
        let report = harness.graph().execute(run).await;
        canceller.await.unwrap();

        assert_eq!(report.outcome, RunOutcome::Cancelled);
        assert_eq!(report.status_of("version"), Some(StageStatus::Success));
        for target in crate::release::STANDARD_TARGETS {
            let name = format!("build-{}", target.slug());
            assert_eq!(report.status_of(&name), Some(StageStatus::Cancelled), "{name}");
        }
        assert_eq!(report.status_of("publish"), Some(StageStatus::Cancelled));
        assert_eq!(harness.linker.calls(), 0);
        assert_eq!(harness.host.release_count(), 0);
    }

    #[tokio::test]
    async fn test_report_serializes_publication_state() {
        let harness = Harness::new();
        let report = harness.run("refs/tags/v1.2.3").await;

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["outcome"], "success");
        assert_eq!(json["publication"]["state"], "published");
        assert_eq!(json["publication"]["tag"], "v1.2.3");
        assert!(json["artifacts"]
            .as_array()
            .unwrap()
            .iter()
            .all(|a| a["digest"].as_str().is_some_and(|d| d.len() == 64)));
    }
}
