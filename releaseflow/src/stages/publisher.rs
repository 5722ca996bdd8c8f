//! Publishing the tagged release.

use super::Stage;
use crate::artifacts::{MERGED_LIBS, NATIVE_LIBS, PACKAGE, RELEASE};
use crate::context::StageContext;
use crate::core::{Artifact, ArtifactKind, Platform, StageOutput};
use crate::errors::{ReleaseError, ToolError};
use crate::pipeline::{invoke, with_retry_if, RetryConfig};
use crate::tools::{Archiver, ReleaseEntry, ReleaseHost};
use crate::version::Version;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Naming and retry settings for publication.
#[derive(Debug, Clone)]
pub struct PublishSettings {
    /// Project name, e.g. `oso`.
    pub project: String,
    /// Binding label, e.g. `java`.
    pub binding: String,
    /// Retry policy for asset uploads.
    pub upload_retry: RetryConfig,
    /// Timeout of each hosting-service call.
    pub timeout: Duration,
}

impl PublishSettings {
    /// Creates settings with the default upload retry policy.
    #[must_use]
    pub fn new(project: impl Into<String>, binding: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            binding: binding.into(),
            upload_retry: RetryConfig::default(),
            timeout: Duration::from_secs(10 * 60),
        }
    }

    /// Sets the upload retry policy.
    #[must_use]
    pub fn with_upload_retry(mut self, retry: RetryConfig) -> Self {
        self.upload_retry = retry;
        self
    }

    /// Sets the hosting-service timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Name of the native library archive, `<project>-lib-<version>.zip`.
    #[must_use]
    pub fn lib_archive(&self, version: &Version) -> String {
        format!("{}-lib-{version}.zip", self.project)
    }

    /// Name of the binding archive, `<project>-<binding>-<version>.zip`.
    #[must_use]
    pub fn binding_archive(&self, version: &Version) -> String {
        format!("{}-{}-{version}.zip", self.project, self.binding)
    }
}

/// Tracks what reached the hosting service, for the run report.
#[derive(Debug, Default)]
struct Progress {
    tag: String,
    release_created: bool,
    uploaded: Vec<String>,
    missing: Vec<String>,
}

impl Progress {
    fn finish(self, output: StageOutput) -> StageOutput {
        output
            .with_metadata("tag", serde_json::json!(self.tag))
            .with_metadata("release_created", serde_json::json!(self.release_created))
            .with_metadata("uploaded", serde_json::json!(self.uploaded))
            .with_metadata("missing", serde_json::json!(self.missing))
    }
}

/// Creates the release entry for a version tag and uploads both archives.
///
/// The entry is written at most once per tag: an existing entry fails the
/// stage with `PublishConflict` before anything is uploaded.
#[derive(Debug, Clone)]
pub struct ReleasePublisherStage {
    name: String,
    settings: PublishSettings,
    archiver: Arc<dyn Archiver>,
    host: Arc<dyn ReleaseHost>,
}

impl ReleasePublisherStage {
    /// Creates the publisher.
    #[must_use]
    pub fn new(settings: PublishSettings, archiver: Arc<dyn Archiver>, host: Arc<dyn ReleaseHost>) -> Self {
        Self {
            name: "publish".to_string(),
            settings,
            archiver,
            host,
        }
    }

    /// Sets the stage name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    fn bundle_artifacts(ctx: &StageContext, bundles: &[&str]) -> Result<Vec<Artifact>, String> {
        let mut by_key: BTreeMap<String, Artifact> = BTreeMap::new();
        for bundle in bundles {
            let snapshot = ctx.bundle(bundle).map_err(|e| e.to_string())?;
            for artifact in snapshot.iter().flat_map(|s| s.iter()) {
                by_key.entry(artifact.key.clone()).or_insert_with(|| artifact.clone());
            }
        }
        Ok(by_key.into_values().collect())
    }

    async fn build_archive(&self, ctx: &StageContext, name: &str, bundles: &[&str]) -> Result<Artifact, String> {
        let entries = Self::bundle_artifacts(ctx, bundles)?;
        if entries.is_empty() {
            return Err(format!("nothing to archive into {name}: bundles {} are empty", bundles.join(", ")));
        }
        let bytes = invoke(
            "archiver",
            self.settings.timeout,
            ctx.run().cancellation(),
            self.archiver.archive(name, &entries),
        )
        .await
        .map_err(|e| e.to_string())?;
        Ok(Artifact::new(name, ArtifactKind::Archive, Platform::Shared, name, bytes))
    }

    /// Returns the archive a previous attempt recorded under `name`, or builds it.
    ///
    /// Archivers are not byte-reproducible, so a recorded archive is reused
    /// rather than rebuilt into a conflicting `release` entry.
    async fn archive(&self, ctx: &StageContext, name: &str, bundles: &[&str]) -> Result<Artifact, String> {
        let recorded = ctx
            .run()
            .artifacts()
            .download(RELEASE)
            .and_then(|bundle| bundle.get(name).cloned());
        if let Some(archive) = recorded {
            info!(stage = %self.name, archive = name, digest = %archive.digest, "reusing recorded archive");
            return Ok(archive);
        }
        self.build_archive(ctx, name, bundles).await
    }

    /// Hosting-service writes run under a timeout only: once started they
    /// are not abandoned on cancellation.
    async fn host_call<T, F>(&self, call: F) -> Result<T, ToolError>
    where
        F: std::future::Future<Output = Result<T, ToolError>>,
    {
        tokio::time::timeout(self.settings.timeout, call)
            .await
            .map_err(|_| ToolError::TimedOut {
                tool: "release-host".to_string(),
                timeout: self.settings.timeout,
            })?
    }

    async fn upload(&self, tag: &str, archive: &Artifact) -> Result<(), ReleaseError> {
        with_retry_if(
            &self.settings.upload_retry,
            &archive.key,
            ReleaseError::is_retryable,
            || async move {
                self.host_call(self.host.upload_asset(tag, &archive.key, archive.content()))
                    .await
                    .map_err(|e| ReleaseError::UploadFailure {
                        asset: archive.key.clone(),
                        reason: e.to_string(),
                    })
            },
        )
        .await
    }
}

#[async_trait]
impl Stage for ReleasePublisherStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &StageContext) -> StageOutput {
        let trigger = ctx.run().trigger();
        let (Some(tag), Some(tag_version)) = (trigger.tag(), trigger.tag_version()) else {
            return StageOutput::skip(format!("{trigger} is not a version tag"));
        };
        let mut progress = Progress {
            tag: tag.to_string(),
            ..Progress::default()
        };

        let version = match ctx.version() {
            Ok(version) => version.clone(),
            Err(err) => return progress.finish(StageOutput::from_error(&err)),
        };
        if tag_version != version.as_str() {
            let err = ReleaseError::VersionMismatch {
                tag: tag.to_string(),
                expected: version.to_string(),
                found: tag_version.to_string(),
            };
            return progress.finish(StageOutput::from_error(&err));
        }

        let cancel = ctx.run().cancellation();
        match invoke("release-host", self.settings.timeout, cancel, self.host.release_exists(tag)).await {
            Ok(false) => {}
            Ok(true) => {
                warn!(stage = %self.name, tag, "release entry already exists");
                let err = ReleaseError::PublishConflict { tag: tag.to_string() };
                return progress.finish(StageOutput::from_error(&err));
            }
            Err(err) if err.is_cancelled() => return StageOutput::cancel(err.to_string()),
            Err(err) => {
                return progress.finish(StageOutput::fail(format!("cannot query release host: {err}")));
            }
        }

        let lib_name = self.settings.lib_archive(&version);
        let binding_name = self.settings.binding_archive(&version);
        progress.missing = vec![lib_name.clone(), binding_name.clone()];

        let archives = futures::try_join!(
            self.archive(ctx, &lib_name, &[NATIVE_LIBS, MERGED_LIBS]),
            self.archive(ctx, &binding_name, &[PACKAGE]),
        );
        let archives = match archives {
            Ok((lib, binding)) => vec![lib, binding],
            Err(_) if ctx.is_cancelled() => return StageOutput::cancel("run cancelled before publication"),
            Err(reason) => return progress.finish(StageOutput::fail(reason)),
        };
        let recorded = match ctx.upload(RELEASE, archives.clone()) {
            Ok(keys) => keys,
            Err(err) => return progress.finish(StageOutput::from_error(&err)),
        };

        if ctx.is_cancelled() {
            return StageOutput::cancel("run cancelled before publication");
        }
        let entry = ReleaseEntry::prerelease(tag);
        if let Err(err) = self.host_call(self.host.create_release(&entry)).await {
            error!(stage = %self.name, tag, error = %err, "cannot create release entry");
            return progress.finish(StageOutput::fail(format!("cannot create release entry: {err}")));
        }
        progress.release_created = true;
        info!(stage = %self.name, tag, "release entry created");

        let mut failures = Vec::new();
        let mut reasons = Vec::new();
        for archive in &archives {
            if ctx.is_cancelled() {
                failures.push(format!("upload of '{}' not attempted: run cancelled", archive.key));
                reasons.push("not attempted: run cancelled".to_string());
                continue;
            }
            match self.upload(tag, archive).await {
                Ok(()) => {
                    info!(stage = %self.name, tag, asset = %archive.key, bytes = archive.size, "asset uploaded");
                    progress.missing.retain(|name| name != &archive.key);
                    progress.uploaded.push(archive.key.clone());
                }
                Err(err) => {
                    error!(stage = %self.name, tag, error = %err, "asset upload failed");
                    reasons.push(match &err {
                        ReleaseError::UploadFailure { reason, .. } => reason.clone(),
                        other => other.to_string(),
                    });
                    failures.push(err.to_string());
                }
            }
        }

        let output = if failures.is_empty() {
            StageOutput::success()
        } else {
            let err = ReleaseError::UploadFailure {
                asset: progress.missing.join(", "),
                reason: reasons.join("; "),
            };
            StageOutput::from_error(&err).with_failures(failures)
        };
        progress.finish(output.with_uploads(RELEASE, recorded))
    }
}
