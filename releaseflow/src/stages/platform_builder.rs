//! Per-target native builds.

use super::Stage;
use crate::artifacts::NATIVE_LIBS;
use crate::context::StageContext;
use crate::core::{
    dynamic_key, static_key, Arch, Artifact, ArtifactKind, Platform, StageOutput, Target,
    HEADER_KEY,
};
use crate::errors::{ReleaseError, ToolError};
use crate::pipeline::{invoke, with_retry_if, RetryConfig};
use crate::tools::{BuildRequest, Toolchain};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Builds the static and dynamic library for one target.
///
/// Each invocation gets its own scratch workspace. On success the two
/// libraries and the shared header are uploaded to `native-libs` in one
/// atomic write; the header upload is idempotent across builders.
#[derive(Debug, Clone)]
pub struct PlatformBuilderStage {
    name: String,
    target: Target,
    toolchain: Arc<dyn Toolchain>,
    lib_name: String,
    header_name: String,
    profile: String,
    host_arch: Option<Arch>,
    timeout: Duration,
    retry: RetryConfig,
    work_root: Option<PathBuf>,
}

impl PlatformBuilderStage {
    /// Creates a builder for `target` named `build-<os>-<arch>`.
    #[must_use]
    pub fn new(
        target: Target,
        toolchain: Arc<dyn Toolchain>,
        lib_name: impl Into<String>,
        header_name: impl Into<String>,
    ) -> Self {
        Self {
            name: Self::stage_name(target),
            target,
            toolchain,
            lib_name: lib_name.into(),
            header_name: header_name.into(),
            profile: "release".to_string(),
            host_arch: std::env::consts::ARCH.parse().ok(),
            timeout: DEFAULT_TIMEOUT,
            retry: RetryConfig::no_retry(),
            work_root: None,
        }
    }

    /// The stage name used for `target`.
    #[must_use]
    pub fn stage_name(target: Target) -> String {
        format!("build-{}", target.slug())
    }

    /// Sets the optimization profile.
    #[must_use]
    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = profile.into();
        self
    }

    /// Overrides the detected host architecture.
    #[must_use]
    pub fn with_host_arch(mut self, arch: Arch) -> Self {
        self.host_arch = Some(arch);
        self
    }

    /// Sets the toolchain timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the toolchain retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Creates scratch workspaces under `root` instead of the system temp dir.
    #[must_use]
    pub fn with_work_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.work_root = Some(root.into());
        self
    }

    /// Returns the target.
    #[must_use]
    pub fn target(&self) -> Target {
        self.target
    }

    /// Returns true if the target needs cross-compilation.
    #[must_use]
    pub fn is_cross(&self) -> bool {
        self.host_arch.is_some_and(|host| host != self.target.arch)
    }

    fn failure(&self, diagnostic: impl Into<String>) -> StageOutput {
        StageOutput::from_error(&ReleaseError::BuildFailure {
            target: self.target,
            diagnostic: diagnostic.into(),
        })
    }

    fn scratch(&self) -> std::io::Result<tempfile::TempDir> {
        let prefix = format!("{}-", self.name);
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix);
        match &self.work_root {
            Some(root) => {
                std::fs::create_dir_all(root)?;
                builder.tempdir_in(root)
            }
            None => builder.tempdir(),
        }
    }
}

#[async_trait]
impl Stage for PlatformBuilderStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &StageContext) -> StageOutput {
        let version = match ctx.version() {
            Ok(version) => version.clone(),
            Err(err) => return StageOutput::from_error(&err),
        };
        let workspace = match self.scratch() {
            Ok(dir) => dir,
            Err(e) => return self.failure(format!("cannot create build workspace: {e}")),
        };

        let request = BuildRequest {
            target: self.target,
            profile: self.profile.clone(),
            version,
            workspace: workspace.path().to_path_buf(),
            cross: self.is_cross(),
        };
        info!(stage = %self.name, target = %self.target, cross = request.cross, "building");

        let cancel = ctx.run().cancellation();
        let built = with_retry_if(
            &self.retry,
            &self.name,
            |e: &ToolError| !e.is_cancelled(),
            || invoke("toolchain", self.timeout, cancel, self.toolchain.build(&request)),
        )
        .await;

        let built = match built {
            Ok(built) => built,
            Err(err) if err.is_cancelled() => return StageOutput::cancel(err.to_string()),
            Err(err) => {
                warn!(stage = %self.name, target = %self.target, error = %err, "build failed");
                return self.failure(err.to_string());
            }
        };

        let platform = Platform::Target {
            target: self.target,
        };
        let os = self.target.os;
        let artifacts = vec![
            Artifact::new(
                static_key(self.target),
                ArtifactKind::StaticLibrary,
                platform,
                os.static_lib_file(&self.lib_name),
                built.static_lib,
            ),
            Artifact::new(
                dynamic_key(self.target),
                ArtifactKind::DynamicLibrary,
                platform,
                os.dynamic_lib_file(&self.lib_name),
                built.dynamic_lib,
            ),
            Artifact::new(
                HEADER_KEY,
                ArtifactKind::Header,
                Platform::Shared,
                self.header_name.clone(),
                built.header,
            ),
        ];
        let digests: serde_json::Map<String, serde_json::Value> = artifacts
            .iter()
            .map(|a| (a.key.clone(), serde_json::json!(a.digest)))
            .collect();

        match ctx.upload(NATIVE_LIBS, artifacts) {
            Ok(keys) => StageOutput::success()
                .with_uploads(NATIVE_LIBS, keys)
                .with_metadata("target", serde_json::json!(self.target.to_string()))
                .with_metadata("cross", serde_json::json!(request.cross))
                .with_metadata("digests", serde_json::Value::Object(digests)),
            Err(err) => StageOutput::from_error(&err),
        }
    }
}
