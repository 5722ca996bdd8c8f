//! Packaging the language binding around the native libraries.

use super::Stage;
use crate::artifacts::{BundleSnapshot, MERGED_LIBS, NATIVE_LIBS, PACKAGE};
use crate::context::StageContext;
use crate::core::{
    dynamic_key, static_key, universal_dynamic_key, universal_static_key, Artifact, ArtifactKind,
    Os, Platform, StageOutput, Target, HEADER_KEY,
};
use crate::errors::ReleaseError;
use crate::pipeline::invoke;
use crate::tools::{BindingTool, ResourceLayout};
use crate::version::Version;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20 * 60);

/// How the packaged binding is named.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageNaming {
    /// Project name, e.g. `oso`.
    pub project: String,
    /// Binding label, e.g. `java`.
    pub binding: String,
    /// Package file extension, e.g. `jar`.
    pub extension: String,
}

impl PackageNaming {
    /// Creates a naming scheme.
    #[must_use]
    pub fn new(
        project: impl Into<String>,
        binding: impl Into<String>,
        extension: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            binding: binding.into(),
            extension: extension.into(),
        }
    }

    /// Package file name, `<project>-<binding>-<version>.<ext>`.
    #[must_use]
    pub fn file_name(&self, version: &Version) -> String {
        format!("{}-{}-{version}.{}", self.project, self.binding, self.extension)
    }
}

/// Assembles the resource layout, tests the binding and packages it.
///
/// Multi-architecture OSes contribute their universal pair, single
/// architecture OSes their only pair. Every required OS must be present.
#[derive(Debug, Clone)]
pub struct BindingPackagerStage {
    name: String,
    naming: PackageNaming,
    tool: Arc<dyn BindingTool>,
    targets: Vec<Target>,
    required: Vec<Os>,
    timeout: Duration,
}

impl BindingPackagerStage {
    /// Creates the packager over the libraries built for `targets`.
    #[must_use]
    pub fn new(
        naming: PackageNaming,
        tool: Arc<dyn BindingTool>,
        targets: impl IntoIterator<Item = Target>,
    ) -> Self {
        let mut targets: Vec<Target> = targets.into_iter().collect();
        targets.sort();
        targets.dedup();
        Self {
            name: "package".to_string(),
            naming,
            tool,
            targets,
            required: vec![Os::Linux, Os::Macos],
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Sets the stage name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the operating systems the package must cover.
    #[must_use]
    pub fn with_required_os(mut self, required: impl IntoIterator<Item = Os>) -> Self {
        self.required = required.into_iter().collect();
        self
    }

    /// Sets the binding tool timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn failure(reason: impl Into<String>) -> StageOutput {
        StageOutput::from_error(&ReleaseError::PackagingFailure {
            reason: reason.into(),
        })
    }

    fn targets_by_os(&self) -> BTreeMap<Os, Vec<Target>> {
        let mut by_os: BTreeMap<Os, Vec<Target>> = BTreeMap::new();
        for target in &self.targets {
            by_os.entry(target.os).or_default().push(*target);
        }
        by_os
    }

    /// Collects the library pair for every OS, returning the missing keys.
    fn collect_libraries(
        &self,
        native: Option<&BundleSnapshot>,
        merged: Option<&BundleSnapshot>,
        layout: &mut ResourceLayout,
    ) -> Vec<String> {
        let by_os = self.targets_by_os();
        let mut missing = Vec::new();

        for os in &self.required {
            if !by_os.contains_key(os) {
                missing.push(format!("{os} (no target builds it)"));
            }
        }

        for (os, targets) in &by_os {
            let (source, keys) = match targets.as_slice() {
                [single] => (native, [dynamic_key(*single), static_key(*single)]),
                _ => (merged, [universal_dynamic_key(*os), universal_static_key(*os)]),
            };
            let found: Vec<&Artifact> = keys
                .iter()
                .filter_map(|key| source.and_then(|bundle| bundle.get(key)))
                .collect();

            if found.len() == keys.len() {
                for artifact in found {
                    layout.insert(format!("{os}/{}", artifact.file_name), artifact.content().to_vec());
                }
            } else if self.required.contains(os) {
                missing.extend(
                    keys.into_iter()
                        .filter(|key| source.map_or(true, |bundle| !bundle.contains(key))),
                );
            } else {
                warn!(stage = %self.name, %os, "optional platform libraries missing, leaving them out");
            }
        }
        missing
    }
}

#[async_trait]
impl Stage for BindingPackagerStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &StageContext) -> StageOutput {
        let version = match ctx.version() {
            Ok(version) => version.clone(),
            Err(err) => return StageOutput::from_error(&err),
        };
        let (native, merged) = match (ctx.bundle(NATIVE_LIBS), ctx.bundle(MERGED_LIBS)) {
            (Ok(native), Ok(merged)) => (native, merged),
            (Err(err), _) | (_, Err(err)) => return StageOutput::fail(err.to_string()),
        };

        let mut layout = ResourceLayout::new();
        let mut missing = self.collect_libraries(native.as_ref(), merged.as_ref(), &mut layout);
        match native.as_ref().and_then(|bundle| bundle.get(HEADER_KEY)) {
            Some(header) => layout.insert(format!("include/{}", header.file_name), header.content().to_vec()),
            None => missing.push(HEADER_KEY.to_string()),
        }

        if !missing.is_empty() {
            let failed = ctx.failed_dependencies();
            warn!(stage = %self.name, ?missing, ?failed, "cannot assemble package layout");
            let mut reason = format!("missing artifacts: {}", missing.join(", "));
            if !failed.is_empty() {
                reason.push_str(&format!(" (failed upstream: {})", failed.join(", ")));
            }
            return Self::failure(reason);
        }

        let cancel = ctx.run().cancellation();
        if let Err(err) = invoke("binding-test", self.timeout, cancel, self.tool.test(&layout)).await {
            if err.is_cancelled() {
                return StageOutput::cancel(err.to_string());
            }
            return Self::failure(format!("binding tests failed: {err}"));
        }

        let bytes = match invoke(
            "binding-package",
            self.timeout,
            cancel,
            self.tool.package(&layout, &version),
        )
        .await
        {
            Ok(bytes) => bytes,
            Err(err) if err.is_cancelled() => return StageOutput::cancel(err.to_string()),
            Err(err) => return Self::failure(err.to_string()),
        };

        let file_name = self.naming.file_name(&version);
        let package = Artifact::new(
            self.naming.binding.clone(),
            ArtifactKind::Package,
            Platform::Shared,
            file_name.clone(),
            bytes,
        );
        match ctx.upload(PACKAGE, vec![package]) {
            Ok(keys) => {
                info!(stage = %self.name, package = %file_name, files = layout.len(), "binding packaged");
                StageOutput::success()
                    .with_uploads(PACKAGE, keys)
                    .with_metadata("package", serde_json::json!(file_name))
                    .with_metadata("layout", serde_json::json!(layout.paths()))
            }
            Err(err) => StageOutput::from_error(&err),
        }
    }
}
