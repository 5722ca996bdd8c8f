//! Universal binary merging for multi-architecture operating systems.

use super::Stage;
use crate::artifacts::{MERGED_LIBS, NATIVE_LIBS};
use crate::context::StageContext;
use crate::core::{
    dynamic_key, static_key, universal_dynamic_key, universal_static_key, Arch, Artifact,
    ArtifactKind, Os, Platform, StageOutput, Target,
};
use crate::errors::{ReleaseError, ToolError};
use crate::pipeline::invoke;
use crate::tools::UniversalLinker;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Joins the per-architecture libraries of one OS into universal ones.
///
/// Runs only after every sibling builder is terminal. If any per-arch
/// artifact is missing the stage fails without attempting a partial merge.
#[derive(Debug, Clone)]
pub struct ArtifactMergerStage {
    name: String,
    os: Os,
    arches: Vec<Arch>,
    linker: Arc<dyn UniversalLinker>,
    lib_name: String,
    timeout: Duration,
}

impl ArtifactMergerStage {
    /// Creates a merger for `os` over `arches`, named `merge-<os>`.
    #[must_use]
    pub fn new(
        os: Os,
        arches: impl IntoIterator<Item = Arch>,
        linker: Arc<dyn UniversalLinker>,
        lib_name: impl Into<String>,
    ) -> Self {
        let mut arches: Vec<Arch> = arches.into_iter().collect();
        arches.sort();
        arches.dedup();
        Self {
            name: Self::stage_name(os),
            os,
            arches,
            linker,
            lib_name: lib_name.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// The stage name used for `os`.
    #[must_use]
    pub fn stage_name(os: Os) -> String {
        format!("merge-{os}")
    }

    /// Sets the linker timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn failure(&self, reason: impl Into<String>) -> StageOutput {
        StageOutput::from_error(&ReleaseError::MergeFailure {
            os: self.os,
            reason: reason.into(),
        })
    }

    async fn merge(&self, ctx: &StageContext, inputs: &[Artifact]) -> Result<Vec<u8>, ToolError> {
        invoke(
            "linker",
            self.timeout,
            ctx.run().cancellation(),
            self.linker.merge(self.os, inputs),
        )
        .await
    }
}

#[async_trait]
impl Stage for ArtifactMergerStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &StageContext) -> StageOutput {
        let bundle = match ctx.bundle(NATIVE_LIBS) {
            Ok(bundle) => bundle,
            Err(err) => return StageOutput::fail(err.to_string()),
        };

        let mut dynamic = Vec::with_capacity(self.arches.len());
        let mut statics = Vec::with_capacity(self.arches.len());
        let mut missing = Vec::new();
        for arch in &self.arches {
            let target = Target::new(self.os, *arch);
            for (key, into) in [(dynamic_key(target), &mut dynamic), (static_key(target), &mut statics)] {
                match bundle.as_ref().and_then(|b| b.get(&key)) {
                    Some(artifact) => into.push(artifact.clone()),
                    None => missing.push(key),
                }
            }
        }

        if !missing.is_empty() {
            let failed = ctx.failed_dependencies();
            warn!(stage = %self.name, ?missing, ?failed, "per-architecture artifacts missing");
            let mut reason = format!("missing per-architecture artifacts: {}", missing.join(", "));
            if !failed.is_empty() {
                reason.push_str(&format!(" (failed builders: {})", failed.join(", ")));
            }
            return self.failure(reason);
        }

        let merged = futures::try_join!(self.merge(ctx, &dynamic), self.merge(ctx, &statics));
        let (fat_dynamic, fat_static) = match merged {
            Ok(merged) => merged,
            Err(err) if err.is_cancelled() => return StageOutput::cancel(err.to_string()),
            Err(err) => return self.failure(err.to_string()),
        };

        let universal = Platform::Universal { os: self.os };
        let mut artifacts = vec![
            Artifact::new(
                universal_dynamic_key(self.os),
                ArtifactKind::DynamicLibrary,
                universal,
                self.os.dynamic_lib_file(&self.lib_name),
                fat_dynamic,
            )
            .produced_by(&self.name),
            Artifact::new(
                universal_static_key(self.os),
                ArtifactKind::StaticLibrary,
                universal,
                self.os.static_lib_file(&self.lib_name),
                fat_static,
            )
            .produced_by(&self.name),
        ];
        // Per-arch inputs are carried alongside, keeping their producer.
        artifacts.extend(dynamic);
        artifacts.extend(statics);

        match ctx.run().artifacts().upload(MERGED_LIBS, artifacts) {
            Ok(keys) => {
                info!(stage = %self.name, os = %self.os, artifacts = keys.len(), "universal artifacts uploaded");
                StageOutput::success()
                    .with_uploads(MERGED_LIBS, keys)
                    .with_metadata("os", serde_json::json!(self.os))
            }
            Err(err) => StageOutput::from_error(&err),
        }
    }
}
