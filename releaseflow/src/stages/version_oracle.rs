//! The gate stage: reads and verifies the authoritative version.

use super::Stage;
use crate::context::StageContext;
use crate::core::StageOutput;
use crate::version::{verify_trigger, VersionSource};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

/// Reads the version once and publishes it into the run context.
///
/// On a version-tag run the tag's version must equal the authoritative
/// version byte for byte; every other stage depends on this one.
#[derive(Debug, Clone)]
pub struct VersionOracleStage {
    name: String,
    source: Arc<dyn VersionSource>,
}

impl VersionOracleStage {
    /// Creates the stage.
    #[must_use]
    pub fn new(name: impl Into<String>, source: Arc<dyn VersionSource>) -> Self {
        Self {
            name: name.into(),
            source,
        }
    }
}

#[async_trait]
impl Stage for VersionOracleStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &StageContext) -> StageOutput {
        let version = match self.source.read().await {
            Ok(version) => version,
            Err(err) => return StageOutput::from_error(&err),
        };

        let trigger = ctx.run().trigger();
        if let Err(err) = verify_trigger(trigger, &version) {
            warn!(%trigger, version = %version, error = %err, "version check failed");
            return StageOutput::from_error(&err);
        }

        if let Err(err) = ctx.run().publish_version(version.clone()) {
            return StageOutput::fail(err.to_string());
        }

        info!(%trigger, version = %version, release = ctx.run().is_release_run(), "version verified");
        StageOutput::success()
            .with_metadata("version", serde_json::json!(version.as_str()))
            .with_metadata("release_run", serde_json::json!(ctx.run().is_release_run()))
    }
}
