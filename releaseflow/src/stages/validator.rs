//! Smoke-testing the package across an (os, runtime) matrix.

use super::Stage;
use crate::artifacts::PACKAGE;
use crate::context::StageContext;
use crate::core::{Artifact, ArtifactKind, Os, StageOutput};
use crate::errors::{ReleaseError, ToolError};
use crate::pipeline::invoke;
use crate::tools::EnvironmentRunner;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// One validation environment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValidationCell {
    /// Operating system of the environment.
    pub os: Os,
    /// Runtime version installed in the environment.
    pub runtime: String,
}

impl ValidationCell {
    /// Creates a cell.
    #[must_use]
    pub fn new(os: Os, runtime: impl Into<String>) -> Self {
        Self {
            os,
            runtime: runtime.into(),
        }
    }
}

impl fmt::Display for ValidationCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.runtime)
    }
}

/// Runs the smoke test in every cell and aggregates the results.
///
/// Cells are independent: a failing cell never stops the others, and
/// every cell's result ends up in the stage metadata.
#[derive(Debug, Clone)]
pub struct CrossEnvironmentValidatorStage {
    name: String,
    cells: Vec<ValidationCell>,
    runner: Arc<dyn EnvironmentRunner>,
    concurrency: usize,
    timeout: Duration,
}

impl CrossEnvironmentValidatorStage {
    /// Creates the validator over `cells`.
    #[must_use]
    pub fn new(cells: Vec<ValidationCell>, runner: Arc<dyn EnvironmentRunner>) -> Self {
        Self {
            name: "validate".to_string(),
            cells,
            runner,
            concurrency: 4,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Bounds how many cells run at once.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Sets the per-cell timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn run_cell(&self, ctx: &StageContext, cell: &ValidationCell, package: &Artifact) -> Result<(), ToolError> {
        invoke(
            "environment-runner",
            self.timeout,
            ctx.run().cancellation(),
            self.runner.smoke_test(cell.os, &cell.runtime, package),
        )
        .await
    }
}

#[async_trait]
impl Stage for CrossEnvironmentValidatorStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &StageContext) -> StageOutput {
        let bundle = match ctx.bundle(PACKAGE) {
            Ok(bundle) => bundle,
            Err(err) => return StageOutput::fail(err.to_string()),
        };
        let Some(package) = bundle
            .as_ref()
            .and_then(|b| b.of_kind(ArtifactKind::Package).first().map(|a| (*a).clone()))
        else {
            return StageOutput::fail("no package artifact to validate");
        };

        let package = &package;
        let checks: Vec<_> = self
            .cells
            .iter()
            .map(|cell| async move { (cell.clone(), self.run_cell(ctx, cell, package).await) })
            .collect();
        let results: Vec<(ValidationCell, Result<(), ToolError>)> =
            stream::iter(checks).buffered(self.concurrency).collect().await;

        if results.iter().any(|(_, r)| matches!(r, Err(e) if e.is_cancelled())) {
            let reason = ctx.run().cancellation().reason();
            return StageOutput::cancel(reason.unwrap_or_else(|| "run cancelled".to_string()));
        }

        let mut cells = serde_json::Map::new();
        let mut failures = Vec::new();
        for (cell, result) in results {
            let entry = match result {
                Ok(()) => serde_json::json!({ "status": "passed" }),
                Err(err) => {
                    warn!(stage = %self.name, %cell, error = %err, "validation cell failed");
                    let entry = serde_json::json!({ "status": "failed", "diagnostic": err.to_string() });
                    failures.push(ReleaseError::ValidationFailure {
                        os: cell.os,
                        runtime: cell.runtime.clone(),
                        diagnostic: err.to_string(),
                    });
                    entry
                }
            };
            cells.insert(cell.to_string(), entry);
        }

        let output = match failures.first() {
            None => {
                info!(stage = %self.name, cells = self.cells.len(), "all validation cells passed");
                StageOutput::success()
            }
            Some(first) => {
                let reasons: Vec<String> = failures.iter().map(ToString::to_string).collect();
                StageOutput {
                    error: Some(format!(
                        "{} of {} validation cells failed: {}",
                        failures.len(),
                        self.cells.len(),
                        reasons.join("; ")
                    )),
                    ..StageOutput::from_error(first)
                }
                .with_failures(reasons)
            }
        };
        output
            .with_metadata("package", serde_json::json!(package.file_name))
            .with_metadata("concurrency", serde_json::json!(self.concurrency))
            .with_metadata("cells", serde_json::Value::Object(cells))
    }
}
