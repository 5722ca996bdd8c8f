//! Stage trait and the release stages.
//!
//! Stages are the fundamental units of work in a release pipeline. Each
//! release stage wraps one external collaborator behind a trait from
//! [`crate::tools`] and communicates only through artifact bundles.

mod binding_packager;
mod merger;
mod platform_builder;
mod publisher;
mod validator;
mod version_oracle;

pub use binding_packager::{BindingPackagerStage, PackageNaming};
pub use merger::ArtifactMergerStage;
pub use platform_builder::PlatformBuilderStage;
pub use publisher::{ReleasePublisherStage, PublishSettings};
pub use validator::{CrossEnvironmentValidatorStage, ValidationCell};
pub use version_oracle::VersionOracleStage;

use crate::context::StageContext;
use crate::core::StageOutput;
use async_trait::async_trait;
use std::fmt::Debug;

/// Trait for pipeline stages.
///
/// Stages never return `Err`: every failure is folded into a
/// [`StageOutput`] so the executor can record it and decide which
/// dependents to skip.
#[async_trait]
pub trait Stage: Send + Sync + Debug {
    /// Returns the name of the stage.
    fn name(&self) -> &str;

    /// Executes the stage.
    async fn execute(&self, ctx: &StageContext) -> StageOutput;
}

/// A simple function-based stage.
pub struct FnStage<F>
where
    F: Fn(&StageContext) -> StageOutput + Send + Sync,
{
    name: String,
    func: F,
}

impl<F> FnStage<F>
where
    F: Fn(&StageContext) -> StageOutput + Send + Sync,
{
    /// Creates a new function-based stage.
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl<F> Debug for FnStage<F>
where
    F: Fn(&StageContext) -> StageOutput + Send + Sync,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnStage").field("name", &self.name).finish()
    }
}

#[async_trait]
impl<F> Stage for FnStage<F>
where
    F: Fn(&StageContext) -> StageOutput + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &StageContext) -> StageOutput {
        (self.func)(ctx)
    }
}

/// A no-op stage, handy for wiring tests and benchmarks.
#[derive(Debug, Clone)]
pub struct NoOpStage {
    name: String,
}

impl NoOpStage {
    /// Creates a new no-op stage.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Stage for NoOpStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, _ctx: &StageContext) -> StageOutput {
        StageOutput::success()
    }
}
