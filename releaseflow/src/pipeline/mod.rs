//! Pipeline building and execution.
//!
//! This module provides:
//! - Stage specifications with join modes and run conditions
//! - Pipeline builder with validation
//! - The DAG execution engine and run reports
//! - Bounded retry and bounded external invocations

mod builder;
mod dag;
mod invoke;
mod report;
mod retry;
mod spec;

#[cfg(test)]
mod integration_tests;

pub use builder::PipelineBuilder;
pub use dag::StageGraph;
pub use invoke::invoke;
pub use report::{ArtifactSummary, PublicationState, RunOutcome, RunReport, StageRecord};
pub use retry::{
    should_retry, with_retry, with_retry_if, BackoffStrategy, JitterStrategy, RetryConfig,
    RetryDecision, RetryState,
};
pub use spec::{JoinMode, RunCondition, StageSpec};
