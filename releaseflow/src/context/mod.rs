//! Context management for pipeline execution.
//!
//! This module provides:
//! - The run context shared by every stage of one run
//! - Per-stage contexts with declared-bundle enforcement

mod execution;

pub use execution::{RunContext, StageContext};
