//! Testing utilities for release pipelines.
//!
//! This module provides:
//! - In-memory fakes for every external tool
//! - Fixtures for targets, runs and stage contexts

pub mod fixtures;
mod mocks;

pub use mocks::{
    FakeArchiver, FakeBindingTool, FakeEnvironmentRunner, FakeLinker, FakeToolchain,
    InMemoryReleaseHost,
};
