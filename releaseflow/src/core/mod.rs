//! Core domain model types for releaseflow.
//!
//! This module contains the fundamental types used throughout the crate:
//! - Stage status and kind enums
//! - Build targets and platforms
//! - Immutable artifacts and their key convention
//! - Stage output type with factory methods

mod artifact;
mod output;
mod status;
mod target;

pub use artifact::{
    dynamic_key, static_key, universal_dynamic_key, universal_static_key, Artifact,
    ArtifactKind, FAT_SUFFIX, HEADER_KEY, STATIC_SUFFIX,
};
pub use output::StageOutput;
pub use status::{StageKind, StageStatus};
pub use target::{Arch, Os, Platform, Target};
