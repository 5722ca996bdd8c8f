//! # Releaseflow
//!
//! Release orchestration for native libraries and their language bindings.
//!
//! A release is a DAG of stages:
//!
//! - **Version gate**: reads the authoritative version once and checks it
//!   against the triggering tag
//! - **Platform fan-out**: one build stage per target, each in its own
//!   scratch workspace
//! - **Universal merge**: one merge stage per multi-architecture OS
//! - **Packaging and validation**: the binding is packaged, tested and
//!   smoke-tested across an (os, runtime) matrix
//! - **Publication**: on version tags only, a pre-release entry with two
//!   archive assets is created exactly once
//!
//! Stages exchange data only through named artifact bundles.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use releaseflow::prelude::*;
//!
//! let config = ReleaseConfig::from_file(Path::new("release.toml"))?;
//! let tools = ReleaseTools::from_config(&config)?;
//! let graph = release_graph(&config, &tools)?;
//!
//! let run = Arc::new(RunContext::new(Trigger::from_ref("refs/tags/v1.2.3")));
//! let report = graph.execute(run).await;
//! println!("{}", report.summary());
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod artifacts;
pub mod cancellation;
pub mod config;
pub mod context;
pub mod core;
pub mod errors;
pub mod events;
pub mod pipeline;
pub mod release;
pub mod stages;
pub mod testing;
pub mod tools;
pub mod version;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::artifacts::{ArtifactStore, BundleSnapshot, MERGED_LIBS, NATIVE_LIBS, PACKAGE, RELEASE};
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::{ConfigError, ReleaseConfig};
    pub use crate::context::{RunContext, StageContext};
    pub use crate::core::{
        Arch, Artifact, ArtifactKind, Os, Platform, StageKind, StageOutput, StageStatus, Target,
    };
    pub use crate::errors::{
        PipelineValidationError, ReleaseError, ReleaseflowError, ToolError,
    };
    pub use crate::events::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::pipeline::{
        JoinMode, PipelineBuilder, PublicationState, RetryConfig, RunCondition, RunOutcome,
        RunReport, StageGraph, StageSpec,
    };
    pub use crate::release::{publish_graph, release_graph, ReleaseTools};
    pub use crate::stages::Stage;
    pub use crate::version::{Trigger, Version, VersionSource};
}

pub use errors::{ReleaseError, ReleaseflowError};
pub use pipeline::{PipelineBuilder, RunReport, StageGraph};

/// Result type alias for releaseflow operations.
pub type Result<T> = std::result::Result<T, ReleaseflowError>;
