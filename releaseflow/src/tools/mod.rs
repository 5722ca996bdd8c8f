//! External collaborators.
//!
//! Every tool the release pipeline drives (native toolchain, universal
//! linker, binding tool, environment runner, archiver and the hosting
//! service) is reached through one narrow async trait. This module provides:
//! - The collaborator traits and their request types
//! - Command-backed implementations driven by argument templates
//! - A directory-backed release host

mod command;
mod host;
mod process;

pub use command::{run_command, CommandTemplate, TemplateVars};
pub use host::DirectoryReleaseHost;
pub use process::{
    CommandArchiver, CommandBindingTool, CommandEnvironmentRunner, CommandLinker, CommandToolchain,
    ToolchainOutputs,
};

use crate::core::{Artifact, Os, Target};
use crate::errors::ToolError;
use crate::version::Version;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::path::{Path, PathBuf};

/// One native build invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    /// The target being built.
    pub target: Target,
    /// Optimization profile (e.g. `release`).
    pub profile: String,
    /// The verified version.
    pub version: Version,
    /// Isolated scratch directory owned by this invocation.
    pub workspace: PathBuf,
    /// True if the target architecture differs from the host.
    pub cross: bool,
}

/// What the native toolchain produced for one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOutput {
    /// Static library bytes.
    pub static_lib: Vec<u8>,
    /// Dynamic library bytes.
    pub dynamic_lib: Vec<u8>,
    /// Shared header bytes.
    pub header: Vec<u8>,
}

/// Compiles the native library for one target.
#[async_trait]
pub trait Toolchain: Send + Sync + Debug {
    /// Builds static and dynamic libraries plus the header.
    async fn build(&self, request: &BuildRequest) -> Result<BuildOutput, ToolError>;
}

/// Combines per-architecture libraries into one universal binary.
#[async_trait]
pub trait UniversalLinker: Send + Sync + Debug {
    /// Merges `inputs` (all of one kind, one OS) into universal bytes.
    async fn merge(&self, os: Os, inputs: &[Artifact]) -> Result<Vec<u8>, ToolError>;
}

/// Files of a binding package, keyed by relative path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceLayout {
    files: BTreeMap<String, Vec<u8>>,
}

impl ResourceLayout {
    /// Creates an empty layout.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Places `content` at `path`.
    pub fn insert(&mut self, path: impl Into<String>, content: Vec<u8>) {
        self.files.insert(path.into(), content);
    }

    /// Returns the content at `path`.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<&[u8]> {
        self.files.get(path).map(Vec::as_slice)
    }

    /// Returns true if `path` is present.
    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    /// Returns all paths, sorted.
    #[must_use]
    pub fn paths(&self) -> Vec<&str> {
        self.files.keys().map(String::as_str).collect()
    }

    /// Returns the number of files.
    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Returns true if the layout is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Materializes the layout under `root`.
    ///
    /// # Errors
    ///
    /// Returns an IO error if a file cannot be written.
    pub async fn write_to(&self, root: &Path) -> std::io::Result<()> {
        for (path, content) in &self.files {
            let dest = root.join(path);
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(dest, content).await?;
        }
        Ok(())
    }
}

/// Builds, tests and packages the language binding.
#[async_trait]
pub trait BindingTool: Send + Sync + Debug {
    /// Runs the binding's own test suite against the embedded libraries.
    async fn test(&self, layout: &ResourceLayout) -> Result<(), ToolError>;

    /// Produces the distributable package.
    async fn package(&self, layout: &ResourceLayout, version: &Version) -> Result<Vec<u8>, ToolError>;
}

/// Exercises a package in a freshly provisioned environment.
#[async_trait]
pub trait EnvironmentRunner: Send + Sync + Debug {
    /// Installs `package` into an `os` environment with `runtime` and runs
    /// the smoke test.
    async fn smoke_test(&self, os: Os, runtime: &str, package: &Artifact) -> Result<(), ToolError>;
}

/// Bundles artifacts into one archive.
#[async_trait]
pub trait Archiver: Send + Sync + Debug {
    /// Produces archive bytes holding every entry at `<key>/<file name>`.
    async fn archive(&self, name: &str, entries: &[Artifact]) -> Result<Vec<u8>, ToolError>;
}

/// A tagged release entry on the hosting service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseEntry {
    /// The tag the release is attached to.
    pub tag: String,
    /// Display name.
    pub name: String,
    /// Whether the release is marked as a pre-release.
    pub prerelease: bool,
    /// Whether the release is a draft.
    pub draft: bool,
    /// When the entry was created.
    pub created_at: DateTime<Utc>,
}

impl ReleaseEntry {
    /// Creates a published pre-release entry for `tag`.
    #[must_use]
    pub fn prerelease(tag: impl Into<String>) -> Self {
        let tag = tag.into();
        Self {
            name: tag.clone(),
            tag,
            prerelease: true,
            draft: false,
            created_at: Utc::now(),
        }
    }
}

/// The hosting service storing tagged releases and their assets.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReleaseHost: Send + Sync + Debug {
    /// Returns true if a release entry exists for `tag`.
    async fn release_exists(&self, tag: &str) -> Result<bool, ToolError>;

    /// Creates a new release entry.
    async fn create_release(&self, entry: &ReleaseEntry) -> Result<(), ToolError>;

    /// Uploads one asset to the release for `tag`.
    ///
    /// Re-uploading identical content succeeds without a write; different
    /// content under an attached name is an error.
    async fn upload_asset(&self, tag: &str, name: &str, content: &[u8]) -> Result<(), ToolError>;

    /// Lists the asset names attached to the release for `tag`.
    async fn list_assets(&self, tag: &str) -> Result<Vec<String>, ToolError>;
}
