//! Immutable build artifacts and their key convention.

use super::{Os, Platform, Target};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;

/// Key under which the shared header is stored.
pub const HEADER_KEY: &str = "header";

/// Suffix distinguishing static libraries from dynamic ones.
pub const STATIC_SUFFIX: &str = "-static";

/// Suffix marking universal (multi-architecture) artifacts.
pub const FAT_SUFFIX: &str = "-fat";

/// What an artifact contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactKind {
    /// A static library archive.
    StaticLibrary,
    /// A dynamic/shared library.
    DynamicLibrary,
    /// A C header shared by all targets.
    Header,
    /// A packaged language binding.
    Package,
    /// A release archive.
    Archive,
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StaticLibrary => write!(f, "static-library"),
            Self::DynamicLibrary => write!(f, "dynamic-library"),
            Self::Header => write!(f, "header"),
            Self::Package => write!(f, "package"),
            Self::Archive => write!(f, "archive"),
        }
    }
}

/// Key of the dynamic library built for `target`, e.g. `linux-arm`.
#[must_use]
pub fn dynamic_key(target: Target) -> String {
    target.platform_tag()
}

/// Key of the static library built for `target`, e.g. `linux-arm-static`.
#[must_use]
pub fn static_key(target: Target) -> String {
    format!("{}{STATIC_SUFFIX}", target.platform_tag())
}

/// Key of the universal dynamic library for `os`, e.g. `macos-fat`.
#[must_use]
pub fn universal_dynamic_key(os: Os) -> String {
    format!("{}{FAT_SUFFIX}", os.tag())
}

/// Key of the universal static library for `os`, e.g. `macos-fat-static`.
#[must_use]
pub fn universal_static_key(os: Os) -> String {
    format!("{}{FAT_SUFFIX}{STATIC_SUFFIX}", os.tag())
}

/// A named, typed binary blob produced by exactly one stage invocation.
///
/// Artifacts are immutable: merging produces a new artifact and leaves
/// its inputs untouched. Cloning is cheap, the content is shared.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    /// Key under which the artifact is stored in a bundle.
    pub key: String,
    /// What the artifact contains.
    pub kind: ArtifactKind,
    /// What platform the artifact was produced for.
    pub platform: Platform,
    /// File name used when the artifact is materialized on disk.
    pub file_name: String,
    /// Hex-encoded SHA-256 of the content.
    pub digest: String,
    /// Content length in bytes.
    pub size: u64,
    /// Name of the stage that produced the artifact.
    pub produced_by: String,
    /// When the artifact was created.
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    content: Arc<Vec<u8>>,
}

impl Artifact {
    /// Creates a new artifact from its content.
    #[must_use]
    pub fn new(
        key: impl Into<String>,
        kind: ArtifactKind,
        platform: Platform,
        file_name: impl Into<String>,
        content: Vec<u8>,
    ) -> Self {
        let digest = hex::encode(Sha256::digest(&content));
        Self {
            key: key.into(),
            kind,
            platform,
            file_name: file_name.into(),
            digest,
            size: content.len() as u64,
            produced_by: String::new(),
            created_at: Utc::now(),
            content: Arc::new(content),
        }
    }

    /// Records the producing stage.
    #[must_use]
    pub fn produced_by(mut self, stage: impl Into<String>) -> Self {
        self.produced_by = stage.into();
        self
    }

    /// Re-attaches content to an artifact loaded from a manifest.
    ///
    /// Returns `None` if the content does not match the recorded digest.
    #[must_use]
    pub fn with_content(mut self, content: Vec<u8>) -> Option<Self> {
        if hex::encode(Sha256::digest(&content)) != self.digest {
            return None;
        }
        self.size = content.len() as u64;
        self.content = Arc::new(content);
        Some(self)
    }

    /// Returns the artifact content.
    #[must_use]
    pub fn content(&self) -> &[u8] {
        &self.content
    }

    /// Returns true if both artifacts carry identical content.
    #[must_use]
    pub fn same_content(&self, other: &Self) -> bool {
        self.digest == other.digest
    }
}
