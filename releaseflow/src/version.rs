//! Versions and run triggers.
//!
//! The authoritative version is read once per run and shared by reference.
//! The trigger is parsed once from the git ref that started the run.

use crate::errors::ReleaseError;
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

/// Matches a version tag and captures the version it encodes.
fn version_tag_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^v?(\d+\.\d+\.\d+(?:-[0-9A-Za-z.-]+)?(?:\+[0-9A-Za-z.-]+)?)$")
            .unwrap_or_else(|e| unreachable!("static version pattern is valid: {e}"))
    })
}

/// Extracts the version encoded in a tag name, e.g. `v1.2.3` -> `1.2.3`.
#[must_use]
pub fn parse_tag_version(tag: &str) -> Option<&str> {
    version_tag_pattern()
        .captures(tag)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// An immutable version identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(Arc<str>);

impl Version {
    /// Creates a version from a string, trimming surrounding whitespace.
    ///
    /// # Errors
    ///
    /// Returns `MissingVersion` if the string is empty.
    pub fn parse(raw: &str) -> Result<Self, ReleaseError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ReleaseError::MissingVersion(
                "version source is empty".to_string(),
            ));
        }
        Ok(Self(Arc::from(trimmed)))
    }

    /// Returns the version string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What started a pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "name", rename_all = "snake_case")]
pub enum Trigger {
    /// A push to a branch.
    Branch(String),
    /// A push of a tag.
    Tag(String),
}

impl Trigger {
    /// Parses a git ref such as `refs/tags/v1.2.3` or `refs/heads/main`.
    ///
    /// Anything that is not under `refs/tags/` is treated as a branch.
    #[must_use]
    pub fn from_ref(git_ref: &str) -> Self {
        if let Some(tag) = git_ref.strip_prefix("refs/tags/") {
            Self::Tag(tag.to_string())
        } else {
            let branch = git_ref.strip_prefix("refs/heads/").unwrap_or(git_ref);
            Self::Branch(branch.to_string())
        }
    }

    /// Returns the tag name if this is a tag push.
    #[must_use]
    pub fn tag(&self) -> Option<&str> {
        match self {
            Self::Tag(tag) => Some(tag),
            Self::Branch(_) => None,
        }
    }

    /// Returns the version encoded by the tag, if this is a version tag.
    #[must_use]
    pub fn tag_version(&self) -> Option<&str> {
        self.tag().and_then(parse_tag_version)
    }

    /// Returns true if this run was triggered by a version tag.
    #[must_use]
    pub fn is_version_tag(&self) -> bool {
        self.tag_version().is_some()
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Branch(name) => write!(f, "branch {name}"),
            Self::Tag(name) => write!(f, "tag {name}"),
        }
    }
}

/// Checks that a version tag, if any, encodes exactly `version`.
///
/// # Errors
///
/// Returns `VersionMismatch` when the tag version differs byte-for-byte.
pub fn verify_trigger(trigger: &Trigger, version: &Version) -> Result<(), ReleaseError> {
    match (trigger.tag(), trigger.tag_version()) {
        (Some(tag), Some(found)) if found != version.as_str() => Err(ReleaseError::VersionMismatch {
            tag: tag.to_string(),
            expected: version.to_string(),
            found: found.to_string(),
        }),
        _ => Ok(()),
    }
}

/// A single authoritative source of the version string.
#[async_trait]
pub trait VersionSource: Send + Sync + fmt::Debug {
    /// Reads the current version.
    async fn read(&self) -> Result<Version, ReleaseError>;
}

/// Reads the version from a file such as `VERSION`.
#[derive(Debug, Clone)]
pub struct FileVersionSource {
    path: PathBuf,
}

impl FileVersionSource {
    /// Creates a source reading from `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl VersionSource for FileVersionSource {
    async fn read(&self) -> Result<Version, ReleaseError> {
        let raw = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            ReleaseError::MissingVersion(format!("cannot read {}: {e}", self.path.display()))
        })?;
        Version::parse(&raw)
    }
}

/// A fixed version, used for tests and dry runs.
#[derive(Debug, Clone)]
pub struct StaticVersionSource(pub String);

#[async_trait]
impl VersionSource for StaticVersionSource {
    async fn read(&self) -> Result<Version, ReleaseError> {
        Version::parse(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_tag_version() {
        assert_eq!(parse_tag_version("v1.2.3"), Some("1.2.3"));
        assert_eq!(parse_tag_version("1.2.3"), Some("1.2.3"));
        assert_eq!(parse_tag_version("v0.26.0-beta.1"), Some("0.26.0-beta.1"));
        assert_eq!(parse_tag_version("v1.2.3+build.7"), Some("1.2.3+build.7"));
        assert_eq!(parse_tag_version("release-candidate"), None);
        assert_eq!(parse_tag_version("v1.2"), None);
    }

    #[test]
    fn test_trigger_from_ref() {
        assert_eq!(Trigger::from_ref("refs/tags/v1.2.3"), Trigger::Tag("v1.2.3".to_string()));
        assert_eq!(Trigger::from_ref("refs/heads/main"), Trigger::Branch("main".to_string()));
        assert_eq!(Trigger::from_ref("main"), Trigger::Branch("main".to_string()));

        assert!(Trigger::from_ref("refs/tags/v1.2.3").is_version_tag());
        assert!(!Trigger::from_ref("refs/tags/nightly").is_version_tag());
        assert!(!Trigger::from_ref("refs/heads/v1.2.3").is_version_tag());
    }

    #[test]
    fn test_version_parse_trims() {
        let version = Version::parse(" 1.2.3\n").unwrap();
        assert_eq!(version.as_str(), "1.2.3");
        assert!(matches!(Version::parse("  \n"), Err(ReleaseError::MissingVersion(_))));
    }

    #[test]
    fn test_verify_trigger() {
        let version = Version::parse("1.2.4").unwrap();

        let err = verify_trigger(&Trigger::Tag("v1.2.3".to_string()), &version).unwrap_err();
        assert_eq!(err.code(), "VERSION_MISMATCH");

        assert!(verify_trigger(&Trigger::Tag("v1.2.4".to_string()), &version).is_ok());
        assert!(verify_trigger(&Trigger::Branch("main".to_string()), &version).is_ok());
        assert!(verify_trigger(&Trigger::Tag("nightly".to_string()), &version).is_ok());
    }

    #[tokio::test]
    async fn test_file_version_source() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "1.2.3").unwrap();

        let version = FileVersionSource::new(file.path()).read().await.unwrap();
        assert_eq!(version.as_str(), "1.2.3");

        let missing = FileVersionSource::new("/nonexistent/VERSION").read().await;
        assert!(matches!(missing, Err(ReleaseError::MissingVersion(_))));
    }
}
