//! A release host backed by a local directory.
//!
//! Each release is a directory `<root>/<tag>` holding a `release.json`
//! entry and one file per asset. Files are written to a temporary name
//! and renamed into place, so readers never observe a partial asset.

use super::{ReleaseEntry, ReleaseHost};
use crate::errors::ToolError;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

const TOOL: &str = "release-host";
const ENTRY_FILE: &str = "release.json";

/// Stores releases under a root directory.
#[derive(Debug, Clone)]
pub struct DirectoryReleaseHost {
    root: PathBuf,
}

impl DirectoryReleaseHost {
    /// Creates a host rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Reads the release entry for `tag`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry exists but cannot be read.
    pub async fn entry(&self, tag: &str) -> Result<Option<ReleaseEntry>, ToolError> {
        let path = self.release_dir(tag)?.join(ENTRY_FILE);
        match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| ToolError::failed(TOOL, format!("corrupt {}: {e}", path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ToolError::failed(TOOL, format!("cannot read {}: {e}", path.display()))),
        }
    }

    fn release_dir(&self, tag: &str) -> Result<PathBuf, ToolError> {
        check_name("tag", tag)?;
        Ok(self.root.join(tag))
    }
}

fn check_name(what: &str, name: &str) -> Result<(), ToolError> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
        return Err(ToolError::failed(TOOL, format!("invalid {what} '{name}'")));
    }
    Ok(())
}

/// Writes `content` to `dest` via a temporary file in the same directory.
async fn write_atomically(dest: PathBuf, content: Vec<u8>) -> Result<(), ToolError> {
    tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        let dir = dest.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&content)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&dest).map_err(|e| e.error)?;
        Ok(())
    })
    .await
    .map_err(|e| ToolError::failed(TOOL, format!("write task aborted: {e}")))?
    .map_err(|e| ToolError::failed(TOOL, format!("atomic write failed: {e}")))
}

#[async_trait]
impl ReleaseHost for DirectoryReleaseHost {
    async fn release_exists(&self, tag: &str) -> Result<bool, ToolError> {
        Ok(self.entry(tag).await?.is_some())
    }

    async fn create_release(&self, entry: &ReleaseEntry) -> Result<(), ToolError> {
        let dir = self.release_dir(&entry.tag)?;
        if self.release_exists(&entry.tag).await? {
            return Err(ToolError::failed(
                TOOL,
                format!("release '{}' already exists", entry.tag),
            ));
        }
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| ToolError::failed(TOOL, format!("cannot create {}: {e}", dir.display())))?;

        let json = serde_json::to_vec_pretty(entry)
            .map_err(|e| ToolError::failed(TOOL, format!("cannot encode release entry: {e}")))?;
        write_atomically(dir.join(ENTRY_FILE), json).await?;
        info!(tag = %entry.tag, prerelease = entry.prerelease, "release entry created");
        Ok(())
    }

    async fn upload_asset(&self, tag: &str, name: &str, content: &[u8]) -> Result<(), ToolError> {
        check_name("asset name", name)?;
        if name == ENTRY_FILE {
            return Err(ToolError::failed(TOOL, format!("asset name '{name}' is reserved")));
        }
        if !self.release_exists(tag).await? {
            return Err(ToolError::failed(TOOL, format!("release '{tag}' does not exist")));
        }

        let dest = self.release_dir(tag)?.join(name);
        if tokio::fs::try_exists(&dest).await.unwrap_or(false) {
            // An earlier attempt may have landed after its caller gave up.
            let existing = tokio::fs::read(&dest)
                .await
                .map_err(|e| ToolError::failed(TOOL, format!("cannot read {}: {e}", dest.display())))?;
            if Sha256::digest(&existing) == Sha256::digest(content) {
                info!(tag, asset = name, "asset already attached with identical content");
                return Ok(());
            }
            return Err(ToolError::failed(
                TOOL,
                format!("asset '{name}' already attached to '{tag}' with different content"),
            ));
        }
        write_atomically(dest, content.to_vec()).await?;
        info!(tag, asset = name, bytes = content.len(), "asset uploaded");
        Ok(())
    }

    async fn list_assets(&self, tag: &str) -> Result<Vec<String>, ToolError> {
        let dir = self.release_dir(tag)?;
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| ToolError::failed(TOOL, format!("cannot list {}: {e}", dir.display())))?;

        let mut assets = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ToolError::failed(TOOL, format!("cannot list {}: {e}", dir.display())))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            // Skip the entry file and in-flight temporaries.
            if name != ENTRY_FILE && !name.starts_with(".tmp") {
                assets.push(name);
            }
        }
        assets.sort();
        Ok(assets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_create_and_upload() {
        let dir = tempfile::tempdir().unwrap();
        let host = DirectoryReleaseHost::new(dir.path());

        assert!(!host.release_exists("v1.2.3").await.unwrap());
        host.create_release(&ReleaseEntry::prerelease("v1.2.3")).await.unwrap();
        assert!(host.release_exists("v1.2.3").await.unwrap());

        host.upload_asset("v1.2.3", "oso-lib-1.2.3.zip", b"lib").await.unwrap();
        host.upload_asset("v1.2.3", "oso-java-1.2.3.zip", b"java").await.unwrap();

        assert_eq!(
            host.list_assets("v1.2.3").await.unwrap(),
            vec!["oso-java-1.2.3.zip", "oso-lib-1.2.3.zip"]
        );
        let entry = host.entry("v1.2.3").await.unwrap().unwrap();
        assert!(entry.prerelease);
        assert!(!entry.draft);
        assert_eq!(std::fs::read(dir.path().join("v1.2.3/oso-lib-1.2.3.zip")).unwrap(), b"lib");
    }

    #[tokio::test]
    async fn test_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let host = DirectoryReleaseHost::new(dir.path());
        host.create_release(&ReleaseEntry::prerelease("v1.2.3")).await.unwrap();
        host.upload_asset("v1.2.3", "a.zip", b"1").await.unwrap();

        assert!(host.create_release(&ReleaseEntry::prerelease("v1.2.3")).await.is_err());
        assert!(host.upload_asset("v1.2.3", "a.zip", b"2").await.is_err());
        host.upload_asset("v1.2.3", "a.zip", b"1").await.unwrap();
        assert_eq!(std::fs::read(dir.path().join("v1.2.3/a.zip")).unwrap(), b"1");
    }

    #[tokio::test]
    async fn test_rejects_bad_names_and_missing_release() {
        let dir = tempfile::tempdir().unwrap();
        let host = DirectoryReleaseHost::new(dir.path());

        assert!(host.release_exists("../escape").await.is_err());
        assert!(host.upload_asset("v9.9.9", "a.zip", b"1").await.is_err());
        host.create_release(&ReleaseEntry::prerelease("v1.0.0")).await.unwrap();
        assert!(host.upload_asset("v1.0.0", "release.json", b"{}").await.is_err());
    }
}
