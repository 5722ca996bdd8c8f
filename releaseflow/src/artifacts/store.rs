//! Run-scoped, append-only artifact bundle store.

use crate::core::{Artifact, ArtifactKind};
use crate::errors::{ReleaseError, ReleaseflowError};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

const MANIFEST_FILE: &str = "manifest.json";

type BundleCell = Arc<RwLock<BTreeMap<String, Artifact>>>;

/// An immutable view of a bundle at the time it was downloaded.
#[derive(Debug, Clone, Default)]
pub struct BundleSnapshot {
    name: String,
    artifacts: BTreeMap<String, Artifact>,
}

impl BundleSnapshot {
    /// Returns the bundle name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Gets an artifact by key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Artifact> {
        self.artifacts.get(key)
    }

    /// Returns true if the bundle contains `key`.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.artifacts.contains_key(key)
    }

    /// Iterates artifacts in key order.
    pub fn iter(&self) -> impl Iterator<Item = &Artifact> {
        self.artifacts.values()
    }

    /// Returns artifacts of one kind, in key order.
    #[must_use]
    pub fn of_kind(&self, kind: ArtifactKind) -> Vec<&Artifact> {
        self.artifacts.values().filter(|a| a.kind == kind).collect()
    }

    /// Returns all keys in order.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.artifacts.keys().cloned().collect()
    }

    /// Returns the number of artifacts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    /// Returns true if the bundle is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    bundles: BTreeMap<String, Vec<Artifact>>,
}

/// Named artifact bundles shared by all stages of one run.
///
/// Bundles are created on first upload and are append-only: an artifact
/// can be re-uploaded only with identical content (a no-op), never
/// replaced. Each upload call is atomic, so downstream stages observe
/// either all artifacts of an upload or none of them.
#[derive(Debug, Default)]
pub struct ArtifactStore {
    bundles: DashMap<String, BundleCell>,
}

impl ArtifactStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Uploads artifacts into a bundle.
    ///
    /// Returns the keys that were newly added; artifacts already present
    /// with identical content are skipped.
    ///
    /// # Errors
    ///
    /// Returns `ArtifactConflict` if any key exists with different content.
    /// Nothing is written in that case.
    pub fn upload(&self, bundle: &str, artifacts: Vec<Artifact>) -> Result<Vec<String>, ReleaseError> {
        let cell = self
            .bundles
            .entry(bundle.to_string())
            .or_default()
            .value()
            .clone();

        let mut contents = cell.write();
        let mut staged: BTreeMap<String, Artifact> = BTreeMap::new();

        for artifact in artifacts {
            let existing = contents.get(&artifact.key).or_else(|| staged.get(&artifact.key));
            match existing {
                Some(prior) if prior.same_content(&artifact) => {
                    debug!(bundle, key = %artifact.key, "Artifact already present, skipping");
                }
                Some(_) => {
                    return Err(ReleaseError::ArtifactConflict {
                        bundle: bundle.to_string(),
                        key: artifact.key,
                    });
                }
                None => {
                    staged.insert(artifact.key.clone(), artifact);
                }
            }
        }

        let added: Vec<String> = staged.keys().cloned().collect();
        contents.extend(staged);
        debug!(bundle, added = ?added, "Uploaded artifacts");
        Ok(added)
    }

    /// Downloads a snapshot of a bundle, if it exists.
    #[must_use]
    pub fn download(&self, bundle: &str) -> Option<BundleSnapshot> {
        let cell = self.bundles.get(bundle)?.value().clone();
        let artifacts = cell.read().clone();
        Some(BundleSnapshot {
            name: bundle.to_string(),
            artifacts,
        })
    }

    /// Returns all bundle names in sorted order.
    #[must_use]
    pub fn bundle_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.bundles.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Returns the total number of artifacts across bundles.
    #[must_use]
    pub fn artifact_count(&self) -> usize {
        self.bundles.iter().map(|e| e.value().read().len()).sum()
    }

    /// Writes every bundle to `dir` so a later run can reload it.
    ///
    /// # Errors
    ///
    /// Returns an error if a file cannot be written or a key is not a
    /// plain file name.
    pub fn persist(&self, dir: &Path) -> Result<(), ReleaseflowError> {
        std::fs::create_dir_all(dir)?;
        let mut manifest = Manifest {
            bundles: BTreeMap::new(),
        };

        for name in self.bundle_names() {
            let Some(snapshot) = self.download(&name) else {
                continue;
            };
            check_path_component(&name)?;
            let bundle_dir = dir.join(&name);
            std::fs::create_dir_all(&bundle_dir)?;

            for artifact in snapshot.iter() {
                check_path_component(&artifact.key)?;
                write_atomically(&bundle_dir, &artifact.key, artifact.content())?;
            }
            manifest
                .bundles
                .insert(name, snapshot.iter().cloned().collect());
        }

        let json = serde_json::to_vec_pretty(&manifest)?;
        write_atomically(dir, MANIFEST_FILE, &json)?;
        Ok(())
    }

    /// Loads a store previously written by [`ArtifactStore::persist`].
    ///
    /// # Errors
    ///
    /// Returns an error if the manifest is unreadable or any artifact's
    /// content no longer matches its recorded digest.
    pub fn load(dir: &Path) -> Result<Self, ReleaseflowError> {
        let manifest: Manifest = serde_json::from_slice(&std::fs::read(dir.join(MANIFEST_FILE))?)?;
        let store = Self::new();

        for (name, artifacts) in manifest.bundles {
            check_path_component(&name)?;
            let mut restored = Vec::with_capacity(artifacts.len());
            for artifact in artifacts {
                check_path_component(&artifact.key)?;
                let content = std::fs::read(dir.join(&name).join(&artifact.key))?;
                let key = artifact.key.clone();
                let artifact = artifact.with_content(content).ok_or_else(|| {
                    ReleaseflowError::Internal(format!(
                        "artifact '{key}' in bundle '{name}' does not match its digest"
                    ))
                })?;
                restored.push(artifact);
            }
            store.upload(&name, restored)?;
        }

        Ok(store)
    }
}

fn check_path_component(name: &str) -> Result<(), ReleaseflowError> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
        return Err(ReleaseflowError::Internal(format!(
            "'{name}' is not a valid file name"
        )));
    }
    Ok(())
}

fn write_atomically(dir: &Path, file_name: &str, content: &[u8]) -> Result<(), ReleaseflowError> {
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(content)?;
    tmp.persist(dir.join(file_name)).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Arch, Os, Platform, Target};
    use pretty_assertions::assert_eq;

    fn lib(key: &str, content: &[u8]) -> Artifact {
        let target = Target::new(Os::Linux, Arch::X86_64);
        Artifact::new(
            key,
            ArtifactKind::DynamicLibrary,
            Platform::Target { target },
            "liboso.so",
            content.to_vec(),
        )
    }

    fn header(content: &[u8]) -> Artifact {
        Artifact::new("header", ArtifactKind::Header, Platform::Shared, "oso.h", content.to_vec())
    }

    #[test]
    fn test_upload_and_download() {
        let store = ArtifactStore::new();
        let added = store.upload("native-libs", vec![lib("linux", b"elf"), header(b"h")]).unwrap();

        assert_eq!(added, vec!["header".to_string(), "linux".to_string()]);
        let bundle = store.download("native-libs").unwrap();
        assert_eq!(bundle.len(), 2);
        assert_eq!(bundle.get("linux").unwrap().content(), b"elf");
        assert!(store.download("missing").is_none());
    }

    #[test]
    fn test_identical_reupload_is_noop() {
        let store = ArtifactStore::new();
        store.upload("native-libs", vec![header(b"h")]).unwrap();
        let added = store.upload("native-libs", vec![header(b"h"), lib("linux-arm", b"x")]).unwrap();

        assert_eq!(added, vec!["linux-arm".to_string()]);
        assert_eq!(store.download("native-libs").unwrap().len(), 2);
    }

    #[test]
    fn test_conflicting_upload_writes_nothing() {
        let store = ArtifactStore::new();
        store.upload("native-libs", vec![header(b"h")]).unwrap();

        let err = store
            .upload("native-libs", vec![lib("macos", b"macho"), header(b"different")])
            .unwrap_err();

        assert_eq!(err.code(), "ARTIFACT_CONFLICT");
        let bundle = store.download("native-libs").unwrap();
        assert!(!bundle.contains("macos"));
        assert_eq!(bundle.get("header").unwrap().content(), b"h");
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_uploads() {
        let store = ArtifactStore::new();
        store.upload("b", vec![lib("linux", b"1")]).unwrap();
        let before = store.download("b").unwrap();
        store.upload("b", vec![lib("linux-arm", b"2")]).unwrap();

        assert_eq!(before.len(), 1);
        assert_eq!(store.download("b").unwrap().len(), 2);
        assert_eq!(store.artifact_count(), 2);
    }

    #[test]
    fn test_persist_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new();
        store.upload("native-libs", vec![lib("linux", b"elf"), header(b"h")]).unwrap();
        store.upload("package", vec![header(b"pkg")]).unwrap();

        store.persist(dir.path()).unwrap();
        let loaded = ArtifactStore::load(dir.path()).unwrap();

        assert_eq!(loaded.bundle_names(), vec!["native-libs".to_string(), "package".to_string()]);
        let bundle = loaded.download("native-libs").unwrap();
        assert_eq!(bundle.get("linux").unwrap().content(), b"elf");
        assert_eq!(bundle.get("linux").unwrap().digest, store.download("native-libs").unwrap().get("linux").unwrap().digest);
    }

    #[test]
    fn test_load_detects_tampering() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new();
        store.upload("native-libs", vec![lib("linux", b"elf")]).unwrap();
        store.persist(dir.path()).unwrap();

        std::fs::write(dir.path().join("native-libs").join("linux"), b"tampered").unwrap();
        assert!(ArtifactStore::load(dir.path()).is_err());
    }

    #[test]
    fn test_persist_rejects_path_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new();
        store.upload("native-libs", vec![lib("../escape", b"x")]).unwrap();
        assert!(store.persist(dir.path()).is_err());
    }
}
