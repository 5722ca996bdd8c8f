//! In-memory fakes for the external tools.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::fixtures;
use crate::core::{Artifact, ArtifactKind, Os, Target};
use crate::errors::ToolError;
use crate::tools::{
    Archiver, BindingTool, BuildOutput, BuildRequest, EnvironmentRunner, ReleaseEntry,
    ReleaseHost, ResourceLayout, Toolchain, UniversalLinker,
};
use crate::version::Version;

/// A toolchain producing deterministic bytes per target.
#[derive(Debug, Default)]
pub struct FakeToolchain {
    failing: HashSet<Target>,
    delay: Option<Duration>,
    requests: Mutex<Vec<BuildRequest>>,
}

impl FakeToolchain {
    /// Creates a toolchain that builds every target.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes builds for `target` fail.
    #[must_use]
    pub fn failing_on(mut self, target: Target) -> Self {
        self.failing.insert(target);
        self
    }

    /// Delays every build.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Returns every request received, in arrival order.
    #[must_use]
    pub fn requests(&self) -> Vec<BuildRequest> {
        self.requests.lock().clone()
    }

    /// Returns the targets built so far.
    #[must_use]
    pub fn built_targets(&self) -> Vec<Target> {
        self.requests.lock().iter().map(|r| r.target).collect()
    }
}

#[async_trait]
impl Toolchain for FakeToolchain {
    async fn build(&self, request: &BuildRequest) -> Result<BuildOutput, ToolError> {
        self.requests.lock().push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.contains(&request.target) {
            return Err(ToolError::failed(
                "toolchain",
                format!("error: linking {} failed", request.target),
            ));
        }
        Ok(BuildOutput {
            static_lib: fixtures::library_bytes(request.target, ArtifactKind::StaticLibrary),
            dynamic_lib: fixtures::library_bytes(request.target, ArtifactKind::DynamicLibrary),
            header: fixtures::HEADER_BYTES.to_vec(),
        })
    }
}

/// A linker that concatenates its inputs.
#[derive(Debug, Default)]
pub struct FakeLinker {
    fail: bool,
    calls: Mutex<Vec<(Os, Vec<String>)>>,
}

impl FakeLinker {
    /// Creates a working linker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a linker that always fails.
    #[must_use]
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Returns the number of merge calls.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.lock().len()
    }

    /// Returns the input keys of every merge call.
    #[must_use]
    pub fn merged_inputs(&self) -> Vec<(Os, Vec<String>)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl UniversalLinker for FakeLinker {
    async fn merge(&self, os: Os, inputs: &[Artifact]) -> Result<Vec<u8>, ToolError> {
        self.calls
            .lock()
            .push((os, inputs.iter().map(|a| a.key.clone()).collect()));
        if self.fail {
            return Err(ToolError::failed("linker", format!("cannot merge {os} slices")));
        }
        Ok(inputs.iter().flat_map(|a| a.content().iter().copied()).collect())
    }
}

/// A binding tool that records the layouts it was given.
#[derive(Debug, Default)]
pub struct FakeBindingTool {
    failing_tests: Option<String>,
    failing_package: Option<String>,
    tested: Mutex<Vec<ResourceLayout>>,
    packaged: Mutex<Vec<Version>>,
}

impl FakeBindingTool {
    /// Creates a binding tool whose tests pass.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the test suite fail with `diagnostic`.
    #[must_use]
    pub fn failing_tests(mut self, diagnostic: impl Into<String>) -> Self {
        self.failing_tests = Some(diagnostic.into());
        self
    }

    /// Makes packaging fail with `diagnostic`.
    #[must_use]
    pub fn failing_package(mut self, diagnostic: impl Into<String>) -> Self {
        self.failing_package = Some(diagnostic.into());
        self
    }

    /// Returns the layouts the test suite ran against.
    #[must_use]
    pub fn tested_layouts(&self) -> Vec<ResourceLayout> {
        self.tested.lock().clone()
    }

    /// Returns the versions packaged.
    #[must_use]
    pub fn packaged_versions(&self) -> Vec<Version> {
        self.packaged.lock().clone()
    }
}

#[async_trait]
impl BindingTool for FakeBindingTool {
    async fn test(&self, layout: &ResourceLayout) -> Result<(), ToolError> {
        self.tested.lock().push(layout.clone());
        match &self.failing_tests {
            Some(diagnostic) => Err(ToolError::failed("binding-test", diagnostic.clone())),
            None => Ok(()),
        }
    }

    async fn package(&self, layout: &ResourceLayout, version: &Version) -> Result<Vec<u8>, ToolError> {
        self.packaged.lock().push(version.clone());
        if let Some(diagnostic) = &self.failing_package {
            return Err(ToolError::failed("binding-package", diagnostic.clone()));
        }
        Ok(format!("package {version}: {}\n", layout.paths().join(" ")).into_bytes())
    }
}

/// An environment runner that fails configured cells.
#[derive(Debug, Default)]
pub struct FakeEnvironmentRunner {
    failing: HashSet<(Os, String)>,
    delay: Option<Duration>,
    calls: Mutex<Vec<(Os, String)>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl FakeEnvironmentRunner {
    /// Creates a runner where every cell passes.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the `(os, runtime)` cell fail.
    #[must_use]
    pub fn failing_on(mut self, os: Os, runtime: impl Into<String>) -> Self {
        self.failing.insert((os, runtime.into()));
        self
    }

    /// Delays every smoke test.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Returns the cells exercised, in arrival order.
    #[must_use]
    pub fn calls(&self) -> Vec<(Os, String)> {
        self.calls.lock().clone()
    }

    /// Returns the most smoke tests that were ever running at once.
    #[must_use]
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EnvironmentRunner for FakeEnvironmentRunner {
    async fn smoke_test(&self, os: Os, runtime: &str, package: &Artifact) -> Result<(), ToolError> {
        self.calls.lock().push((os, runtime.to_string()));
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if self.failing.contains(&(os, runtime.to_string())) {
            return Err(ToolError::failed(
                "environment-runner",
                format!("{} failed to load on {os}", package.file_name),
            ));
        }
        Ok(())
    }
}

/// An archiver listing its entries instead of compressing them.
#[derive(Debug, Default)]
pub struct FakeArchiver {
    archives: Mutex<Vec<(String, Vec<String>)>>,
}

impl FakeArchiver {
    /// Creates the archiver.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns each archive name with the keys of its entries.
    #[must_use]
    pub fn archives(&self) -> Vec<(String, Vec<String>)> {
        self.archives.lock().clone()
    }
}

#[async_trait]
impl Archiver for FakeArchiver {
    async fn archive(&self, name: &str, entries: &[Artifact]) -> Result<Vec<u8>, ToolError> {
        self.archives
            .lock()
            .push((name.to_string(), entries.iter().map(|a| a.key.clone()).collect()));
        let listing: String = entries
            .iter()
            .map(|a| format!("{} {}\n", a.digest, a.file_name))
            .collect();
        Ok(format!("{name}\n{listing}").into_bytes())
    }
}

#[derive(Debug)]
struct HostedRelease {
    entry: ReleaseEntry,
    assets: BTreeMap<String, Vec<u8>>,
}

/// A release host kept in memory, with injectable upload failures.
#[derive(Debug, Default)]
pub struct InMemoryReleaseHost {
    releases: Mutex<BTreeMap<String, HostedRelease>>,
    /// Remaining failures per asset name; `None` fails forever.
    upload_failures: Mutex<HashMap<String, Option<usize>>>,
    upload_attempts: Mutex<Vec<String>>,
}

impl InMemoryReleaseHost {
    /// Creates an empty host.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds an existing release for `tag`.
    #[must_use]
    pub fn with_release(self, tag: &str) -> Self {
        self.releases.lock().insert(
            tag.to_string(),
            HostedRelease {
                entry: ReleaseEntry::prerelease(tag),
                assets: BTreeMap::new(),
            },
        );
        self
    }

    /// Makes the first `times` uploads of `asset` fail.
    #[must_use]
    pub fn failing_upload(self, asset: &str, times: usize) -> Self {
        self.upload_failures.lock().insert(asset.to_string(), Some(times));
        self
    }

    /// Makes every upload of `asset` fail.
    #[must_use]
    pub fn always_failing_upload(self, asset: &str) -> Self {
        self.upload_failures.lock().insert(asset.to_string(), None);
        self
    }

    /// Returns the release entry for `tag`.
    #[must_use]
    pub fn entry(&self, tag: &str) -> Option<ReleaseEntry> {
        self.releases.lock().get(tag).map(|r| r.entry.clone())
    }

    /// Returns the asset names attached to `tag`.
    #[must_use]
    pub fn assets(&self, tag: &str) -> Vec<String> {
        self.releases
            .lock()
            .get(tag)
            .map(|r| r.assets.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns the content of one asset.
    #[must_use]
    pub fn asset(&self, tag: &str, name: &str) -> Option<Vec<u8>> {
        self.releases
            .lock()
            .get(tag)
            .and_then(|r| r.assets.get(name).cloned())
    }

    /// Returns the number of release entries.
    #[must_use]
    pub fn release_count(&self) -> usize {
        self.releases.lock().len()
    }

    /// Returns every upload attempt, in order.
    #[must_use]
    pub fn upload_attempts(&self) -> Vec<String> {
        self.upload_attempts.lock().clone()
    }

    fn take_failure(&self, asset: &str) -> bool {
        let mut failures = self.upload_failures.lock();
        match failures.get_mut(asset) {
            Some(None) => true,
            Some(Some(0)) | None => false,
            Some(Some(remaining)) => {
                *remaining -= 1;
                true
            }
        }
    }
}

#[async_trait]
impl ReleaseHost for InMemoryReleaseHost {
    async fn release_exists(&self, tag: &str) -> Result<bool, ToolError> {
        Ok(self.releases.lock().contains_key(tag))
    }

    async fn create_release(&self, entry: &ReleaseEntry) -> Result<(), ToolError> {
        let mut releases = self.releases.lock();
        if releases.contains_key(&entry.tag) {
            return Err(ToolError::failed(
                "release-host",
                format!("release '{}' already exists", entry.tag),
            ));
        }
        releases.insert(
            entry.tag.clone(),
            HostedRelease {
                entry: entry.clone(),
                assets: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn upload_asset(&self, tag: &str, name: &str, content: &[u8]) -> Result<(), ToolError> {
        self.upload_attempts.lock().push(name.to_string());
        if self.take_failure(name) {
            return Err(ToolError::failed("release-host", "503 Service Unavailable"));
        }
        let mut releases = self.releases.lock();
        let release = releases
            .get_mut(tag)
            .ok_or_else(|| ToolError::failed("release-host", format!("release '{tag}' does not exist")))?;
        match release.assets.get(name) {
            Some(existing) if existing.as_slice() == content => return Ok(()),
            Some(_) => {
                return Err(ToolError::failed(
                    "release-host",
                    format!("asset '{name}' already attached to '{tag}'"),
                ));
            }
            None => {}
        }
        release.assets.insert(name.to_string(), content.to_vec());
        Ok(())
    }

    async fn list_assets(&self, tag: &str) -> Result<Vec<String>, ToolError> {
        Ok(self.assets(tag))
    }
}
