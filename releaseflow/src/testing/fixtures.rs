//! Test fixtures for release pipelines.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::context::{RunContext, StageContext};
use crate::core::{
    dynamic_key, static_key, Artifact, ArtifactKind, Platform, Target, HEADER_KEY,
};
use crate::version::{Trigger, Version};

/// Project name used across fixtures.
pub const PROJECT: &str = "oso";

/// Binding label used across fixtures.
pub const BINDING: &str = "java";

/// Header file name used across fixtures.
pub const HEADER: &str = "oso.h";

/// Header content every fake build produces.
pub const HEADER_BYTES: &[u8] = b"/* oso.h */\nint oso_init(void);\n";

/// The four targets of the standard release.
#[must_use]
pub fn standard_targets() -> Vec<Target> {
    crate::release::STANDARD_TARGETS.to_vec()
}

/// Deterministic library bytes for `target`.
#[must_use]
pub fn library_bytes(target: Target, kind: ArtifactKind) -> Vec<u8> {
    format!("{kind} for {target}\n").into_bytes()
}

/// The artifacts a successful build of `target` uploads to `native-libs`.
#[must_use]
pub fn built_artifacts(target: Target, lib_name: &str) -> Vec<Artifact> {
    let producer = format!("build-{}", target.slug());
    let platform = Platform::Target { target };
    vec![
        Artifact::new(
            static_key(target),
            ArtifactKind::StaticLibrary,
            platform,
            target.os.static_lib_file(lib_name),
            library_bytes(target, ArtifactKind::StaticLibrary),
        )
        .produced_by(&producer),
        Artifact::new(
            dynamic_key(target),
            ArtifactKind::DynamicLibrary,
            platform,
            target.os.dynamic_lib_file(lib_name),
            library_bytes(target, ArtifactKind::DynamicLibrary),
        )
        .produced_by(&producer),
        Artifact::new(
            HEADER_KEY,
            ArtifactKind::Header,
            Platform::Shared,
            HEADER,
            HEADER_BYTES.to_vec(),
        )
        .produced_by(&producer),
    ]
}

/// A run triggered by tag `v<version>` whose version is already verified.
#[must_use]
pub fn tag_run(version: &str) -> Arc<RunContext> {
    let run = Arc::new(RunContext::new(Trigger::Tag(format!("v{version}"))));
    if let Ok(version) = Version::parse(version) {
        let _ = run.publish_version(version);
    }
    run
}

/// A branch run whose version is already verified.
#[must_use]
pub fn branch_run(version: &str) -> Arc<RunContext> {
    let run = Arc::new(RunContext::new(Trigger::Branch("main".to_string())));
    if let Ok(version) = Version::parse(version) {
        let _ = run.publish_version(version);
    }
    run
}

/// A stage context consuming `bundles`, with no recorded dependencies.
#[must_use]
pub fn stage_context(run: &Arc<RunContext>, stage: &str, bundles: &[&str]) -> StageContext {
    StageContext::new(
        run.clone(),
        stage,
        bundles.iter().map(|b| (*b).to_string()).collect::<HashSet<_>>(),
        HashMap::new(),
    )
}
