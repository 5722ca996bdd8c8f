//! Assembly of the standard release DAG.
//!
//! ```text
//! version ─┬─ build-<target> ... ─┬─ merge-<os> ─┐
//!          │                      └──────────────┴─ package ─ validate ─ publish
//! ```
//!
//! Builders join strictly on the version gate. Mergers and the packager use
//! completion joins so a failed builder is reported by name downstream;
//! validation and publication join strictly.

use crate::artifacts::{MERGED_LIBS, NATIVE_LIBS, PACKAGE};
use crate::config::{ConfigError, ReleaseConfig};
use crate::core::{Arch, Os, StageKind, Target};
use crate::errors::PipelineValidationError;
use crate::pipeline::{JoinMode, PipelineBuilder, RunCondition, StageGraph, StageSpec};
use crate::stages::{
    ArtifactMergerStage, BindingPackagerStage, CrossEnvironmentValidatorStage, PackageNaming,
    PlatformBuilderStage, PublishSettings, ReleasePublisherStage, Stage, VersionOracleStage,
};
use crate::tools::{
    Archiver, BindingTool, CommandArchiver, CommandBindingTool, CommandEnvironmentRunner,
    CommandLinker, CommandToolchain, DirectoryReleaseHost, EnvironmentRunner, ReleaseHost,
    Toolchain, UniversalLinker,
};
use crate::version::{FileVersionSource, VersionSource};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// Name of the full release pipeline.
pub const RELEASE_PIPELINE: &str = "release";

/// Name of the publish-only pipeline.
pub const PUBLISH_PIPELINE: &str = "publish-only";

/// Name of the version gate stage.
pub const VERSION_STAGE: &str = "version";

/// The four targets built when none are configured.
pub const STANDARD_TARGETS: [Target; 4] = [
    Target::new(Os::Linux, Arch::X86_64),
    Target::new(Os::Linux, Arch::Aarch64),
    Target::new(Os::Macos, Arch::X86_64),
    Target::new(Os::Macos, Arch::Aarch64),
];

/// The external collaborators a release drives.
#[derive(Debug, Clone)]
pub struct ReleaseTools {
    /// Reads the authoritative version.
    pub version_source: Arc<dyn VersionSource>,
    /// Builds native libraries.
    pub toolchain: Arc<dyn Toolchain>,
    /// Merges per-architecture libraries.
    pub linker: Arc<dyn UniversalLinker>,
    /// Tests and packages the binding.
    pub binding: Arc<dyn BindingTool>,
    /// Runs smoke tests in validation environments.
    pub runner: Arc<dyn EnvironmentRunner>,
    /// Produces release archives.
    pub archiver: Arc<dyn Archiver>,
    /// Hosts release entries and assets.
    pub host: Arc<dyn ReleaseHost>,
}

impl ReleaseTools {
    /// Creates the command-backed tools described by `config`.
    ///
    /// # Errors
    ///
    /// Returns `Validation` if a required command is not configured.
    pub fn from_config(config: &ReleaseConfig) -> Result<Self, ConfigError> {
        config.validate_commands()?;
        let outputs = config
            .build
            .outputs
            .clone()
            .ok_or_else(|| ConfigError::Validation("build.outputs must be set".to_string()))?;
        let dir = |configured: Option<&Path>| config.resolve(configured.unwrap_or_else(|| Path::new(".")));

        let mut toolchain = CommandToolchain::new(
            config.build.command.clone(),
            outputs,
            dir(config.build.working_dir.as_deref()),
        );
        if let Some(cross) = &config.build.cross_command {
            toolchain = toolchain.with_cross_command(cross.clone());
        }

        Ok(Self {
            version_source: Arc::new(FileVersionSource::new(config.resolve(&config.project.version_file))),
            toolchain: Arc::new(toolchain),
            linker: Arc::new(CommandLinker::new(config.merge.command.clone())),
            binding: Arc::new(CommandBindingTool::new(
                config.package.test_command.clone(),
                config.package.command.clone(),
                config.package.output.clone(),
                dir(config.package.working_dir.as_deref()),
            )),
            runner: Arc::new(CommandEnvironmentRunner::new(config.validate.command.clone())),
            archiver: Arc::new(CommandArchiver::new(config.publish.archive_command.clone())),
            host: Arc::new(DirectoryReleaseHost::new(config.resolve(&config.publish.host_dir))),
        })
    }
}

/// Groups the configured architectures by operating system.
#[must_use]
pub fn arches_by_os(targets: &[Target]) -> BTreeMap<Os, Vec<Arch>> {
    let mut by_os: BTreeMap<Os, Vec<Arch>> = BTreeMap::new();
    for target in targets {
        let arches = by_os.entry(target.os).or_default();
        if !arches.contains(&target.arch) {
            arches.push(target.arch);
        }
    }
    for arches in by_os.values_mut() {
        arches.sort();
    }
    by_os
}

fn spec_for(stage: Arc<dyn Stage>) -> StageSpec {
    StageSpec::new(stage.name().to_string(), stage)
}

fn version_spec(tools: &ReleaseTools) -> StageSpec {
    spec_for(Arc::new(VersionOracleStage::new(VERSION_STAGE, tools.version_source.clone())))
        .with_kind(StageKind::Gate)
}

fn publisher(config: &ReleaseConfig, tools: &ReleaseTools) -> Arc<dyn Stage> {
    let settings = PublishSettings::new(&config.project.name, &config.project.binding)
        .with_upload_retry(config.execution.upload_retry.clone())
        .with_timeout(config.timeout());
    Arc::new(ReleasePublisherStage::new(settings, tools.archiver.clone(), tools.host.clone()))
}

/// Builds the full release DAG.
///
/// # Errors
///
/// Returns an error if the assembled graph does not validate.
pub fn release_graph(config: &ReleaseConfig, tools: &ReleaseTools) -> Result<StageGraph, PipelineValidationError> {
    let timeout = config.timeout();
    let lib_name = config.project.lib_name();
    let header = config.project.header();
    let mut builder = PipelineBuilder::new(RELEASE_PIPELINE).with_workers(config.workers());

    builder.add_stage_spec(version_spec(tools))?;

    let mut builds_by_os: BTreeMap<Os, Vec<String>> = BTreeMap::new();
    for target in &config.targets {
        let mut stage = PlatformBuilderStage::new(*target, tools.toolchain.clone(), lib_name, &header)
            .with_profile(config.build.profile())
            .with_timeout(timeout)
            .with_retry(config.execution.build_retry.clone());
        if let Some(arch) = config.build.host_arch {
            stage = stage.with_host_arch(arch);
        }
        let spec = spec_for(Arc::new(stage))
            .with_dependency(VERSION_STAGE)
            .with_kind(StageKind::Build);
        builds_by_os.entry(target.os).or_default().push(spec.name.clone());
        builder.add_stage_spec(spec)?;
    }

    let mut package_deps: Vec<String> = builds_by_os.values().flatten().cloned().collect();
    for (os, arches) in arches_by_os(&config.targets) {
        if arches.len() < 2 {
            continue;
        }
        let stage = ArtifactMergerStage::new(os, arches, tools.linker.clone(), lib_name).with_timeout(timeout);
        let spec = spec_for(Arc::new(stage))
            .with_dependencies(builds_by_os.get(&os).cloned().unwrap_or_default())
            .with_join(JoinMode::Completion)
            .consumes(NATIVE_LIBS)
            .with_kind(StageKind::Merge);
        package_deps.push(spec.name.clone());
        builder.add_stage_spec(spec)?;
    }

    let naming = PackageNaming::new(&config.project.name, &config.project.binding, &config.package.extension);
    let packager = BindingPackagerStage::new(naming, tools.binding.clone(), config.targets.iter().copied())
        .with_required_os(config.package.required_os.iter().copied())
        .with_timeout(timeout);
    let package = spec_for(Arc::new(packager))
        .with_dependencies(package_deps)
        .with_join(JoinMode::Completion)
        .consumes(NATIVE_LIBS)
        .consumes(MERGED_LIBS)
        .with_kind(StageKind::Package);
    let package_name = package.name.clone();
    builder.add_stage_spec(package)?;

    let validator = CrossEnvironmentValidatorStage::new(config.validate.cells.clone(), tools.runner.clone())
        .with_concurrency(config.workers())
        .with_timeout(timeout);
    let validate = spec_for(Arc::new(validator))
        .with_dependency(&package_name)
        .consumes(PACKAGE)
        .with_kind(StageKind::Validate);
    let validate_name = validate.name.clone();
    builder.add_stage_spec(validate)?;

    builder.add_stage_spec(
        spec_for(publisher(config, tools))
            .with_dependencies([package_name, validate_name])
            .when(RunCondition::VersionTag)
            .consumes(NATIVE_LIBS)
            .consumes(MERGED_LIBS)
            .consumes(PACKAGE)
            .with_kind(StageKind::Publish),
    )?;

    builder.build()
}

/// Builds a graph that only re-verifies the version and publishes the
/// artifacts already present in the run's store.
///
/// # Errors
///
/// Returns an error if the assembled graph does not validate.
pub fn publish_graph(config: &ReleaseConfig, tools: &ReleaseTools) -> Result<StageGraph, PipelineValidationError> {
    let mut builder = PipelineBuilder::new(PUBLISH_PIPELINE).with_workers(1);
    builder.add_stage_spec(version_spec(tools))?;
    builder.add_stage_spec(
        spec_for(publisher(config, tools))
            .with_dependency(VERSION_STAGE)
            .when(RunCondition::VersionTag)
            .consumes(NATIVE_LIBS)
            .consumes(MERGED_LIBS)
            .consumes(PACKAGE)
            .with_kind(StageKind::Publish),
    )?;
    builder.build()
}
