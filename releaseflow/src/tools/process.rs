//! Command-backed collaborator implementations.
//!
//! Each implementation renders a [`CommandTemplate`], runs it in a scratch
//! directory and reads the files it is expected to produce. Any non-zero
//! exit or missing output is a [`ToolError`].

use super::command::read_output;
use super::{
    run_command, Archiver, BindingTool, BuildOutput, BuildRequest, CommandTemplate,
    EnvironmentRunner, ResourceLayout, TemplateVars, Toolchain, UniversalLinker,
};
use crate::core::{Artifact, Os};
use crate::errors::ToolError;
use crate::version::Version;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn scratch(tool: &str) -> Result<TempDir, ToolError> {
    tempfile::Builder::new()
        .prefix("releaseflow-")
        .tempdir()
        .map_err(|e| ToolError::failed(tool, format!("cannot create scratch directory: {e}")))
}

async fn write_input(tool: &str, path: &Path, content: &[u8]) -> Result<(), ToolError> {
    tokio::fs::write(path, content)
        .await
        .map_err(|e| ToolError::failed(tool, format!("cannot stage {}: {e}", path.display())))
}

/// Resolves a rendered output path relative to `out_dir`.
fn output_path(tool: &str, template: &str, vars: &TemplateVars, out_dir: &Path) -> Result<PathBuf, ToolError> {
    let rendered = CommandTemplate::new([template])
        .render(vars)
        .map_err(|e| ToolError::failed(tool, e))?
        .concat();
    Ok(out_dir.join(rendered))
}

/// Where the toolchain leaves its outputs, relative to `{out_dir}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolchainOutputs {
    /// Static library path template.
    pub static_lib: String,
    /// Dynamic library path template.
    pub dynamic_lib: String,
    /// Header path template.
    pub header: String,
}

/// Native toolchain driven by a build command.
#[derive(Debug, Clone)]
pub struct CommandToolchain {
    command: CommandTemplate,
    cross_command: Option<CommandTemplate>,
    outputs: ToolchainOutputs,
    working_dir: PathBuf,
}

impl CommandToolchain {
    /// Creates a toolchain running `command` in `working_dir`.
    #[must_use]
    pub fn new(command: CommandTemplate, outputs: ToolchainOutputs, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            command,
            cross_command: None,
            outputs,
            working_dir: working_dir.into(),
        }
    }

    /// Uses a separate command for cross-compiled targets.
    #[must_use]
    pub fn with_cross_command(mut self, command: CommandTemplate) -> Self {
        self.cross_command = Some(command);
        self
    }
}

#[async_trait]
impl Toolchain for CommandToolchain {
    async fn build(&self, request: &BuildRequest) -> Result<BuildOutput, ToolError> {
        const TOOL: &str = "toolchain";
        let vars = TemplateVars::new()
            .set("os", request.target.os.tag())
            .set("arch", request.target.arch.as_str())
            .set("target", request.target.slug())
            .set("profile", request.profile.as_str())
            .set("version", request.version.as_str())
            .set("out_dir", request.workspace.display().to_string());

        let command = match (&self.cross_command, request.cross) {
            (Some(cross), true) => cross,
            _ => &self.command,
        };
        run_command(TOOL, command, &vars, &self.working_dir).await?;

        let out = &request.workspace;
        let static_path = output_path(TOOL, &self.outputs.static_lib, &vars, out)?;
        let dynamic_path = output_path(TOOL, &self.outputs.dynamic_lib, &vars, out)?;
        let header_path = output_path(TOOL, &self.outputs.header, &vars, out)?;
        let (static_lib, dynamic_lib, header) = futures::try_join!(
            read_output(TOOL, &static_path),
            read_output(TOOL, &dynamic_path),
            read_output(TOOL, &header_path),
        )?;

        Ok(BuildOutput {
            static_lib,
            dynamic_lib,
            header,
        })
    }
}

/// Universal linker driven by a merge command (e.g. `lipo`).
#[derive(Debug, Clone)]
pub struct CommandLinker {
    command: CommandTemplate,
}

impl CommandLinker {
    /// Creates a linker running `command`.
    #[must_use]
    pub fn new(command: CommandTemplate) -> Self {
        Self { command }
    }
}

#[async_trait]
impl UniversalLinker for CommandLinker {
    async fn merge(&self, os: Os, inputs: &[Artifact]) -> Result<Vec<u8>, ToolError> {
        const TOOL: &str = "linker";
        let dir = scratch(TOOL)?;

        let mut paths = Vec::with_capacity(inputs.len());
        for input in inputs {
            let path = dir.path().join(format!("{}-{}", input.key, input.file_name));
            write_input(TOOL, &path, input.content()).await?;
            paths.push(path.display().to_string());
        }
        let output = dir.path().join("universal.out");

        let vars = TemplateVars::new()
            .set("os", os.tag())
            .set("out_dir", dir.path().display().to_string())
            .set("output", output.display().to_string())
            .set_list("inputs", paths);
        run_command(TOOL, &self.command, &vars, dir.path()).await?;
        read_output(TOOL, &output).await
    }
}

/// Binding tool driven by test and package commands.
#[derive(Debug, Clone)]
pub struct CommandBindingTool {
    test_command: CommandTemplate,
    package_command: CommandTemplate,
    package_output: String,
    working_dir: PathBuf,
}

impl CommandBindingTool {
    /// Creates a binding tool. `package_output` is a path template relative
    /// to `{out_dir}` naming the produced package.
    #[must_use]
    pub fn new(
        test_command: CommandTemplate,
        package_command: CommandTemplate,
        package_output: impl Into<String>,
        working_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            test_command,
            package_command,
            package_output: package_output.into(),
            working_dir: working_dir.into(),
        }
    }

    async fn materialize(tool: &str, layout: &ResourceLayout) -> Result<TempDir, ToolError> {
        let dir = scratch(tool)?;
        layout
            .write_to(dir.path())
            .await
            .map_err(|e| ToolError::failed(tool, format!("cannot write resource layout: {e}")))?;
        Ok(dir)
    }
}

#[async_trait]
impl BindingTool for CommandBindingTool {
    async fn test(&self, layout: &ResourceLayout) -> Result<(), ToolError> {
        const TOOL: &str = "binding-test";
        let dir = Self::materialize(TOOL, layout).await?;
        let vars = TemplateVars::new().set("out_dir", dir.path().display().to_string());
        run_command(TOOL, &self.test_command, &vars, &self.working_dir).await?;
        Ok(())
    }

    async fn package(&self, layout: &ResourceLayout, version: &Version) -> Result<Vec<u8>, ToolError> {
        const TOOL: &str = "binding-package";
        let dir = Self::materialize(TOOL, layout).await?;
        let vars = TemplateVars::new()
            .set("out_dir", dir.path().display().to_string())
            .set("version", version.as_str());
        run_command(TOOL, &self.package_command, &vars, &self.working_dir).await?;
        read_output(TOOL, &output_path(TOOL, &self.package_output, &vars, dir.path())?).await
    }
}

/// Environment runner driven by a smoke-test command.
#[derive(Debug, Clone)]
pub struct CommandEnvironmentRunner {
    command: CommandTemplate,
}

impl CommandEnvironmentRunner {
    /// Creates a runner executing `command` once per matrix cell.
    #[must_use]
    pub fn new(command: CommandTemplate) -> Self {
        Self { command }
    }
}

#[async_trait]
impl EnvironmentRunner for CommandEnvironmentRunner {
    async fn smoke_test(&self, os: Os, runtime: &str, package: &Artifact) -> Result<(), ToolError> {
        const TOOL: &str = "environment";
        // Every cell gets its own freshly provisioned directory.
        let dir = scratch(TOOL)?;
        let path = dir.path().join(&package.file_name);
        write_input(TOOL, &path, package.content()).await?;

        let vars = TemplateVars::new()
            .set("os", os.tag())
            .set("runtime", runtime)
            .set("package", path.display().to_string())
            .set("out_dir", dir.path().display().to_string());
        run_command(TOOL, &self.command, &vars, dir.path()).await?;
        Ok(())
    }
}

/// Archiver driven by an archive command (e.g. `zip`).
///
/// Entries are staged as `<key>/<file name>` and the command runs inside
/// the staging directory, so per-target libraries sharing a file name
/// stay apart.
#[derive(Debug, Clone)]
pub struct CommandArchiver {
    command: CommandTemplate,
}

impl CommandArchiver {
    /// Creates an archiver running `command`.
    #[must_use]
    pub fn new(command: CommandTemplate) -> Self {
        Self { command }
    }
}

impl Default for CommandArchiver {
    fn default() -> Self {
        Self::new(CommandTemplate::new(["zip", "-q", "{output}", "{inputs}"]))
    }
}

#[async_trait]
impl Archiver for CommandArchiver {
    async fn archive(&self, name: &str, entries: &[Artifact]) -> Result<Vec<u8>, ToolError> {
        const TOOL: &str = "archiver";
        let dir = scratch(TOOL)?;
        let staging = dir.path().join("entries");
        tokio::fs::create_dir_all(&staging)
            .await
            .map_err(|e| ToolError::failed(TOOL, format!("cannot create staging directory: {e}")))?;

        let mut paths = Vec::with_capacity(entries.len());
        for entry in entries {
            let relative = format!("{}/{}", entry.key, entry.file_name);
            let path = staging.join(&relative);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| ToolError::failed(TOOL, format!("cannot create {}: {e}", parent.display())))?;
            }
            write_input(TOOL, &path, entry.content()).await?;
            paths.push(relative);
        }
        let output = dir.path().join(name);

        let vars = TemplateVars::new()
            .set("out_dir", dir.path().display().to_string())
            .set("output", output.display().to_string())
            .set_list("inputs", paths);
        run_command(TOOL, &self.command, &vars, &staging).await?;
        read_output(TOOL, &output).await
    }
}
