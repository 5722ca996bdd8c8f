//! Release configuration (`release.toml`).
//!
//! Everything except the project name and the tool commands has a default.
//! Relative paths are resolved against the directory holding the file.

use crate::core::{Arch, Os, Target};
use crate::pipeline::RetryConfig;
use crate::stages::ValidationCell;
use crate::tools::{CommandTemplate, ToolchainOutputs};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read configuration file {path}: {source}")]
    Io {
        /// The file path.
        path: PathBuf,
        /// The underlying error.
        source: std::io::Error,
    },

    /// The file is not valid TOML or does not match the schema.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// The configuration parsed but is not usable.
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

/// Top-level release configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseConfig {
    /// Project naming.
    pub project: ProjectConfig,

    /// Targets to build.
    #[serde(default = "default_targets")]
    pub targets: Vec<Target>,

    /// Native build settings.
    #[serde(default)]
    pub build: BuildConfig,

    /// Universal merge settings.
    #[serde(default)]
    pub merge: MergeConfig,

    /// Binding packaging settings.
    #[serde(default)]
    pub package: PackageConfig,

    /// Validation matrix settings.
    #[serde(default)]
    pub validate: ValidateConfig,

    /// Publication settings.
    #[serde(default)]
    pub publish: PublishConfig,

    /// Executor settings.
    #[serde(default)]
    pub execution: ExecutionConfig,

    #[serde(skip)]
    base_dir: PathBuf,
}

/// Project naming.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Project name, used in package and archive names.
    pub name: String,

    /// Binding label, e.g. `java`.
    #[serde(default = "default_binding")]
    pub binding: String,

    /// Native library base name; defaults to the project name.
    #[serde(default)]
    pub lib_name: Option<String>,

    /// Header file name; defaults to `<name>.h`.
    #[serde(default)]
    pub header: Option<String>,

    /// File holding the authoritative version.
    #[serde(default = "default_version_file")]
    pub version_file: PathBuf,
}

impl ProjectConfig {
    /// Returns the native library base name.
    #[must_use]
    pub fn lib_name(&self) -> &str {
        self.lib_name.as_deref().unwrap_or(&self.name)
    }

    /// Returns the header file name.
    #[must_use]
    pub fn header(&self) -> String {
        self.header
            .clone()
            .unwrap_or_else(|| format!("{}.h", self.name))
    }
}

/// Native build settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Optimization profile.
    pub profile: Option<String>,
    /// Host architecture; detected when unset.
    pub host_arch: Option<Arch>,
    /// Build command template.
    pub command: CommandTemplate,
    /// Command used instead for cross-compiled targets.
    pub cross_command: Option<CommandTemplate>,
    /// Output paths relative to `{out_dir}`.
    pub outputs: Option<ToolchainOutputs>,
    /// Directory the build command runs in.
    pub working_dir: Option<PathBuf>,
}

impl BuildConfig {
    /// Returns the profile, `release` by default.
    #[must_use]
    pub fn profile(&self) -> &str {
        self.profile.as_deref().unwrap_or("release")
    }
}

/// Universal merge settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Merge command template.
    pub command: CommandTemplate,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            command: CommandTemplate::new(["lipo", "-create", "-output", "{output}", "{inputs}"]),
        }
    }
}

/// Binding packaging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PackageConfig {
    /// Operating systems the package must cover.
    pub required_os: Vec<Os>,
    /// Test command template.
    pub test_command: CommandTemplate,
    /// Package command template.
    pub command: CommandTemplate,
    /// Produced package, relative to `{out_dir}`.
    pub output: String,
    /// Package file extension.
    pub extension: String,
    /// Directory the commands run in.
    pub working_dir: Option<PathBuf>,
}

impl Default for PackageConfig {
    fn default() -> Self {
        Self {
            required_os: vec![Os::Linux, Os::Macos],
            test_command: CommandTemplate::default(),
            command: CommandTemplate::default(),
            output: "package.zip".to_string(),
            extension: "zip".to_string(),
            working_dir: None,
        }
    }
}

/// Validation matrix settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidateConfig {
    /// Matrix cells.
    pub cells: Vec<ValidationCell>,
    /// Smoke test command template.
    pub command: CommandTemplate,
}

/// Publication settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    /// Directory backing the release host.
    pub host_dir: PathBuf,
    /// Archive command template.
    pub archive_command: CommandTemplate,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            host_dir: PathBuf::from("releases"),
            archive_command: CommandTemplate::new(["zip", "-q", "{output}", "{inputs}"]),
        }
    }
}

/// Executor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Concurrently running stages; defaults to targets + 2.
    pub workers: Option<usize>,
    /// Timeout of each external invocation in seconds.
    pub timeout_secs: u64,
    /// Retry policy for asset uploads.
    pub upload_retry: RetryConfig,
    /// Retry policy for toolchain invocations.
    pub build_retry: RetryConfig,
    /// Where the artifact store is persisted after a run.
    pub store_dir: PathBuf,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            workers: None,
            timeout_secs: 30 * 60,
            upload_retry: RetryConfig::default(),
            build_retry: RetryConfig::no_retry(),
            store_dir: PathBuf::from(".releaseflow/store"),
        }
    }
}

fn default_targets() -> Vec<Target> {
    crate::release::STANDARD_TARGETS.to_vec()
}

fn default_binding() -> String {
    "binding".to_string()
}

fn default_version_file() -> PathBuf {
    PathBuf::from("VERSION")
}

impl ReleaseConfig {
    /// Creates a configuration with defaults for `project`.
    #[must_use]
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            project: ProjectConfig {
                name: project.into(),
                binding: default_binding(),
                lib_name: None,
                header: None,
                version_file: default_version_file(),
            },
            targets: default_targets(),
            build: BuildConfig::default(),
            merge: MergeConfig::default(),
            package: PackageConfig::default(),
            validate: ValidateConfig::default(),
            publish: PublishConfig::default(),
            execution: ExecutionConfig::default(),
            base_dir: PathBuf::from("."),
        }
    }

    /// Loads and validates a configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml(&content)?;
        config.base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        Ok(config)
    }

    /// Parses and validates a configuration string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails validation.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(content)?;
        config.base_dir = PathBuf::from(".");
        config.validate()?;
        Ok(config)
    }

    /// Checks the configuration for values no run could succeed with.
    ///
    /// # Errors
    ///
    /// Returns `Validation` describing the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.project.name.trim().is_empty() {
            return Err(ConfigError::Validation("project.name must not be empty".to_string()));
        }
        if self.targets.is_empty() {
            return Err(ConfigError::Validation("at least one target is required".to_string()));
        }
        let mut seen = HashSet::new();
        for target in &self.targets {
            if !seen.insert(*target) {
                return Err(ConfigError::Validation(format!("duplicate target {target}")));
            }
        }
        if self.execution.workers == Some(0) {
            return Err(ConfigError::Validation("execution.workers must be at least 1".to_string()));
        }
        if self.execution.timeout_secs == 0 {
            return Err(ConfigError::Validation("execution.timeout_secs must be at least 1".to_string()));
        }
        for (what, retry) in [
            ("upload_retry", &self.execution.upload_retry),
            ("build_retry", &self.execution.build_retry),
        ] {
            if retry.max_attempts == 0 {
                return Err(ConfigError::Validation(format!(
                    "execution.{what}.max_attempts must be at least 1"
                )));
            }
        }
        Ok(())
    }

    /// Checks that every command needed to drive the real tools is set.
    ///
    /// # Errors
    ///
    /// Returns `Validation` naming the first missing command.
    pub fn validate_commands(&self) -> Result<(), ConfigError> {
        let required = [
            ("build.command", &self.build.command),
            ("package.test_command", &self.package.test_command),
            ("package.command", &self.package.command),
            ("merge.command", &self.merge.command),
            ("publish.archive_command", &self.publish.archive_command),
        ];
        for (key, command) in required {
            if command.is_empty() {
                return Err(ConfigError::Validation(format!("{key} must be set")));
            }
        }
        if self.build.outputs.is_none() {
            return Err(ConfigError::Validation("build.outputs must be set".to_string()));
        }
        if !self.validate.cells.is_empty() && self.validate.command.is_empty() {
            return Err(ConfigError::Validation(
                "validate.command must be set when validate.cells is not empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Number of concurrently running stages.
    #[must_use]
    pub fn workers(&self) -> usize {
        self.execution.workers.unwrap_or(self.targets.len() + 2)
    }

    /// Timeout of each external invocation.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.execution.timeout_secs)
    }

    /// Resolves `path` against the configuration directory.
    #[must_use]
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }
}
