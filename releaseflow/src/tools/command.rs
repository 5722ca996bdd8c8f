//! Templated external commands.

use crate::errors::ToolError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::OnceLock;
use tokio::process::Command;
use tracing::{debug, info};

/// Longest diagnostic kept from a failing command's output.
const MAX_DIAGNOSTIC_BYTES: usize = 4096;

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\{([a-z_]+)\}")
            .unwrap_or_else(|e| unreachable!("static placeholder pattern is valid: {e}"))
    })
}

/// Values substituted into a [`CommandTemplate`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateVars {
    scalars: BTreeMap<String, String>,
    lists: BTreeMap<String, Vec<String>>,
}

impl TemplateVars {
    /// Creates an empty set of variables.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a scalar placeholder.
    #[must_use]
    pub fn set(mut self, name: &str, value: impl Into<String>) -> Self {
        self.scalars.insert(name.to_string(), value.into());
        self
    }

    /// Sets a list placeholder. A list placeholder occupying a whole
    /// argument expands into one argument per element.
    #[must_use]
    pub fn set_list(mut self, name: &str, values: Vec<String>) -> Self {
        self.lists.insert(name.to_string(), values);
        self
    }

    fn lookup(&self, name: &str) -> Option<String> {
        self.scalars
            .get(name)
            .cloned()
            .or_else(|| self.lists.get(name).map(|values| values.join(" ")))
    }
}

/// A command line with `{placeholder}` arguments; the first element is
/// the program.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandTemplate(pub Vec<String>);

impl CommandTemplate {
    /// Creates a template from its parts.
    #[must_use]
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(parts.into_iter().map(Into::into).collect())
    }

    /// Returns true if the template has no program.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.first().map_or(true, |program| program.trim().is_empty())
    }

    /// Renders the template into program and arguments.
    ///
    /// # Errors
    ///
    /// Returns a message naming the first unknown placeholder.
    pub fn render(&self, vars: &TemplateVars) -> Result<Vec<String>, String> {
        if self.is_empty() {
            return Err("command template is empty".to_string());
        }

        let mut rendered = Vec::with_capacity(self.0.len());
        for part in &self.0 {
            if let Some(name) = part.strip_prefix('{').and_then(|p| p.strip_suffix('}')) {
                if let Some(values) = vars.lists.get(name) {
                    rendered.extend(values.iter().cloned());
                    continue;
                }
            }

            let mut unknown = None;
            let arg = placeholder_pattern().replace_all(part, |caps: &regex::Captures<'_>| {
                let name = &caps[1];
                vars.lookup(name).unwrap_or_else(|| {
                    unknown.get_or_insert_with(|| name.to_string());
                    String::new()
                })
            });
            if let Some(name) = unknown {
                return Err(format!("unknown placeholder '{{{name}}}' in '{part}'"));
            }
            rendered.push(arg.into_owned());
        }
        Ok(rendered)
    }
}

/// Runs a rendered template in `cwd` and returns its stdout.
///
/// The child is killed if the returned future is dropped, so callers can
/// bound it with a timeout or race it against cancellation.
///
/// # Errors
///
/// Returns `ToolError::Failed` if the template cannot be rendered, the
/// program cannot be spawned, or it exits non-zero.
pub async fn run_command(
    tool: &str,
    template: &CommandTemplate,
    vars: &TemplateVars,
    cwd: &Path,
) -> Result<Vec<u8>, ToolError> {
    let argv = template
        .render(vars)
        .map_err(|e| ToolError::failed(tool, e))?;
    let Some((program, args)) = argv.split_first() else {
        return Err(ToolError::failed(tool, "command template is empty"));
    };

    info!(tool, program = %program, args = ?args, cwd = %cwd.display(), "running command");

    let child = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ToolError::failed(tool, format!("failed to spawn '{program}': {e}")))?;

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| ToolError::failed(tool, format!("failed to wait for '{program}': {e}")))?;

    if output.status.success() {
        debug!(tool, stdout_bytes = output.stdout.len(), "command succeeded");
        return Ok(output.stdout);
    }

    let stream = if output.stderr.is_empty() {
        &output.stdout
    } else {
        &output.stderr
    };
    let code = output
        .status
        .code()
        .map_or_else(|| "signal".to_string(), |c| c.to_string());
    Err(ToolError::failed(
        tool,
        format!("exited with {code}: {}", diagnostic_tail(stream)),
    ))
}

/// Reads an expected output file.
///
/// # Errors
///
/// Returns `ToolError::MissingOutput` if the file is absent or unreadable.
pub(crate) async fn read_output(tool: &str, path: &Path) -> Result<Vec<u8>, ToolError> {
    tokio::fs::read(path)
        .await
        .map_err(|_| ToolError::missing_output(tool, path.display().to_string()))
}

fn diagnostic_tail(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim();
    if text.len() <= MAX_DIAGNOSTIC_BYTES {
        return text.to_string();
    }
    let mut start = text.len() - MAX_DIAGNOSTIC_BYTES;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &text[start..])
}
