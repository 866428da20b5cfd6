//! Tool layer: the trait every action implements, the execution environment
//! handed to it, and the built-in tools.
//!
//! Tools return [`ToolOutcome`] for expected failures (bad parameters, missing
//! files, non-zero exit codes) and `Err` only for unexpected ones. The
//! [`dispatch::Dispatcher`] turns OS-level errors into failures as well.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::core::plan::Plan;
use crate::core::types::ToolOutcome;
use crate::io::config::ShellConfig;
use crate::io::interaction::Interaction;
use crate::io::llm::LlmClient;
use crate::io::process::{CommandOutput, ProcessLimits, run_command_async};

pub mod ask;
pub mod dispatch;
pub mod fetch;
pub mod fs;
pub mod permissions;
pub mod registry;
pub mod shell;

pub use dispatch::Dispatcher;
pub use permissions::Permissions;
pub use registry::ToolRegistry;

/// Capability a tool needs; gated by [`Permissions`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionGroup {
    ShellExecution,
    FilesystemWrite,
    FilesystemRead,
    InternetAccess,
}

impl PermissionGroup {
    pub fn as_str(self) -> &'static str {
        match self {
            PermissionGroup::ShellExecution => "shell_execution",
            PermissionGroup::FilesystemWrite => "filesystem_write",
            PermissionGroup::FilesystemRead => "filesystem_read",
            PermissionGroup::InternetAccess => "internet_access",
        }
    }
}

impl fmt::Display for PermissionGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a tool may touch during one call. Borrowed, never retained.
#[derive(Clone, Copy)]
pub struct ToolEnv<'a> {
    pub workspace: &'a Path,
    pub llm: &'a dyn LlmClient,
    pub interaction: &'a dyn Interaction,
    /// The live plan, if one exists yet.
    pub plan: Option<&'a Plan>,
    pub variables: &'a BTreeMap<String, Value>,
    pub shell: &'a ShellConfig,
}

impl ToolEnv<'_> {
    /// Run a sub-command under the configured shell limits, in `dir` or the
    /// workspace root.
    pub async fn run_command(
        &self,
        mut cmd: Command,
        dir: Option<&Path>,
        timeout_secs: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput> {
        cmd.current_dir(dir.unwrap_or(self.workspace));
        let limits = ProcessLimits {
            timeout: std::time::Duration::from_secs(
                timeout_secs.unwrap_or(self.shell.timeout_secs),
            ),
            output_limit_bytes: self.shell.output_limit_bytes,
        };
        run_command_async(cmd, None, limits, cancel.clone()).await
    }

    /// Resolve `raw` against the workspace, refusing paths that escape it.
    pub fn resolve_path(&self, raw: &str) -> std::result::Result<PathBuf, String> {
        resolve_in_workspace(self.workspace, raw)
    }
}

/// Unified tool interface.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Action name used in plans (e.g. `list_files`).
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema of the accepted parameters.
    fn parameters(&self) -> Value;

    fn permission_group(&self) -> Option<PermissionGroup> {
        None
    }

    /// True for tools that block on a human answer.
    fn requests_user_input(&self) -> bool {
        false
    }

    async fn execute(
        &self,
        params: &Map<String, Value>,
        env: &ToolEnv<'_>,
        cancel: &CancellationToken,
    ) -> Result<ToolOutcome>;
}

/// Registry with every built-in tool.
pub fn builtin_registry() -> Result<ToolRegistry> {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(shell::ExecuteCommandTool));
    registry.register(Arc::new(fs::ListFilesTool));
    registry.register(Arc::new(fs::ReadFileTool));
    registry.register(Arc::new(fs::WriteFileTool));
    registry.register(Arc::new(fetch::FetchUrlTool::new()?));
    registry.register(Arc::new(ask::AskLlmTool));
    registry.register(Arc::new(ask::AskUserTool));
    Ok(registry)
}

/// Lexically resolve `raw` under `root`, rejecting anything outside it.
pub fn resolve_in_workspace(root: &Path, raw: &str) -> std::result::Result<PathBuf, String> {
    let trimmed = raw.trim();
    let candidate = Path::new(if trimmed.is_empty() { "." } else { trimmed });
    let relative = if candidate.is_absolute() {
        candidate
            .strip_prefix(root)
            .map_err(|_| format!("Path `{raw}` is outside the workspace"))?
    } else {
        candidate
    };

    let mut resolved = root.to_path_buf();
    let mut depth = 0usize;
    for component in relative.components() {
        match component {
            Component::CurDir => {}
            Component::Normal(part) => {
                resolved.push(part);
                depth += 1;
            }
            Component::ParentDir => {
                if depth == 0 {
                    return Err(format!("Path `{raw}` is outside the workspace"));
                }
                resolved.pop();
                depth -= 1;
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(format!("Path `{raw}` is outside the workspace"));
            }
        }
    }
    Ok(resolved)
}

/// Required string parameter, or a failure message naming it.
pub(crate) fn required_str<'p>(
    params: &'p Map<String, Value>,
    key: &str,
) -> std::result::Result<&'p str, ToolOutcome> {
    params
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| ToolOutcome::failure(format!("Missing required parameter: {key}")))
}

pub(crate) fn optional_str<'p>(params: &'p Map<String, Value>, key: &str) -> Option<&'p str> {
    params.get(key).and_then(Value::as_str)
}

/// Non-negative integer parameter; numeric strings are accepted too.
pub(crate) fn optional_u64(params: &Map<String, Value>, key: &str) -> Option<u64> {
    match params.get(key)? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub(crate) fn optional_bool(params: &Map<String, Value>, key: &str) -> Option<bool> {
    match params.get(key)? {
        Value::Bool(b) => Some(*b),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
