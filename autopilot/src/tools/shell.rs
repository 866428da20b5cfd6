//! `execute_command`: run a shell command in the workspace.

use std::process::Command;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::core::types::ToolOutcome;

use super::{PermissionGroup, Tool, ToolEnv, optional_str, optional_u64, required_str};

pub struct ExecuteCommandTool;

fn shell_command(script: &str) -> Command {
    if cfg!(windows) {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(script);
        cmd
    } else {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }
}

#[async_trait]
impl Tool for ExecuteCommandTool {
    fn name(&self) -> &str {
        "execute_command"
    }

    fn description(&self) -> &str {
        "Run a shell command in the workspace and return its combined stdout/stderr. \
         Non-zero exit codes and timeouts are failures."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {"type": "string", "description": "Shell command line"},
                "cwd": {"type": "string", "description": "Directory relative to the workspace"},
                "timeout_secs": {"type": "integer", "minimum": 1}
            },
            "required": ["command"]
        })
    }

    fn permission_group(&self) -> Option<PermissionGroup> {
        Some(PermissionGroup::ShellExecution)
    }

    #[instrument(skip_all)]
    async fn execute(
        &self,
        params: &Map<String, Value>,
        env: &ToolEnv<'_>,
        cancel: &CancellationToken,
    ) -> Result<ToolOutcome> {
        let command = match required_str(params, "command") {
            Ok(command) if !command.trim().is_empty() => command,
            Ok(_) => return Ok(ToolOutcome::failure("Parameter `command` is empty")),
            Err(missing) => return Ok(missing),
        };
        let dir = match optional_str(params, "cwd").map(|raw| (raw, env.resolve_path(raw))) {
            None => None,
            Some((_, Err(msg))) => return Ok(ToolOutcome::failure(msg)),
            Some((raw, Ok(dir))) if !dir.is_dir() => {
                return Ok(ToolOutcome::failure(format!("Directory not found: {raw}")));
            }
            Some((_, Ok(dir))) => Some(dir),
        };
        let timeout_secs = optional_u64(params, "timeout_secs").filter(|secs| *secs > 0);

        let output = env
            .run_command(shell_command(command), dir.as_deref(), timeout_secs, cancel)
            .await?;

        let text = output.combined();
        debug!(exit_code = ?output.status.code(), timed_out = output.timed_out, "command finished");
        if output.timed_out {
            let secs = timeout_secs.unwrap_or(env.shell.timeout_secs);
            return Ok(ToolOutcome::failure(format!(
                "Command timed out after {secs}s\n{text}"
            )));
        }
        if !output.status.success() {
            let code = output
                .status
                .code()
                .map_or_else(|| "signal".to_string(), |c| c.to_string());
            return Ok(ToolOutcome::failure(format!("Exit code {code}\n{text}")));
        }
        Ok(ToolOutcome::success(text))
    }
}
