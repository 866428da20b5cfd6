//! Action dispatch with the permission gate and OS-error normalization.

use std::io::ErrorKind;

use anyhow::Result;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::cancel::{ensure_active, is_cancelled};
use crate::core::types::ToolOutcome;

use super::{Permissions, ToolEnv, ToolRegistry};

/// Resolves an action to a tool and runs it behind the permission gate.
#[derive(Clone)]
pub struct Dispatcher {
    registry: ToolRegistry,
    permissions: Permissions,
}

impl Dispatcher {
    pub fn new(registry: ToolRegistry, permissions: Permissions) -> Self {
        Self {
            registry,
            permissions,
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn permissions(&self) -> &Permissions {
        &self.permissions
    }

    /// True if `action` names a tool that blocks on user input.
    pub fn requests_user_input(&self, action: &str) -> bool {
        self.registry
            .get(action)
            .is_some_and(|tool| tool.requests_user_input())
    }

    /// Run `action` with already-resolved `params`.
    ///
    /// Unknown actions, permission denials and OS permission/not-found errors
    /// come back as failed outcomes. Cancellation and any other error
    /// propagate.
    #[instrument(skip_all, fields(action))]
    pub async fn execute_task(
        &self,
        action: &str,
        params: &Map<String, Value>,
        env: &ToolEnv<'_>,
        cancel: &CancellationToken,
    ) -> Result<ToolOutcome> {
        ensure_active(cancel)?;
        let Some(tool) = self.registry.get(action) else {
            debug!("unknown action");
            return Ok(ToolOutcome::failure(format!("Unknown action: {action}")));
        };
        if let Err(denied) = self.permissions.check(tool.permission_group()) {
            warn!(reason = %denied, "permission denied");
            return Ok(ToolOutcome::failure(denied));
        }

        match tool.execute(params, env, cancel).await {
            Ok(outcome) => Ok(outcome),
            Err(err) if is_cancelled(&err) => Err(err),
            Err(err) => match classify_os_error(&err) {
                Some(OsFailure::PermissionDenied) => {
                    warn!(err = %format!("{err:#}"), "tool hit an OS permission error");
                    Ok(ToolOutcome::failure(format!(
                        "Permission error while running `{action}`: {err:#}. \
                         The file or command is not accessible; choose another path or approach."
                    )))
                }
                Some(OsFailure::NotFound) => {
                    warn!(err = %format!("{err:#}"), "tool hit a missing file or binary");
                    Ok(ToolOutcome::failure(format!(
                        "`{action}` could not find a required file or executable: {err:#}. \
                         Check that the program is installed and the path exists."
                    )))
                }
                None => Err(err),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OsFailure {
    PermissionDenied,
    NotFound,
}

fn classify_os_error(err: &anyhow::Error) -> Option<OsFailure> {
    for cause in err.chain() {
        if let Some(io_err) = cause.downcast_ref::<std::io::Error>() {
            match io_err.kind() {
                ErrorKind::PermissionDenied => return Some(OsFailure::PermissionDenied),
                ErrorKind::NotFound => return Some(OsFailure::NotFound),
                _ => {}
            }
        }
    }
    let text = format!("{err:#}").to_ascii_lowercase();
    if text.contains("eacces") || text.contains("permission denied") {
        return Some(OsFailure::PermissionDenied);
    }
    if text.contains("enoent") || text.contains("command not found") {
        return Some(OsFailure::NotFound);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::PermissionGroup;
    use crate::test_support::{ScriptedTool, TestEnv};
    use anyhow::anyhow;
    use std::sync::Arc;

    fn dispatcher(tools: Vec<ScriptedTool>, permissions: Permissions) -> Dispatcher {
        let mut registry = ToolRegistry::new();
        for tool in tools {
            registry.register(Arc::new(tool));
        }
        Dispatcher::new(registry, permissions)
    }

    #[tokio::test]
    async fn unknown_action_is_a_failure() {
        let harness = TestEnv::new();
        let dispatcher = dispatcher(Vec::new(), Permissions::default());
        let outcome = dispatcher
            .execute_task("teleport", &Map::new(), &harness.env(None), &CancellationToken::new())
            .await
            .expect("dispatch");
        assert_eq!(outcome, ToolOutcome::failure("Unknown action: teleport"));
    }

    #[tokio::test]
    async fn denied_tool_is_never_invoked() {
        let harness = TestEnv::new();
        let tool = ScriptedTool::succeeding("shell", "ran").with_group(PermissionGroup::ShellExecution);
        let calls = tool.calls();
        let dispatcher = dispatcher(
            vec![tool],
            Permissions {
                can_execute: false,
                ..Permissions::default()
            },
        );
        let outcome = dispatcher
            .execute_task("shell", &Map::new(), &harness.env(None), &CancellationToken::new())
            .await
            .expect("dispatch");
        assert!(!outcome.success);
        assert!(outcome.output.starts_with("Permission denied"));
        assert_eq!(calls.count(), 0);
    }

    #[tokio::test]
    async fn os_errors_are_rewrapped() {
        let harness = TestEnv::new();
        let eacces = ScriptedTool::erroring("locked", || {
            anyhow::Error::from(std::io::Error::from(ErrorKind::PermissionDenied))
                .context("open secret.txt")
        });
        let missing = ScriptedTool::erroring("missing", || {
            anyhow::Error::from(std::io::Error::from(ErrorKind::NotFound)).context("spawn command")
        });
        let textual = ScriptedTool::erroring("textual", || anyhow!("EACCES: cannot write"));
        let dispatcher = dispatcher(vec![eacces, missing, textual], Permissions::default());
        let env = harness.env(None);
        let cancel = CancellationToken::new();

        let outcome = dispatcher
            .execute_task("locked", &Map::new(), &env, &cancel)
            .await
            .expect("dispatch");
        assert!(!outcome.success);
        assert!(outcome.output.contains("Permission error"));

        let outcome = dispatcher
            .execute_task("missing", &Map::new(), &env, &cancel)
            .await
            .expect("dispatch");
        assert!(outcome.output.contains("could not find"));

        let outcome = dispatcher
            .execute_task("textual", &Map::new(), &env, &cancel)
            .await
            .expect("dispatch");
        assert!(outcome.output.contains("Permission error"));
    }

    #[tokio::test]
    async fn other_errors_propagate() {
        let harness = TestEnv::new();
        let tool = ScriptedTool::erroring("flaky", || anyhow!("socket reset"));
        let dispatcher = dispatcher(vec![tool], Permissions::default());
        let err = dispatcher
            .execute_task("flaky", &Map::new(), &harness.env(None), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("socket reset"));
    }
}
