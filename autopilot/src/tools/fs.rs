//! Filesystem tools: `list_files`, `read_file`, `write_file`.

use std::fs;
use std::io::Write as _;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use crate::cancel::ensure_active;
use crate::core::types::{ToolOutcome, truncate_chars};

use super::{
    PermissionGroup, Tool, ToolEnv, optional_bool, optional_str, optional_u64, required_str,
};

const DEFAULT_LIST_DEPTH: usize = 3;
const DEFAULT_LIST_LIMIT: usize = 500;
const DEFAULT_READ_BYTES: u64 = 100_000;

/// Directories that are never listed.
const SKIPPED_DIRS: &[&str] = &[".git", ".autopilot", "target", "node_modules"];

pub struct ListFilesTool;

#[async_trait]
impl Tool for ListFilesTool {
    fn name(&self) -> &str {
        "list_files"
    }

    fn description(&self) -> &str {
        "List files under a workspace directory, one relative path per line. \
         Directories end with `/`."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "Directory relative to the workspace (default `.`)"},
                "max_depth": {"type": "integer", "minimum": 1},
                "limit": {"type": "integer", "minimum": 1}
            }
        })
    }

    fn permission_group(&self) -> Option<PermissionGroup> {
        Some(PermissionGroup::FilesystemRead)
    }

    async fn execute(
        &self,
        params: &Map<String, Value>,
        env: &ToolEnv<'_>,
        cancel: &CancellationToken,
    ) -> Result<ToolOutcome> {
        let raw = optional_str(params, "path").unwrap_or(".");
        let root = match env.resolve_path(raw) {
            Ok(root) => root,
            Err(msg) => return Ok(ToolOutcome::failure(msg)),
        };
        if !root.exists() {
            return Ok(ToolOutcome::failure(format!("Directory not found: {raw}")));
        }
        if !root.is_dir() {
            return Ok(ToolOutcome::failure(format!("Not a directory: {raw}")));
        }
        let max_depth = optional_u64(params, "max_depth")
            .map_or(DEFAULT_LIST_DEPTH, |d| d.max(1) as usize);
        let limit = optional_u64(params, "limit").map_or(DEFAULT_LIST_LIMIT, |l| l.max(1) as usize);

        let walker = WalkDir::new(&root)
            .min_depth(1)
            .max_depth(max_depth)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                !(entry.file_type().is_dir()
                    && entry
                        .file_name()
                        .to_str()
                        .is_some_and(|name| SKIPPED_DIRS.contains(&name)))
            });

        let mut lines = Vec::new();
        let mut truncated = false;
        for entry in walker {
            ensure_active(cancel)?;
            let entry = entry.with_context(|| format!("walk {}", root.display()))?;
            if lines.len() == limit {
                truncated = true;
                break;
            }
            let relative = entry
                .path()
                .strip_prefix(env.workspace)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .replace('\\', "/");
            if entry.file_type().is_dir() {
                lines.push(format!("{relative}/"));
            } else {
                lines.push(relative);
            }
        }

        if lines.is_empty() {
            return Ok(ToolOutcome::success(format!("(empty directory: {raw})")));
        }
        let mut output = lines.join("\n");
        if truncated {
            output.push_str(&format!("\n... (truncated at {limit} entries)"));
        }
        Ok(ToolOutcome::success(output))
    }
}

pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a UTF-8 text file from the workspace."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string"},
                "max_bytes": {"type": "integer", "minimum": 1}
            },
            "required": ["path"]
        })
    }

    fn permission_group(&self) -> Option<PermissionGroup> {
        Some(PermissionGroup::FilesystemRead)
    }

    async fn execute(
        &self,
        params: &Map<String, Value>,
        env: &ToolEnv<'_>,
        _cancel: &CancellationToken,
    ) -> Result<ToolOutcome> {
        let raw = match required_str(params, "path") {
            Ok(raw) => raw,
            Err(missing) => return Ok(missing),
        };
        let path = match env.resolve_path(raw) {
            Ok(path) => path,
            Err(msg) => return Ok(ToolOutcome::failure(msg)),
        };
        if !path.exists() {
            return Ok(ToolOutcome::failure(format!("File not found: {raw}")));
        }
        if path.is_dir() {
            return Ok(ToolOutcome::failure(format!(
                "`{raw}` is a directory; use list_files instead"
            )));
        }
        let max_bytes = optional_u64(params, "max_bytes").unwrap_or(DEFAULT_READ_BYTES);

        let bytes = fs::read(&path).with_context(|| format!("read {}", path.display()))?;
        let text = String::from_utf8_lossy(&bytes);
        let limit = usize::try_from(max_bytes).unwrap_or(usize::MAX);
        if bytes.len() > limit {
            let head = truncate_chars(&text, limit);
            return Ok(ToolOutcome::success(format!(
                "{head}\n... (truncated, file is {} bytes)",
                bytes.len()
            )));
        }
        Ok(ToolOutcome::success(text.into_owned()))
    }
}

pub struct WriteFileTool;

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write text to a workspace file, creating parent directories. \
         Set `append` to add to the end instead of replacing."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string"},
                "content": {"type": "string"},
                "append": {"type": "boolean"}
            },
            "required": ["path", "content"]
        })
    }

    fn permission_group(&self) -> Option<PermissionGroup> {
        Some(PermissionGroup::FilesystemWrite)
    }

    async fn execute(
        &self,
        params: &Map<String, Value>,
        env: &ToolEnv<'_>,
        _cancel: &CancellationToken,
    ) -> Result<ToolOutcome> {
        let raw = match required_str(params, "path") {
            Ok(raw) => raw,
            Err(missing) => return Ok(missing),
        };
        let content = match required_str(params, "content") {
            Ok(content) => content,
            Err(missing) => return Ok(missing),
        };
        let path = match env.resolve_path(raw) {
            Ok(path) if path == env.workspace => {
                return Ok(ToolOutcome::failure("Refusing to write to the workspace root"));
            }
            Ok(path) => path,
            Err(msg) => return Ok(ToolOutcome::failure(msg)),
        };
        if path.is_dir() {
            return Ok(ToolOutcome::failure(format!("`{raw}` is a directory")));
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }

        let append = optional_bool(params, "append").unwrap_or(false);
        if append {
            let mut file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("open {}", path.display()))?;
            file.write_all(content.as_bytes())
                .with_context(|| format!("append {}", path.display()))?;
        } else {
            fs::write(&path, content).with_context(|| format!("write {}", path.display()))?;
        }

        let verb = if append { "Appended" } else { "Wrote" };
        Ok(ToolOutcome::success(format!(
            "{verb} {} bytes to {raw}",
            content.len()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestEnv;

    fn params(value: Value) -> Map<String, Value> {
        value.as_object().cloned().expect("object")
    }

    #[tokio::test]
    async fn list_files_skips_state_and_vcs_directories() {
        let harness = TestEnv::new();
        let root = harness.root();
        fs::create_dir_all(root.join("src")).expect("mkdir");
        fs::create_dir_all(root.join(".git/objects")).expect("mkdir");
        fs::create_dir_all(root.join(".autopilot")).expect("mkdir");
        fs::write(root.join("src/main.rs"), "fn main() {}").expect("write");
        fs::write(root.join("README.md"), "hi").expect("write");

        let outcome = ListFilesTool
            .execute(&Map::new(), &harness.env(None), &CancellationToken::new())
            .await
            .expect("list");
        assert!(outcome.success);
        assert_eq!(outcome.output, "README.md\nsrc/\nsrc/main.rs");
    }

    #[tokio::test]
    async fn list_files_honours_limit_and_missing_dirs() {
        let harness = TestEnv::new();
        for name in ["a", "b", "c"] {
            fs::write(harness.root().join(name), "").expect("write");
        }
        let env = harness.env(None);
        let cancel = CancellationToken::new();

        let outcome = ListFilesTool
            .execute(&params(json!({"limit": 2})), &env, &cancel)
            .await
            .expect("list");
        assert!(outcome.output.starts_with("a\nb\n"));
        assert!(outcome.output.contains("truncated at 2 entries"));

        let outcome = ListFilesTool
            .execute(&params(json!({"path": "nope"})), &env, &cancel)
            .await
            .expect("list");
        assert_eq!(outcome, ToolOutcome::failure("Directory not found: nope"));
    }

    #[tokio::test]
    async fn read_file_reports_missing_files_as_failures() {
        let harness = TestEnv::new();
        let env = harness.env(None);
        let cancel = CancellationToken::new();

        let outcome = ReadFileTool
            .execute(&params(json!({"path": "absent.txt"})), &env, &cancel)
            .await
            .expect("read");
        assert_eq!(outcome, ToolOutcome::failure("File not found: absent.txt"));

        let outcome = ReadFileTool.execute(&Map::new(), &env, &cancel).await.expect("read");
        assert_eq!(
            outcome,
            ToolOutcome::failure("Missing required parameter: path")
        );
    }

    #[tokio::test]
    async fn read_file_truncates_large_files() {
        let harness = TestEnv::new();
        fs::write(harness.root().join("big.txt"), "x".repeat(50)).expect("write");
        let outcome = ReadFileTool
            .execute(
                &params(json!({"path": "big.txt", "max_bytes": 10})),
                &harness.env(None),
                &CancellationToken::new(),
            )
            .await
            .expect("read");
        assert!(outcome.success);
        assert!(outcome.output.starts_with("xxxxxxxxxx... [truncated]"));
        assert!(outcome.output.contains("file is 50 bytes"));
    }

    #[tokio::test]
    async fn write_file_creates_parents_and_appends() {
        let harness = TestEnv::new();
        let env = harness.env(None);
        let cancel = CancellationToken::new();

        let outcome = WriteFileTool
            .execute(
                &params(json!({"path": "notes/today.md", "content": "one\n"})),
                &env,
                &cancel,
            )
            .await
            .expect("write");
        assert!(outcome.success);
        WriteFileTool
            .execute(
                &params(json!({"path": "notes/today.md", "content": "two\n", "append": true})),
                &env,
                &cancel,
            )
            .await
            .expect("append");

        let written = fs::read_to_string(harness.root().join("notes/today.md")).expect("read");
        assert_eq!(written, "one\ntwo\n");
    }

    #[tokio::test]
    async fn write_file_refuses_escaping_paths() {
        let harness = TestEnv::new();
        let outcome = WriteFileTool
            .execute(
                &params(json!({"path": "../outside.txt", "content": "x"})),
                &harness.env(None),
                &CancellationToken::new(),
            )
            .await
            .expect("write");
        assert!(!outcome.success);
        assert!(outcome.output.contains("outside the workspace"));
    }
}
