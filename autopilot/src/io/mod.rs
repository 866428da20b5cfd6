//! I/O helpers for the engine: files, processes, git, LLM and the terminal.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub mod config;
pub mod git;
pub mod init;
pub mod interaction;
pub mod llm;
pub mod plan_store;
pub mod process;
pub mod prompt;
pub mod run_log;

/// Well-known paths under `<root>/.autopilot/`.
#[derive(Debug, Clone)]
pub struct StatePaths {
    pub dir: PathBuf,
    pub config: PathBuf,
    pub plan: PathBuf,
    pub run_log: PathBuf,
}

impl StatePaths {
    pub fn new(root: &Path) -> Self {
        let dir = root.join(".autopilot");
        Self {
            config: dir.join("config.toml"),
            plan: dir.join("plan.json"),
            run_log: dir.join("runs.jsonl"),
            dir,
        }
    }
}

/// Write via temp file + rename so readers never see a partial file.
pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
