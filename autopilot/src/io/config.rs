//! Engine configuration stored under `.autopilot/config.toml`.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::tools::PermissionGroup;

/// Engine configuration (TOML).
///
/// This file is intended to be edited by humans. Missing fields take the
/// defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AutopilotConfig {
    /// Revisions allowed per list position before asking the user.
    pub max_task_retries: u32,

    /// Consecutive failures at one list position that halt the whole run.
    pub max_consecutive_failures: u32,

    /// Architect conversation turns before planning is declared failed.
    pub architect_max_iterations: u32,

    /// After this many turns the architect is told to stop investigating.
    pub architect_final_warning_after: u32,

    pub working_memory_capacity: usize,

    /// Successful outputs shorter than this are not added to working memory.
    pub working_memory_min_output: usize,

    /// Characters kept when quoting tool output into memory or prompts.
    pub excerpt_chars: usize,

    pub prompt_budget_bytes: usize,

    /// Actions whose successful output is reviewed by the supervisor.
    pub significant_actions: BTreeSet<String>,

    /// Actions preceded by a git checkpoint.
    pub checkpoint_actions: BTreeSet<String>,

    pub shell: ShellConfig,
    pub permissions: PermissionConfig,
    pub llm: LlmConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ShellConfig {
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 120,
            output_limit_bytes: 100_000,
        }
    }
}

/// Coarse capability flags plus an explicit deny list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PermissionConfig {
    /// Gates `shell_execution` and `filesystem_write`.
    pub can_execute: bool,
    /// Gates `filesystem_read` and `internet_access`.
    pub can_read: bool,
    pub disabled_groups: BTreeSet<PermissionGroup>,
}

impl Default for PermissionConfig {
    fn default() -> Self {
        Self {
            can_execute: true,
            can_read: true,
            disabled_groups: BTreeSet::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmBackend {
    /// Pipe the transcript to an external command and read stdout.
    #[default]
    Command,
    /// OpenAI-compatible `/chat/completions` endpoint.
    Openai,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LlmConfig {
    pub backend: LlmBackend,
    /// Command line for the `command` backend (e.g. `["codex","exec","-"]`).
    pub command: Vec<String>,
    pub base_url: String,
    pub model: String,
    /// Optional cheaper model for supervisor calls.
    pub supervisor_model: Option<String>,
    /// Environment variable holding the API key for the `openai` backend.
    pub api_key_env: String,
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            backend: LlmBackend::Command,
            command: vec![
                "codex".to_string(),
                "exec".to_string(),
                "--skip-git-repo-check".to_string(),
                "-".to_string(),
            ],
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            supervisor_model: None,
            api_key_env: "OPENAI_API_KEY".to_string(),
            timeout_secs: 10 * 60,
        }
    }
}

impl Default for AutopilotConfig {
    fn default() -> Self {
        Self {
            max_task_retries: 2,
            max_consecutive_failures: 3,
            architect_max_iterations: 10,
            architect_final_warning_after: 8,
            working_memory_capacity: 10,
            working_memory_min_output: 20,
            excerpt_chars: 500,
            prompt_budget_bytes: 40_000,
            significant_actions: ["ask_user", "fetch_url", "execute_command"]
                .into_iter()
                .map(String::from)
                .collect(),
            checkpoint_actions: ["execute_command", "write_file"]
                .into_iter()
                .map(String::from)
                .collect(),
            shell: ShellConfig::default(),
            permissions: PermissionConfig::default(),
            llm: LlmConfig::default(),
        }
    }
}

impl AutopilotConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_consecutive_failures == 0 {
            return Err(anyhow!("max_consecutive_failures must be > 0"));
        }
        if self.architect_max_iterations == 0 {
            return Err(anyhow!("architect_max_iterations must be > 0"));
        }
        if self.architect_final_warning_after >= self.architect_max_iterations {
            return Err(anyhow!(
                "architect_final_warning_after must be < architect_max_iterations"
            ));
        }
        if self.working_memory_capacity == 0 {
            return Err(anyhow!("working_memory_capacity must be > 0"));
        }
        if self.excerpt_chars == 0 {
            return Err(anyhow!("excerpt_chars must be > 0"));
        }
        if self.prompt_budget_bytes == 0 {
            return Err(anyhow!("prompt_budget_bytes must be > 0"));
        }
        if self.shell.timeout_secs == 0 {
            return Err(anyhow!("shell.timeout_secs must be > 0"));
        }
        if self.shell.output_limit_bytes == 0 {
            return Err(anyhow!("shell.output_limit_bytes must be > 0"));
        }
        if self.llm.timeout_secs == 0 {
            return Err(anyhow!("llm.timeout_secs must be > 0"));
        }
        match self.llm.backend {
            LlmBackend::Command => {
                if self.llm.command.is_empty() || self.llm.command[0].trim().is_empty() {
                    return Err(anyhow!("llm.command must be a non-empty array"));
                }
            }
            LlmBackend::Openai => {
                if self.llm.base_url.trim().is_empty() || self.llm.model.trim().is_empty() {
                    return Err(anyhow!("llm.base_url and llm.model must be set"));
                }
            }
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `AutopilotConfig::default()`.
pub fn load_config(path: &Path) -> Result<AutopilotConfig> {
    if !path.exists() {
        let cfg = AutopilotConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: AutopilotConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &AutopilotConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    super::write_atomic(path, &buf)
}
